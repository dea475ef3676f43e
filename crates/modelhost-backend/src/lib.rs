//! Model backend adapters for modelhost.
//!
//! - [`hardware`]: device inventory (CUDA probe, RAM and cores via `sysinfo`)
//! - [`backend`]: the opaque backend and handle contracts
//! - [`simulated`]: a deterministic backend for tests and demos
//! - [`loader`] / [`factory`]: per-family loaders and the factory choosing between them

pub mod backend;
pub mod factory;
pub mod hardware;
pub mod loader;
pub mod simulated;

pub use backend::{
    BackendError, BackendResult, Generation, ModelBackend, ModelHandle, SharedHandle,
    hub_cache_dir,
};
pub use factory::LoaderFactory;
pub use hardware::{Accelerator, DeviceInventory};
pub use loader::{DownloadStatus, EmbeddingLoader, LoadedModel, ModelLoader, TextGenerationLoader};
pub use simulated::SimulatedBackend;
