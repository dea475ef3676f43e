//! modelhost testing utilities
//!
//! A [`ScriptedBackend`] whose per-model load and inference behaviour can be
//! changed while a test runs, plus [`ServiceFixture`] for spinning up a
//! started [`ModelService`](modelhost_foundation::ModelService) on a
//! throwaway data directory.

pub mod backend;
pub mod fixtures;

pub use backend::{ModelScript, ScriptedBackend};
pub use fixtures::{ServiceFixture, service_config};
