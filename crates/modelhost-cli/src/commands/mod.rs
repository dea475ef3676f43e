//! CLI command implementations

pub mod config;
pub mod demo;
pub mod download;
pub mod embed;
pub mod generate;
pub mod status;
