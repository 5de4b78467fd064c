pub mod api;
pub mod cluster;
pub mod config;
pub mod error;
pub mod hub;
pub mod models;
pub mod platform;
pub mod service;
pub mod storage;

pub use error::{DeployError, Result};
pub use service::DeploymentService;
pub use storage::Storage;
