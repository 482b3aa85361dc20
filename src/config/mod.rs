//! Configuration loading and parsing.
//!
//! This module provides the YAML scheduler configuration and job submission
//! files.

mod error;
mod types;
mod yaml;

pub use error::ConfigError;
pub use types::{BackendConfig, GlobalConfig, KubernetesConfig, PayloadConfig, StorageConfig};
pub use yaml::YamlLoader;
