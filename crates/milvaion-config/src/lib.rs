//! # Milvaion Config
//!
//! Layered configuration loading for the scheduling control plane:
//! `config/default.toml` -> `config/{environment}.toml` ->
//! `config/local.toml` -> `MILVAION_`-prefixed environment variables.

mod app_config;
mod loader;

pub use app_config::*;
pub use loader::ConfigLoader;
