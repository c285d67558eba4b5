//! vmscale-core: configuration and shared types for the vmscale autoscaler.
//!
//! The [`ScalerConfig`] is loaded once from `vmscale.toml` and passed by
//! `Arc` into both deciders. It is never mutated at runtime.

pub mod config;
pub mod types;

pub use config::{
    ConfigError, ConfigResult, DrainOrder, ScalePolicy, ScalerConfig, TemplateCatalog,
};
pub use types::*;
