// src/config/mod.rs

//! Configuration loading, modelling and validation.
//!
//! The TOML file is deserialized into [`model::RawConfigFile`] and then
//! promoted to the validated [`model::ConfigFile`] via `TryFrom`, so the rest
//! of the daemon only ever sees a config that passed the semantic checks.

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{load_and_validate, load_from_path};
pub use model::{ConfigFile, DaemonSection, DirectorySection, RawConfigFile, RuleConfig};
