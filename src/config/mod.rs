// src/config/mod.rs

//! Configuration loading for `atelier`.
//!
//! The config file is TOML with sections for the experiment database, the
//! artifact store, the cloud object backend, the queue and run-time knobs.
//! All sections and fields have defaults, so an empty file is valid.

pub mod loader;
pub mod model;

pub use loader::{default_config_path, load_and_validate, load_from_path};
pub use model::{
    CloudSection, ConfigFile, DatabaseSection, QueueSection, RawConfigFile, RunSection,
    StoreSection,
};
