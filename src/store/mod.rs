// src/store/mod.rs

//! Artifact storage: reference types, content versioning, source transfer
//! (local, HTTP, cloud), workspace sync and the store itself.
//!
//! The store owns artifact payload bytes under its root directory; the
//! experiment database only holds non-owning [`ArtifactRef`] descriptors.

pub mod artifact;
pub mod cloud;
pub mod http;
pub mod sync;
pub mod transfer;
pub mod version;

pub use artifact::{is_valid_key, ArtifactRef, ArtifactSource, CapturePolicy};
pub use cloud::{EnvCredentials, FsObjectStore, ObjectStore};
pub use transfer::{ArtifactStore, MAX_ALIAS_DEPTH};
pub use version::{content_version, file_version, tree_version};
