// src/db/mod.rs

//! Experiment metadata: record types and the authoritative database.

pub mod database;
pub mod experiment;

pub use database::ExperimentDatabase;
pub use experiment::{Experiment, SubmissionRequest};
