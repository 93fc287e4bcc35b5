// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::store::{is_valid_key, ArtifactRef, ArtifactSource, CapturePolicy};

/// Command-line arguments for `atelier`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "atelier",
    version,
    about = "Submit, run and track computational experiments.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    ///
    /// Default: `Atelier.toml` in the current working directory, when it
    /// exists.
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<String>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `ATELIER_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL", global = true)]
    pub verbose: Option<LogLevel>,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Clone, Subcommand)]
pub enum CliCommand {
    /// Submit an experiment and run it to completion.
    Run(RunArgs),
    /// Request a stop for a running experiment.
    Stop {
        /// Experiment name.
        experiment: String,
    },
    /// Delete an experiment and its artifacts.
    Delete {
        /// Experiment name.
        experiment: String,
    },
    /// List experiment names, optionally filtered by prefix.
    List {
        /// Name prefix filter.
        prefix: Option<String>,
    },
}

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Experiment name. Generated from the script name when omitted.
    #[arg(long, value_name = "NAME")]
    pub experiment: Option<String>,

    /// Collect git provenance even when the working tree is dirty.
    #[arg(long)]
    pub force_git: bool,

    /// Capture an artifact on every run: `<source>:<key>`.
    #[arg(long = "capture", value_name = "SOURCE:KEY")]
    pub capture: Vec<String>,

    /// Capture an artifact only when its content changed: `<source>:<key>`.
    #[arg(long = "capture-once", value_name = "SOURCE:KEY")]
    pub capture_once: Vec<String>,

    /// Reuse another experiment's artifact: `<experiment>/<key>:<localKey>`.
    #[arg(long = "reuse", value_name = "EXPERIMENT/KEY:LOCALKEY")]
    pub reuse: Vec<String>,

    /// Hyperparameter override: `<name>=<value>` (repeatable).
    #[arg(long = "hyperparam", value_name = "NAME=VALUE")]
    pub hyperparam: Vec<String>,

    /// Script to execute.
    pub script: String,

    /// Arguments passed to the script.
    #[arg(trailing_var_arg = true)]
    pub script_args: Vec<String>,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}

/// Parse a `<source>:<key>` capture flag. The split is on the last colon so
/// URL sources (`https://...`) keep their scheme intact.
pub fn parse_capture(value: &str, policy: CapturePolicy) -> Result<ArtifactRef, String> {
    let (source, key) = value
        .rsplit_once(':')
        .ok_or_else(|| format!("expected <source>:<key>, got '{value}'"))?;
    if !is_valid_key(key) {
        return Err(format!("invalid artifact key '{key}' in '{value}'"));
    }
    let source = ArtifactSource::parse(source)?;
    Ok(ArtifactRef::new(key, source, policy))
}

/// Parse a `<experiment>/<key>:<localKey>` reuse flag.
pub fn parse_reuse(value: &str) -> Result<ArtifactRef, String> {
    let (target, local_key) = value
        .rsplit_once(':')
        .ok_or_else(|| format!("expected <experiment>/<key>:<localKey>, got '{value}'"))?;
    let (experiment, key) = target
        .split_once('/')
        .ok_or_else(|| format!("expected <experiment>/<key> before ':', got '{value}'"))?;
    if experiment.is_empty() || key.is_empty() {
        return Err(format!("empty component in reuse flag '{value}'"));
    }
    if !is_valid_key(local_key) {
        return Err(format!("invalid artifact key '{local_key}' in '{value}'"));
    }
    Ok(ArtifactRef::alias(local_key, experiment, key))
}

/// Parse a `<name>=<value>` hyperparameter flag.
pub fn parse_hyperparam(value: &str) -> Result<(String, String), String> {
    let (name, val) = value
        .split_once('=')
        .ok_or_else(|| format!("expected <name>=<value>, got '{value}'"))?;
    if name.is_empty() {
        return Err(format!("empty hyperparameter name in '{value}'"));
    }
    Ok((name.to_string(), val.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn capture_splits_on_last_colon() {
        let r = parse_capture("https://example.com/a.txt:f", CapturePolicy::CaptureOnce).unwrap();
        assert_eq!(r.key, "f");
        assert_eq!(
            r.source,
            ArtifactSource::RemoteUrl {
                url: "https://example.com/a.txt".to_string()
            }
        );
        assert_eq!(r.policy, CapturePolicy::CaptureOnce);
    }

    #[test]
    fn capture_accepts_plain_paths() {
        let r = parse_capture("/tmp/data.txt:f", CapturePolicy::AlwaysCapture).unwrap();
        assert_eq!(
            r.source,
            ArtifactSource::LocalPath {
                path: PathBuf::from("/tmp/data.txt")
            }
        );
    }

    #[test]
    fn capture_rejects_traversal_keys() {
        assert!(parse_capture("/tmp/x:../../escaped", CapturePolicy::AlwaysCapture).is_err());
        assert!(parse_capture("/tmp/x:", CapturePolicy::AlwaysCapture).is_err());
        assert!(parse_reuse("exp-a/f:../g").is_err());
    }

    #[test]
    fn reuse_parses_experiment_key_and_local_key() {
        let r = parse_reuse("exp-a/f:g").unwrap();
        assert_eq!(r.key, "g");
        assert_eq!(
            r.source,
            ArtifactSource::ExperimentAlias {
                experiment: "exp-a".to_string(),
                key: "f".to_string()
            }
        );
        assert_eq!(r.policy, CapturePolicy::Reuse);
        assert!(parse_reuse("no-slash:g").is_err());
    }

    #[test]
    fn hyperparam_needs_equals() {
        assert_eq!(
            parse_hyperparam("learning_rate=0.4").unwrap(),
            ("learning_rate".to_string(), "0.4".to_string())
        );
        assert!(parse_hyperparam("learning_rate").is_err());
    }
}
