// SPDX-License-Identifier: AGPL-3.0-or-later
//! `stow.toml` loading

use directories::ProjectDirs;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use stow_core::{StowError, StowResult};
use stow_engine::{EngineConfig, SecurityPolicy};

const CONFIG_FILE: &str = "stow.toml";
const STATE_FILE: &str = "storages.toml";

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Where registered storages are persisted
    pub state_file: Option<PathBuf>,
    pub engine: EngineSection,
    pub security: SecuritySection,
}

/// Engine tunables; unset fields keep the engine defaults
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineSection {
    pub chunk_size: Option<usize>,
    pub workers_per_job: Option<usize>,
    pub max_concurrent_jobs: Option<usize>,
    pub io_timeout_secs: Option<u64>,
    pub max_job_duration_secs: Option<u64>,
    pub job_retention_secs: Option<u64>,
    pub progress_interval_ms: Option<u64>,
    pub progress_bytes: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SecuritySection {
    pub allow_local_ips: bool,
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("dev", "stowage", "stow")
}

impl Config {
    /// Default location of `stow.toml`
    pub fn default_path() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }

    /// Load from `path`, or from the default location. A missing file at the
    /// default location means all defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> StowResult<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match Self::default_path() {
                Some(p) => (p, false),
                None => return Ok(Self::default()),
            },
        };
        match std::fs::read_to_string(&path) {
            Ok(text) => Self::parse(&text).map_err(|e| match e {
                StowError::InvalidConfig(msg) => {
                    StowError::InvalidConfig(format!("{}: {msg}", path.display()))
                }
                other => other,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !explicit => Ok(Self::default()),
            Err(e) => Err(StowError::from_io(e, path.display().to_string())),
        }
    }

    pub fn parse(text: &str) -> StowResult<Self> {
        toml::from_str(text).map_err(|e| StowError::InvalidConfig(e.to_string()))
    }

    pub fn state_file(&self) -> StowResult<PathBuf> {
        if let Some(path) = &self.state_file {
            return Ok(path.clone());
        }
        project_dirs()
            .map(|dirs| dirs.data_dir().join(STATE_FILE))
            .ok_or_else(|| {
                StowError::InvalidConfig("no home directory; set state_file in stow.toml".into())
            })
    }

    pub fn engine(&self) -> EngineConfig {
        let defaults = EngineConfig::default();
        let e = &self.engine;
        EngineConfig {
            chunk_size: e.chunk_size.unwrap_or(defaults.chunk_size).max(1),
            workers_per_job: e.workers_per_job.unwrap_or(defaults.workers_per_job).max(1),
            max_concurrent_jobs: e
                .max_concurrent_jobs
                .unwrap_or(defaults.max_concurrent_jobs)
                .max(1),
            io_timeout: e.io_timeout_secs.map_or(defaults.io_timeout, Duration::from_secs),
            max_job_duration: e
                .max_job_duration_secs
                .map(Duration::from_secs)
                .or(defaults.max_job_duration),
            job_retention: e
                .job_retention_secs
                .map_or(defaults.job_retention, Duration::from_secs),
            progress_interval: e
                .progress_interval_ms
                .map_or(defaults.progress_interval, Duration::from_millis),
            progress_bytes: e.progress_bytes.unwrap_or(defaults.progress_bytes),
        }
    }

    pub fn security(&self) -> SecurityPolicy {
        SecurityPolicy {
            allow_local_ips: self.security.allow_local_ips,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_is_all_defaults() {
        let config = Config::parse("").unwrap();
        let engine = config.engine();
        let defaults = EngineConfig::default();
        assert_eq!(engine.chunk_size, defaults.chunk_size);
        assert_eq!(engine.io_timeout, defaults.io_timeout);
        assert!(!config.security().allow_local_ips);
    }

    #[test]
    fn test_sections_override_defaults() {
        let config = Config::parse(
            r#"
            state_file = "/tmp/stow-state.toml"

            [engine]
            workers_per_job = 8
            io_timeout_secs = 5
            max_job_duration_secs = 3600
            progress_interval_ms = 100

            [security]
            allow_local_ips = true
            "#,
        )
        .unwrap();
        let engine = config.engine();
        assert_eq!(engine.workers_per_job, 8);
        assert_eq!(engine.io_timeout, Duration::from_secs(5));
        assert_eq!(engine.max_job_duration, Some(Duration::from_secs(3600)));
        assert_eq!(engine.progress_interval, Duration::from_millis(100));
        assert!(config.security().allow_local_ips);
        assert_eq!(config.state_file().unwrap(), PathBuf::from("/tmp/stow-state.toml"));
    }

    #[test]
    fn test_unknown_keys_rejected() {
        assert!(matches!(
            Config::parse("[engine]\nworkers = 3\n"),
            Err(StowError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(Config::load(Some(&missing)).is_err());

        let present = dir.path().join("stow.toml");
        std::fs::write(&present, "[security]\nallow_local_ips = true\n").unwrap();
        assert!(Config::load(Some(&present)).unwrap().security().allow_local_ips);
    }
}
