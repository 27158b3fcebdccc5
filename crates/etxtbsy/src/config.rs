use crate::worker::WorkerId;
use anyhow::{bail, Result};
use serde::Deserialize;
use slog::Level;
use std::{
    fmt::{self, Debug, Formatter},
    os::unix::ffi::OsStrExt as _,
    path::PathBuf,
};
use strum::Display;

pub const DEFAULT_WORKERS: usize = 20;
pub const DEFAULT_SCRATCH_DIR: &str = "/var/tmp";
pub const DEFAULT_FILE_PREFIX: &str = "fork-exec-";
pub const DEFAULT_PAYLOAD: &[u8] = b"#!/bin/sh\nexit 0\n";

/// Everything a run of the harness depends on. The binary always uses [`Config::default`].
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct Config {
    /// The number of workers. Each gets its own thread and its own scratch file.
    pub workers: usize,

    /// The directory the scratch files are created in.
    pub scratch_dir: PathBuf,

    /// The scratch file name is this prefix followed by the worker's identity.
    pub file_prefix: String,

    /// The script written to every scratch file.
    pub payload: Payload,

    /// How many iterations each worker runs before returning.
    pub iterations: Iterations,

    pub handshake: Handshake,

    /// Minimum log level to output.
    pub log_level: LogLevel,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            scratch_dir: PathBuf::from(DEFAULT_SCRATCH_DIR),
            file_prefix: DEFAULT_FILE_PREFIX.into(),
            payload: Payload::default(),
            iterations: Iterations::default(),
            handshake: Handshake::default(),
            log_level: LogLevel::Info,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            bail!("at least one worker is required");
        }
        if self.payload.as_bytes().is_empty() {
            bail!("payload must not be empty");
        }
        if self.file_prefix.contains(['/', '\0']) {
            bail!(
                "file prefix {:?} must not contain '/' or NUL characters",
                self.file_prefix
            );
        }
        if self.scratch_dir.as_os_str().as_bytes().contains(&0) {
            bail!(
                "scratch directory {:?} must not contain NUL characters",
                self.scratch_dir
            );
        }
        Ok(())
    }

    /// The scratch file owned by `id`. Distinct identities always map to distinct paths.
    pub fn scratch_path(&self, id: WorkerId) -> PathBuf {
        self.scratch_dir.join(format!("{}{id}", self.file_prefix))
    }
}

#[derive(Clone, Deserialize, Eq, PartialEq)]
#[serde(from = "String")]
pub struct Payload(Vec<u8>);

impl Payload {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Default for Payload {
    fn default() -> Self {
        Self(DEFAULT_PAYLOAD.to_vec())
    }
}

impl From<String> for Payload {
    fn from(script: String) -> Self {
        Self(script.into_bytes())
    }
}

impl From<&str> for Payload {
    fn from(script: &str) -> Self {
        Self(script.as_bytes().to_vec())
    }
}

impl Debug for Payload {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Debug::fmt(&String::from_utf8_lossy(&self.0), f)
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(from = "u64")]
pub enum Iterations {
    /// Run until the process is killed or a worker hits a fatal error.
    #[default]
    Unbounded,
    Bounded(u64),
}

impl Iterations {
    /// Whether another iteration may start after `completed` have finished.
    pub fn allows(self, completed: u64) -> bool {
        match self {
            Iterations::Unbounded => true,
            Iterations::Bounded(limit) => completed < limit,
        }
    }
}

impl From<u64> for Iterations {
    fn from(limit: u64) -> Self {
        Iterations::Bounded(limit)
    }
}

/// What a worker does to the scratch file between writing it and executing it.
#[derive(Clone, Copy, Debug, Default, Deserialize, Display, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Handshake {
    /// Take an exclusive lock on the written descriptor and close it, then open the file again
    /// read-only and take a shared lock on the new descriptor before closing it and forking.
    #[default]
    Flock,

    /// Close the written descriptor and fork right away. This is the unprotected baseline.
    None,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum LogLevel {
    Error,
    Warning,
    Info,
    Debug,
}

impl LogLevel {
    pub fn as_slog_level(&self) -> Level {
        match self {
            LogLevel::Error => Level::Error,
            LogLevel::Warning => Level::Warning,
            LogLevel::Info => Level::Info,
            LogLevel::Debug => Level::Debug,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{collections::HashSet, path::Path};

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.workers, 20);
        assert_eq!(config.scratch_dir, Path::new("/var/tmp"));
        assert_eq!(config.payload.as_bytes(), b"#!/bin/sh\nexit 0\n");
        assert_eq!(config.iterations, Iterations::Unbounded);
        assert_eq!(config.handshake, Handshake::Flock);
        assert_eq!(config.log_level, LogLevel::Info);
        config.validate().unwrap();
    }

    #[test]
    fn scratch_path_appends_identity_to_prefix() {
        let config = Config::default();
        assert_eq!(
            config.scratch_path(WorkerId::from(7)),
            Path::new("/var/tmp/fork-exec-7")
        );
    }

    #[test]
    fn scratch_paths_are_disjoint() {
        let config = Config {
            workers: 1000,
            ..Default::default()
        };
        let paths: HashSet<_> = (0..config.workers)
            .map(|id| config.scratch_path(WorkerId::from(id)))
            .collect();
        assert_eq!(paths.len(), config.workers);
    }

    #[test]
    fn deserialize_empty_is_default() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn deserialize_all_fields() {
        let config: Config = toml::from_str(
            r##"
            workers = 2
            scratch-dir = "/tmp/scratch"
            file-prefix = "race-"
            payload = "#!/bin/sh\nexit 3\n"
            iterations = 50
            handshake = "none"
            log-level = "debug"
            "##,
        )
        .unwrap();
        assert_eq!(
            config,
            Config {
                workers: 2,
                scratch_dir: "/tmp/scratch".into(),
                file_prefix: "race-".into(),
                payload: "#!/bin/sh\nexit 3\n".into(),
                iterations: Iterations::Bounded(50),
                handshake: Handshake::None,
                log_level: LogLevel::Debug,
            }
        );
    }

    #[test]
    fn deserialize_unknown_field_fails() {
        assert!(toml::from_str::<Config>("slots = 4").is_err());
    }

    #[test]
    fn zero_workers_is_invalid() {
        let config = Config {
            workers: 0,
            ..Default::default()
        };
        assert_eq!(
            config.validate().unwrap_err().to_string(),
            "at least one worker is required"
        );
    }

    #[test]
    fn empty_payload_is_invalid() {
        let config = Config {
            payload: "".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn prefix_with_separator_is_invalid() {
        let config = Config {
            file_prefix: "../fork-exec-".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn bounded_iterations() {
        assert!(Iterations::Bounded(2).allows(0));
        assert!(Iterations::Bounded(2).allows(1));
        assert!(!Iterations::Bounded(2).allows(2));
        assert!(!Iterations::Bounded(0).allows(0));
        assert!(Iterations::Unbounded.allows(u64::MAX));
    }

    #[test]
    fn handshake_display() {
        assert_eq!(Handshake::Flock.to_string(), "flock");
        assert_eq!(Handshake::None.to_string(), "none");
    }
}
