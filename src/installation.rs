//! Locating a `PostgreSQL` toolchain through `pg_config`.

use std::{
    env,
    ffi::{OsStr, OsString},
    io,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use thiserror::Error;
use tracing::{debug, warn};

/// Environment variable holding an explicit `pg_config` path.
pub const INSTALLATION_ENV: &str = "PGINSTALLATION";

const PG_CONFIG: &str = "pg_config";

/// Failure to interrogate a `pg_config` binary.
#[derive(Debug, Error)]
pub enum InstallationError {
    /// The binary could not be executed.
    #[error("failed to run {path}: {source}")]
    Spawn {
        /// Path that was executed.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },
    /// The binary ran but reported failure.
    #[error("{path} {flag} exited with {status}")]
    Failed {
        /// Path that was executed.
        path: PathBuf,
        /// Flag passed to `pg_config`.
        flag: &'static str,
        /// Exit status as reported by the OS.
        status: std::process::ExitStatus,
    },
    /// The binary printed nothing for a query.
    #[error("{path} {flag} printed nothing")]
    EmptyOutput {
        /// Path that was executed.
        path: PathBuf,
        /// Flag passed to `pg_config`.
        flag: &'static str,
    },
}

/// A discovered server toolchain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Installation {
    pg_config: PathBuf,
    bindir: PathBuf,
    version: String,
}

impl Installation {
    /// Interrogates the `pg_config` at `pg_config`.
    ///
    /// # Errors
    ///
    /// Returns an error when the binary cannot be run or does not answer
    /// `--bindir` and `--version`.
    pub fn from_pg_config(pg_config: impl Into<PathBuf>) -> Result<Self, InstallationError> {
        let pg_config = pg_config.into();
        let bindir = PathBuf::from(query(&pg_config, "--bindir")?);
        let version = query(&pg_config, "--version")?;
        Ok(Self {
            pg_config,
            bindir,
            version,
        })
    }

    /// Finds the default installation for this process.
    ///
    /// `PGINSTALLATION`, when set, is the only candidate. Otherwise the first
    /// executable `pg_config` on `PATH` is used.
    #[must_use]
    pub fn discover() -> Option<Self> {
        Self::discover_from(env::var_os(INSTALLATION_ENV), env::var_os("PATH"))
    }

    /// [`discover`](Self::discover) with the environment passed in.
    #[must_use]
    pub fn discover_from(explicit: Option<OsString>, search_path: Option<OsString>) -> Option<Self> {
        let candidate = match explicit {
            Some(path) if !path.is_empty() => PathBuf::from(path),
            _ => search_path.as_deref().and_then(find_on_path)?,
        };
        match Self::from_pg_config(&candidate) {
            Ok(installation) => {
                debug!(
                    pg_config = %candidate.display(),
                    version = %installation.version,
                    "found installation"
                );
                Some(installation)
            }
            Err(e) => {
                warn!(pg_config = %candidate.display(), error = %e, "unusable pg_config");
                None
            }
        }
    }

    /// Path of the `pg_config` this installation was read from.
    #[must_use]
    pub fn pg_config(&self) -> &Path { &self.pg_config }

    /// Directory holding `initdb`, `pg_ctl` and friends.
    #[must_use]
    pub fn bindir(&self) -> &Path { &self.bindir }

    /// Version string as printed by `pg_config --version`.
    #[must_use]
    pub fn version(&self) -> &str { &self.version }

    /// Path of a toolchain binary.
    #[must_use]
    pub fn binary(&self, name: &str) -> PathBuf { self.bindir.join(name) }
}

fn query(pg_config: &Path, flag: &'static str) -> Result<String, InstallationError> {
    let output = Command::new(pg_config)
        .arg(flag)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .map_err(|source| InstallationError::Spawn {
            path: pg_config.to_path_buf(),
            source,
        })?;
    if !output.status.success() {
        return Err(InstallationError::Failed {
            path: pg_config.to_path_buf(),
            flag,
            status: output.status,
        });
    }
    let text = String::from_utf8_lossy(&output.stdout).trim().to_owned();
    if text.is_empty() {
        return Err(InstallationError::EmptyOutput {
            path: pg_config.to_path_buf(),
            flag,
        });
    }
    Ok(text)
}

fn find_on_path(search_path: &OsStr) -> Option<PathBuf> {
    env::split_paths(search_path)
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(|dir| dir.join(PG_CONFIG))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    path.metadata()
        .is_ok_and(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool { path.is_file() }
