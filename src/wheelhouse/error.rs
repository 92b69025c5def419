use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

// The stage of a build the failure was raised from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    BaseEnvironment,
    SystemDependencies,
    PythonDependencies,
    ImageBuild,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::BaseEnvironment => "base environment",
            Stage::SystemDependencies => "system dependencies",
            Stage::PythonDependencies => "python dependencies",
            Stage::ImageBuild => "image build",
        };
        f.write_str(s)
    }
}

/// Failures are either build-time or start-time. Both are fatal.
#[derive(Debug, Error)]
pub enum Error {
    #[error("build failed during {stage}: {reason}")]
    Build { stage: Stage, reason: String },

    #[error("start failed: {reason}")]
    Start { reason: String },

    #[error("no dependency manifest found in {0} (expected uv.lock, pyproject.toml or requirements.txt)")]
    MissingManifest(PathBuf),

    #[error("unable to read manifest {path}: {reason}")]
    Manifest { path: PathBuf, reason: String },

    #[error("port {0} is already bound")]
    PortInUse(u16),

    #[error("invalid entrypoint '{0}'")]
    InvalidEntrypoint(String),

    #[error("docker or podman not found")]
    EngineNotFound,

    #[error("{what} timed out after {secs} seconds")]
    Timeout { what: String, secs: u64 },
}

impl Error {
    pub fn build(stage: Stage, reason: impl Into<String>) -> Self {
        Error::Build {
            stage,
            reason: reason.into(),
        }
    }

    pub fn start(reason: impl Into<String>) -> Self {
        Error::Start {
            reason: reason.into(),
        }
    }

    pub fn is_build(&self) -> bool {
        matches!(
            self,
            Error::Build { .. }
                | Error::MissingManifest(_)
                | Error::Manifest { .. }
                | Error::EngineNotFound
        )
    }

    pub fn is_start(&self) -> bool {
        matches!(
            self,
            Error::Start { .. } | Error::PortInUse(_) | Error::InvalidEntrypoint(_)
        )
    }
}
