// Application launcher: process environment, entry point command and port checks.

use std::collections::BTreeMap;
use std::fmt;
use std::net::TcpListener;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::error::Error;
use super::installer::INSTALLER;

pub const BIND_HOST: &str = "0.0.0.0";
pub const RELOAD_ENV: &str = "WHEELHOUSE_RELOAD";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Entrypoint {
    /// A script file executed directly by the interpreter.
    Script { path: PathBuf },
    /// An application object served by an ASGI server.
    Asgi { module: String, object: String },
}

impl Entrypoint {
    /// Accepts `module:object` or a path to a `.py` script.
    pub fn parse(s: &str) -> Result<Self, Error> {
        let s = s.trim();
        if let Some((module, object)) = s.split_once(':') {
            let valid = |part: &str| {
                !part.is_empty()
                    && part
                        .split('.')
                        .all(|seg| !seg.is_empty() && seg.chars().all(|c| c.is_alphanumeric() || c == '_'))
            };
            if !valid(module) || !valid(object) {
                return Err(Error::InvalidEntrypoint(s.to_string()));
            }
            return Ok(Entrypoint::Asgi {
                module: module.to_string(),
                object: object.to_string(),
            });
        }
        if s.ends_with(".py") && s.len() > 3 {
            return Ok(Entrypoint::Script {
                path: PathBuf::from(s),
            });
        }
        Err(Error::InvalidEntrypoint(s.to_string()))
    }

    /// Checks that the entry point's file exists under `project_root`.
    pub fn resolve(&self, project_root: &Path) -> Result<(), Error> {
        let file = match self {
            Entrypoint::Script { path } => path.clone(),
            Entrypoint::Asgi { module, .. } => {
                let as_file = PathBuf::from(format!("{}.py", module.replace('.', "/")));
                if project_root.join(&as_file).is_file() {
                    return Ok(());
                }
                PathBuf::from(module.replace('.', "/")).join("__init__.py")
            }
        };
        if project_root.join(&file).is_file() {
            Ok(())
        } else {
            Err(Error::start(format!(
                "entrypoint {} cannot be resolved in {}",
                self,
                project_root.display()
            )))
        }
    }
}

impl fmt::Display for Entrypoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entrypoint::Script { path } => write!(f, "{}", path.display()),
            Entrypoint::Asgi { module, object } => write!(f, "{}:{}", module, object),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchState {
    NotStarted,
    Running,
}

impl LaunchState {
    /// The only transition. A running process is never started again.
    pub fn start(self) -> Result<Self, Error> {
        match self {
            LaunchState::NotStarted => Ok(LaunchState::Running),
            LaunchState::Running => Err(Error::start("process is already running")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub entrypoint: Entrypoint,
    pub port: u16,
    pub reload: bool,
    pub venv: PathBuf,
}

impl LaunchSpec {
    /// Arguments for the long-running process, run through the installer so the
    /// isolated environment is used without activation.
    pub fn command(&self) -> Vec<String> {
        let mut cmd: Vec<String> = vec![INSTALLER.into(), "run".into(), "--no-sync".into()];
        match &self.entrypoint {
            Entrypoint::Script { path } => {
                cmd.push("python".into());
                cmd.push(path.to_string_lossy().to_string());
            }
            Entrypoint::Asgi { module, object } => {
                cmd.push("uvicorn".into());
                cmd.push(format!("{}:{}", module, object));
                cmd.extend(["--host".into(), BIND_HOST.into()]);
                cmd.extend(["--port".into(), self.port.to_string()]);
                if self.reload {
                    cmd.push("--reload".into());
                }
            }
        }
        cmd
    }

    /// Fixed for the lifetime of the process.
    pub fn process_env(&self) -> BTreeMap<String, String> {
        process_env(&self.venv, self.port)
    }
}

/// `PORT` carries the recipe's port to script entrypoints, which pick their own bind port.
pub fn process_env(venv: &Path, port: u16) -> BTreeMap<String, String> {
    let venv_str = venv.to_string_lossy().to_string();
    let mut env = BTreeMap::new();
    env.insert("PORT".to_string(), port.to_string());
    env.insert("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string());
    env.insert("PYTHONUNBUFFERED".to_string(), "1".to_string());
    env.insert("VIRTUAL_ENV".to_string(), venv_str.clone());
    env.insert("UV_PROJECT_ENVIRONMENT".to_string(), venv_str);
    env
}

/// `PATH` with the environment's `bin` directory in front of `current`.
pub fn prepend_path(venv: &Path, current: &str) -> String {
    let bin = venv.join("bin").to_string_lossy().to_string();
    if current.is_empty() {
        bin
    } else {
        format!("{}:{}", bin, current)
    }
}

/// Reads the reload switch. Anything other than `1`/`true`/`yes`/`on` is off.
pub fn reload_from_env(value: Option<&str>) -> bool {
    matches!(
        value.map(|v| v.trim().to_ascii_lowercase()).as_deref(),
        Some("1") | Some("true") | Some("yes") | Some("on")
    )
}

pub fn ensure_port_free(host: &str, port: u16) -> Result<(), Error> {
    match TcpListener::bind((host, port)) {
        Ok(listener) => {
            drop(listener);
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => Err(Error::PortInUse(port)),
        Err(e) => Err(Error::start(format!("unable to bind {}:{}: {}", host, port, e))),
    }
}
