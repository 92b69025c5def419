use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Result;
use log::{debug, info};
use subprocess::{Popen, PopenConfig};

use super::error::Error;
use super::installer;
use super::launcher::{self, LaunchState, BIND_HOST};
use super::recipe::Recipe;
use super::utils::META_DIR;

pub struct NativeRunOpts {
    pub host: String,
    pub env_map: Vec<String>,
    pub timeout: Option<u32>,
    pub args: Vec<String>,
}

impl Default for NativeRunOpts {
    fn default() -> Self {
        Self {
            host: BIND_HOST.to_string(),
            env_map: vec![],
            timeout: None,
            args: vec![],
        }
    }
}

pub fn local_venv(project_root: &Path) -> PathBuf {
    project_root.join(META_DIR).join("venv")
}

/// Builds the isolated environment under `.wheelhouse/venv` and runs the entry
/// point in the foreground with inherited stdio.
pub fn run(project_root: &Path, recipe: &Recipe, opts: NativeRunOpts, start: Instant) -> Result<()> {
    let venv = local_venv(project_root);
    std::fs::create_dir_all(project_root.join(META_DIR))?;

    let plan = recipe.install_plan(&venv, project_root)?;
    installer::install_locally(&plan, project_root)?;

    let spec = recipe.launch_spec(&venv);
    spec.entrypoint.resolve(project_root)?;
    launcher::ensure_port_free(&opts.host, spec.port)?;

    let mut cmd = spec.command();
    cmd.extend(opts.args.iter().cloned());

    let popen_config = PopenConfig {
        cwd: Some(project_root.as_os_str().to_owned()),
        env: Some(launch_env(&venv, &spec.process_env(), &opts.env_map)),
        ..Default::default()
    };

    debug!("Running command: {}", cmd.join(" "));
    debug!("Time Elapsed in Setup: {:?}", start.elapsed());

    let mut p = Popen::create(cmd.as_slice(), popen_config)
        .map_err(|e| Error::start(format!("unable to start {}: {}", spec.entrypoint, e)))?;
    let state = LaunchState::NotStarted.start()?;
    info!("{} on port {} is {:?}", spec.entrypoint, spec.port, state);

    let status = if let Some(timeout_secs) = opts.timeout {
        debug!("Running with timeout: {} seconds", timeout_secs);
        match p.wait_timeout(Duration::from_secs(timeout_secs as u64))? {
            Some(status) => status,
            None => {
                p.terminate()?;
                return Err(Error::Timeout {
                    what: spec.entrypoint.to_string(),
                    secs: timeout_secs as u64,
                }
                .into());
            }
        }
    } else {
        p.wait()?
    };

    if !status.success() {
        return Err(Error::start(format!("{} exited with {:?}", spec.entrypoint, status)).into());
    }
    Ok(())
}

// Parent env, then the fixed process env, then user overrides. PATH gets the
// environment's bin directory in front.
fn launch_env(
    venv: &Path,
    process_env: &std::collections::BTreeMap<String, String>,
    env_map: &[String],
) -> Vec<(OsString, OsString)> {
    let mut extras: Vec<(String, String)> = process_env
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let path = env::var("PATH").unwrap_or_default();
    extras.push(("PATH".to_string(), launcher::prepend_path(venv, &path)));
    extras.extend(resolve_env_map(env_map));

    let mut vars: Vec<(OsString, OsString)> = env::vars_os().collect();
    for (key, value) in extras {
        vars.retain(|(k, _)| k != key.as_str());
        vars.push((key.into(), value.into()));
    }
    vars
}

// `KEY=VAL` is taken literally, a bare `KEY` is read from the current environment.
fn resolve_env_map(env_map: &[String]) -> Vec<(String, String)> {
    env_map
        .iter()
        .map(|x| match x.split_once('=') {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => (x.clone(), env::var(x).unwrap_or_default()),
        })
        .collect()
}
