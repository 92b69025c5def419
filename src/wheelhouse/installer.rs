// Python dependency installation into an isolated environment.
//
// The environment is always scoped to the image (or the project's .wheelhouse
// directory when launching locally). Nothing is installed into a system interpreter.

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::ValueEnum;
use log::{debug, log_enabled, warn};
use serde::{Deserialize, Serialize};

use super::error::{Error, Stage};
use super::manifest::{Manifest, ManifestKind};

pub const INSTALLER: &str = "uv";

/// What to do when the project has no dependency manifest.
#[derive(Debug, Default, Clone, Copy, ValueEnum, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MissingManifestPolicy {
    /// Install nothing beyond the base image. Logged as a warning.
    #[default]
    Skip,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallStep {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl InstallStep {
    fn uv(args: &[&str]) -> Self {
        Self {
            program: INSTALLER.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            env: vec![],
        }
    }

    fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    /// Shell form, used for `RUN` instructions.
    pub fn shell(&self) -> String {
        let mut parts: Vec<String> = self.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        parts.push(self.program.clone());
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

#[derive(Debug, Clone)]
pub struct InstallPlan {
    pub manifest: Option<Manifest>,
    pub venv: PathBuf,
    pub create_venv: InstallStep,
    pub install: Option<InstallStep>,
}

impl InstallPlan {
    pub fn steps(&self) -> Vec<&InstallStep> {
        std::iter::once(&self.create_venv)
            .chain(self.install.iter())
            .collect()
    }

    /// Files the install step reads, relative to the project root.
    pub fn inputs(&self) -> Vec<&'static str> {
        self.manifest
            .as_ref()
            .map(|m| m.kind.install_inputs())
            .unwrap_or_default()
    }

    /// Requirement files reached through `-r`/`-c`, relative to the project root.
    pub fn includes(&self) -> &[PathBuf] {
        self.manifest
            .as_ref()
            .map(|m| m.includes.as_slice())
            .unwrap_or_default()
    }
}

pub fn plan(
    manifest: Option<&Manifest>,
    venv: &Path,
    policy: MissingManifestPolicy,
    project_root: &Path,
) -> Result<InstallPlan, Error> {
    let venv_str = venv.to_string_lossy().to_string();
    let python = venv.join("bin").join("python").to_string_lossy().to_string();
    let create_venv = InstallStep::uv(&["venv", &venv_str]);

    let install = match manifest {
        Some(m) => Some(match m.kind {
            ManifestKind::Lockfile => {
                InstallStep::uv(&["sync", "--frozen", "--no-dev", "--no-install-project"])
                    .with_env("UV_PROJECT_ENVIRONMENT", &venv_str)
            }
            ManifestKind::ProjectManifest | ManifestKind::Requirements => InstallStep::uv(&[
                "pip",
                "install",
                "--python",
                &python,
                "-r",
                m.filename(),
            ]),
        }),
        None => match policy {
            MissingManifestPolicy::Skip => {
                warn!(
                    "No dependency manifest found in {}; dependency installation is skipped",
                    project_root.display()
                );
                None
            }
            MissingManifestPolicy::Fail => {
                return Err(Error::MissingManifest(project_root.to_path_buf()))
            }
        },
    };

    Ok(InstallPlan {
        manifest: manifest.cloned(),
        venv: venv.to_path_buf(),
        create_venv,
        install,
    })
}

/// Runs the plan against the local filesystem. A failed install removes the
/// environment it created so no partial state is left behind.
pub fn install_locally(plan: &InstallPlan, project_root: &Path) -> Result<()> {
    let created = !plan.venv.exists();
    if created {
        debug!("Creating isolated environment at {:?}", plan.venv);
        run_step(&plan.create_venv, project_root)?;
    } else {
        debug!("Reusing isolated environment at {:?}", plan.venv);
    }

    if let Some(step) = &plan.install {
        if let Err(e) = run_step(step, project_root) {
            if created {
                let _ = std::fs::remove_dir_all(&plan.venv);
            }
            return Err(e);
        }
    }
    Ok(())
}

fn run_step(step: &InstallStep, project_root: &Path) -> Result<()> {
    debug!("Running: {}", step.shell());
    let mut cmd = std::process::Command::new(&step.program);
    cmd.args(&step.args).current_dir(project_root);
    for (k, v) in &step.env {
        cmd.env(k, v);
    }

    let failure = if log_enabled!(log::Level::Debug) {
        let status = cmd.status().map_err(|e| spawn_error(step, e))?;
        (!status.success()).then(|| format!("'{}' exited with {}", step.shell(), status))
    } else {
        let output = cmd.output().map_err(|e| spawn_error(step, e))?;
        (!output.status.success()).then(|| {
            format!(
                "'{}' exited with {}: {}",
                step.shell(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )
        })
    };

    match failure {
        Some(reason) => Err(Error::build(Stage::PythonDependencies, reason).into()),
        None => Ok(()),
    }
}

fn spawn_error(step: &InstallStep, e: std::io::Error) -> Error {
    Error::build(
        Stage::PythonDependencies,
        format!("unable to start {}: {}", step.program, e),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(kind: ManifestKind, packages: &[&str]) -> Manifest {
        Manifest {
            kind,
            path: PathBuf::from(kind.filename()),
            packages: packages.iter().map(|s| s.to_string()).collect(),
            includes: vec![],
        }
    }

    #[test]
    fn test_plan_lockfile_targets_venv() {
        let m = manifest(ManifestKind::Lockfile, &["flask"]);
        let plan = plan(Some(&m), Path::new("/opt/venv"), MissingManifestPolicy::Skip, Path::new("/app")).unwrap();
        assert_eq!(plan.create_venv.shell(), "uv venv /opt/venv");
        assert_eq!(
            plan.install.unwrap().shell(),
            "UV_PROJECT_ENVIRONMENT=/opt/venv uv sync --frozen --no-dev --no-install-project"
        );
    }

    #[test]
    fn test_plan_requirements_targets_venv_python() {
        let m = manifest(ManifestKind::Requirements, &["flask"]);
        let plan = plan(Some(&m), Path::new("/opt/venv"), MissingManifestPolicy::Skip, Path::new("/app")).unwrap();
        let install = plan.install.as_ref().unwrap().shell();
        assert_eq!(install, "uv pip install --python /opt/venv/bin/python -r requirements.txt");
        assert!(!install.contains("--system"));
        assert_eq!(plan.inputs(), vec!["requirements.txt"]);
    }

    #[test]
    fn test_plan_project_manifest() {
        let m = manifest(ManifestKind::ProjectManifest, &["fastapi"]);
        let plan = plan(Some(&m), Path::new("/opt/venv"), MissingManifestPolicy::Skip, Path::new("/app")).unwrap();
        assert!(plan.install.unwrap().shell().ends_with("-r pyproject.toml"));
    }

    #[test]
    fn test_plan_missing_manifest_skip_is_noop() {
        let plan = plan(None, Path::new("/opt/venv"), MissingManifestPolicy::Skip, Path::new("/app")).unwrap();
        assert!(plan.install.is_none());
        assert_eq!(plan.steps().len(), 1);
        assert!(plan.inputs().is_empty());
    }

    #[test]
    fn test_plan_missing_manifest_fail() {
        let err = plan(None, Path::new("/opt/venv"), MissingManifestPolicy::Fail, Path::new("/app")).unwrap_err();
        assert!(matches!(err, Error::MissingManifest(_)));
        assert!(err.is_build());
    }

    #[test]
    fn test_install_locally_missing_installer_reports_build_failure() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let mut plan = plan(
            None,
            &temp_dir.path().join("venv"),
            MissingManifestPolicy::Skip,
            temp_dir.path(),
        )
        .unwrap();
        plan.create_venv.program = "wheelhouse-no-such-installer".to_string();

        let err = install_locally(&plan, temp_dir.path()).unwrap_err();
        let err = err.downcast::<Error>().unwrap();
        assert!(err.is_build());
        assert!(!temp_dir.path().join("venv").exists());
    }
}
