// Dependency manifest detection and parsing.

use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

use clap::ValueEnum;
use log::{debug, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::error::Error;

pub const LOCKFILE: &str = "uv.lock";
pub const PROJECT_MANIFEST: &str = "pyproject.toml";
pub const REQUIREMENTS: &str = "requirements.txt";

#[derive(Debug, Clone, Copy, ValueEnum, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ManifestKind {
    Lockfile,
    ProjectManifest,
    Requirements,
}

impl ManifestKind {
    /// Precedence order used when more than one manifest is present.
    pub const PRECEDENCE: [ManifestKind; 3] = [
        ManifestKind::Lockfile,
        ManifestKind::ProjectManifest,
        ManifestKind::Requirements,
    ];

    pub fn filename(&self) -> &'static str {
        match self {
            ManifestKind::Lockfile => LOCKFILE,
            ManifestKind::ProjectManifest => PROJECT_MANIFEST,
            ManifestKind::Requirements => REQUIREMENTS,
        }
    }

    /// Files that must be present in the image before the install step runs.
    pub fn install_inputs(&self) -> Vec<&'static str> {
        match self {
            // uv sync reads the project table alongside the lock.
            ManifestKind::Lockfile => vec![PROJECT_MANIFEST, LOCKFILE],
            ManifestKind::ProjectManifest => vec![PROJECT_MANIFEST],
            ManifestKind::Requirements => vec![REQUIREMENTS],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    pub kind: ManifestKind,
    pub path: PathBuf,
    pub packages: Vec<String>,
    /// Files pulled in with `-r`/`-c`, relative to the project root.
    #[serde(default)]
    pub includes: Vec<PathBuf>,
}

impl Manifest {
    pub fn filename(&self) -> &'static str {
        self.kind.filename()
    }

    pub fn contains(&self, package: &str) -> bool {
        let wanted = normalize_name(package);
        self.packages.iter().any(|p| *p == wanted)
    }
}

/// Returns the authoritative manifest for the project, if any.
pub fn detect(project_root: &Path) -> Result<Option<Manifest>, Error> {
    for kind in ManifestKind::PRECEDENCE {
        let path = project_root.join(kind.filename());
        if !path.is_file() {
            continue;
        }
        if kind == ManifestKind::Lockfile && !project_root.join(PROJECT_MANIFEST).is_file() {
            warn!(
                "{} found without {}; uv sync will not be able to install it",
                LOCKFILE, PROJECT_MANIFEST
            );
        }
        let (packages, includes) = match kind {
            ManifestKind::Requirements => read_requirements(project_root)?,
            _ => (read_packages(kind, &path)?, vec![]),
        };
        debug!(
            "Using {} with {} declared packages",
            kind.filename(),
            packages.len()
        );
        return Ok(Some(Manifest {
            kind,
            path: PathBuf::from(kind.filename()),
            packages,
            includes,
        }));
    }
    debug!("No dependency manifest in {}", project_root.display());
    Ok(None)
}

fn read_packages(kind: ManifestKind, path: &Path) -> Result<Vec<String>, Error> {
    let text = std::fs::read_to_string(path).map_err(|e| Error::Manifest {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let parsed = match kind {
        ManifestKind::Lockfile => parse_lockfile(&text),
        ManifestKind::ProjectManifest => parse_pyproject(&text),
        ManifestKind::Requirements => Ok(parse_requirements(&text)),
    };
    parsed.map_err(|reason| Error::Manifest {
        path: path.to_path_buf(),
        reason,
    })
}

// Follows `-r`/`-c` includes from requirements.txt. Included requirement files
// contribute packages; constraint files only need to be present.
fn read_requirements(project_root: &Path) -> Result<(Vec<String>, Vec<PathBuf>), Error> {
    let mut packages: Vec<String> = vec![];
    let mut includes: Vec<PathBuf> = vec![];
    let mut pending = vec![(PathBuf::from(REQUIREMENTS), true)];

    while let Some((relative, with_packages)) = pending.pop() {
        let path = project_root.join(&relative);
        let text = std::fs::read_to_string(&path).map_err(|e| Error::Manifest {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        if with_packages {
            for name in parse_requirements(&text) {
                if !packages.contains(&name) {
                    packages.push(name);
                }
            }
        }
        for include in parse_includes(&text) {
            let base = relative.parent().unwrap_or_else(|| Path::new(""));
            let target = match within_root(&base.join(&include.path)) {
                Some(target) => target,
                None => {
                    warn!("Ignoring {} outside the project root", include.path);
                    continue;
                }
            };
            if target == Path::new(REQUIREMENTS) || includes.contains(&target) {
                continue;
            }
            if !project_root.join(&target).is_file() {
                return Err(Error::Manifest {
                    path: path.clone(),
                    reason: format!("included file {} does not exist", target.display()),
                });
            }
            includes.push(target.clone());
            pending.push((target, !include.constraint));
        }
    }
    Ok((packages, includes))
}

#[derive(Debug, PartialEq, Eq)]
struct Include {
    path: String,
    constraint: bool,
}

// `-r file`, `-rfile`, `--requirement file`, `--requirement=file` and the `-c` forms.
fn parse_includes(text: &str) -> Vec<Include> {
    static INCLUDE: OnceLock<Regex> = OnceLock::new();
    let re = INCLUDE.get_or_init(|| {
        Regex::new(r"^(?:-(r|c)\s*|--(requirement|constraint)(?:\s+|\s*=\s*))(\S+)").expect("valid regex")
    });
    text.lines()
        .filter_map(|line| {
            let caps = re.captures(line.trim())?;
            let flag = caps.get(1).or_else(|| caps.get(2))?.as_str();
            let path = caps.get(3)?.as_str();
            // Remote includes are fetched by the installer itself.
            if path.contains("://") {
                return None;
            }
            Some(Include {
                path: path.to_string(),
                constraint: flag.starts_with('c'),
            })
        })
        .collect()
}

// Lexically normalizes a relative path, rejecting anything that leaves the root.
fn within_root(path: &Path) -> Option<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    return None;
                }
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if normalized.as_os_str().is_empty() {
        None
    } else {
        Some(normalized)
    }
}

/// PEP 503 name normalization.
pub fn normalize_name(name: &str) -> String {
    static SEPARATORS: OnceLock<Regex> = OnceLock::new();
    let re = SEPARATORS.get_or_init(|| Regex::new(r"[-_.]+").expect("valid regex"));
    re.replace_all(name.trim(), "-").to_lowercase()
}

fn requirement_name(spec: &str) -> Option<String> {
    static NAME: OnceLock<Regex> = OnceLock::new();
    let re = NAME.get_or_init(|| Regex::new(r"^([A-Za-z0-9][A-Za-z0-9._-]*)").expect("valid regex"));
    let spec = spec.trim();
    // Bare VCS or archive URLs carry no distribution name we can use.
    if spec.contains("://") {
        let (name, _) = spec.split_once(" @ ")?;
        return requirement_name(name);
    }
    let caps = re.captures(spec)?;
    Some(normalize_name(caps.get(1)?.as_str()))
}

pub fn parse_requirements(text: &str) -> Vec<String> {
    let mut packages = vec![];
    for line in text.lines() {
        let line = match line.find(" #") {
            Some(idx) => &line[..idx],
            None => line,
        };
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('-') {
            continue;
        }
        if let Some(name) = requirement_name(line) {
            if !packages.contains(&name) {
                packages.push(name);
            }
        }
    }
    packages
}

pub fn parse_pyproject(text: &str) -> Result<Vec<String>, String> {
    let doc: toml::Value = toml::from_str(text).map_err(|e| e.to_string())?;
    let mut packages = vec![];

    if let Some(deps) = doc
        .get("project")
        .and_then(|p| p.get("dependencies"))
        .and_then(|d| d.as_array())
    {
        for dep in deps.iter().filter_map(|d| d.as_str()) {
            if let Some(name) = requirement_name(dep) {
                if !packages.contains(&name) {
                    packages.push(name);
                }
            }
        }
    }

    if let Some(deps) = doc
        .get("tool")
        .and_then(|t| t.get("poetry"))
        .and_then(|p| p.get("dependencies"))
        .and_then(|d| d.as_table())
    {
        for key in deps.keys() {
            let name = normalize_name(key);
            if name != "python" && !packages.contains(&name) {
                packages.push(name);
            }
        }
    }

    Ok(packages)
}

pub fn parse_lockfile(text: &str) -> Result<Vec<String>, String> {
    let doc: toml::Value = toml::from_str(text).map_err(|e| e.to_string())?;
    let mut packages = vec![];
    let entries = doc
        .get("package")
        .and_then(|p| p.as_array())
        .cloned()
        .unwrap_or_default();
    for entry in entries {
        // The project itself is recorded as an editable or virtual source.
        let is_root = entry
            .get("source")
            .and_then(|s| s.as_table())
            .map(|s| s.contains_key("editable") || s.contains_key("virtual"))
            .unwrap_or(false);
        if is_root {
            continue;
        }
        if let Some(name) = entry.get("name").and_then(|n| n.as_str()) {
            let name = normalize_name(name);
            if !packages.contains(&name) {
                packages.push(name);
            }
        }
    }
    Ok(packages)
}
