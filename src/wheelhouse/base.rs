// Base environment selection.

use std::path::Path;
use std::sync::OnceLock;

use clap::ValueEnum;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const DEFAULT_PYTHON_VERSION: &str = "3.12";

#[derive(Debug, Default, Clone, Copy, ValueEnum, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum BaseFlavor {
    // Ships with the uv installer.
    #[default]
    Alpine,
    // Needs uv bootstrapped through pip.
    DebianSlim,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BaseImage {
    pub flavor: BaseFlavor,
    pub python_version: String,
}

impl BaseImage {
    pub fn new(flavor: BaseFlavor, python_version: impl Into<String>) -> Self {
        Self {
            flavor,
            python_version: python_version.into(),
        }
    }

    pub fn image_ref(&self) -> String {
        match self.flavor {
            BaseFlavor::Alpine => format!("ghcr.io/astral-sh/uv:python{}-alpine", self.python_version),
            BaseFlavor::DebianSlim => format!("python:{}-slim", self.python_version),
        }
    }

    pub fn installer_bootstrap(&self) -> Option<&'static str> {
        match self.flavor {
            BaseFlavor::Alpine => None,
            BaseFlavor::DebianSlim => Some("pip install --no-cache-dir uv"),
        }
    }

    pub fn package_manager(&self) -> PackageManager {
        match self.flavor {
            BaseFlavor::Alpine => PackageManager::Apk,
            BaseFlavor::DebianSlim => PackageManager::Apt,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Apk,
    Apt,
}

impl PackageManager {
    /// Single shell command installing `packages`; `None` when there is nothing to install.
    pub fn install_command(&self, packages: &[String]) -> Option<String> {
        if packages.is_empty() {
            return None;
        }
        let list = packages.join(" ");
        Some(match self {
            PackageManager::Apk => format!("apk add --no-cache {}", list),
            PackageManager::Apt => format!(
                "apt-get update && apt-get install -y --no-install-recommends {} && rm -rf /var/lib/apt/lists/*",
                list
            ),
        })
    }
}

/// Reads the interpreter version from `.python-version` or `requires-python`.
pub fn detect_python_version(project_root: &Path) -> Option<String> {
    static VERSION: OnceLock<Regex> = OnceLock::new();
    static REQUIRES: OnceLock<Regex> = OnceLock::new();
    let version = VERSION.get_or_init(|| Regex::new(r"^(\d+\.\d+)").expect("valid regex"));
    let requires = REQUIRES
        .get_or_init(|| Regex::new(r#"requires-python\s*=\s*"([^"]*)""#).expect("valid regex"));

    if let Ok(content) = std::fs::read_to_string(project_root.join(".python-version")) {
        if let Some(caps) = version.captures(content.trim()) {
            return Some(caps[1].to_string());
        }
    }
    if let Ok(content) = std::fs::read_to_string(project_root.join("pyproject.toml")) {
        if let Some(caps) = requires.captures(&content) {
            return lower_bound(&caps[1]);
        }
    }
    None
}

// First clause that sets a floor or pins a version. Upper bounds and exclusions are skipped.
fn lower_bound(specifier: &str) -> Option<String> {
    static CLAUSE: OnceLock<Regex> = OnceLock::new();
    let clause = CLAUSE.get_or_init(|| Regex::new(r"^(?:>=|~=|==)?\s*(\d+\.\d+)").expect("valid regex"));
    specifier
        .split(',')
        .find_map(|c| clause.captures(c.trim()).map(|caps| caps[1].to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_image_refs() {
        let alpine = BaseImage::new(BaseFlavor::Alpine, "3.12");
        assert_eq!(alpine.image_ref(), "ghcr.io/astral-sh/uv:python3.12-alpine");
        assert_eq!(alpine.installer_bootstrap(), None);

        let slim = BaseImage::new(BaseFlavor::DebianSlim, "3.11");
        assert_eq!(slim.image_ref(), "python:3.11-slim");
        assert_eq!(slim.installer_bootstrap(), Some("pip install --no-cache-dir uv"));
    }

    #[test]
    fn test_install_command() {
        let pkgs = vec!["build-base".to_string(), "mariadb-dev".to_string()];
        assert_eq!(
            PackageManager::Apk.install_command(&pkgs).unwrap(),
            "apk add --no-cache build-base mariadb-dev"
        );
        assert!(PackageManager::Apt
            .install_command(&pkgs)
            .unwrap()
            .starts_with("apt-get update && apt-get install -y --no-install-recommends build-base"));
        assert_eq!(PackageManager::Apt.install_command(&[]), None);
    }

    #[test]
    fn test_detect_python_version_file() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join(".python-version"), "3.11.9\n").unwrap();
        assert_eq!(detect_python_version(temp_dir.path()), Some("3.11".to_string()));
    }

    #[test]
    fn test_detect_python_version_requires_python() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(
            temp_dir.path().join("pyproject.toml"),
            "[project]\nrequires-python = \">=3.13\"\n",
        )
        .unwrap();
        assert_eq!(detect_python_version(temp_dir.path()), Some("3.13".to_string()));
    }

    #[test]
    fn test_requires_python_upper_bound_is_not_a_version() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(
            temp_dir.path().join("pyproject.toml"),
            "[project]\nrequires-python = \"<3.13\"\n",
        )
        .unwrap();
        assert_eq!(detect_python_version(temp_dir.path()), None);

        assert_eq!(lower_bound("<3.13, >=3.10"), Some("3.10".to_string()));
        assert_eq!(lower_bound("~=3.11"), Some("3.11".to_string()));
        assert_eq!(lower_bound("==3.12.*"), Some("3.12".to_string()));
        assert_eq!(lower_bound("!=3.11,>3.9"), None);
    }

    #[test]
    fn test_detect_python_version_none() {
        let temp_dir = TempDir::new().unwrap();
        assert_eq!(detect_python_version(temp_dir.path()), None);
    }
}
