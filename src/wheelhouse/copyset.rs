use std::path::{Component, Path, PathBuf};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use super::error::{Error, Stage};

// Directories picked up by an allow-list when they exist.
pub const ASSET_DIRS: &[&str] = &["static", "templates"];

#[derive(Debug, Clone, Copy, ValueEnum, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CopyMode {
    Full,
    AllowList,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode", content = "paths", rename_all = "kebab-case")]
pub enum CopySet {
    AllowList(Vec<PathBuf>),
    Full,
}

impl CopySet {
    pub fn validate(&self) -> Result<(), Error> {
        if let CopySet::AllowList(paths) = self {
            for p in paths {
                let escapes = p.is_absolute()
                    || p.components().any(|c| matches!(c, Component::ParentDir));
                if escapes || p.as_os_str().is_empty() {
                    return Err(Error::build(
                        Stage::ImageBuild,
                        format!("copy path {} must be relative to the project root", p.display()),
                    ));
                }
            }
        }
        Ok(())
    }

    /// `(source, destination)` pairs; sources are relative to the project root,
    /// destinations to the image working directory.
    pub fn copy_pairs(&self) -> Vec<(String, String)> {
        match self {
            CopySet::Full => vec![(".".to_string(), ".".to_string())],
            CopySet::AllowList(paths) => paths
                .iter()
                .map(|p| {
                    let s = p.to_string_lossy().trim_end_matches('/').to_string();
                    let dst = format!("./{}", s);
                    (s, dst)
                })
                .collect(),
        }
    }
}

/// Builds the allow-list: the entry file, internal packages and asset directories present in the project.
pub fn allow_list(project_root: &Path, entry_file: Option<&Path>, packages: &[PathBuf]) -> CopySet {
    let mut paths: Vec<PathBuf> = vec![];
    if let Some(entry) = entry_file {
        paths.push(entry.to_path_buf());
    }
    for pkg in packages {
        if !paths.contains(pkg) {
            paths.push(pkg.clone());
        }
    }
    for dir in ASSET_DIRS {
        let p = PathBuf::from(dir);
        if project_root.join(&p).is_dir() && !paths.contains(&p) {
            paths.push(p);
        }
    }
    CopySet::AllowList(paths)
}
