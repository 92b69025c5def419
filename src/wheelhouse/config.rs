// Optional per-project settings read from wheelhouse.toml.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::debug;
use serde::Deserialize;

use super::copyset::CopyMode;
use super::installer::MissingManifestPolicy;
use super::recipe::Preset;
use super::sysdeps::DatabaseClient;

pub const CONFIG_FILE: &str = "wheelhouse.toml";

#[derive(Debug, Default, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    pub name: Option<String>,
    pub preset: Option<Preset>,
    pub python_version: Option<String>,
    pub port: Option<u16>,
    pub entrypoint: Option<String>,
    pub reload: Option<bool>,
    pub database_client: Option<DatabaseClient>,
    #[serde(default)]
    pub system_packages: Vec<String>,
    pub missing_manifest: Option<MissingManifestPolicy>,
    pub copy: Option<CopyMode>,
    #[serde(default)]
    pub copy_paths: Vec<PathBuf>,
    pub health_path: Option<String>,
    pub healthcheck: Option<bool>,
}

impl ProjectConfig {
    pub fn load(project_root: &Path) -> Result<Option<Self>> {
        let path = project_root.join(CONFIG_FILE);
        if !path.is_file() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path)?;
        let config = toml::from_str(&text)
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;
        debug!("Loaded project configuration: {:?}", config);
        Ok(Some(config))
    }
}
