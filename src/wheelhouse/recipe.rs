use std::env;
use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::ValueEnum;
use log::{debug, warn};
use pathdiff::diff_paths;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use super::base::{self, BaseFlavor, BaseImage};
use super::config::ProjectConfig;
use super::copyset::{self, CopyMode, CopySet};
use super::error::Error;
use super::health::HealthCheck;
use super::installer::{self, InstallPlan, MissingManifestPolicy};
use super::launcher::{self, Entrypoint, LaunchSpec, RELOAD_ENV};
use super::manifest::{self, Manifest};
use super::sysdeps::{self, DatabaseClient};
use super::utils::{self, Framework, META_DIR};

pub const RECIPE_FILE: &str = "recipe.json";
pub const IMAGE_WORKDIR: &str = "/app";
pub const IMAGE_VENV: &str = "/opt/venv";

#[derive(Debug, Clone, Copy, ValueEnum, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Preset {
    FlaskAlpine,
    FlaskSlim,
    FastapiSlim,
}

impl Preset {
    pub fn flavor(&self) -> BaseFlavor {
        match self {
            Preset::FlaskAlpine => BaseFlavor::Alpine,
            Preset::FlaskSlim | Preset::FastapiSlim => BaseFlavor::DebianSlim,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Preset::FlaskAlpine => 5000,
            Preset::FlaskSlim | Preset::FastapiSlim => 8080,
        }
    }

    pub fn copy_mode(&self) -> CopyMode {
        match self {
            Preset::FlaskAlpine | Preset::FlaskSlim => CopyMode::AllowList,
            Preset::FastapiSlim => CopyMode::Full,
        }
    }

    fn accepts(&self, framework: Framework) -> bool {
        match self {
            Preset::FlaskAlpine | Preset::FlaskSlim => framework != Framework::FastApi,
            Preset::FastapiSlim => framework == Framework::FastApi,
        }
    }

    fn for_framework(framework: Framework) -> Self {
        match framework {
            Framework::FastApi => Preset::FastapiSlim,
            Framework::Flask | Framework::Plain => Preset::FlaskAlpine,
        }
    }
}

// Recipe is the resolved build and launch configuration for one project.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Recipe {
    pub name: String,
    pub preset: Preset,
    pub base: BaseImage,
    pub database_client: DatabaseClient,
    pub system_packages: Vec<String>,
    pub manifest: Option<Manifest>,
    pub missing_manifest: MissingManifestPolicy,
    pub entrypoint: Entrypoint,
    pub port: u16,
    pub reload: bool,
    pub copy_set: CopySet,
    pub health: Option<HealthCheck>,
}

impl Recipe {
    pub fn load(project_root: &Path) -> Result<Self> {
        let recipe_file = project_root.join(META_DIR).join(RECIPE_FILE);
        let recipe_json = std::fs::read_to_string(recipe_file)?;
        let recipe: Recipe = serde_json::from_str(&recipe_json)?;
        Ok(recipe)
    }

    pub fn save(&self, project_root: &Path) -> Result<()> {
        let recipe_file = project_root.join(META_DIR).join(RECIPE_FILE);
        let recipe_json = serde_json::to_string_pretty(&self)?;
        std::fs::write(recipe_file, recipe_json)?;
        Ok(())
    }

    pub fn preset_name(&self) -> String {
        self.preset
            .to_possible_value()
            .map(|v| v.get_name().to_string())
            .unwrap_or_default()
    }

    /// Analyses the project, then applies `wheelhouse.toml` and the reload switch
    /// from the environment, in that order.
    pub fn builder(project_root: &Path) -> Result<RecipeBuilder> {
        let mut builder = analyse_project(project_root)?;
        if let Some(config) = ProjectConfig::load(project_root)? {
            builder = builder.apply_config(config)?;
        }
        if let Ok(value) = env::var(RELOAD_ENV) {
            builder = builder.reload(launcher::reload_from_env(Some(&value)));
        }
        Ok(builder)
    }

    pub fn install_plan(&self, venv: &Path, project_root: &Path) -> Result<InstallPlan, Error> {
        installer::plan(
            self.manifest.as_ref(),
            venv,
            self.missing_manifest,
            project_root,
        )
    }

    pub fn launch_spec(&self, venv: &Path) -> LaunchSpec {
        LaunchSpec {
            entrypoint: self.entrypoint.clone(),
            port: self.port,
            reload: self.reload,
            venv: venv.to_path_buf(),
        }
    }
}

#[derive(Debug, Clone)]
struct Candidate {
    entrypoint: Entrypoint,
    framework: Framework,
    priority: u8,
}

#[derive(Default, Debug)]
pub struct RecipeBuilder {
    project_root: PathBuf,
    name: Option<String>,
    preset: Option<Preset>,
    python_version: Option<String>,
    port: Option<u16>,
    entrypoint: Option<Entrypoint>,
    reload: Option<bool>,
    database_client: Option<DatabaseClient>,
    system_packages: Vec<String>,
    missing_manifest: Option<MissingManifestPolicy>,
    copy_mode: Option<CopyMode>,
    copy_paths: Vec<PathBuf>,
    health_path: Option<String>,
    healthcheck: Option<bool>,

    // Detected
    manifest: Option<Manifest>,
    detected_python: Option<String>,
    packages: Vec<PathBuf>,
    candidates: Vec<Candidate>,
}

impl RecipeBuilder {
    pub fn name(mut self, name: String) -> Self {
        self.name = Some(name);
        self
    }

    pub fn preset(mut self, preset: Preset) -> Self {
        self.preset = Some(preset);
        self
    }

    pub fn python_version(mut self, version: String) -> Self {
        self.python_version = Some(version);
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn entrypoint(mut self, entrypoint: Entrypoint) -> Self {
        self.entrypoint = Some(entrypoint);
        self
    }

    pub fn reload(mut self, reload: bool) -> Self {
        self.reload = Some(reload);
        self
    }

    pub fn database_client(mut self, client: DatabaseClient) -> Self {
        self.database_client = Some(client);
        self
    }

    pub fn system_packages(mut self, packages: Vec<String>) -> Self {
        self.system_packages.extend(packages);
        self
    }

    pub fn missing_manifest(mut self, policy: MissingManifestPolicy) -> Self {
        self.missing_manifest = Some(policy);
        self
    }

    pub fn copy_mode(mut self, mode: CopyMode) -> Self {
        self.copy_mode = Some(mode);
        self
    }

    pub fn copy_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.copy_paths = paths;
        self
    }

    pub fn health_path(mut self, path: String) -> Self {
        self.health_path = Some(path);
        self
    }

    pub fn healthcheck(mut self, enabled: bool) -> Self {
        self.healthcheck = Some(enabled);
        self
    }

    fn apply_config(mut self, config: ProjectConfig) -> Result<Self> {
        if let Some(entrypoint) = config.entrypoint {
            self.entrypoint = Some(Entrypoint::parse(&entrypoint)?);
        }
        self.name = config.name.or(self.name);
        self.preset = config.preset.or(self.preset);
        self.python_version = config.python_version.or(self.python_version);
        self.port = config.port.or(self.port);
        self.reload = config.reload.or(self.reload);
        self.database_client = config.database_client.or(self.database_client);
        self.system_packages.extend(config.system_packages);
        self.missing_manifest = config.missing_manifest.or(self.missing_manifest);
        self.copy_mode = config.copy.or(self.copy_mode);
        if !config.copy_paths.is_empty() {
            self.copy_paths = config.copy_paths;
        }
        self.health_path = config.health_path.or(self.health_path);
        self.healthcheck = config.healthcheck.or(self.healthcheck);
        Ok(self)
    }

    fn choose_entrypoint(&self) -> Result<(Entrypoint, Framework)> {
        let mut candidates: Vec<&Candidate> = self
            .candidates
            .iter()
            .filter(|c| self.preset.map(|p| p.accepts(c.framework)).unwrap_or(true))
            .collect();
        if candidates.is_empty() {
            return Err(anyhow::anyhow!(
                "Could not detect project entrypoint. Please specify it manually."
            ));
        }
        candidates.sort_by_key(|c| c.priority);
        if candidates.len() > 1 && candidates[0].priority == candidates[1].priority {
            let names: Vec<String> = candidates
                .iter()
                .filter(|c| c.priority == candidates[0].priority)
                .map(|c| c.entrypoint.to_string())
                .collect();
            return Err(anyhow::anyhow!(
                "Multiple entrypoints detected! {:?}. Please choose one with --entrypoint or --preset.",
                names
            ));
        }
        Ok((candidates[0].entrypoint.clone(), candidates[0].framework))
    }

    pub fn build(self) -> Result<Recipe> {
        let name = match &self.name {
            Some(name) if !name.trim().is_empty() => name.clone(),
            _ => {
                return Err(anyhow::anyhow!(
                    "Could not detect project name. Please specify it manually."
                ))
            }
        };

        let (entrypoint, framework) = match &self.entrypoint {
            Some(e) => {
                let framework = self
                    .candidates
                    .iter()
                    .find(|c| c.entrypoint == *e)
                    .map(|c| c.framework)
                    .unwrap_or(match e {
                        Entrypoint::Asgi { .. } => Framework::FastApi,
                        Entrypoint::Script { .. } => Framework::Plain,
                    });
                (e.clone(), framework)
            }
            None => self.choose_entrypoint()?,
        };
        debug!("Entrypoint: {} ({:?})", entrypoint, framework);
        entrypoint.resolve(&self.project_root)?;

        let preset = self.preset.unwrap_or_else(|| Preset::for_framework(framework));
        let port = self.port.unwrap_or_else(|| preset.port());
        if port == 0 {
            return Err(anyhow::anyhow!("Port must be between 1 and 65535."));
        }
        if let Entrypoint::Script { path } = &entrypoint {
            let code = utils::read_source(&self.project_root.join(path)).unwrap_or_default();
            match utils::hardcoded_port(&code) {
                Some(fixed) if fixed != port => warn!(
                    "{} listens on port {} but the recipe exposes {}; read PORT from the environment instead",
                    path.display(),
                    fixed,
                    port
                ),
                _ => {}
            }
        }

        if let (Some(m), Entrypoint::Asgi { .. }) = (&self.manifest, &entrypoint) {
            if !m.contains("uvicorn") && !m.contains("fastapi") {
                warn!("Neither uvicorn nor fastapi is declared in {}", m.filename());
            }
        }

        let missing_manifest = self.missing_manifest.unwrap_or_default();
        if self.manifest.is_none() && missing_manifest == MissingManifestPolicy::Fail {
            return Err(Error::MissingManifest(self.project_root.clone()).into());
        }

        let python_version = self
            .python_version
            .clone()
            .or_else(|| self.detected_python.clone())
            .unwrap_or_else(|| base::DEFAULT_PYTHON_VERSION.to_string());
        let base = BaseImage::new(preset.flavor(), python_version);

        let database_client = self.database_client.unwrap_or_else(|| {
            self.manifest
                .as_ref()
                .map(|m| sysdeps::detect_database_client(&m.packages))
                .unwrap_or_default()
        });
        let system_packages =
            sysdeps::system_packages(base.flavor, database_client, &self.system_packages);

        let copy_set = match self.copy_mode.unwrap_or_else(|| preset.copy_mode()) {
            CopyMode::Full => CopySet::Full,
            CopyMode::AllowList if !self.copy_paths.is_empty() => {
                CopySet::AllowList(self.copy_paths.clone())
            }
            CopyMode::AllowList => {
                let entry_file = entry_file(&entrypoint, &self.project_root);
                copyset::allow_list(&self.project_root, entry_file.as_deref(), &self.packages)
            }
        };
        copy_set.validate()?;

        let health = match self.healthcheck {
            Some(false) => None,
            _ => Some(HealthCheck::with_path(self.health_path.clone())),
        };

        Ok(Recipe {
            name,
            preset,
            base,
            database_client,
            system_packages,
            manifest: self.manifest,
            missing_manifest,
            entrypoint,
            port,
            reload: self.reload.unwrap_or(false),
            copy_set,
            health,
        })
    }
}

// The file or package directory holding the entry point, relative to the root.
fn entry_file(entrypoint: &Entrypoint, project_root: &Path) -> Option<PathBuf> {
    match entrypoint {
        Entrypoint::Script { path } => Some(path.clone()),
        Entrypoint::Asgi { module, .. } => {
            let top = module.split('.').next()?;
            let file = PathBuf::from(format!("{}.py", top));
            if project_root.join(&file).is_file() {
                Some(file)
            } else if project_root.join(top).is_dir() {
                Some(PathBuf::from(top))
            } else {
                None
            }
        }
    }
}

fn detect_name(project_root: &Path) -> Option<String> {
    let name = project_root.file_name()?.to_str()?;
    Some(name.to_string())
}

fn analyse_project(project_root: &Path) -> Result<RecipeBuilder> {
    let mut builder = RecipeBuilder {
        name: detect_name(project_root),
        project_root: project_root.to_path_buf(),
        manifest: manifest::detect(project_root)?,
        detected_python: base::detect_python_version(project_root),
        ..Default::default()
    };

    // Entry candidates live at the top level, packages one level down.
    for entry in WalkDir::new(project_root)
        .max_depth(2)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !(utils::is_hidden(e) || utils::ignore_dir(e)))
    {
        let entry = entry.map_err(|e| anyhow::anyhow!("Error walking project directory: {:?}", e))?;
        let relative_path = match diff_paths(entry.path(), project_root) {
            Some(p) => p,
            None => continue,
        };

        if entry.depth() == 1 && entry.file_type().is_dir() && utils::is_python_package(entry.path()) {
            builder.packages.push(relative_path);
            continue;
        }

        let is_py = entry.path().extension().map(|e| e == "py").unwrap_or(false);
        if entry.depth() == 1 && entry.file_type().is_file() && is_py {
            let code = match utils::read_source(entry.path()) {
                Ok(code) => code,
                Err(e) => {
                    debug!("Skipping unreadable {:?}: {}", entry.path(), e);
                    continue;
                }
            };
            let (framework, app_object) = utils::detect_framework(&code);
            let entrypoint = match (framework, app_object) {
                (Framework::FastApi, Some(object)) => Entrypoint::Asgi {
                    module: relative_path
                        .file_stem()
                        .map(|s| s.to_string_lossy().to_string())
                        .unwrap_or_default(),
                    object,
                },
                _ => Entrypoint::Script {
                    path: relative_path.clone(),
                },
            };
            builder.candidates.push(Candidate {
                entrypoint,
                framework,
                priority: utils::python_priority(framework, &code),
            });
        }
    }

    debug!("Project analysis result: {:?}", builder);
    Ok(builder)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const FLASK_APP: &str = "from flask import Flask\napp = Flask(__name__)\n";
    const FASTAPI_APP: &str = "from fastapi import FastAPI\napp = FastAPI()\n";

    fn project() -> TempDir {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir(temp_dir.path().join("adms_wrapper")).unwrap();
        fs::write(temp_dir.path().join("adms_wrapper").join("__main__.py"), "").unwrap();
        fs::create_dir(temp_dir.path().join("templates")).unwrap();
        fs::create_dir(temp_dir.path().join("scripts")).unwrap();
        fs::write(temp_dir.path().join("scripts").join("clear_db.py"), "").unwrap();
        temp_dir
    }

    #[test]
    fn test_recipe_load_and_save() {
        let temp_dir = project();
        fs::write(temp_dir.path().join("app.py"), FLASK_APP).unwrap();
        fs::create_dir(temp_dir.path().join(META_DIR)).unwrap();

        let recipe = Recipe::builder(temp_dir.path())
            .unwrap()
            .name("adms".to_string())
            .build()
            .unwrap();
        recipe.save(temp_dir.path()).unwrap();
        let loaded = Recipe::load(temp_dir.path()).unwrap();
        assert_eq!(loaded, recipe);
    }

    #[test]
    fn test_flask_project_defaults_to_flask_alpine() {
        let temp_dir = project();
        fs::write(temp_dir.path().join("app.py"), FLASK_APP).unwrap();
        fs::write(temp_dir.path().join("requirements.txt"), "flask\nmysqlclient\n").unwrap();

        let recipe = Recipe::builder(temp_dir.path()).unwrap().build().unwrap();
        assert_eq!(recipe.preset, Preset::FlaskAlpine);
        assert_eq!(recipe.port, 5000);
        assert_eq!(recipe.base.flavor, BaseFlavor::Alpine);
        assert_eq!(recipe.database_client, DatabaseClient::Mysql);
        assert!(recipe.system_packages.contains(&"mariadb-dev".to_string()));
        assert_eq!(
            recipe.copy_set,
            CopySet::AllowList(vec![
                PathBuf::from("app.py"),
                PathBuf::from("adms_wrapper"),
                PathBuf::from("templates"),
            ])
        );
        assert!(!recipe.reload);
        assert!(recipe.health.is_some());
    }

    #[test]
    fn test_fastapi_project_defaults_to_fastapi_slim() {
        let temp_dir = project();
        fs::write(temp_dir.path().join("main.py"), FASTAPI_APP).unwrap();

        let recipe = Recipe::builder(temp_dir.path()).unwrap().build().unwrap();
        assert_eq!(recipe.preset, Preset::FastapiSlim);
        assert_eq!(recipe.port, 8080);
        assert_eq!(
            recipe.entrypoint,
            Entrypoint::Asgi {
                module: "main".to_string(),
                object: "app".to_string()
            }
        );
        assert_eq!(recipe.copy_set, CopySet::Full);
        assert!(!recipe.reload);
    }

    #[test]
    fn test_both_frameworks_need_a_choice() {
        let temp_dir = project();
        fs::write(temp_dir.path().join("app.py"), FLASK_APP).unwrap();
        fs::write(temp_dir.path().join("main.py"), FASTAPI_APP).unwrap();

        let err = Recipe::builder(temp_dir.path()).unwrap().build().unwrap_err();
        assert!(err.to_string().contains("Multiple entrypoints"));

        let recipe = Recipe::builder(temp_dir.path())
            .unwrap()
            .preset(Preset::FlaskSlim)
            .build()
            .unwrap();
        assert_eq!(recipe.entrypoint, Entrypoint::parse("app.py").unwrap());
        assert_eq!(recipe.port, 8080);
        assert_eq!(recipe.base.flavor, BaseFlavor::DebianSlim);
    }

    #[test]
    fn test_plain_script_with_main_guard() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("serve.py"), "if __name__ == \"__main__\":\n    run()\n").unwrap();
        fs::write(temp_dir.path().join("helpers.py"), "x = 1\n").unwrap();

        let recipe = Recipe::builder(temp_dir.path()).unwrap().build().unwrap();
        assert_eq!(recipe.entrypoint, Entrypoint::parse("serve.py").unwrap());
    }

    #[test]
    fn test_no_entrypoint() {
        let temp_dir = TempDir::new().unwrap();
        let err = Recipe::builder(temp_dir.path()).unwrap().build().unwrap_err();
        assert!(err.to_string().contains("entrypoint"));
    }

    #[test]
    fn test_missing_name() {
        let temp_dir = project();
        fs::write(temp_dir.path().join("app.py"), FLASK_APP).unwrap();
        let err = Recipe::builder(temp_dir.path())
            .unwrap()
            .name("  ".to_string())
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("name"));
    }

    #[test]
    fn test_missing_manifest_policy() {
        let temp_dir = project();
        fs::write(temp_dir.path().join("app.py"), FLASK_APP).unwrap();

        let recipe = Recipe::builder(temp_dir.path()).unwrap().build().unwrap();
        assert!(recipe.manifest.is_none());
        let plan = recipe.install_plan(Path::new(IMAGE_VENV), temp_dir.path()).unwrap();
        assert!(plan.install.is_none());

        let err = Recipe::builder(temp_dir.path())
            .unwrap()
            .missing_manifest(MissingManifestPolicy::Fail)
            .build()
            .unwrap_err();
        assert!(err.downcast_ref::<Error>().map(|e| e.is_build()).unwrap_or(false));
    }

    #[test]
    fn test_overrides_take_precedence_over_config_file() {
        let temp_dir = project();
        fs::write(temp_dir.path().join("app.py"), FLASK_APP).unwrap();
        fs::write(
            temp_dir.path().join("wheelhouse.toml"),
            "port = 9000\nreload = true\nhealthcheck = false\nsystem_packages = [\"curl\"]\n",
        )
        .unwrap();

        let recipe = Recipe::builder(temp_dir.path()).unwrap().build().unwrap();
        assert_eq!(recipe.port, 9000);
        assert!(recipe.reload);
        assert!(recipe.health.is_none());
        assert!(recipe.system_packages.contains(&"curl".to_string()));

        let recipe = Recipe::builder(temp_dir.path())
            .unwrap()
            .port(7000)
            .reload(false)
            .build()
            .unwrap();
        assert_eq!(recipe.port, 7000);
        assert!(!recipe.reload);
    }

    #[test]
    fn test_explicit_entrypoint_must_exist() {
        let temp_dir = project();
        fs::write(temp_dir.path().join("app.py"), FLASK_APP).unwrap();

        let err = Recipe::builder(temp_dir.path())
            .unwrap()
            .entrypoint(Entrypoint::parse("missing.py").unwrap())
            .build()
            .unwrap_err();
        assert!(err.downcast_ref::<Error>().map(|e| e.is_start()).unwrap_or(false));

        let err = Recipe::builder(temp_dir.path())
            .unwrap()
            .entrypoint(Entrypoint::parse("service:app").unwrap())
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("service:app"));
    }

    #[test]
    fn test_port_zero_rejected() {
        let temp_dir = project();
        fs::write(temp_dir.path().join("app.py"), FLASK_APP).unwrap();
        assert!(Recipe::builder(temp_dir.path()).unwrap().port(0).build().is_err());
    }

    #[test]
    fn test_launch_spec_uses_recipe() {
        let temp_dir = project();
        fs::write(temp_dir.path().join("main.py"), FASTAPI_APP).unwrap();
        let recipe = Recipe::builder(temp_dir.path()).unwrap().reload(true).build().unwrap();
        let spec = recipe.launch_spec(Path::new(IMAGE_VENV));
        assert!(spec.command().contains(&"--reload".to_string()));
        assert!(spec.command().contains(&"8080".to_string()));
    }
}
