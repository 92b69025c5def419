use std::path::Path;

use anyhow::Result;
use log::info;

use super::docker;
use super::recipe::Recipe;
use super::utils::META_DIR;

pub struct Generator {
    pub recipe: Recipe,
}

impl Generator {
    pub fn new(recipe: Recipe) -> Self {
        Self { recipe }
    }

    pub fn generate_meta_dir(&self, project_root: &Path) -> Result<()> {
        let meta_dir = project_root.join(META_DIR);
        if !meta_dir.exists() {
            std::fs::create_dir(&meta_dir)?;
        }
        Ok(())
    }

    pub fn generate_docker(&self, project_root: &Path) -> Result<()> {
        let dockerfile = docker::generate_dockerfile(&self.recipe, project_root)?;
        let dockerignore = docker::generate_docker_ignore(&self.recipe)?;
        let dockerfile_path = project_root.join(META_DIR).join("Dockerfile");
        let dockerignore_path = project_root.join(".dockerignore");
        std::fs::write(dockerfile_path, dockerfile)?;
        std::fs::write(dockerignore_path, dockerignore)?;
        Ok(())
    }

    pub fn generate(&self, project_root: &Path) -> Result<()> {
        self.generate_meta_dir(project_root)?;
        // Write the json file to the meta dir
        self.recipe.save(project_root)?;
        self.generate_docker(project_root)?;
        info!(
            "Generated {} recipe for {} in {}",
            self.recipe.preset_name(),
            self.recipe.name,
            project_root.join(META_DIR).display()
        );
        Ok(())
    }
}

/// Loads the saved recipe, generating one first when it is missing or `regenerate` is set.
pub fn load_or_generate(
    project_root: &Path,
    regenerate: bool,
    build: impl FnOnce() -> Result<Recipe>,
) -> Result<Recipe> {
    let recipe_file = project_root.join(META_DIR).join(super::recipe::RECIPE_FILE);
    let dockerfile = project_root.join(META_DIR).join("Dockerfile");
    if !regenerate && recipe_file.is_file() && dockerfile.is_file() {
        return Recipe::load(project_root);
    }
    let recipe = build()?;
    Generator::new(recipe.clone()).generate(project_root)?;
    Ok(recipe)
}
