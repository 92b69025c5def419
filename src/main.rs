mod wheelhouse;

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use log::LevelFilter;
use serde::Serialize;
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode};

use wheelhouse::copyset::CopyMode;
use wheelhouse::installer::MissingManifestPolicy;
use wheelhouse::launcher::Entrypoint;
use wheelhouse::recipe::{Preset, Recipe, RecipeBuilder, IMAGE_VENV};
use wheelhouse::sysdeps::DatabaseClient;
use wheelhouse::{docker, health, meta, native};

#[derive(Debug, Args)]
struct RecipeOpts {
    /// Project name, used for the image name
    #[arg(long, short)]
    name: Option<String>,

    #[arg(long, value_enum)]
    preset: Option<Preset>,

    /// `module:object` for an ASGI app or a path to a script
    #[arg(long, short)]
    entrypoint: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    /// Python version for the base image, e.g. 3.12
    #[arg(long = "python")]
    python_version: Option<String>,

    #[arg(long = "db-client", value_enum)]
    database_client: Option<DatabaseClient>,

    /// Extra system package to install, may be repeated
    #[arg(long = "system-package")]
    system_packages: Vec<String>,

    #[arg(long = "on-missing-manifest", value_enum)]
    missing_manifest: Option<MissingManifestPolicy>,

    #[arg(long, value_enum)]
    copy: Option<CopyMode>,

    /// Watch sources and restart on change. Also read from WHEELHOUSE_RELOAD.
    #[arg(long)]
    reload: bool,

    /// HTTP path for the health check. A TCP check is used when unset.
    #[arg(long)]
    health_path: Option<String>,

    #[arg(long)]
    no_healthcheck: bool,
}

impl RecipeOpts {
    fn builder(self, project_root: &Path) -> Result<RecipeBuilder> {
        let mut builder = Recipe::builder(project_root)?;

        // Overwrite detected values if needed
        if let Some(name) = self.name {
            builder = builder.name(name);
        }
        if let Some(preset) = self.preset {
            builder = builder.preset(preset);
        }
        if let Some(entrypoint) = self.entrypoint {
            builder = builder.entrypoint(Entrypoint::parse(&entrypoint)?);
        }
        if let Some(port) = self.port {
            builder = builder.port(port);
        }
        if let Some(version) = self.python_version {
            builder = builder.python_version(version);
        }
        if let Some(client) = self.database_client {
            builder = builder.database_client(client);
        }
        if !self.system_packages.is_empty() {
            builder = builder.system_packages(self.system_packages);
        }
        if let Some(policy) = self.missing_manifest {
            builder = builder.missing_manifest(policy);
        }
        if let Some(mode) = self.copy {
            builder = builder.copy_mode(mode);
        }
        if self.reload {
            builder = builder.reload(true);
        }
        if let Some(path) = self.health_path {
            builder = builder.health_path(path);
        }
        if self.no_healthcheck {
            builder = builder.healthcheck(false);
        }
        Ok(builder)
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PlanFormat {
    Json,
    Dockerfile,
}

#[derive(Serialize)]
struct PlanView<'a> {
    recipe: &'a Recipe,
    install_steps: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[clap(
        name = "generate",
        about = "Generate the recipe, Dockerfile and .dockerignore. Overwrites if re-run."
    )]
    Generate {
        #[arg(default_value_os_t = PathBuf::from("."))]
        project_root: PathBuf,
        #[clap(flatten)]
        opts: RecipeOpts,
    },

    #[clap(name = "plan", about = "Print the resolved recipe without writing anything.")]
    Plan {
        #[arg(default_value_os_t = PathBuf::from("."))]
        project_root: PathBuf,
        #[clap(flatten)]
        opts: RecipeOpts,
        #[arg(long, value_enum, default_value_t = PlanFormat::Json)]
        format: PlanFormat,
    },

    #[clap(name = "build", about = "Build the container image from the generated recipe.")]
    Build {
        #[arg(default_value_os_t = PathBuf::from("."))]
        project_root: PathBuf,
        #[arg(long, default_value = "latest")]
        tag: String,
        #[arg(long)]
        no_cache: bool,
        /// Regenerate the recipe before building
        #[arg(long)]
        autogen: bool,
    },

    #[clap(name = "run", about = "Run the app in a container, building the image if needed.")]
    Run {
        #[arg(default_value_os_t = PathBuf::from("."))]
        project_root: PathBuf,
        #[arg(long, default_value = "latest")]
        tag: String,
        #[arg(long)]
        rebuild: bool,
        /// Regenerate the recipe before running
        #[arg(long)]
        autogen: bool,
        /// KEY=VAL, or KEY to pass through from the current environment
        #[arg(long = "env", short = 'e')]
        env_map: Vec<String>,
        /// Stop the container after this many seconds
        #[arg(long)]
        timeout: Option<u32>,
        #[clap(raw = true)]
        args: Vec<String>,
    },

    #[clap(
        name = "launch",
        about = "Install into .wheelhouse/venv and run the app on this machine."
    )]
    Launch {
        #[arg(default_value_os_t = PathBuf::from("."))]
        project_root: PathBuf,
        #[clap(flatten)]
        opts: RecipeOpts,
        #[arg(long = "env")]
        env_map: Vec<String>,
        #[arg(long)]
        timeout: Option<u32>,
        #[clap(raw = true)]
        args: Vec<String>,
    },

    #[clap(name = "probe", about = "Check a running app over HTTP. Exits non-zero when unhealthy.")]
    Probe {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long)]
        port: u16,
        #[arg(long)]
        path: Option<String>,
        /// Seconds to wait for an answer
        #[arg(long, default_value_t = 5)]
        timeout: u64,
    },
}

#[derive(Parser)]
#[command(name = "wheelhouse")]
#[command(about = "Build and launch reproducible container recipes for Python web apps.", long_about = None)]
#[command(version)]
pub struct App {
    /// -v for debug output, -vv for trace
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[clap(subcommand)]
    command: Command,
}

fn init_logging(verbose: u8) -> Result<()> {
    let level = match verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    TermLogger::init(
        level,
        Config::default(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    )?;
    Ok(())
}

fn canonical_root(project_root: &Path) -> Result<PathBuf> {
    std::fs::canonicalize(project_root)
        .with_context(|| format!("Project root {} does not exist", project_root.display()))
}

fn main() -> Result<()> {
    let start = Instant::now();
    let app = App::parse();
    init_logging(app.verbose)?;

    match app.command {
        Command::Generate { project_root, opts } => {
            let root = canonical_root(&project_root)?;
            let recipe = opts.builder(&root)?.build()?;
            meta::Generator::new(recipe).generate(&root)?;
        }
        Command::Plan {
            project_root,
            opts,
            format,
        } => {
            let root = canonical_root(&project_root)?;
            let recipe = opts.builder(&root)?.build()?;
            match format {
                PlanFormat::Json => {
                    let plan = recipe.install_plan(Path::new(IMAGE_VENV), &root)?;
                    let view = PlanView {
                        recipe: &recipe,
                        install_steps: plan.steps().iter().map(|s| s.shell()).collect(),
                    };
                    println!("{}", serde_json::to_string_pretty(&view)?)
                }
                PlanFormat::Dockerfile => {
                    print!("{}", docker::generate_dockerfile(&recipe, &root)?)
                }
            }
        }
        Command::Build {
            project_root,
            tag,
            no_cache,
            autogen,
        } => {
            let root = canonical_root(&project_root)?;
            let recipe = meta::load_or_generate(&root, autogen, || {
                Recipe::builder(&root)?.build()
            })?;
            let image = docker::build(&root, &recipe, &tag, no_cache, docker::DEFAULT_BUILD_TIMEOUT)?;
            println!("{}", image);
        }
        Command::Run {
            project_root,
            tag,
            rebuild,
            autogen,
            env_map,
            timeout,
            args,
        } => {
            let root = canonical_root(&project_root)?;
            let recipe = meta::load_or_generate(&root, autogen, || {
                Recipe::builder(&root)?.build()
            })?;
            let opts = docker::RunOpts {
                tag,
                // A regenerated Dockerfile needs a fresh image.
                rebuild: rebuild || autogen,
                env_map,
                timeout,
                args,
            };
            docker::run(&root, &recipe, opts, start)?;
        }
        Command::Launch {
            project_root,
            opts,
            env_map,
            timeout,
            args,
        } => {
            let root = canonical_root(&project_root)?;
            let recipe = opts.builder(&root)?.build()?;
            let opts = native::NativeRunOpts {
                env_map,
                timeout,
                args,
                ..Default::default()
            };
            native::run(&root, &recipe, opts, start)?;
        }
        Command::Probe {
            host,
            port,
            path,
            timeout,
        } => {
            let url = health::probe_url(&host, port, path.as_deref());
            if !health::probe(&url, Duration::from_secs(timeout))? {
                return Err(anyhow::anyhow!("{} is unhealthy", url));
            }
            println!("{} is healthy", url);
        }
    }

    Ok(())
}
