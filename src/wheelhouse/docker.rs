use std::env;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::Result;
use handlebars::Handlebars;
use log::{debug, info, log_enabled};
use serde::Serialize;
use subprocess::{Popen, PopenConfig};

use super::error::{Error, Stage};
use super::recipe::{Recipe, IMAGE_VENV, IMAGE_WORKDIR};
use super::templates::{DOCKER_IGNORE, TEMPLATE_DOCKERFILE};
use super::utils::META_DIR;

pub const DEFAULT_BUILD_TIMEOUT: u64 = 600;

pub fn check_docker() -> Result<()> {
    check_engine("docker")
}

pub fn check_podman() -> Result<()> {
    check_engine("podman")
}

fn check_engine(engine: &str) -> Result<()> {
    let mut p = Popen::create(
        &[engine, "ps"],
        PopenConfig {
            stdout: subprocess::Redirection::Pipe,
            stderr: subprocess::Redirection::Pipe,
            ..Default::default()
        },
    )?;
    match p.wait_timeout(Duration::from_secs(5))? {
        Some(status) if status.success() => Ok(()),
        Some(_) => Err(anyhow::anyhow!("{} is not usable", engine)),
        None => {
            p.terminate()?;
            Err(anyhow::anyhow!("{} did not answer", engine))
        }
    }
}

pub fn get_docker_executor() -> Result<String, Error> {
    if check_docker().is_ok() {
        return Ok("docker".to_string());
    } else if check_podman().is_ok() {
        return Ok("podman".to_string());
    }
    Err(Error::EngineNotFound)
}

pub struct RunOpts {
    pub tag: String,
    pub rebuild: bool,
    pub env_map: Vec<String>,
    pub timeout: Option<u32>,
    pub args: Vec<String>,
}

pub fn run(project_root: &Path, recipe: &Recipe, opts: RunOpts, start: Instant) -> Result<()> {
    let executor = get_docker_executor()?;

    let image = get_image_name(&recipe.name, &opts.tag);
    if opts.rebuild || !check_image_existence(&executor, &image)? {
        debug!("Building image: {}", image);
        build(project_root, recipe, &opts.tag, false, DEFAULT_BUILD_TIMEOUT)?;
    }

    let mut command = vec![executor, "run".to_string(), "--rm".to_string()];
    command.extend(get_port_map_args(recipe.port));
    let env_file = project_root.join(".env");
    if env_file.is_file() {
        command.push(format!("--env-file={}", env_file.display()));
    }
    command.extend(get_env_map_args(&opts.env_map));
    command.push(image);
    command.extend(opts.args);

    debug!("Running command: {}", command.join(" "));
    debug!("Time Elapsed in Setup: {:?}", start.elapsed());
    let mut p = Popen::create(command.as_slice(), PopenConfig::default())?;

    let status = if let Some(timeout_secs) = opts.timeout {
        debug!("Running with timeout: {} seconds", timeout_secs);
        match p.wait_timeout(Duration::from_secs(timeout_secs as u64))? {
            Some(status) => status,
            None => {
                debug!("Container execution timed out after {} seconds", timeout_secs);
                p.terminate()?;
                return Err(Error::Timeout {
                    what: "container".to_string(),
                    secs: timeout_secs as u64,
                }
                .into());
            }
        }
    } else {
        p.wait()?
    };
    if !status.success() {
        return Err(Error::start(format!("container exited with {:?}", status)).into());
    }
    Ok(())
}

fn get_env_map_args(env_map: &[String]) -> Vec<String> {
    env_map
        .iter()
        .flat_map(|x| {
            let pair = if x.contains('=') {
                x.to_string()
            } else {
                let val = env::var(x).unwrap_or_default();
                format!("{}={}", x, val)
            };
            ["-e".to_string(), pair]
        })
        .collect()
}

fn get_port_map_args(port: u16) -> Vec<String> {
    vec!["-p".to_string(), format!("{}:{}", port, port)]
}

pub fn get_image_name(name: &str, tag: &str) -> String {
    let sanitized: String = name
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let sanitized = sanitized.trim_matches(|c: char| !c.is_ascii_alphanumeric());
    format!("wheelhouse-{}:{}", sanitized, tag.to_lowercase())
}

fn check_image_existence(executor: &str, image: &str) -> Result<bool> {
    let cmd = std::process::Command::new(executor)
        .arg("images")
        .arg("-q")
        .arg("--filter")
        .arg(format!("reference={}", image))
        .output()?;
    let status = cmd.status;
    let stdout = String::from_utf8(cmd.stdout)?;

    if status.success() && !stdout.trim().is_empty() {
        return Ok(true);
    }
    Ok(false)
}

/// Builds the image from the generated Dockerfile. Layers are reused by the engine
/// unless `no_cache` is set.
pub fn build(
    project_root: &Path,
    recipe: &Recipe,
    tag: &str,
    no_cache: bool,
    timeout_secs: u64,
) -> Result<String> {
    let executor = get_docker_executor()?;
    let image = get_image_name(&recipe.name, tag);

    let dockerfile_path = project_root.join(META_DIR).join("Dockerfile");
    if !dockerfile_path.is_file() {
        return Err(Error::build(
            Stage::ImageBuild,
            format!("{} is missing, run generate first", dockerfile_path.display()),
        )
        .into());
    }

    let mut command = vec![
        executor,
        "build".to_string(),
        "-t".to_string(),
        image.clone(),
        "-f".to_string(),
        dockerfile_path.to_string_lossy().to_string(),
    ];
    if no_cache {
        command.push("--no-cache".to_string());
    }
    command.push(project_root.to_string_lossy().to_string());

    info!("Building image {} from {}", image, recipe.base.image_ref());
    let mut popen_conf = PopenConfig {
        stdout: subprocess::Redirection::Pipe,
        stderr: subprocess::Redirection::Merge,
        ..Default::default()
    };
    if log_enabled!(log::Level::Debug) {
        // This prints all logs
        popen_conf = PopenConfig::default();
    }
    let mut p = Popen::create(command.as_slice(), popen_conf)?;
    let mut output = String::new();
    let status = if log_enabled!(log::Level::Debug) {
        p.wait_timeout(Duration::from_secs(timeout_secs))?
    } else {
        // Drain output so the engine does not block on a full pipe.
        let mut comm = p
            .communicate_start(None)
            .limit_time(Duration::from_secs(timeout_secs));
        match comm.read_string() {
            Ok((out, _)) => {
                output = out.unwrap_or_default();
                Some(p.wait()?)
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => None,
            Err(e) => return Err(e.error.into()),
        }
    };

    match status {
        Some(s) if s.success() => Ok(image),
        Some(s) => {
            if !output.is_empty() {
                log::error!("{}", output.trim_end());
            }
            Err(Error::build(failed_stage(&output), format!("engine exited with {:?}", s)).into())
        }
        None => {
            p.terminate()?;
            Err(Error::Timeout {
                what: "image build".to_string(),
                secs: timeout_secs,
            }
            .into())
        }
    }
}

// Attributes a failed build to a recipe stage from the engine's output.
// Output is only captured when not streaming, otherwise the stage is unknown.
fn failed_stage(output: &str) -> Stage {
    let failed = output.lines().rev().find(|l| {
        l.contains("did not complete successfully")
            || l.contains("returned a non-zero code")
            || l.contains("failed to solve")
            || l.starts_with("Error:")
    });
    let line = match failed {
        Some(line) => line,
        None => return Stage::ImageBuild,
    };
    if line.contains("apk add") || line.contains("apt-get") {
        Stage::SystemDependencies
    } else if line.contains("uv venv") || line.contains("uv sync") || line.contains("uv pip") {
        Stage::PythonDependencies
    } else if line.contains("pip install") || line.contains("pull") || line.contains("manifest") {
        Stage::BaseEnvironment
    } else {
        Stage::ImageBuild
    }
}

#[derive(Serialize)]
struct EnvVar {
    key: String,
    value: String,
}

#[derive(Serialize)]
struct CopyLine {
    src: String,
    dst: String,
}

#[derive(Serialize)]
struct HealthLine {
    options: String,
    command: String,
}

#[derive(Serialize)]
struct DockerfileData {
    name: String,
    preset: String,
    base_image: String,
    bootstrap: Option<String>,
    system_install: Option<String>,
    env: Vec<EnvVar>,
    workdir: String,
    create_venv: String,
    install_inputs: String,
    install_includes: Vec<CopyLine>,
    install: Option<String>,
    copy: Vec<CopyLine>,
    port: u16,
    healthcheck: Option<HealthLine>,
    command: String,
}

fn new_registry() -> Handlebars<'static> {
    let mut handlebars = Handlebars::new();
    handlebars.register_escape_fn(handlebars::no_escape);
    handlebars
}

pub fn generate_dockerfile(recipe: &Recipe, project_root: &Path) -> Result<String> {
    let mut handlebars = new_registry();
    handlebars.register_template_string("Dockerfile", TEMPLATE_DOCKERFILE)?;

    let venv = Path::new(IMAGE_VENV);
    let plan = recipe.install_plan(venv, project_root)?;
    let launch = recipe.launch_spec(venv);

    let mut env: Vec<EnvVar> = launch
        .process_env()
        .into_iter()
        .map(|(key, value)| EnvVar { key, value })
        .collect();
    env.push(EnvVar {
        key: "PATH".to_string(),
        value: format!("{}/bin:$PATH", IMAGE_VENV),
    });

    let healthcheck = match &recipe.health {
        Some(h) => Some(HealthLine {
            options: h.options(),
            command: serde_json::to_string(&h.command(recipe.port))?,
        }),
        None => None,
    };

    let d = DockerfileData {
        name: recipe.name.clone(),
        preset: recipe.preset_name(),
        base_image: recipe.base.image_ref(),
        bootstrap: recipe.base.installer_bootstrap().map(|s| s.to_string()),
        system_install: recipe
            .base
            .package_manager()
            .install_command(&recipe.system_packages),
        env,
        workdir: IMAGE_WORKDIR.to_string(),
        create_venv: plan.create_venv.shell(),
        install_inputs: plan.inputs().join(" "),
        install_includes: plan
            .includes()
            .iter()
            .map(|p| {
                let src = p.to_string_lossy().to_string();
                let dst = format!("./{}", src);
                CopyLine { src, dst }
            })
            .collect(),
        install: plan.install.as_ref().map(|s| s.shell()),
        copy: recipe
            .copy_set
            .copy_pairs()
            .into_iter()
            .map(|(src, dst)| CopyLine { src, dst })
            .collect(),
        port: recipe.port,
        healthcheck,
        command: serde_json::to_string(&launch.command())?,
    };

    Ok(handlebars.render("Dockerfile", &d)?)
}

pub fn generate_docker_ignore(recipe: &Recipe) -> Result<String> {
    let mut handlebars = new_registry();
    handlebars.register_template_string("dockerignore", DOCKER_IGNORE)?;

    #[derive(Serialize)]
    struct Data {
        full_copy: bool,
    }

    let d = Data {
        full_copy: matches!(recipe.copy_set, super::copyset::CopySet::Full),
    };

    Ok(handlebars.render("dockerignore", &d)?)
}
