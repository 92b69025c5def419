pub static TEMPLATE_DOCKERFILE: &str = r#"# Wheelhouse recipe: {{name}} ({{preset}})
FROM {{base_image}}
{{#if bootstrap}}

# Installer bootstrap
RUN {{bootstrap}}
{{/if}}
{{#if system_install}}

# Native toolchain and database client headers
RUN {{system_install}}
{{/if}}

{{#each env}}
ENV {{this.key}}={{this.value}}
{{/each}}

WORKDIR {{workdir}}

# Isolated environment and dependencies
RUN {{create_venv}}
{{#if install_inputs}}
COPY {{install_inputs}} ./
{{/if}}
{{#each install_includes}}
COPY {{this.src}} {{this.dst}}
{{/each}}
{{#if install}}
RUN {{install}}
{{/if}}

# Application
{{#each copy}}
COPY {{this.src}} {{this.dst}}
{{/each}}

EXPOSE {{port}}
{{#if healthcheck}}
HEALTHCHECK {{healthcheck.options}} CMD {{healthcheck.command}}
{{/if}}
ENTRYPOINT {{command}}
"#;

pub static DOCKER_IGNORE: &str = r#"**/.git
**/.gitignore
.wheelhouse/venv
**/__pycache__
*.pyc
.venv
venv
.env
{{#if full_copy}}
**/.pytest_cache
**/.mypy_cache
*.egg-info
{{/if}}
"#;
