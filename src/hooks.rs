use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

use crate::error::{DeployError, Result};
use crate::models::ProjectConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookSlot {
    Init,
    CompileFiles,
    BeforeBuild,
    Finish,
}

impl HookSlot {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookSlot::Init => "init",
            HookSlot::CompileFiles => "compile_files",
            HookSlot::BeforeBuild => "before_build",
            HookSlot::Finish => "finish",
        }
    }
}

impl fmt::Display for HookSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a hook gets to see about the service it runs for.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub service: String,
    pub clone_path: PathBuf,
    pub dist_path: PathBuf,
    pub env: String,
}

impl HookContext {
    pub fn new(config: &ProjectConfig, service: &str) -> Self {
        Self {
            service: service.to_string(),
            clone_path: config.paths.clone_path(service),
            dist_path: config.paths.dist_path.clone(),
            env: config.project.env.clone(),
        }
    }
}

/// Lifecycle callbacks a service may provide. Every slot defaults to doing nothing.
pub trait ServiceHooks {
    fn init(&self, _ctx: &HookContext) -> Result<()> {
        Ok(())
    }

    fn compile_files(&self, _ctx: &HookContext) -> Result<()> {
        Ok(())
    }

    fn before_build(&self, _ctx: &HookContext) -> Result<()> {
        Ok(())
    }

    fn finish(&self, _ctx: &HookContext) -> Result<()> {
        Ok(())
    }
}

/// Runs `<dir>/<slot>.sh` with `sh` inside the service clone, when the script exists.
pub struct ScriptHooks {
    dir: PathBuf,
}

impl ScriptHooks {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn run_script(&self, slot: HookSlot, ctx: &HookContext) -> Result<()> {
        let script = self.dir.join(format!("{}.sh", slot));
        if !script.is_file() {
            return Ok(());
        }
        info!("    Running {} hook of '{}'", slot, ctx.service);

        let mut command = Command::new("sh");
        if let Some(workdir) = [&ctx.clone_path, &ctx.dist_path].into_iter().find(|p| p.is_dir()) {
            command.current_dir(workdir);
        }
        let output = command
            .arg(&script)
            .env("DOCKERUP_SERVICE", &ctx.service)
            .env("DOCKERUP_CLONE_PATH", &ctx.clone_path)
            .env("DOCKERUP_DIST_PATH", &ctx.dist_path)
            .env("DOCKERUP_ENV", &ctx.env)
            .output()
            .map_err(|e| DeployError::Hook {
                service: ctx.service.clone(),
                hook: slot.to_string(),
                reason: e.to_string(),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            debug!("{} hook output:\n{}", slot, stdout.trim_end());
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DeployError::Hook {
                service: ctx.service.clone(),
                hook: slot.to_string(),
                reason: format!("{} ({})", output.status, stderr.trim()),
            });
        }
        Ok(())
    }
}

impl ServiceHooks for ScriptHooks {
    fn init(&self, ctx: &HookContext) -> Result<()> {
        self.run_script(HookSlot::Init, ctx)
    }

    fn compile_files(&self, ctx: &HookContext) -> Result<()> {
        self.run_script(HookSlot::CompileFiles, ctx)
    }

    fn before_build(&self, ctx: &HookContext) -> Result<()> {
        self.run_script(HookSlot::BeforeBuild, ctx)
    }

    fn finish(&self, ctx: &HookContext) -> Result<()> {
        self.run_script(HookSlot::Finish, ctx)
    }
}

/// Service name to hooks. Services without an entry get no-op hooks.
#[derive(Default)]
pub struct HookRegistry {
    hooks: HashMap<String, Box<dyn ServiceHooks>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers script hooks for every service with a `<profile>/hooks/<service>` dir.
    pub fn from_profile(config: &ProjectConfig) -> Self {
        let mut registry = Self::new();
        for name in config.services.keys() {
            let dir = hooks_dir(&config.paths.profile_path, name);
            if dir.is_dir() {
                debug!("Found hooks for service '{}' in {}", name, dir.display());
                registry.register(name, Box::new(ScriptHooks::new(dir)));
            }
        }
        registry
    }

    pub fn register(&mut self, service: &str, hooks: Box<dyn ServiceHooks>) {
        self.hooks.insert(service.to_string(), hooks);
    }

    pub fn has_hooks(&self, service: &str) -> bool {
        self.hooks.contains_key(service)
    }

    pub fn run(&self, slot: HookSlot, config: &ProjectConfig, service: &str) -> Result<()> {
        let Some(hooks) = self.hooks.get(service) else {
            return Ok(());
        };
        let ctx = HookContext::new(config, service);
        match slot {
            HookSlot::Init => hooks.init(&ctx),
            HookSlot::CompileFiles => hooks.compile_files(&ctx),
            HookSlot::BeforeBuild => hooks.before_build(&ctx),
            HookSlot::Finish => hooks.finish(&ctx),
        }
    }
}

/// Where a service's hook scripts live inside a profile.
pub fn hooks_dir(profile_path: &Path, service: &str) -> PathBuf {
    profile_path.join("hooks").join(service)
}
