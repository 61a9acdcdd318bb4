use anyhow::Result;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{reload, EnvFilter, Registry};

use crate::config::Config;
use crate::config_loader::ConfigLoader;
use crate::database::Database;
use crate::docker::{ContainerEngine, ContainerService, DockerClient, ImageService};
use crate::git::{GitCredentials, RepositoryService};
use crate::hooks::{HookRegistry, HookSlot};
use crate::models::{Profile, ProjectConfig, STATIC_NETWORK_NAME, STATIC_SUBNET_PREFIX};
use crate::profile_processor::{discover_profile, scaffold_profile, DEFAULT_PROFILE_NAME};
use crate::proxy_processor::ProxyProcessor;
use crate::scheduler::Scheduler;
use crate::service_processor::ServiceProcessor;
use crate::storage_processor::{storage_image, StorageProcessor};
use crate::template_processor::TemplateProcessor;

/// Handle used to raise the log level when a profile asks for debug output.
pub type LogHandle = reload::Handle<EnvFilter, Registry>;

/// Which profile and environment a command works on.
#[derive(Debug, Clone, Default)]
pub struct Target {
    pub profile: Option<String>,
    pub env: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    pub target: Target,
    pub skip_clone: Vec<String>,
    pub skip_build: Vec<String>,
    pub no_cache_build: Vec<String>,
    pub skip_remove_unused_images: bool,
    pub remove_containers: bool,
}

#[derive(Debug, Clone, Default)]
pub struct StopOptions {
    pub target: Target,
    pub services: Vec<String>,
    pub storages: Vec<String>,
    pub all_services: bool,
    pub all_storages: bool,
    pub remove_containers: bool,
}

pub struct Commands {
    db: Database,
    config: Config,
    log_handle: Option<LogHandle>,
}

impl Commands {
    pub fn new(db: Database, config: Config, log_handle: Option<LogHandle>) -> Self {
        Self {
            db,
            config,
            log_handle,
        }
    }

    pub async fn install(&self, opts: InstallOptions) -> Result<()> {
        let mut config = self.load(&opts.target).await?;
        let service_names = config.enabled_service_names();
        info!(
            "Installing '{}' in '{}' mode ({} services)",
            config.project.name,
            config.project.env,
            service_names.len()
        );

        if config.domain.ssl_enabled {
            check_certificates(&config);
        }

        let client = DockerClient::new().await?;
        let containers = ContainerService::new(client.clone());
        let images = ImageService::new(client, self.config.image_pull_policy);
        let proxy = ProxyProcessor::new(&containers)?;
        let templates = TemplateProcessor::new();
        let hooks = HookRegistry::from_profile(&config);

        if !opts.skip_remove_unused_images {
            images.remove_unused_images().await?;
        }

        if config.project.ip_mapping == crate::models::IpMapping::Static {
            containers
                .recreate_network(STATIC_NETWORK_NAME, &format!("{}.0/24", STATIC_SUBNET_PREFIX))
                .await?;
        }

        let all_services: Vec<String> = config.services.keys().cloned().collect();
        ServiceProcessor::normalize(&all_services, &mut config)?;

        let clone_names: Vec<String> = service_names
            .iter()
            .filter(|name| !opts.skip_clone.contains(name))
            .cloned()
            .collect();
        self.prepare_sources(&config, &clone_names, &service_names, &hooks, &templates)
            .await?;

        templates.render_hook_templates(&config)?;
        templates.render_custom_files(&config)?;

        if let Err(e) = proxy.ensure_running(&config).await {
            warn!("Proxy could not be started yet: {:#}", e);
        }

        for storage in config.storages.values() {
            if let Some(image) = storage_image(storage) {
                images.pull_image(&image).await?;
            }
        }
        StorageProcessor::new(&containers)
            .normalize_all(&mut config)
            .await?;

        let build_names: Vec<String> = service_names
            .iter()
            .filter(|name| !opts.skip_build.contains(name))
            .cloned()
            .collect();
        build_images(&config, &build_names, &opts.no_cache_build, &hooks, &images).await?;

        info!("Stopping service containers...");
        stop_containers(&containers, &config, &service_names, true).await?;
        if opts.remove_containers {
            let storage_names: Vec<String> = config.storages.keys().cloned().collect();
            stop_containers(&containers, &config, &storage_names, true).await?;
            if let Err(e) = proxy.restart(&config).await {
                warn!("Proxy restart failed: {:#}", e);
            }
        }

        info!("Running storages and services...");
        Scheduler::new(
            &containers,
            &proxy,
            self.config.scheduler,
            self.config.image_pull_policy,
        )
        .run(&mut config, &service_names)
        .await?;

        if let Err(e) = proxy.restart(&config).await {
            warn!("Proxy restart failed, please check it: {:#}", e);
        }
        dump_config(&config);

        for name in &service_names {
            if templates.render_entrypoint(&config, name)? {
                debug!("Rendered docker_entrypoint.sh of '{}'", name);
            }
            hooks.run(HookSlot::Finish, &config, name)?;
        }

        if config.backup.is_some() {
            info!("Backup plans are declared; schedule them with your backup tooling");
        }

        let scheme = if config.domain.ssl_enabled { "https" } else { "http" };
        info!(
            "✅ Installed. Point '{}' and its sub domains to this host (e.g. in /etc/hosts), then open {}://{}",
            config.domain.name, scheme, config.domain.name
        );
        Ok(())
    }

    /// Clones, renders and builds images without touching running containers.
    pub async fn build(&self, target: &Target, service: Option<&str>, no_cache: bool) -> Result<()> {
        let mut config = self.load(target).await?;
        let names = match service {
            Some(name) if config.services.contains_key(name) => vec![name.to_string()],
            Some(name) => anyhow::bail!("Unknown service '{}'", name),
            None => config.enabled_service_names(),
        };

        let client = DockerClient::new().await?;
        let images = ImageService::new(client, self.config.image_pull_policy);
        let templates = TemplateProcessor::new();
        let hooks = HookRegistry::from_profile(&config);

        let all_services: Vec<String> = config.services.keys().cloned().collect();
        ServiceProcessor::normalize(&all_services, &mut config)?;
        self.prepare_sources(&config, &names, &names, &hooks, &templates)
            .await?;

        let no_cache_names = if no_cache { names.clone() } else { Vec::new() };
        build_images(&config, &names, &no_cache_names, &hooks, &images).await?;
        info!("✅ Built {} image(s)", names.len());
        Ok(())
    }

    /// Builds the base images a service lists under `docker.push` and publishes them
    /// under the project's registry path.
    pub async fn push(
        &self,
        target: &Target,
        service: Option<&str>,
        docker_project: Option<&str>,
    ) -> Result<()> {
        let mut config = self.load(target).await?;
        let names = match service {
            Some(name) if config.services.contains_key(name) => vec![name.to_string()],
            Some(name) => anyhow::bail!("Unknown service '{}'", name),
            None => config.enabled_service_names(),
        };
        let base_path = docker_project
            .map(str::to_string)
            .or_else(|| config.project.docker_project_base_path.clone());

        let all_services: Vec<String> = config.services.keys().cloned().collect();
        ServiceProcessor::normalize(&all_services, &mut config)?;
        self.clone_sources(&config, &names).await?;

        let images = ImageService::new(DockerClient::new().await?, self.config.image_pull_policy);
        let mut pushed = 0;
        for name in &names {
            let service = &config.services[name];
            let context_dir = build_context(&config, name);
            for (dockerfile_name, image) in &service.docker.push {
                let dockerfile = config
                    .paths
                    .profile_path
                    .join("services")
                    .join(name)
                    .join(dockerfile_name);
                if !dockerfile.is_file() {
                    warn!("Skipping base image {}: {} is missing", image, dockerfile.display());
                    continue;
                }
                info!("Building base image '{}' of '{}'...", image, name);
                images
                    .build_image(
                        image,
                        &dockerfile,
                        &context_dir,
                        service.docker.build_kit_enabled,
                        false,
                    )
                    .await?;
                images
                    .push_image(image, &push_reference(base_path.as_deref(), image))
                    .await?;
                pushed += 1;
            }
        }
        info!("✅ Pushed {} base image(s)", pushed);
        Ok(())
    }

    pub async fn stop(&self, opts: StopOptions) -> Result<()> {
        let config = self.load(&opts.target).await?;
        let containers = ContainerService::new(DockerClient::new().await?);

        let services = if opts.all_services {
            config.services.keys().cloned().collect()
        } else {
            known_names(&opts.services, |n| config.services.contains_key(n))
        };
        let storages = if opts.all_storages {
            config.storages.keys().cloned().collect()
        } else {
            known_names(&opts.storages, |n| config.storages.contains_key(n))
        };
        if services.is_empty() && storages.is_empty() {
            warn!("Nothing to stop");
            return Ok(());
        }

        stop_containers(&containers, &config, &services, opts.remove_containers).await?;
        stop_containers(&containers, &config, &storages, opts.remove_containers).await?;
        info!(
            "Stopped {} service(s) and {} storage(s)",
            services.len(),
            storages.len()
        );
        Ok(())
    }

    pub async fn log(&self, target: &Target, service: &str, follow: bool) -> Result<()> {
        let config = self.load(target).await?;
        if !config.services.contains_key(service) && !config.storages.contains_key(service) {
            anyhow::bail!("Unknown service or storage '{}'", service);
        }
        let containers = ContainerService::new(DockerClient::new().await?);
        containers
            .follow_logs(&config.container_name(service), follow)
            .await
    }

    /// Registers a profile directory. A missing directory is scaffolded first; without
    /// a name the directory's `.profile` file is used.
    pub async fn profile_add(
        &self,
        path: &Path,
        name: Option<&str>,
        default_env: Option<String>,
    ) -> Result<()> {
        if !path.exists() {
            scaffold_profile(path, name.unwrap_or(DEFAULT_PROFILE_NAME))?;
        } else if !path.is_dir() {
            anyhow::bail!("{} is not a directory", path.display());
        }
        let path = std::fs::canonicalize(path)?;

        let found = discover_profile(&path)?;
        let name = name
            .map(str::to_string)
            .or_else(|| found.name.clone())
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "No profile name given and {} has no .profile file",
                    path.display()
                )
            })?;
        if found.envs.is_empty() {
            warn!("No configs.<env>.yml file found in {}", path.display());
        } else {
            info!("Environments of '{}': {}", name, found.envs.join(", "));
        }
        let default_env = match default_env {
            Some(env) => {
                if !found.envs.contains(&env) {
                    warn!("Default env '{}' has no configs.{}.yml", env, env);
                }
                Some(env)
            }
            None => found.default_env(),
        };

        let profile = Profile::new(name, path.display().to_string(), default_env);
        let saved = self.db.add_profile(&profile).await?;
        info!("Profile '{}' registered at {}", saved.name, saved.path);
        Ok(())
    }

    pub async fn profile_list(&self) -> Result<()> {
        let profiles = self.db.get_all_profiles().await?;
        if profiles.is_empty() {
            println!("No profiles registered. Use 'dockerup profile add'.");
            return Ok(());
        }
        for profile in profiles {
            println!(
                "  - {} ({}), default env: {}",
                profile.name,
                profile.path,
                profile.default_env.as_deref().unwrap_or("prod")
            );
        }
        Ok(())
    }

    pub async fn profile_remove(&self, name: &str) -> Result<()> {
        if self.db.remove_profile(name).await? {
            info!("Profile '{}' removed", name);
        } else {
            warn!("No profile named '{}'", name);
        }
        Ok(())
    }

    pub fn show_version() {
        println!("dockerup v{}", env!("CARGO_PKG_VERSION"));
        println!("Profile driven installer for multi-container application stacks");
    }

    async fn load(&self, target: &Target) -> Result<ProjectConfig> {
        let profile = self.db.find_profile(target.profile.as_deref()).await?;
        let env = target
            .env
            .clone()
            .or_else(|| profile.default_env.clone())
            .unwrap_or_else(|| "prod".to_string());
        info!("Using profile '{}' ({})", profile.name, profile.path);

        let config = ConfigLoader::new(&self.config.assets_dir).load(Path::new(&profile.path), &env)?;
        if config.project.debug {
            self.enable_debug_logging();
        }
        Ok(config)
    }

    fn enable_debug_logging(&self) {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        if let Some(handle) = &self.log_handle {
            if let Err(e) = handle.modify(|filter| *filter = EnvFilter::new("debug")) {
                error!("Could not raise log level: {}", e);
            }
        }
    }

    /// Clones `clone_names`, then for every name in `names` runs the `init` hook,
    /// renders its Dockerfile and runs the `compile_files` hook.
    async fn prepare_sources(
        &self,
        config: &ProjectConfig,
        clone_names: &[String],
        names: &[String],
        hooks: &HookRegistry,
        templates: &TemplateProcessor,
    ) -> Result<()> {
        self.clone_sources(config, clone_names).await?;

        for name in names {
            if hooks.has_hooks(name) {
                debug!("Service '{}' has lifecycle hooks", name);
            }
            hooks.run(HookSlot::Init, config, name)?;
            templates.render_dockerfile(config, name)?;
            hooks.run(HookSlot::CompileFiles, config, name)?;
        }
        Ok(())
    }

    async fn clone_sources(&self, config: &ProjectConfig, names: &[String]) -> Result<()> {
        let repos = RepositoryService::new(GitCredentials::new(
            self.config.git_username.clone(),
            self.config.git_password.clone(),
        ));
        for name in names {
            let service = &config.services[name];
            repos
                .clone_repository(name, &service.clone, &config.paths.clone_path(name))
                .await?;
        }
        Ok(())
    }
}

async fn build_images(
    config: &ProjectConfig,
    names: &[String],
    no_cache: &[String],
    hooks: &HookRegistry,
    images: &ImageService,
) -> Result<()> {
    for name in names {
        hooks.run(HookSlot::BeforeBuild, config, name)?;

        let dockerfile = config
            .paths
            .dockerfiles_path
            .join(format!("{}_Dockerfile", name));
        if !dockerfile.is_file() {
            warn!("Skipping build of '{}': {} is missing", name, dockerfile.display());
            continue;
        }
        let context_dir = build_context(config, name);

        info!("Building image of '{}'...", name);
        images
            .build_image(
                &config.service_image_name(name),
                &dockerfile,
                &context_dir,
                config.services[name].docker.build_kit_enabled,
                no_cache.contains(name),
            )
            .await?;
    }
    Ok(())
}

/// The service clone when there is one, else the `.dist` tree.
fn build_context(config: &ProjectConfig, name: &str) -> PathBuf {
    let clone = config.paths.clone_path(name);
    if clone.is_dir() {
        clone
    } else {
        config.paths.dist_path.clone()
    }
}

/// Image reference a base image is pushed as: `<base>/<image>`, or the image itself
/// without a base path.
fn push_reference(base_path: Option<&str>, image: &str) -> String {
    match base_path.map(|b| b.trim().trim_end_matches('/')).filter(|b| !b.is_empty()) {
        Some(base) => format!("{}/{}", base, image),
        None => image.to_string(),
    }
}

/// Stops (and optionally removes) the containers of `names` that exist.
async fn stop_containers<E: ContainerEngine>(
    engine: &E,
    config: &ProjectConfig,
    names: &[String],
    remove: bool,
) -> Result<()> {
    for name in names {
        let container = config.container_name(name);
        if !engine.container_exists(&container).await? {
            continue;
        }
        info!("    Stopping '{}'", container);
        engine.stop_container(&container, remove).await?;
    }
    Ok(())
}

fn known_names(requested: &[String], exists: impl Fn(&str) -> bool) -> Vec<String> {
    requested
        .iter()
        .map(|name| name.trim().to_string())
        .filter(|name| {
            let known = exists(name);
            if !known && !name.is_empty() {
                warn!("Ignoring unknown name '{}'", name);
            }
            known
        })
        .collect()
}

fn check_certificates(config: &ProjectConfig) {
    let certs = config.paths.ssl_path.join(&config.project.env);
    for kind in ["root", "wildcard"] {
        let cert: PathBuf = certs.join(kind).join("cert.crt");
        if !cert.is_file() {
            warn!(
                "SSL is enabled but {} is missing; generate the certificates before serving https",
                cert.display()
            );
        }
    }
}

fn dump_config(config: &ProjectConfig) {
    if !config.project.debug {
        return;
    }
    match serde_json::to_string_pretty(config) {
        Ok(json) => debug!("configs: {}", json),
        Err(e) => debug!("Could not serialize configs: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::fake::FakeEngine;
    use crate::models::{RuntimePaths, Service, Storage};

    fn config() -> ProjectConfig {
        let mut config = ProjectConfig::default();
        config.project.env = "prod".to_string();
        config.paths = RuntimePaths::new(Path::new("/srv/shop"), Path::new("env"));
        config.services.insert("api".to_string(), Service::default());
        config.storages.insert("db".to_string(), Storage::default());
        config
    }

    #[tokio::test]
    async fn test_stop_only_existing_containers() {
        let engine = FakeEngine::new();
        engine.mark_existing("sample_prod_db");
        let config = config();

        stop_containers(&engine, &config, &["api".to_string(), "db".to_string()], true)
            .await
            .unwrap();
        assert_eq!(
            *engine.stops.lock().unwrap(),
            vec![("sample_prod_db".to_string(), true)]
        );
        assert!(engine.existing.lock().unwrap().is_empty());
    }

    async fn commands() -> Commands {
        Commands::new(Database::in_memory().await.unwrap(), Config::default(), None)
    }

    #[tokio::test]
    async fn test_profile_add_scaffolds_missing_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("shop");
        let commands = commands().await;

        commands.profile_add(&path, Some("shop"), None).await.unwrap();

        assert!(path.join("configs.base.yml").is_file());
        let profile = commands.db.find_profile(Some("shop")).await.unwrap();
        assert_eq!(profile.default_env.as_deref(), Some("prod"));
        assert_eq!(Path::new(&profile.path), std::fs::canonicalize(&path).unwrap());
    }

    #[tokio::test]
    async fn test_profile_add_imports_existing_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join(".profile"), "blog\n").unwrap();
        std::fs::write(dir.path().join("configs.staging.yml"), "").unwrap();
        let commands = commands().await;

        commands.profile_add(dir.path(), None, None).await.unwrap();
        let profile = commands.db.find_profile(Some("blog")).await.unwrap();
        assert_eq!(profile.default_env.as_deref(), Some("staging"));

        // an explicit name wins over .profile
        commands
            .profile_add(dir.path(), Some("news"), Some("live".to_string()))
            .await
            .unwrap();
        let profile = commands.db.find_profile(Some("news")).await.unwrap();
        assert_eq!(profile.default_env.as_deref(), Some("live"));
    }

    #[tokio::test]
    async fn test_profile_add_needs_a_name() {
        let dir = tempfile::TempDir::new().unwrap();
        let commands = commands().await;
        let err = commands.profile_add(dir.path(), None, None).await.unwrap_err();
        assert!(err.to_string().contains(".profile"));
    }

    #[test]
    fn test_push_reference() {
        assert_eq!(
            push_reference(Some("harbor.company.com/shop/"), "base-php:8"),
            "harbor.company.com/shop/base-php:8"
        );
        assert_eq!(push_reference(Some(" "), "base-php:8"), "base-php:8");
        assert_eq!(push_reference(None, "base-php:8"), "base-php:8");
    }

    #[test]
    fn test_build_context_falls_back_to_dist() {
        let config = config();
        assert_eq!(build_context(&config, "api"), PathBuf::from("/srv/shop/.dist"));
    }

    #[test]
    fn test_known_names_drops_unknown() {
        let config = config();
        let names = known_names(
            &[" api".to_string(), "ghost".to_string()],
            |n| config.services.contains_key(n),
        );
        assert_eq!(names, vec!["api"]);
    }
}
