use std::collections::{HashMap, VecDeque};
use tracing::{debug, info, warn};

use crate::config::{ImagePullPolicy, SchedulerLimits};
use crate::docker::{ContainerEngine, PortBinding, RunSpec};
use crate::error::{DeployError, Result};
use crate::models::{scalar_to_string, HealthStatus, ProjectConfig, Storage};
use crate::proxy_processor::ProxyRefresh;

/// Starts storages eagerly, then services in declaration order, holding back any
/// service whose declared dependencies are not all healthy yet.
pub struct Scheduler<'a, E: ContainerEngine, P: ProxyRefresh> {
    engine: &'a E,
    proxy: &'a P,
    limits: SchedulerLimits,
    pull_policy: ImagePullPolicy,
}

impl<'a, E: ContainerEngine, P: ProxyRefresh> Scheduler<'a, E, P> {
    pub fn new(
        engine: &'a E,
        proxy: &'a P,
        limits: SchedulerLimits,
        pull_policy: ImagePullPolicy,
    ) -> Self {
        Self {
            engine,
            proxy,
            limits,
            pull_policy,
        }
    }

    pub async fn run(&self, config: &mut ProjectConfig, service_names: &[String]) -> Result<()> {
        self.start_storages(config).await?;

        let mut queue: VecDeque<String> = config
            .services
            .keys()
            .filter(|name| service_names.contains(name))
            .cloned()
            .collect();
        let mut requeues: HashMap<String, u32> = HashMap::new();

        while let Some(name) = queue.pop_front() {
            let depends = config.services[&name].docker.depends.clone();

            if !depends.is_empty() {
                self.refresh_health(config).await;
                let pending: Vec<&String> = depends
                    .iter()
                    .filter(|dep| config.health_of(dep) != Some(HealthStatus::Healthy))
                    .collect();

                if !pending.is_empty() {
                    let attempts = requeues.entry(name.clone()).or_insert(0);
                    *attempts += 1;
                    if *attempts >= self.limits.retry_limit {
                        return Err(DeployError::DependencyTimeout {
                            service: name,
                            attempts: *attempts,
                            pending: pending
                                .iter()
                                .map(|dep| dep.as_str())
                                .collect::<Vec<_>>()
                                .join(", "),
                        });
                    }
                    debug!(
                        "Service '{}' waits for {:?} (containers {:?}, attempt {})",
                        name, pending, config.services[&name].docker.depend_containers, attempts
                    );
                    queue.push_back(name);
                    tokio::time::sleep(self.limits.poll_interval).await;
                    continue;
                }
            }

            self.start_service(config, &name).await?;
        }

        Ok(())
    }

    async fn start_storages(&self, config: &mut ProjectConfig) -> Result<()> {
        let names: Vec<String> = config.storages.keys().cloned().collect();
        for name in names {
            let container = config.container_name(&name);
            let exists = self.engine.container_exists(&container).await.map_err(|e| {
                DeployError::ContainerLaunch {
                    container: container.clone(),
                    reason: format!("{:#}", e),
                }
            })?;
            if exists {
                info!("Storage '{}' is already running", name);
                continue;
            }

            info!("Starting storage '{}'", name);
            let spec = storage_run_spec(config, &name, &config.storages[&name], self.pull_policy);
            self.engine
                .run_container(&spec)
                .await
                .map_err(|e| DeployError::ContainerLaunch {
                    container: container.clone(),
                    reason: format!("{:#}", e),
                })?;

            let status = self.engine.health_status(&container).await;
            if let Some(storage) = config.storages.get_mut(&name) {
                storage.health_status = status;
            }
        }
        Ok(())
    }

    async fn start_service(&self, config: &mut ProjectConfig, name: &str) -> Result<()> {
        let container = config.container_name(name);
        info!("Starting service '{}'", name);

        let spec = service_run_spec(config, name);
        self.engine
            .run_container(&spec)
            .await
            .map_err(|e| DeployError::ContainerLaunch {
                container: container.clone(),
                reason: format!("{:#}", e),
            })?;

        let status = self.engine.health_status(&container).await;
        let ip = self.engine.container_ip(&container).await;
        if let Some(service) = config.services.get_mut(name) {
            service.docker.health_status = status.or(Some(HealthStatus::Starting));
            service.docker.runtime_ip = ip.or_else(|| service.docker.ip.clone());
            if service.docker.health_status == Some(HealthStatus::Unhealthy) {
                warn!("Service '{}' reports unhealthy right after launch", name);
            }
        }

        self.proxy.refresh(config).await
    }

    /// One probe per storage and enabled service that has not reached a final status.
    async fn refresh_health(&self, config: &mut ProjectConfig) {
        let storages: Vec<String> = config
            .storages
            .iter()
            .filter(|(_, s)| !s.health_status.is_some_and(HealthStatus::is_terminal))
            .map(|(name, _)| name.clone())
            .collect();
        for name in storages {
            let status = self.engine.health_status(&config.container_name(&name)).await;
            if let Some(storage) = config.storages.get_mut(&name) {
                storage.health_status = status;
            }
        }

        let services: Vec<String> = config
            .services
            .iter()
            .filter(|(_, s)| !s.disabled)
            .filter(|(_, s)| !s.docker.health_status.is_some_and(HealthStatus::is_terminal))
            .map(|(name, _)| name.clone())
            .collect();
        for name in services {
            let status = self.engine.health_status(&config.container_name(&name)).await;
            if let (Some(status), Some(service)) = (status, config.services.get_mut(&name)) {
                service.docker.health_status = Some(status);
            }
        }
    }
}

pub fn storage_run_spec(
    config: &ProjectConfig,
    name: &str,
    storage: &Storage,
    pull_policy: ImagePullPolicy,
) -> RunSpec {
    let mut spec = RunSpec::new(
        config.container_name(name),
        storage.image.clone(),
        &config.paths.dist_path,
    );
    spec.hostname = Some(name.to_string());
    if let Some(port) = storage.real_port {
        let host_ip = if storage.allow_public { "0.0.0.0" } else { "127.0.0.1" };
        spec.ports.push(PortBinding {
            host: port,
            container: port,
            host_ip: Some(host_ip.to_string()),
        });
    }
    spec.pull = Some(pull_policy.as_docker_flag().to_string());
    spec.cap_add = storage.cap_add.clone();
    spec.health_check = storage.health_check.clone();
    spec.volumes = storage.volumes.clone();
    spec.envs = storage
        .envs
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    spec.argvs = storage.argvs.clone();
    spec.ip = storage.ip.clone();
    spec.network = storage.network.clone();
    spec
}

pub fn service_run_spec(config: &ProjectConfig, name: &str) -> RunSpec {
    let docker = &config.services[name].docker;
    let mut spec = RunSpec::new(
        config.container_name(name),
        config.service_image_name(name),
        &config.paths.dist_path,
    );
    spec.hostname = Some(format!("{}_service", name));
    if let (Some(host), Some(container)) = (docker.host_port, docker.expose_port) {
        spec.ports.push(PortBinding {
            host,
            container,
            host_ip: None,
        });
    }
    spec.volumes = docker.volumes.clone();
    spec.mounts = docker.mounts.clone();
    spec.envs = docker
        .envs
        .iter()
        .map(|(k, v)| (k.clone(), scalar_to_string(v)))
        .collect();
    spec.links = docker.link_containers.clone();
    spec.hosts = docker.hosts.clone();
    spec.pull = Some("never".to_string());
    spec.health_check = docker.health_check.clone();
    spec.ip = docker.ip.clone();
    spec.network = docker.network.clone();
    spec
}
