use anyhow::Result;
use bollard::query_parameters::InspectContainerOptions;
use std::process::Command;
use tracing::{debug, info, warn};

use crate::docker::client::{is_not_found, DockerClient};
use crate::docker::{first_ip, ContainerEngine, RunSpec};
use crate::models::HealthStatus;

/// Container lifecycle: launches go through the docker CLI, queries through the API.
pub struct ContainerService {
    client: DockerClient,
}

impl ContainerService {
    pub fn new(client: DockerClient) -> Self {
        Self { client }
    }

    fn docker_cli(args: &[String]) -> Result<std::process::Output> {
        debug!("docker {}", args.join(" "));
        Ok(Command::new("docker").args(args).output()?)
    }

    /// Recreates the shared bridge network used for static IP mapping.
    pub async fn recreate_network(&self, name: &str, subnet: &str) -> Result<()> {
        let _ = Self::docker_cli(&["network".to_string(), "rm".to_string(), name.to_string()]);
        let output = Self::docker_cli(&[
            "network".to_string(),
            "create".to_string(),
            name.to_string(),
            format!("--subnet={}", subnet),
        ])?;
        if output.status.success() {
            info!("Created network '{}' ({})", name, subnet);
            Ok(())
        } else {
            let error = String::from_utf8_lossy(&output.stderr);
            Err(anyhow::anyhow!("Failed to create network {}: {}", name, error.trim()))
        }
    }

    /// Streams `docker logs` of a container to the terminal.
    pub async fn follow_logs(&self, name: &str, follow: bool) -> Result<()> {
        let mut command = Command::new("docker");
        command.arg("logs");
        if follow {
            command.arg("-f");
        }
        let status = command.arg(name).status()?;
        if !status.success() {
            anyhow::bail!("docker logs {} exited with {}", name, status);
        }
        Ok(())
    }
}

impl ContainerEngine for ContainerService {
    async fn container_exists(&self, name: &str) -> Result<bool> {
        match self
            .client
            .docker()
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(anyhow::anyhow!("Failed to inspect container {}: {}", name, e)),
        }
    }

    async fn run_container(&self, spec: &RunSpec) -> Result<()> {
        if spec.image.is_empty() {
            anyhow::bail!("no image configured for container {}", spec.name);
        }
        info!("    Running container '{}' from {}", spec.name, spec.image);

        let output = Self::docker_cli(&spec.to_args())?;
        if output.status.success() {
            Ok(())
        } else {
            let error = String::from_utf8_lossy(&output.stderr);
            Err(anyhow::anyhow!("docker run failed: {}", error.trim()))
        }
    }

    async fn health_status(&self, name: &str) -> Option<HealthStatus> {
        let inspect = self
            .client
            .docker()
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .ok()?;
        let status = inspect.state?.health?.status?;
        reported_health(&status.to_string())
    }

    async fn container_ip(&self, name: &str) -> Option<String> {
        let inspect = self
            .client
            .docker()
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .ok()?;
        let networks = inspect.network_settings?.networks?;
        first_ip(
            networks
                .values()
                .filter_map(|endpoint| endpoint.ip_address.as_deref()),
        )
    }

    async fn image_env(&self, image: &str) -> Option<Vec<String>> {
        match self.client.docker().inspect_image(image).await {
            Ok(inspect) => inspect.config.and_then(|c| c.env),
            Err(e) => {
                debug!("Could not inspect image {}: {}", image, e);
                None
            }
        }
    }

    async fn restart_container(&self, name: &str) -> Result<()> {
        let output = Self::docker_cli(&["restart".to_string(), name.to_string()])?;
        if output.status.success() {
            Ok(())
        } else {
            let error = String::from_utf8_lossy(&output.stderr);
            Err(anyhow::anyhow!("Failed to restart {}: {}", name, error.trim()))
        }
    }

    async fn stop_container(&self, name: &str, remove: bool) -> Result<()> {
        let output = Self::docker_cli(&["stop".to_string(), name.to_string()])?;
        if !output.status.success() {
            let error = String::from_utf8_lossy(&output.stderr);
            warn!("    Error stopping container '{}': {}", name, error.trim());
        }
        if remove {
            let output = Self::docker_cli(&["rm".to_string(), name.to_string()])?;
            if !output.status.success() {
                let error = String::from_utf8_lossy(&output.stderr);
                warn!("    Error removing container '{}': {}", name, error.trim());
            }
        }
        Ok(())
    }
}

/// Maps the engine's health string. Containers without a health check report
/// nothing, which keeps their dependents waiting.
fn reported_health(status: &str) -> Option<HealthStatus> {
    match status.trim() {
        "" | "none" => None,
        status => Some(HealthStatus::parse(status).unwrap_or(HealthStatus::Unhealthy)),
    }
}
