use anyhow::Result;
use bollard::models::ImageSummary;
use bollard::query_parameters::{CreateImageOptions, ListImagesOptions};
use futures::StreamExt;
use std::path::Path;
use std::process::Command;
use tracing::{info, warn};

use crate::config::ImagePullPolicy;
use crate::docker::client::DockerClient;

/// Pulls registry images and builds service images.
pub struct ImageService {
    client: DockerClient,
    pull_policy: ImagePullPolicy,
}

impl ImageService {
    pub fn new(client: DockerClient, pull_policy: ImagePullPolicy) -> Self {
        Self {
            client,
            pull_policy,
        }
    }

    pub async fn image_exists(&self, image_name: &str) -> Result<bool> {
        let images: Vec<ImageSummary> = self
            .client
            .docker()
            .list_images(None::<ListImagesOptions>)
            .await?;

        Ok(images
            .iter()
            .any(|img| img.repo_tags.iter().any(|tag| tag == image_name)))
    }

    /// Pulls an image according to the configured policy.
    pub async fn pull_image(&self, image_name: &str) -> Result<()> {
        match self.pull_policy {
            ImagePullPolicy::Always => {
                info!("    Pulling image: {} (policy: Always)", image_name);
                self.force_pull_image(image_name).await
            }
            ImagePullPolicy::IfNotPresent => {
                if self.image_exists(image_name).await? {
                    info!(
                        "    Image {} already exists locally (policy: IfNotPresent), skipping pull",
                        image_name
                    );
                    Ok(())
                } else {
                    info!(
                        "    Pulling image: {} (policy: IfNotPresent, not found locally)",
                        image_name
                    );
                    self.force_pull_image(image_name).await
                }
            }
        }
    }

    async fn force_pull_image(&self, image_name: &str) -> Result<()> {
        let options = CreateImageOptions {
            from_image: Some(image_name.to_string()),
            ..Default::default()
        };

        let mut stream = self.client.docker().create_image(Some(options), None, None);

        while let Some(result) = stream.next().await {
            if let Err(e) = result {
                return Err(anyhow::anyhow!("Failed to pull image {}: {}", image_name, e));
            }
        }

        info!("    Successfully pulled image: {}", image_name);
        Ok(())
    }

    /// Builds `tag` from a rendered Dockerfile with the clone as build context.
    pub async fn build_image(
        &self,
        tag: &str,
        dockerfile: &Path,
        context_dir: &Path,
        build_kit: bool,
        no_cache: bool,
    ) -> Result<()> {
        info!("    Building image {} from {}", tag, dockerfile.display());

        let mut command = Command::new("docker");
        command
            .current_dir(context_dir)
            .args(["build", "-t", tag, "--network=host", "-f"])
            .arg(dockerfile);
        if no_cache {
            command.arg("--no-cache");
        }
        command.arg(".");
        if build_kit {
            command.env("DOCKER_BUILDKIT", "1");
        }

        let status = command.status()?;
        if status.success() {
            info!("    Successfully built image {}", tag);
            Ok(())
        } else {
            Err(anyhow::anyhow!("docker build of {} exited with {}", tag, status))
        }
    }

    /// Tags `image` as `target` and pushes it. Registry credentials come from a
    /// previous `docker login`.
    pub async fn push_image(&self, image: &str, target: &str) -> Result<()> {
        info!("    Pushing image {} as {}", image, target);
        let status = Command::new("docker").args(["tag", image, target]).status()?;
        if !status.success() {
            anyhow::bail!("docker tag {} {} exited with {}", image, target, status);
        }
        let status = Command::new("docker").args(["push", target]).status()?;
        if !status.success() {
            anyhow::bail!("docker push {} exited with {}", target, status);
        }
        info!("    Successfully pushed {}", target);
        Ok(())
    }

    /// Removes dangling images left behind by previous builds.
    pub async fn remove_unused_images(&self) -> Result<()> {
        info!("Removing unused docker images...");
        let output = Command::new("docker")
            .args(["image", "prune", "-f"])
            .output()?;

        if !output.status.success() {
            let error = String::from_utf8_lossy(&output.stderr);
            warn!("    Warning: Error pruning images: {}", error.trim());
        }
        Ok(())
    }
}
