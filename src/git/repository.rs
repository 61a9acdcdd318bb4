use anyhow::Result;
use git2::{build::RepoBuilder, Cred, FetchOptions, RemoteCallbacks};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::models::CloneSpec;

#[derive(Debug, Clone, Default)]
pub struct GitCredentials {
    pub username: Option<String>,
    pub password: Option<String>,
}

impl GitCredentials {
    pub fn new(username: Option<String>, password: Option<String>) -> Self {
        Self { username, password }
    }

    fn userpass(&self) -> Option<(String, String)> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) if !user.is_empty() => Some((user.clone(), pass.clone())),
            _ => None,
        }
    }
}

/// Shallow clones of service sources into the profile's `.dist/clones` tree.
pub struct RepositoryService {
    credentials: GitCredentials,
}

impl RepositoryService {
    pub fn new(credentials: GitCredentials) -> Self {
        Self { credentials }
    }

    /// Clones `spec.branch` of `spec.url` with depth 1 into `dest`, replacing any previous clone.
    /// Returns `None` when the service declares no repository.
    pub async fn clone_repository(&self, service: &str, spec: &CloneSpec, dest: &Path) -> Result<Option<PathBuf>> {
        if spec.url.trim().is_empty() {
            warn!("Service '{}' has no clone url, skipping clone", service);
            return Ok(None);
        }

        if dest.exists() {
            debug!("Removing previous clone at {}", dest.display());
            fs::remove_dir_all(dest)?;
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        info!("Cloning '{}' ({}) from {}", service, spec.branch, spec.url);
        let url = spec.url.clone();
        let branch = spec.branch.clone();
        let target = dest.to_path_buf();
        let credentials = self.credentials.userpass();

        tokio::task::spawn_blocking(move || clone_shallow(&url, &branch, &target, credentials))
            .await
            .map_err(|e| anyhow::anyhow!("Clone task for {} failed: {}", service, e))??;

        Ok(Some(dest.to_path_buf()))
    }
}

fn clone_shallow(url: &str, branch: &str, dest: &Path, credentials: Option<(String, String)>) -> Result<()> {
    let mut callbacks = RemoteCallbacks::new();
    if let Some((username, password)) = credentials {
        callbacks.credentials(move |_url, _username_from_url, _allowed_types| {
            Cred::userpass_plaintext(&username, &password)
        });
    }

    let mut fetch_options = FetchOptions::new();
    fetch_options.remote_callbacks(callbacks);
    fetch_options.depth(1);

    let mut builder = RepoBuilder::new();
    builder.fetch_options(fetch_options);
    builder.branch(branch);

    builder
        .clone(url, dest)
        .map_err(|e| anyhow::anyhow!("Failed to clone {} ({}): {}", url, branch, e.message()))?;
    Ok(())
}
