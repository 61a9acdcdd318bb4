use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Pull policy applied to storage images (service images are always built locally).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImagePullPolicy {
    /// Always pull from the registry.
    Always,
    /// Pull only when the image is missing locally.
    IfNotPresent,
}

impl Default for ImagePullPolicy {
    fn default() -> Self {
        ImagePullPolicy::IfNotPresent
    }
}

impl ImagePullPolicy {
    pub fn from_str(s: &str) -> Result<Self, String> {
        match s.to_lowercase().as_str() {
            "always" => Ok(ImagePullPolicy::Always),
            "ifnotpresent" | "if_not_present" | "missing" => Ok(ImagePullPolicy::IfNotPresent),
            _ => Err(format!("Unknown image pull policy: {}", s)),
        }
    }

    /// Value for `docker run --pull=`.
    pub fn as_docker_flag(&self) -> &'static str {
        match self {
            ImagePullPolicy::Always => "always",
            ImagePullPolicy::IfNotPresent => "missing",
        }
    }
}

/// Bounds for the dependency wait loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerLimits {
    /// How many times a single service may be requeued before the run fails.
    pub retry_limit: u32,
    /// Pause after each requeue.
    pub poll_interval: Duration,
}

impl Default for SchedulerLimits {
    fn default() -> Self {
        Self {
            retry_limit: 600,
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Application settings, read from the process environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub image_pull_policy: ImagePullPolicy,
    pub db_path: PathBuf,
    pub assets_dir: PathBuf,
    pub scheduler: SchedulerLimits,
    pub git_username: Option<String>,
    pub git_password: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            image_pull_policy: ImagePullPolicy::default(),
            db_path: default_db_path(),
            assets_dir: PathBuf::from("env"),
            scheduler: SchedulerLimits::default(),
            git_username: None,
            git_password: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let image_pull_policy = std::env::var("DOCKERUP_IMAGE_PULL_POLICY")
            .ok()
            .and_then(|s| ImagePullPolicy::from_str(&s).ok())
            .unwrap_or_default();

        let db_path = std::env::var("DOCKERUP_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        let assets_dir = std::env::var("DOCKERUP_ASSETS_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.assets_dir);

        let retry_limit = std::env::var("DOCKERUP_DEPENDENCY_RETRY_LIMIT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.scheduler.retry_limit);

        let poll_interval = std::env::var("DOCKERUP_DEPENDENCY_POLL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.scheduler.poll_interval);

        Self {
            image_pull_policy,
            db_path,
            assets_dir,
            scheduler: SchedulerLimits {
                retry_limit,
                poll_interval,
            },
            git_username: non_empty_var("GIT_USERNAME"),
            git_password: non_empty_var("GIT_PASSWORD"),
        }
    }

    pub fn database_url(&self) -> String {
        format!("sqlite:{}?mode=rwc", self.db_path.display())
    }
}

fn default_db_path() -> PathBuf {
    let home_dir = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home_dir).join(".dockerup").join("dockerup.db")
}

fn non_empty_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
