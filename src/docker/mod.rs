mod client;
mod containers;
mod images;

pub use client::DockerClient;
pub use containers::ContainerService;
pub use images::ImageService;

use anyhow::Result;
use std::path::{Path, PathBuf};

use crate::models::{HealthCheck, HealthStatus};

/// Operations the deployment core needs from a container engine.
///
/// Queries that fail are reported as `None` rather than as errors: the scheduler
/// cannot tell a broken probe from a container that is still starting.
#[allow(async_fn_in_trait)]
pub trait ContainerEngine {
    async fn container_exists(&self, name: &str) -> Result<bool>;

    async fn run_container(&self, spec: &RunSpec) -> Result<()>;

    async fn health_status(&self, name: &str) -> Option<HealthStatus>;

    async fn container_ip(&self, name: &str) -> Option<String>;

    /// Environment baked into an image (`KEY=value` entries).
    async fn image_env(&self, image: &str) -> Option<Vec<String>>;

    async fn restart_container(&self, name: &str) -> Result<()>;

    async fn stop_container(&self, name: &str, remove: bool) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortBinding {
    pub host: u16,
    pub container: u16,
    pub host_ip: Option<String>,
}

/// A `docker run` request. Relative host paths in `volumes` and `mounts` are
/// resolved against `base_dir` (the profile's `.dist` tree).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSpec {
    pub name: String,
    pub image: String,
    pub base_dir: PathBuf,
    pub hostname: Option<String>,
    pub ports: Vec<PortBinding>,
    pub volumes: Vec<String>,
    pub mounts: Vec<String>,
    pub envs: Vec<(String, String)>,
    pub links: Vec<String>,
    pub hosts: Vec<String>,
    pub network: Option<String>,
    pub ip: Option<String>,
    pub pull: Option<String>,
    pub cap_add: Option<String>,
    pub health_check: Option<HealthCheck>,
    pub argvs: Vec<String>,
}

impl RunSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>, base_dir: &Path) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            base_dir: base_dir.to_path_buf(),
            ..Default::default()
        }
    }

    /// Arguments for `docker`, starting with `run`.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--name".to_string(),
            self.name.clone(),
            "-d".to_string(),
            "--restart=unless-stopped".to_string(),
        ];

        for port in &self.ports {
            let prefix = port
                .host_ip
                .as_ref()
                .map(|ip| format!("{}:", ip))
                .unwrap_or_default();
            args.push("-p".to_string());
            args.push(format!("{}{}:{}", prefix, port.host, port.container));
        }
        if let Some(pull) = &self.pull {
            args.push(format!("--pull={}", pull));
        }
        if let Some(cap) = &self.cap_add {
            args.push(format!("--cap-add={}", cap));
        }
        if let Some(hostname) = &self.hostname {
            args.push("--hostname".to_string());
            args.push(hostname.clone());
        }
        if let Some(network) = &self.network {
            args.push("--network".to_string());
            args.push(network.clone());
        }
        if let Some(ip) = &self.ip {
            args.push("--ip".to_string());
            args.push(ip.clone());
        }
        for volume in &self.volumes {
            args.push("--volume".to_string());
            args.push(self.resolve_host_path(volume));
        }
        for mount in &self.mounts {
            let mut parts = mount.splitn(2, ':');
            let src = parts.next().unwrap_or_default();
            let dst = parts.next().unwrap_or(src);
            args.push("--mount".to_string());
            args.push(format!(
                "type=bind,src={},dst={}",
                self.host_path(src).display(),
                dst
            ));
        }
        for link in &self.links {
            args.push(format!("--link={}", link));
        }
        for host in &self.hosts {
            args.push(format!("--add-host={}", host));
        }
        for (key, value) in &self.envs {
            args.push("--env".to_string());
            args.push(format!("{}={}", key, value));
        }
        if let Some(check) = &self.health_check {
            args.push("--health-cmd".to_string());
            args.push(check.test.clone());
            args.push(format!("--health-interval={}", check.interval));
            args.push(format!("--health-timeout={}", check.timeout));
            args.push(format!("--health-retries={}", check.retries));
        }

        args.push(self.image.clone());
        args.extend(self.argvs.iter().cloned());
        args
    }

    fn resolve_host_path(&self, volume: &str) -> String {
        match volume.split_once(':') {
            Some((host, rest)) => format!("{}:{}", self.host_path(host).display(), rest),
            None => volume.to_string(),
        }
    }

    fn host_path(&self, host: &str) -> PathBuf {
        let path = Path::new(host);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(host.trim_start_matches("./"))
        }
    }
}

/// Picks the container IP out of an engine inspect result, preferring any named network.
pub(crate) fn first_ip<'a>(candidates: impl IntoIterator<Item = &'a str>) -> Option<String> {
    candidates
        .into_iter()
        .map(str::trim)
        .find(|ip| !ip.is_empty())
        .map(str::to_string)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_args_for_storage() {
        let mut spec = RunSpec::new("shop_prod_db", "mysql:8.0", Path::new("/srv/shop/.dist"));
        spec.hostname = Some("db".to_string());
        spec.ports.push(PortBinding {
            host: 3306,
            container: 3306,
            host_ip: Some("127.0.0.1".to_string()),
        });
        spec.volumes.push("./data/mysql_data/db:/var/lib/mysql".to_string());
        spec.envs.push(("TZ".to_string(), "UTC".to_string()));
        spec.health_check = Some(HealthCheck::new("mysqladmin ping -h localhost").with_timing("2s", "1s", 300));
        spec.argvs.push("--skip-ssl".to_string());

        let args = spec.to_args();
        assert_eq!(&args[..5], ["run", "--name", "shop_prod_db", "-d", "--restart=unless-stopped"]);
        assert!(args.windows(2).any(|w| w == ["-p", "127.0.0.1:3306:3306"]));
        assert!(args
            .windows(2)
            .any(|w| w == ["--volume", "/srv/shop/.dist/data/mysql_data/db:/var/lib/mysql"]));
        assert!(args.windows(2).any(|w| w == ["--env", "TZ=UTC"]));
        assert!(args.windows(2).any(|w| w == ["--health-cmd", "mysqladmin ping -h localhost"]));
        assert!(args.contains(&"--health-retries=300".to_string()));
        // image comes before its arguments
        let image_pos = args.iter().position(|a| a == "mysql:8.0").unwrap();
        assert_eq!(args[image_pos + 1], "--skip-ssl");
    }

    #[test]
    fn test_absolute_volume_and_mount() {
        let mut spec = RunSpec::new("c", "img", Path::new("/dist"));
        spec.volumes.push("/var/data:/data:ro".to_string());
        spec.mounts.push("uploads:/app/uploads".to_string());
        let args = spec.to_args();
        assert!(args.contains(&"/var/data:/data:ro".to_string()));
        assert!(args.contains(&"type=bind,src=/dist/uploads,dst=/app/uploads".to_string()));
    }

    #[test]
    fn test_first_ip_skips_empty() {
        assert_eq!(first_ip(["", " ", "172.18.0.4"]), Some("172.18.0.4".to_string()));
        assert_eq!(first_ip([""]), None);
    }
}
