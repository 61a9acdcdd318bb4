use indexmap::IndexMap;
use serde::{de, Deserialize, Deserializer, Serialize};
use sqlx::FromRow;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Error codes for which the proxy carries an `error_page` entry.
pub const NGINX_ERROR_PAGE_CODES: [&str; 6] = ["404", "500", "501", "502", "503", "504"];

/// Name reserved for the reverse proxy container.
pub const PROXY_SERVICE_NAME: &str = "nginx";

/// Shared bridge network used when `ip_mapping` is `static`.
pub const STATIC_NETWORK_NAME: &str = "project_services";

/// First three octets of the static network's /24 block.
pub const STATIC_SUBNET_PREFIX: &str = "172.18.0";

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Profile {
    pub id: i64,
    pub name: String,
    pub path: String,
    pub default_env: Option<String>,
}

impl Profile {
    pub fn new(name: String, path: String, default_env: Option<String>) -> Self {
        Self {
            id: 0, // Will be set by database
            name,
            path,
            default_env,
        }
    }
}

/// Directories the pipeline reads from and renders into. Exposed to templates as `_env`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimePaths {
    pub profile_path: PathBuf,
    pub dist_path: PathBuf,
    pub dockerfiles_path: PathBuf,
    pub dist_hooks_path: PathBuf,
    pub ssl_path: PathBuf,
    pub env_path: PathBuf,
    pub env_hooks_path: PathBuf,
    pub custom_path: PathBuf,
}

impl RuntimePaths {
    pub fn new(profile_path: &std::path::Path, assets_dir: &std::path::Path) -> Self {
        let dist_path = profile_path.join(".dist");
        Self {
            profile_path: profile_path.to_path_buf(),
            dockerfiles_path: dist_path.join("dockerfiles"),
            dist_hooks_path: dist_path.join("hooks"),
            dist_path,
            ssl_path: profile_path.join("ssl"),
            env_path: assets_dir.to_path_buf(),
            env_hooks_path: assets_dir.join("hooks"),
            custom_path: profile_path.join("custom"),
        }
    }

    pub fn clone_path(&self, service_name: &str) -> PathBuf {
        self.dist_path.join("clones").join(service_name)
    }

    pub fn nginx_conf_dir(&self) -> PathBuf {
        self.dist_hooks_path.join("nginx").join("conf")
    }

    pub fn nginx_static_dir(&self) -> PathBuf {
        self.dist_path.join("data").join("nginx").join("static")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(rename = "_env", default, skip_deserializing)]
    pub paths: RuntimePaths,
    #[serde(default)]
    pub project: Project,
    #[serde(default)]
    pub domain: Domain,
    #[serde(default)]
    pub services: IndexMap<String, Service>,
    #[serde(default)]
    pub storages: IndexMap<String, Storage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupInfo>,
    #[serde(default)]
    pub variables: IndexMap<String, serde_yaml::Value>,
}

impl ProjectConfig {
    /// Container name for a service or storage: `<project>_<env>_<name>`.
    pub fn container_name(&self, name: &str) -> String {
        format!("{}_{}_{}", self.project.name, self.project.env, name)
    }

    pub fn proxy_container_name(&self) -> String {
        self.container_name(PROXY_SERVICE_NAME)
    }

    pub fn service_image_name(&self, name: &str) -> String {
        format!("{}_{}:{}", self.project.name, name, self.project.version)
    }

    /// Names of services that are not disabled, in declaration order.
    pub fn enabled_service_names(&self) -> Vec<String> {
        self.services
            .iter()
            .filter(|(_, service)| !service.disabled)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Resolves names to container names, looking in storages first and then services.
    /// Unknown names are dropped.
    pub fn resolve_container_names(&self, names: &[String]) -> Vec<String> {
        names
            .iter()
            .filter(|name| self.storages.contains_key(*name) || self.services.contains_key(*name))
            .map(|name| self.container_name(name))
            .collect()
    }

    pub fn health_of(&self, name: &str) -> Option<HealthStatus> {
        if let Some(storage) = self.storages.get(name) {
            return storage.health_status;
        }
        self.services.get(name).and_then(|s| s.docker.health_status)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    #[serde(default = "default_project_name")]
    pub name: String,
    #[serde(default = "default_version", deserialize_with = "lenient_number")]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extends: Option<String>,
    #[serde(default = "default_registry")]
    pub docker_register: String,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub debug: bool,
    #[serde(default)]
    pub ip_mapping: IpMapping,
    /// Registry path pushed base images are tagged under, e.g. `harbor.company.com/project`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_project_base_path: Option<String>,
    #[serde(rename = "_env", default)]
    pub env: String,
}

impl Default for Project {
    fn default() -> Self {
        Self {
            name: default_project_name(),
            version: default_version(),
            extends: None,
            docker_register: default_registry(),
            debug: false,
            ip_mapping: IpMapping::default(),
            docker_project_base_path: None,
            env: String::new(),
        }
    }
}

fn default_project_name() -> String {
    "sample".to_string()
}

fn default_version() -> u32 {
    1
}

fn default_registry() -> String {
    "docker.io".to_string()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpMapping {
    #[default]
    Dhcp,
    Static,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Domain {
    #[serde(default = "default_domain_name")]
    pub name: String,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub ssl_enabled: bool,
}

impl Default for Domain {
    fn default() -> Self {
        Self {
            name: default_domain_name(),
            ssl_enabled: false,
        }
    }
}

fn default_domain_name() -> String {
    "localhost".to_string()
}

/// Readiness reported by the container engine's health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Stopped,
    Starting,
    Healthy,
    Unhealthy,
}

impl HealthStatus {
    /// `healthy` and `unhealthy` are final; the scheduler stops probing them.
    pub fn is_terminal(self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Unhealthy)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "stopped" => Some(HealthStatus::Stopped),
            "starting" => Some(HealthStatus::Starting),
            "healthy" => Some(HealthStatus::Healthy),
            "unhealthy" => Some(HealthStatus::Unhealthy),
            _ => None,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthStatus::Stopped => "stopped",
            HealthStatus::Starting => "starting",
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub test: String,
    #[serde(default = "default_health_duration")]
    pub timeout: String,
    #[serde(default = "default_health_duration")]
    pub interval: String,
    #[serde(default = "default_health_retries", deserialize_with = "lenient_number")]
    pub retries: u32,
}

impl HealthCheck {
    pub fn new(test: impl Into<String>) -> Self {
        Self {
            test: test.into(),
            timeout: default_health_duration(),
            interval: default_health_duration(),
            retries: default_health_retries(),
        }
    }

    pub fn with_timing(mut self, timeout: &str, interval: &str, retries: u32) -> Self {
        self.timeout = timeout.to_string();
        self.interval = interval.to_string();
        self.retries = retries;
        self
    }
}

fn default_health_duration() -> String {
    "30s".to_string()
}

fn default_health_retries() -> u32 {
    30
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Service {
    #[serde(default)]
    pub sub_domain: String,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub disabled: bool,
    #[serde(default)]
    pub clone: CloneSpec,
    #[serde(default)]
    pub docker: DockerSpec,
    #[serde(default)]
    pub web: WebSpec,
}

impl Service {
    /// A sub-domain of `.` (or nothing) mounts the service on the root domain.
    pub fn is_root_domain(&self) -> bool {
        let sub = self.sub_domain.trim();
        sub.is_empty() || sub == "."
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloneSpec {
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_branch")]
    pub branch: String,
}

impl Default for CloneSpec {
    fn default() -> Self {
        Self {
            url: String::new(),
            branch: default_branch(),
        }
    }
}

fn default_branch() -> String {
    "master".to_string()
}

/// Port as written in YAML: a bare number or a `host:container` string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortValue {
    Number(u32),
    Text(String),
}

impl fmt::Display for PortValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortValue::Number(n) => write!(f, "{}", n),
            PortValue::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default = "default_true", deserialize_with = "lenient_bool")]
    pub build_kit_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<PortValue>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub envs: IndexMap<String, serde_yaml::Value>,
    #[serde(default)]
    pub links: Vec<String>,
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheck>,
    #[serde(default)]
    pub mounts: Vec<String>,
    #[serde(default)]
    pub depends: Vec<String>,
    /// Base images to build and publish: Dockerfile name under
    /// `<profile>/services/<service>/` mapped to the image tag.
    #[serde(default)]
    pub push: IndexMap<String, String>,

    #[serde(rename = "_expose_port", default, skip_deserializing)]
    pub expose_port: Option<u16>,
    #[serde(rename = "_host_port", default, skip_deserializing)]
    pub host_port: Option<u16>,
    #[serde(rename = "_link_containers", default, skip_deserializing)]
    pub link_containers: Vec<String>,
    #[serde(rename = "_depend_containers", default, skip_deserializing)]
    pub depend_containers: Vec<String>,
    #[serde(rename = "_health_status", default, skip_deserializing)]
    pub health_status: Option<HealthStatus>,
    #[serde(rename = "_ip", default, skip_deserializing)]
    pub runtime_ip: Option<String>,
    #[serde(rename = "_network", default, skip_deserializing)]
    pub network: Option<String>,
}

impl Default for DockerSpec {
    fn default() -> Self {
        Self {
            ip: None,
            build_kit_enabled: true,
            port: None,
            volumes: Vec::new(),
            envs: IndexMap::new(),
            links: Vec::new(),
            hosts: Vec::new(),
            health_check: None,
            mounts: Vec::new(),
            depends: Vec::new(),
            push: IndexMap::new(),
            expose_port: None,
            host_port: None,
            link_containers: Vec::new(),
            depend_containers: Vec::new(),
            health_status: None,
            runtime_ip: None,
            network: None,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebSpec {
    #[serde(default)]
    pub locations: Vec<AppLocation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintenance: Option<Maintenance>,
    /// Custom error pages, relative to the profile's `custom/` directory.
    #[serde(default)]
    pub error_pages: BTreeMap<String, String>,
    #[serde(rename = "_error_pages", default, skip_deserializing)]
    pub resolved_error_pages: BTreeMap<String, ErrorPage>,
}

impl WebSpec {
    pub fn maintenance_enabled(&self) -> bool {
        self.maintenance.as_ref().map(|m| m.enabled).unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPage {
    /// File name as seen by nginx under its static root.
    pub filename: String,
    /// Absolute path of the file copied into the proxy's static volume.
    pub source: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Maintenance {
    #[serde(default, deserialize_with = "lenient_bool")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default)]
    pub allowed_ips: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppLocation {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_pass: Option<String>,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub internal: bool,
    /// Raw nginx directives placed inside the location block.
    #[serde(default)]
    pub directives: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Mysql,
    Redis,
    Mongo,
}

impl StorageKind {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "mysql" => Some(StorageKind::Mysql),
            "redis" => Some(StorageKind::Redis),
            "mongo" => Some(StorageKind::Mongo),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Storage {
    pub r#type: String,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_optional_number")]
    pub port: Option<u16>,
    #[serde(default)]
    pub init_db_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_optional_string")]
    pub root_password: Option<String>,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub allow_public: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub volumes: Vec<String>,

    #[serde(rename = "_real_port", default, skip_deserializing)]
    pub real_port: Option<u16>,
    #[serde(rename = "_envs", default, skip_deserializing)]
    pub envs: IndexMap<String, String>,
    #[serde(rename = "_argvs", default, skip_deserializing)]
    pub argvs: Vec<String>,
    #[serde(rename = "_cap_add", default, skip_deserializing)]
    pub cap_add: Option<String>,
    #[serde(rename = "_health_check", default, skip_deserializing)]
    pub health_check: Option<HealthCheck>,
    #[serde(rename = "_health_status", default, skip_deserializing)]
    pub health_status: Option<HealthStatus>,
    #[serde(rename = "_version", default, skip_deserializing)]
    pub version: Option<String>,
    #[serde(rename = "_ip", default, skip_deserializing)]
    pub ip: Option<String>,
    #[serde(rename = "_network", default, skip_deserializing)]
    pub network: Option<String>,
}

impl Storage {
    pub fn kind(&self) -> Option<StorageKind> {
        StorageKind::from_str(&self.r#type)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupInfo {
    #[serde(default)]
    pub plans: IndexMap<String, BackupPlan>,
    #[serde(default)]
    pub settings: BackupSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupPlan {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_name: Option<String>,
    #[serde(default = "default_root_path")]
    pub service_local_path: String,
    #[serde(default = "default_root_path")]
    pub remote_path: String,
    #[serde(default = "default_crontab_time")]
    pub crontab_time: String,
    #[serde(default = "default_keep_backups", deserialize_with = "lenient_number")]
    pub keep_backups: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_name: Option<String>,
}

fn default_root_path() -> String {
    "/".to_string()
}

fn default_crontab_time() -> String {
    "0 */12 * * *".to_string()
}

fn default_keep_backups() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSettings {
    #[serde(default = "default_backup_type")]
    pub r#type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            r#type: default_backup_type(),
            host: None,
            username: None,
            password: None,
        }
    }
}

fn default_backup_type() -> String {
    "ftp".to_string()
}

/// Accepts YAML booleans as well as `"true"`/`"false"` strings left behind by variable substitution.
fn lenient_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum BoolOrText {
        Bool(bool),
        Text(String),
    }

    Ok(match Option::<BoolOrText>::deserialize(deserializer)? {
        Some(BoolOrText::Bool(b)) => b,
        Some(BoolOrText::Text(s)) => {
            matches!(s.trim().to_lowercase().as_str(), "true" | "yes" | "on" | "1")
        }
        None => false,
    })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrText {
    Number(u64),
    Text(String),
}

impl NumberOrText {
    fn into_number<T, E>(self) -> Result<T, E>
    where
        T: TryFrom<u64> + FromStr,
        E: de::Error,
    {
        match self {
            NumberOrText::Number(n) => {
                T::try_from(n).map_err(|_| E::custom(format!("number {} is out of range", n)))
            }
            NumberOrText::Text(s) => s
                .trim()
                .parse()
                .map_err(|_| E::custom(format!("'{}' is not a number", s))),
        }
    }
}

/// Accepts numbers as well as numeric strings, the shape substituted variables take.
fn lenient_number<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<u64> + FromStr,
{
    NumberOrText::deserialize(deserializer)?.into_number()
}

fn lenient_optional_number<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<u64> + FromStr,
{
    Option::<NumberOrText>::deserialize(deserializer)?
        .map(NumberOrText::into_number)
        .transpose()
}

/// Reads any scalar as text, so an unquoted numeric password stays a password.
fn lenient_optional_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_yaml::Value>::deserialize(deserializer)?;
    Ok(value.filter(|v| !v.is_null()).map(|v| scalar_to_string(&v)))
}

/// Renders a scalar YAML value the way it should appear in an environment variable.
pub fn scalar_to_string(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::Null => String::new(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}
