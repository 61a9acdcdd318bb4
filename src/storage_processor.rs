use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::docker::ContainerEngine;
use crate::error::{DeployError, Result};
use crate::models::{
    HealthCheck, IpMapping, ProjectConfig, RuntimePaths, Storage, StorageKind,
    STATIC_NETWORK_NAME,
};
use crate::service_processor::next_static_ip;

const DEFAULT_TIMEZONE: &str = "UTC";

const MYSQL_IMAGE: &str = "mysql:8.0";
const MYSQL_PORT: u16 = 3306;
const REDIS_IMAGE: &str = "redis:alpine";
const REDIS_PORT: u16 = 6379;
const MONGO_IMAGE: &str = "mongo:latest";
const MONGO_PORT: u16 = 27017;

/// Type-specific defaults, volumes, environment, health checks and init scripts for storages.
pub struct StorageProcessor<'a, E: ContainerEngine> {
    engine: &'a E,
}

impl<'a, E: ContainerEngine> StorageProcessor<'a, E> {
    pub fn new(engine: &'a E) -> Self {
        Self { engine }
    }

    /// Normalizes every storage in declaration order.
    pub async fn normalize_all(&self, config: &mut ProjectConfig) -> Result<()> {
        let names: Vec<String> = config.storages.keys().cloned().collect();
        for name in names {
            if config.project.ip_mapping == IpMapping::Static && config.storages[&name].ip.is_none() {
                let ip = next_static_ip(config)?;
                if let Some(storage) = config.storages.get_mut(&name) {
                    storage.ip = Some(ip);
                    storage.network = Some(STATIC_NETWORK_NAME.to_string());
                }
            }

            let mut storage = config.storages[&name].clone();
            if storage.timezone.is_none() {
                storage.timezone = Some(DEFAULT_TIMEZONE.to_string());
            }

            let storage = match storage.kind() {
                Some(StorageKind::Mysql) => normalize_mysql(&config.paths, &name, storage)?,
                Some(StorageKind::Redis) => normalize_redis(&name, storage),
                Some(StorageKind::Mongo) => self.normalize_mongo(&config.paths, &name, storage).await?,
                None => {
                    warn!(
                        "Storage '{}' has unsupported type '{}'; it is left as declared",
                        name, storage.r#type
                    );
                    storage
                }
            };

            debug!(
                "Normalized storage '{}' (image '{}', port {:?})",
                name, storage.image, storage.real_port
            );
            config.storages.insert(name, storage);
        }
        Ok(())
    }

    /// Chooses the mongo shell from the image's `MONGO_VERSION`: 4.x and older ship
    /// `mongo`, later images only `mongosh`.
    pub async fn normalize_mongo(
        &self,
        paths: &RuntimePaths,
        name: &str,
        mut storage: Storage,
    ) -> Result<Storage> {
        if storage.image.is_empty() {
            storage.image = MONGO_IMAGE.to_string();
        }

        storage.version = self
            .engine
            .image_env(&storage.image)
            .await
            .and_then(|envs| mongo_version(&envs));
        let cli = mongo_cli(storage.version.as_deref());
        info!("    Mongo storage '{}' uses '{}' shell", name, cli);

        let port = storage.port.unwrap_or(MONGO_PORT);
        storage.real_port = Some(port);
        storage.argvs = Vec::new();
        let mut port_flag = String::new();
        if port != MONGO_PORT {
            storage.argvs = vec!["--port".to_string(), port.to_string()];
            port_flag = format!(" --port {}", port);
        }

        storage.health_check = Some(
            HealthCheck::new(format!(
                "{}{} --quiet --eval \"db.adminCommand('ping').ok\"",
                cli, port_flag
            ))
            .with_timing("30s", "1s", 300),
        );

        if storage.volumes.is_empty() {
            let data_dir = paths.dist_path.join("data").join("mongo_data").join(name);
            fs::create_dir_all(&data_dir).map_err(|e| DeployError::io(&data_dir, e))?;
            storage.volumes.push(format!("./data/mongo_data/{}:/data/db", name));
        }

        let hook_dir = paths.dist_hooks_path.join("mongo").join(name);
        write_hook(&hook_dir, "init.sh", &mongo_init_script(cli, &port_flag, &storage))?;
        let init_volume = format!(
            "./hooks/mongo/{}/init.sh:/docker-entrypoint-initdb.d/mongo-init.sh:ro",
            name
        );
        if !storage.volumes.contains(&init_volume) {
            storage.volumes.push(init_volume);
        }

        storage.envs.clear();
        storage.envs.insert("TZ".to_string(), timezone(&storage));
        if let Some(password) = storage.root_password.clone() {
            storage
                .envs
                .insert("MONGO_INITDB_ROOT_USERNAME".to_string(), "root".to_string());
            storage
                .envs
                .insert("MONGO_INITDB_ROOT_PASSWORD".to_string(), password);
        }

        Ok(storage)
    }
}

/// Image a storage runs: the declared one, else the default of its type.
pub fn storage_image(storage: &Storage) -> Option<String> {
    if !storage.image.is_empty() {
        return Some(storage.image.clone());
    }
    let image = match storage.kind()? {
        StorageKind::Mysql => MYSQL_IMAGE,
        StorageKind::Redis => REDIS_IMAGE,
        StorageKind::Mongo => MONGO_IMAGE,
    };
    Some(image.to_string())
}

pub fn normalize_mysql(paths: &RuntimePaths, name: &str, mut storage: Storage) -> Result<Storage> {
    storage.argvs = vec![
        "--character-set-server=utf8mb4".to_string(),
        "--collation-server=utf8mb4_unicode_ci".to_string(),
        "--skip-ssl".to_string(),
        "--default-authentication-plugin=mysql_native_password".to_string(),
    ];
    storage.cap_add = Some("SYS_NICE".to_string());
    if storage.image.is_empty() {
        storage.image = MYSQL_IMAGE.to_string();
    }
    let port = storage.port.unwrap_or(MYSQL_PORT);
    storage.real_port = Some(port);

    let data_root = paths.dist_path.join("data").join("mysql_data");
    fs::create_dir_all(&data_root).map_err(|e| DeployError::io(&data_root, e))?;
    storage.volumes = vec![format!("./data/mysql_data/{}:/var/lib/mysql", name)];

    storage.envs.clear();
    if let Some(password) = &storage.root_password {
        storage
            .envs
            .insert("MYSQL_ROOT_PASSWORD".to_string(), password.clone());
    }
    storage.envs.insert("HOSTNAME".to_string(), name.to_string());
    storage.envs.insert("MYSQL_HOST".to_string(), name.to_string());
    storage
        .envs
        .insert("MYSQL_TCP_PORT".to_string(), port.to_string());
    storage
        .envs
        .insert("MYSQL_ROOT_HOST".to_string(), "%".to_string());
    storage.envs.insert("TZ".to_string(), timezone(&storage));

    storage.health_check =
        Some(HealthCheck::new("mysqladmin ping -h localhost").with_timing("2s", "1s", 300));

    if !storage.init_db_names.is_empty() {
        let statements: Vec<String> = storage
            .init_db_names
            .iter()
            .map(|db| {
                format!(
                    "CREATE DATABASE IF NOT EXISTS `{}` CHARACTER SET utf8mb4 COLLATE utf8mb4_unicode_ci;",
                    db
                )
            })
            .collect();
        let hook_dir = paths.dist_hooks_path.join("mysql").join(name);
        write_hook(&hook_dir, "init.sql", &statements.join("\n\n"))?;
        storage.volumes.push(format!(
            "./hooks/mysql/{}/init.sql:/docker-entrypoint-initdb.d/init.sql:ro",
            name
        ));
    }

    Ok(storage)
}

pub fn normalize_redis(name: &str, mut storage: Storage) -> Storage {
    if storage.image.is_empty() {
        storage.image = REDIS_IMAGE.to_string();
    }
    let port = storage.port.unwrap_or(REDIS_PORT);
    storage.real_port = Some(port);

    let mut test = "redis-cli --raw incr ping".to_string();
    storage.argvs = Vec::new();
    if port != REDIS_PORT {
        storage.argvs = vec![
            "redis-server".to_string(),
            "--port".to_string(),
            port.to_string(),
        ];
        test = format!("redis-cli -p {} --raw incr ping", port);
    }
    storage.health_check = Some(HealthCheck::new(test).with_timing("2s", "1s", 30));

    storage.envs.clear();
    storage.envs.insert("TZ".to_string(), timezone(&storage));
    debug!("Redis storage '{}' listens on {}", name, port);
    storage
}

fn timezone(storage: &Storage) -> String {
    storage
        .timezone
        .clone()
        .unwrap_or_else(|| DEFAULT_TIMEZONE.to_string())
}

fn mongo_version(envs: &[String]) -> Option<String> {
    envs.iter()
        .find_map(|entry| entry.strip_prefix("MONGO_VERSION="))
        .map(str::to_string)
}

fn mongo_cli(version: Option<&str>) -> &'static str {
    let major = version
        .and_then(|v| v.split('.').next())
        .and_then(|m| m.parse::<u32>().ok());
    match major {
        Some(major) if major <= 4 => "mongo",
        _ => "mongosh",
    }
}

fn mongo_init_script(cli: &str, port_flag: &str, storage: &Storage) -> String {
    let mut body = String::new();
    for db in &storage.init_db_names {
        body.push_str(&format!(
            "db.getSiblingDB('{}').createCollection('_init');\n",
            db
        ));
    }
    if let Some(password) = &storage.root_password {
        body.push_str(&format!(
            "if (!db.getSiblingDB('admin').getUser('root')) {{\n  db.getSiblingDB('admin').createUser({{ user: 'root', pwd: '{}', roles: [{{ role: 'root', db: 'admin' }}] }});\n}}\n",
            password.replace('\'', "\\'")
        ));
    }
    format!("set -e\n{}{} <<EOF\n{}EOF\n", cli, port_flag, body)
}

fn write_hook(dir: &Path, file: &str, content: &str) -> Result<()> {
    fs::create_dir_all(dir).map_err(|e| DeployError::io(dir, e))?;
    let path = dir.join(file);
    fs::write(&path, content).map_err(|e| DeployError::io(&path, e))
}
