use regex::Regex;
use serde_yaml::{Mapping, Value};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, info};

use crate::error::{DeployError, Result};
use crate::models::{scalar_to_string, ProjectConfig, RuntimePaths, PROXY_SERVICE_NAME};

/// Loads layered `configs.<env>.yml` files from a profile directory.
pub struct ConfigLoader {
    assets_dir: PathBuf,
}

impl ConfigLoader {
    pub fn new(assets_dir: impl Into<PathBuf>) -> Self {
        Self {
            assets_dir: assets_dir.into(),
        }
    }

    /// Loads `env` (and every environment it extends), substitutes variables,
    /// applies defaults and prepares the `.dist` working tree.
    pub fn load(&self, profile_path: &Path, env: &str) -> Result<ProjectConfig> {
        let mut chain = Vec::new();
        let mut merged = Self::load_layer(profile_path, env, &mut chain)?;

        let variables = merged
            .get("variables")
            .and_then(Value::as_mapping)
            .cloned()
            .unwrap_or_default();
        substitute_variables(&mut merged, &variables);

        let config_path = config_file_path(profile_path, env);
        let mut config: ProjectConfig =
            serde_yaml::from_value(merged).map_err(|e| DeployError::ConfigParse {
                path: config_path,
                reason: e.to_string(),
            })?;

        config.project.env = env.to_string();
        config.paths = RuntimePaths::new(profile_path, &self.assets_dir);
        validate_names(&config)?;
        prepare_dirs(&config.paths)?;

        info!(
            "Loaded '{}' ({} services, {} storages) from {}",
            env,
            config.services.len(),
            config.storages.len(),
            profile_path.display()
        );
        Ok(config)
    }

    fn load_layer(profile_path: &Path, env: &str, chain: &mut Vec<String>) -> Result<Value> {
        if chain.iter().any(|seen| seen == env) {
            chain.push(env.to_string());
            return Err(DeployError::CircularExtends {
                env: env.to_string(),
                chain: chain.join(" -> "),
            });
        }
        chain.push(env.to_string());

        let path = config_file_path(profile_path, env);
        let content = fs::read_to_string(&path).map_err(|source| DeployError::ConfigRead {
            path: path.clone(),
            source,
        })?;
        let value: Value = serde_yaml::from_str(&content).map_err(|e| DeployError::ConfigParse {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        let value = match value {
            Value::Null => Value::Mapping(Mapping::new()),
            Value::Mapping(_) => value,
            _ => {
                return Err(DeployError::ConfigParse {
                    path,
                    reason: "top level must be a mapping".to_string(),
                })
            }
        };

        let parent_env = value
            .get("project")
            .and_then(|p| p.get("extends"))
            .and_then(Value::as_str)
            .map(str::to_string);

        match parent_env {
            Some(parent_env) => {
                debug!("Environment '{}' extends '{}'", env, parent_env);
                let parent = Self::load_layer(profile_path, &parent_env, chain)?;
                Ok(merge_configs(parent, value))
            }
            None => Ok(value),
        }
    }
}

fn config_file_path(profile_path: &Path, env: &str) -> PathBuf {
    profile_path.join(format!("configs.{}.yml", env))
}

/// Merges `child` over `parent` and clears the `extends` marker.
pub fn merge_configs(parent: Value, mut child: Value) -> Value {
    merge_deep(&mut child, parent);
    if let Some(project) = child.get_mut("project").and_then(Value::as_mapping_mut) {
        project.remove("extends");
    }
    child
}

/// Fills keys missing from `target` with the ones from `source`. Values present in
/// `target` win, except that two mappings are merged key by key.
pub fn merge_deep(target: &mut Value, source: Value) {
    let (Value::Mapping(target_map), Value::Mapping(source_map)) = (target, source) else {
        return;
    };
    for (key, source_value) in source_map {
        match target_map.get_mut(&key) {
            None => {
                target_map.insert(key, source_value);
            }
            Some(existing) => {
                if existing.is_mapping() && source_value.is_mapping() {
                    merge_deep(existing, source_value);
                }
            }
        }
    }
}

fn variable_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{\{\s*([\w.]+)\s*\}\}").expect("valid variable pattern"))
}

/// Replaces `{{name}}` tokens in every string held by a mapping, recursively.
/// Sequence elements are left untouched.
pub fn substitute_variables(value: &mut Value, variables: &Mapping) {
    let Value::Mapping(map) = value else {
        return;
    };
    for (_, entry) in map.iter_mut() {
        if let Some(s) = entry.as_str() {
            let replaced = substitute_string(s, variables);
            *entry = replaced;
        } else if entry.is_mapping() {
            substitute_variables(entry, variables);
        }
    }
}

/// Splices known tokens in as text; unknown ones stay verbatim. The result is always
/// a string, typed fields parse it back when they deserialize.
fn substitute_string(input: &str, variables: &Mapping) -> Value {
    let replaced = variable_pattern().replace_all(input, |caps: &regex::Captures| {
        match variables.get(&caps[1]) {
            Some(var) => scalar_to_string(var),
            None => caps[0].to_string(),
        }
    });
    Value::String(replaced.into_owned())
}

fn validate_names(config: &ProjectConfig) -> Result<()> {
    let mut seen: HashSet<&str> = HashSet::new();
    seen.insert(PROXY_SERVICE_NAME);
    for name in config.services.keys().chain(config.storages.keys()) {
        if !seen.insert(name.as_str()) {
            return Err(DeployError::NameCollision { name: name.clone() });
        }
    }
    Ok(())
}

fn prepare_dirs(paths: &RuntimePaths) -> Result<()> {
    let dirs = [
        paths.dist_path.clone(),
        paths.dockerfiles_path.clone(),
        paths.ssl_path.clone(),
        paths.nginx_conf_dir(),
        paths.nginx_static_dir(),
        paths.dist_hooks_path.join("mysql"),
    ];
    for dir in dirs {
        fs::create_dir_all(&dir).map_err(|e| DeployError::io(&dir, e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::IpMapping;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, env: &str, content: &str) {
        fs::write(dir.path().join(format!("configs.{}.yml", env)), content).unwrap();
    }

    fn loader() -> ConfigLoader {
        ConfigLoader::new("env")
    }

    #[test]
    fn test_defaults_are_applied() {
        let dir = TempDir::new().unwrap();
        write_config(&dir, "prod", "domain:\n  name: example.com\nservices: {}\n");

        let config = loader().load(dir.path(), "prod").unwrap();
        assert_eq!(config.project.name, "sample");
        assert_eq!(config.project.docker_register, "docker.io");
        assert_eq!(config.project.version, 1);
        assert_eq!(config.project.ip_mapping, IpMapping::Dhcp);
        assert_eq!(config.project.env, "prod");
        assert!(dir.path().join(".dist").join("dockerfiles").is_dir());
    }

    #[test]
    fn test_child_overrides_and_inherits() {
        let dir = TempDir::new().unwrap();
        write_config(
            &dir,
            "prod",
            r#"
project:
  name: shop
  docker_register: registry.local
domain:
  name: shop.com
  ssl_enabled: true
services:
  api:
    sub_domain: api
    docker:
      port: "8080:80"
"#,
        );
        write_config(
            &dir,
            "dev",
            r#"
project:
  extends: prod
domain:
  name: shop.local
services:
  api:
    docker:
      port: 3000
"#,
        );

        let config = loader().load(dir.path(), "dev").unwrap();
        assert_eq!(config.project.name, "shop");
        assert_eq!(config.project.docker_register, "registry.local");
        assert_eq!(config.project.extends, None);
        assert_eq!(config.domain.name, "shop.local");
        assert!(config.domain.ssl_enabled);

        let api = &config.services["api"];
        assert_eq!(api.sub_domain, "api");
        assert_eq!(api.docker.port.as_ref().unwrap().to_string(), "3000");
    }

    #[test]
    fn test_extends_chain_of_three() {
        let dir = TempDir::new().unwrap();
        write_config(&dir, "base", "project:\n  name: base\n  version: 4\n");
        write_config(&dir, "prod", "project:\n  extends: base\n  name: prod-name\n");
        write_config(&dir, "dev", "project:\n  extends: prod\n");

        let config = loader().load(dir.path(), "dev").unwrap();
        assert_eq!(config.project.name, "prod-name");
        assert_eq!(config.project.version, 4);
    }

    #[test]
    fn test_circular_extends_is_rejected() {
        let dir = TempDir::new().unwrap();
        write_config(&dir, "a", "project:\n  extends: b\n");
        write_config(&dir, "b", "project:\n  extends: a\n");

        let err = loader().load(dir.path(), "a").unwrap_err();
        assert!(matches!(err, DeployError::CircularExtends { .. }));
    }

    #[test]
    fn test_missing_file_is_config_read_error() {
        let dir = TempDir::new().unwrap();
        let err = loader().load(dir.path(), "prod").unwrap_err();
        assert!(matches!(err, DeployError::ConfigRead { .. }));
    }

    #[test]
    fn test_malformed_file_is_config_parse_error() {
        let dir = TempDir::new().unwrap();
        write_config(&dir, "prod", "services: [unclosed\n");
        let err = loader().load(dir.path(), "prod").unwrap_err();
        assert!(matches!(err, DeployError::ConfigParse { .. }));
    }

    #[test]
    fn test_variable_substitution() {
        let dir = TempDir::new().unwrap();
        write_config(
            &dir,
            "prod",
            r#"
variables:
  domain: example.org
  api_port: 8081
  ssl: true
domain:
  name: "{{ domain }}"
  ssl_enabled: "{{ssl}}"
services:
  api:
    sub_domain: "api-{{missing}}"
    clone:
      url: "https://git.{{domain}}/api.git"
    docker:
      port: "{{api_port}}"
      volumes:
        - "{{domain}}:/data"
"#,
        );

        let config = loader().load(dir.path(), "prod").unwrap();
        assert_eq!(config.domain.name, "example.org");
        assert!(config.domain.ssl_enabled);
        let api = &config.services["api"];
        assert_eq!(api.sub_domain, "api-{{missing}}");
        assert_eq!(api.clone.url, "https://git.example.org/api.git");
        assert_eq!(api.docker.port.as_ref().unwrap().to_string(), "8081");
        // sequence elements are not substituted
        assert_eq!(api.docker.volumes, vec!["{{domain}}:/data"]);
    }

    #[test]
    fn test_numeric_variables_in_string_fields() {
        let dir = TempDir::new().unwrap();
        write_config(
            &dir,
            "prod",
            r#"
variables:
  db_pass: 123456
  release: 2
  db_port: 3307
project:
  version: "{{release}}"
services:
  api:
    clone:
      url: https://git.example.org/api.git
      branch: "{{release}}"
storages:
  db:
    type: mysql
    port: "{{db_port}}"
    root_password: "{{db_pass}}"
"#,
        );

        let config = loader().load(dir.path(), "prod").unwrap();
        assert_eq!(config.services["api"].clone.branch, "2");
        assert_eq!(config.project.version, 2);
        let db = &config.storages["db"];
        assert_eq!(db.root_password.as_deref(), Some("123456"));
        assert_eq!(db.port, Some(3307));
    }

    #[test]
    fn test_name_collision_between_service_and_storage() {
        let dir = TempDir::new().unwrap();
        write_config(
            &dir,
            "prod",
            "services:\n  db:\n    sub_domain: db\nstorages:\n  db:\n    type: mysql\n",
        );
        let err = loader().load(dir.path(), "prod").unwrap_err();
        assert!(matches!(err, DeployError::NameCollision { ref name } if name == "db"));
    }

    #[test]
    fn test_proxy_name_is_reserved() {
        let dir = TempDir::new().unwrap();
        write_config(&dir, "prod", "services:\n  nginx:\n    sub_domain: www\n");
        let err = loader().load(dir.path(), "prod").unwrap_err();
        assert!(matches!(err, DeployError::NameCollision { .. }));
    }

    #[test]
    fn test_merge_deep_keeps_target_scalars() {
        let mut target: Value = serde_yaml::from_str("a: 1\nnested:\n  x: child\n").unwrap();
        let source: Value =
            serde_yaml::from_str("a: 2\nb: 3\nnested:\n  x: parent\n  y: parent\n").unwrap();
        merge_deep(&mut target, source);
        assert_eq!(target["a"], Value::from(1));
        assert_eq!(target["b"], Value::from(3));
        assert_eq!(target["nested"]["x"], Value::from("child"));
        assert_eq!(target["nested"]["y"], Value::from("parent"));
    }

    #[test]
    fn test_merge_replaces_sequences_wholesale() {
        let mut target: Value = serde_yaml::from_str("list: [c]\n").unwrap();
        let source: Value = serde_yaml::from_str("list: [p1, p2]\n").unwrap();
        merge_deep(&mut target, source);
        assert_eq!(target["list"].as_sequence().unwrap().len(), 1);
    }
}
