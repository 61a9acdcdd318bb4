use regex::Regex;
use serde_json::json;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;
use tracing::info;

use crate::error::{DeployError, Result};

/// Name a scaffolded profile gets when none is given.
pub const DEFAULT_PROFILE_NAME: &str = "sample";

/// File at the profile root holding the profile's name.
const PROFILE_NAME_FILE: &str = ".profile";

/// What an existing profile directory says about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileDiscovery {
    pub name: Option<String>,
    /// Environments with a `configs.<env>.yml` file, sorted.
    pub envs: Vec<String>,
}

impl ProfileDiscovery {
    /// `prod` when the profile has it, else the first environment found.
    pub fn default_env(&self) -> Option<String> {
        self.envs
            .iter()
            .find(|env| env.as_str() == "prod")
            .or_else(|| self.envs.first())
            .cloned()
    }
}

fn config_file_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^configs\.(\w+)\.yml$").expect("valid config file pattern"))
}

/// Reads `.profile` and lists the environments of a profile directory.
pub fn discover_profile(path: &Path) -> Result<ProfileDiscovery> {
    let name_file = path.join(PROFILE_NAME_FILE);
    let name = if name_file.is_file() {
        let content = fs::read_to_string(&name_file).map_err(|e| DeployError::io(&name_file, e))?;
        Some(content.trim().to_string()).filter(|n| !n.is_empty())
    } else {
        None
    };

    let mut envs = Vec::new();
    for entry in fs::read_dir(path).map_err(|e| DeployError::io(path, e))? {
        let entry = entry.map_err(|e| DeployError::io(path, e))?;
        if !entry.path().is_file() {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy().to_string();
        if let Some(caps) = config_file_pattern().captures(&file_name) {
            envs.push(caps[1].to_string());
        }
    }
    envs.sort();

    Ok(ProfileDiscovery { name, envs })
}

/// Writes a starter profile: a `base` environment with one service and a mysql
/// storage, `prod` and `dev` environments extending it, plus `.profile`,
/// `.gitignore` and a README.
pub fn scaffold_profile(path: &Path, name: &str) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| DeployError::io(path, e))?;

    let base = json!({
        "project": { "name": "{{project_name}}" },
        "domain": { "name": "{{domain_name}}", "ssl_enabled": true },
        "services": {
            "backend": {
                "sub_domain": ".",
                "clone": { "url": "{{git_base_url}}/backend", "branch": "dev" },
                "docker": { "volumes": [], "envs": {} }
            }
        },
        "storages": {
            "mysql": {
                "type": "mysql",
                "port": 3306,
                "init_db_names": [format!("{}_db", name)],
                "root_password": "change-me"
            }
        },
        "variables": {
            "project_name": name,
            "domain_name": format!("{}.com", name),
            "git_base_url": format!("https://github.com/{}", name)
        }
    });
    let prod = json!({
        "project": { "extends": "base" },
        "services": { "backend": { "clone": { "branch": "master" } } }
    });
    let dev = json!({
        "project": { "extends": "base" },
        "variables": { "domain_name": format!("dev.{}.com", name) }
    });

    for (env, content) in [("base", base), ("prod", prod), ("dev", dev)] {
        let file = path.join(format!("configs.{}.yml", env));
        let yaml = serde_yaml::to_string(&content).map_err(|e| DeployError::ConfigParse {
            path: file.clone(),
            reason: e.to_string(),
        })?;
        write_file(&file, &yaml)?;
    }
    write_file(&path.join(PROFILE_NAME_FILE), name)?;
    write_file(&path.join(".gitignore"), ".dist\n")?;
    write_file(
        &path.join("README.md"),
        &format!(
            "# {name} project\n\n## Get started\n\n1. Install docker and `dockerup`\n2. Register this profile with `sudo dockerup profile add <path>`\n3. Install it with `sudo dockerup install -p {name}`\n"
        ),
    )?;

    info!("Created profile '{}' in {}", name, path.display());
    Ok(())
}

fn write_file(path: &Path, content: &str) -> Result<()> {
    fs::write(path, content).map_err(|e| DeployError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_loader::ConfigLoader;
    use tempfile::TempDir;

    #[test]
    fn test_scaffolded_profile_loads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("profiles/shop");
        scaffold_profile(&path, "shop").unwrap();

        let found = discover_profile(&path).unwrap();
        assert_eq!(found.name.as_deref(), Some("shop"));
        assert_eq!(found.envs, vec!["base", "dev", "prod"]);
        assert_eq!(found.default_env().as_deref(), Some("prod"));
        assert_eq!(fs::read_to_string(path.join(".gitignore")).unwrap().trim(), ".dist");

        let prod = ConfigLoader::new("env").load(&path, "prod").unwrap();
        assert_eq!(prod.project.name, "shop");
        assert_eq!(prod.domain.name, "shop.com");
        assert_eq!(prod.services["backend"].clone.branch, "master");
        assert_eq!(prod.services["backend"].clone.url, "https://github.com/shop/backend");
        assert_eq!(prod.storages["mysql"].init_db_names, vec!["shop_db"]);

        let dev = ConfigLoader::new("env").load(&path, "dev").unwrap();
        assert_eq!(dev.domain.name, "dev.shop.com");
        assert_eq!(dev.services["backend"].clone.branch, "dev");
    }

    #[test]
    fn test_discover_without_name_file() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("configs.staging.yml"), "").unwrap();
        fs::write(dir.path().join("configs.yml"), "").unwrap();
        fs::write(dir.path().join("notes.txt"), "").unwrap();
        fs::create_dir(dir.path().join("configs.dir.yml")).unwrap();

        let found = discover_profile(dir.path()).unwrap();
        assert_eq!(found.name, None);
        assert_eq!(found.envs, vec!["staging"]);
        assert_eq!(found.default_env().as_deref(), Some("staging"));
    }

    #[test]
    fn test_empty_name_file_is_ignored() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(".profile"), "  \n").unwrap();
        let found = discover_profile(dir.path()).unwrap();
        assert_eq!(found.name, None);
        assert_eq!(found.default_env(), None);
    }
}
