use handlebars::Handlebars;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{DeployError, Result};
use crate::models::ProjectConfig;

/// Shared hook templates rendered into `.dist/hooks`, relative to the assets hooks dir.
pub const HOOK_TEMPLATES: [&str; 3] = ["nginx/nginx.conf", "nginx/uwsgi_params", "mysql/my.cnf"];

/// Renders profile files against the decorated project config.
pub struct TemplateProcessor {
    registry: Handlebars<'static>,
}

impl Default for TemplateProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateProcessor {
    pub fn new() -> Self {
        let mut registry = Handlebars::new();
        // output is config files and shell scripts, not HTML
        registry.register_escape_fn(handlebars::no_escape);
        Self { registry }
    }

    pub fn context(config: &ProjectConfig) -> Result<Value> {
        serde_json::to_value(config).map_err(|e| DeployError::Template {
            path: config.paths.profile_path.clone(),
            reason: format!("cannot serialize config: {}", e),
        })
    }

    pub fn render_str(&self, template: &str, context: &Value, origin: &Path) -> Result<String> {
        self.registry
            .render_template(template, context)
            .map_err(|e| DeployError::Template {
                path: origin.to_path_buf(),
                reason: e.to_string(),
            })
    }

    /// Renders `src` into `dest`, creating parent directories.
    pub fn render_file(&self, src: &Path, dest: &Path, context: &Value) -> Result<()> {
        let template = fs::read_to_string(src).map_err(|e| DeployError::io(src, e))?;
        let rendered = self.render_str(&template, context, src)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| DeployError::io(parent, e))?;
        }
        fs::write(dest, rendered).map_err(|e| DeployError::io(dest, e))?;
        debug!("Rendered {} -> {}", src.display(), dest.display());
        Ok(())
    }

    /// Renders the service's Dockerfile to `<dist>/dockerfiles/<service>_Dockerfile`.
    /// Returns `None` when no Dockerfile source exists.
    pub fn render_dockerfile(&self, config: &ProjectConfig, service: &str) -> Result<Option<PathBuf>> {
        let Some(source) = dockerfile_source(config, service) else {
            warn!("No Dockerfile found for service '{}'", service);
            return Ok(None);
        };
        let dest = config
            .paths
            .dockerfiles_path
            .join(format!("{}_Dockerfile", service));
        let context = Self::context(config)?;
        self.render_file(&source, &dest, &context)?;
        info!("    Rendered Dockerfile of '{}'", service);
        Ok(Some(dest))
    }

    /// Renders the shared nginx/mysql hook templates that exist in the assets dir.
    pub fn render_hook_templates(&self, config: &ProjectConfig) -> Result<()> {
        let context = Self::context(config)?;
        for relative in HOOK_TEMPLATES {
            let src = config.paths.env_hooks_path.join(relative);
            if !src.is_file() {
                debug!("Hook template {} not present, skipping", src.display());
                continue;
            }
            let dest = config.paths.dist_hooks_path.join(relative);
            self.render_file(&src, &dest, &context)?;
        }
        Ok(())
    }

    /// Renders the top-level files of the profile's `custom/` dir into `<dist>/custom`.
    pub fn render_custom_files(&self, config: &ProjectConfig) -> Result<()> {
        let custom = &config.paths.custom_path;
        if !custom.is_dir() {
            return Ok(());
        }
        let context = Self::context(config)?;
        let dest_dir = config.paths.dist_path.join("custom");
        let entries = fs::read_dir(custom).map_err(|e| DeployError::io(custom, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| DeployError::io(custom, e))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            self.render_file(&path, &dest_dir.join(entry.file_name()), &context)?;
        }
        Ok(())
    }

    /// Renders `docker_entrypoint.sh` of a clone in place, if the clone has one.
    pub fn render_entrypoint(&self, config: &ProjectConfig, service: &str) -> Result<bool> {
        let entrypoint = config.paths.clone_path(service).join("docker_entrypoint.sh");
        if !entrypoint.is_file() {
            return Ok(false);
        }
        let context = Self::context(config)?;
        self.render_file(&entrypoint, &entrypoint, &context)?;
        Ok(true)
    }
}

fn dockerfile_source(config: &ProjectConfig, service: &str) -> Option<PathBuf> {
    let profile_dir = config.paths.profile_path.join("dockerfiles");
    [
        profile_dir.join(format!("{}_Dockerfile", service)),
        profile_dir.join(format!("{}.Dockerfile", service)),
        config.paths.clone_path(service).join("Dockerfile"),
    ]
    .into_iter()
    .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RuntimePaths;
    use tempfile::TempDir;

    fn config_in(dir: &TempDir) -> ProjectConfig {
        let mut config = ProjectConfig::default();
        config.project.name = "shop".to_string();
        config.project.env = "prod".to_string();
        config.paths = RuntimePaths::new(&dir.path().join("profile"), &dir.path().join("assets"));
        config
    }

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_render_str_reads_config_paths() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        let context = TemplateProcessor::context(&config).unwrap();
        let processor = TemplateProcessor::new();

        let out = processor
            .render_str("{{project.name}}-{{project._env}} <{{domain.name}}>", &context, Path::new("t"))
            .unwrap();
        assert_eq!(out, "shop-prod <localhost>");
    }

    #[test]
    fn test_render_str_reports_bad_template() {
        let processor = TemplateProcessor::new();
        let err = processor
            .render_str("{{#if}}", &Value::Null, Path::new("broken.tpl"))
            .unwrap_err();
        assert!(matches!(err, DeployError::Template { ref path, .. } if path == Path::new("broken.tpl")));
    }

    #[test]
    fn test_dockerfile_prefers_profile_copy() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        write(
            &config.paths.profile_path.join("dockerfiles/api_Dockerfile"),
            "FROM node\nLABEL project={{project.name}}\n",
        );
        write(&config.paths.clone_path("api").join("Dockerfile"), "FROM scratch\n");

        let processor = TemplateProcessor::new();
        let dest = processor.render_dockerfile(&config, "api").unwrap().unwrap();
        assert!(dest.ends_with(".dist/dockerfiles/api_Dockerfile"));
        assert_eq!(fs::read_to_string(dest).unwrap(), "FROM node\nLABEL project=shop\n");
    }

    #[test]
    fn test_missing_dockerfile_is_none() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        assert!(TemplateProcessor::new().render_dockerfile(&config, "api").unwrap().is_none());
    }

    #[test]
    fn test_hook_templates_skip_missing_files() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        write(
            &config.paths.env_hooks_path.join("nginx/nginx.conf"),
            "# {{project.name}}\n",
        );

        TemplateProcessor::new().render_hook_templates(&config).unwrap();
        let rendered = config.paths.dist_hooks_path.join("nginx/nginx.conf");
        assert_eq!(fs::read_to_string(rendered).unwrap(), "# shop\n");
        assert!(!config.paths.dist_hooks_path.join("mysql/my.cnf").exists());
    }

    #[test]
    fn test_custom_files_and_entrypoint() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        write(&config.paths.custom_path.join("robots.txt"), "Host: {{domain.name}}\n");
        let entrypoint = config.paths.clone_path("api").join("docker_entrypoint.sh");
        write(&entrypoint, "echo {{project._env}}\n");

        let processor = TemplateProcessor::new();
        processor.render_custom_files(&config).unwrap();
        assert!(processor.render_entrypoint(&config, "api").unwrap());
        assert!(!processor.render_entrypoint(&config, "web").unwrap());

        let robots = config.paths.dist_path.join("custom/robots.txt");
        assert_eq!(fs::read_to_string(robots).unwrap(), "Host: localhost\n");
        assert_eq!(fs::read_to_string(entrypoint).unwrap(), "echo prod\n");
    }
}
