use handlebars::Handlebars;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::sync::OnceLock;
use tracing::{debug, info};

use crate::docker::{ContainerEngine, PortBinding, RunSpec};
use crate::error::{DeployError, Result};
use crate::models::{AppLocation, ProjectConfig, Service};

const PLACEHOLDER_IP: &str = "127.0.0.1";
const PLACEHOLDER_PORT: u16 = 80;
const CERTS_DIR: &str = "/etc/nginx/certs";

/// Reaction to a service backend coming up.
#[allow(async_fn_in_trait)]
pub trait ProxyRefresh {
    async fn refresh(&self, config: &ProjectConfig) -> Result<()>;
}

const SITE_TEMPLATE: &str = r#"# generated for service '{{service}}'
upstream {{upstream}} {
    server {{backend}};
    server 127.0.0.1:1 backup;
}
{{#if ssl}}

server {
    listen 80;
    server_name {{server_name}};
    return 301 https://$host$request_uri;
}
{{/if}}

server {
{{#if ssl}}
    listen 443 ssl;
    ssl_certificate {{cert_dir}}/cert.crt;
    ssl_certificate_key {{cert_dir}}/cert.key;
{{else}}
    listen 80;
{{/if}}
    server_name {{server_name}};

    add_header 'Access-Control-Allow-Origin' '*' always;
    add_header 'Access-Control-Allow-Methods' 'GET, POST, PUT, PATCH, DELETE, OPTIONS' always;
    add_header 'Access-Control-Allow-Headers' '*' always;
{{#if maintenance}}

    set $maintenance on;
{{#each allowed_ips}}
    if ($remote_addr = {{this}}) {
        set $maintenance off;
    }
{{/each}}
{{/if}}
{{#each error_pages}}
    error_page {{code}} /{{filename}};
{{/each}}
{{#each error_locations}}

    location = /{{this}} {
        root /var/static;
        internal;
    }
{{/each}}
{{#each locations}}

    location {{#if modifier}}{{modifier}} {{/if}}{{url}} {
{{#if internal}}
        internal;
{{/if}}
{{#if guarded}}
        if ($maintenance = on) {
            return 503;
        }
{{/if}}
{{#if alias}}
        alias {{alias}};
{{/if}}
{{#if proxy_pass}}
        proxy_pass {{proxy_pass}};
{{/if}}
{{#each directives}}
        {{this}}
{{/each}}
    }
{{/each}}
{{#unless has_root_location}}

    location / {
{{#if maintenance}}
        if ($maintenance = on) {
            return 503;
        }
{{/if}}
        proxy_pass http://{{upstream}};
        proxy_set_header Host $host;
        proxy_set_header X-Real-IP $remote_addr;
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
        proxy_set_header X-Forwarded-Proto $scheme;
    }
{{/unless}}
}
"#;

#[derive(Debug, Serialize)]
struct SiteView {
    service: String,
    upstream: String,
    backend: String,
    server_name: String,
    ssl: bool,
    cert_dir: String,
    maintenance: bool,
    allowed_ips: Vec<String>,
    error_pages: Vec<ErrorPageView>,
    error_locations: Vec<String>,
    locations: Vec<LocationView>,
    has_root_location: bool,
}

#[derive(Debug, Serialize)]
struct LocationView {
    #[serde(flatten)]
    location: AppLocation,
    /// Subject to the maintenance check.
    guarded: bool,
}

#[derive(Debug, Serialize)]
struct ErrorPageView {
    code: String,
    filename: String,
}

/// Writes per-service nginx site files and manages the proxy container.
pub struct ProxyProcessor<'a, E: ContainerEngine> {
    engine: &'a E,
    registry: Handlebars<'static>,
}

impl<'a, E: ContainerEngine> ProxyProcessor<'a, E> {
    pub fn new(engine: &'a E) -> Result<Self> {
        let mut registry = Handlebars::new();
        registry.register_escape_fn(handlebars::no_escape);
        registry
            .register_template_string("site", SITE_TEMPLATE)
            .map_err(|e| DeployError::Template {
                path: "site.conf".into(),
                reason: e.to_string(),
            })?;
        Ok(Self { engine, registry })
    }

    /// Copies error pages into the proxy's static volume and rewrites every site file.
    pub fn regenerate(&self, config: &ProjectConfig) -> Result<()> {
        self.collect_static_files(config)?;

        let conf_dir = config.paths.nginx_conf_dir();
        fs::create_dir_all(&conf_dir).map_err(|e| DeployError::io(&conf_dir, e))?;

        for (name, service) in &config.services {
            let path = conf_dir.join(format!("{}.conf", name));
            if service.disabled {
                if path.exists() {
                    fs::remove_file(&path).map_err(|e| DeployError::io(&path, e))?;
                }
                continue;
            }
            let conf = self.render_site(config, name, service)?;
            fs::write(&path, conf).map_err(|e| DeployError::io(&path, e))?;
            debug!("Wrote proxy config {}", path.display());
        }
        Ok(())
    }

    /// Regenerates, then restarts the proxy when it exists or launches it when it does not.
    pub async fn restart(&self, config: &ProjectConfig) -> anyhow::Result<()> {
        self.regenerate(config)?;
        let container = config.proxy_container_name();
        if self.engine.container_exists(&container).await? {
            info!("Restarting proxy '{}'", container);
            self.engine.restart_container(&container).await
        } else {
            info!("Launching proxy '{}'", container);
            self.engine.run_container(&proxy_run_spec(config)).await
        }
    }

    /// Launches the proxy only if it is not there yet.
    pub async fn ensure_running(&self, config: &ProjectConfig) -> anyhow::Result<()> {
        if self
            .engine
            .container_exists(&config.proxy_container_name())
            .await?
        {
            return Ok(());
        }
        self.restart(config).await
    }

    fn collect_static_files(&self, config: &ProjectConfig) -> Result<()> {
        let static_dir = config.paths.nginx_static_dir();
        fs::create_dir_all(&static_dir).map_err(|e| DeployError::io(&static_dir, e))?;

        for service in config.services.values().filter(|s| !s.disabled) {
            for page in service.web.resolved_error_pages.values() {
                if !page.source.is_file() {
                    debug!("Error page {} does not exist, skipping", page.source.display());
                    continue;
                }
                let dest = static_dir.join(&page.filename);
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent).map_err(|e| DeployError::io(parent, e))?;
                }
                fs::copy(&page.source, &dest).map_err(|e| DeployError::io(&dest, e))?;
            }
        }
        Ok(())
    }

    fn render_site(&self, config: &ProjectConfig, name: &str, service: &Service) -> Result<String> {
        let view = site_view(config, name, service);
        self.registry
            .render("site", &view)
            .map_err(|e| DeployError::Template {
                path: config.paths.nginx_conf_dir().join(format!("{}.conf", name)),
                reason: e.to_string(),
            })
    }
}

impl<E: ContainerEngine> ProxyRefresh for ProxyProcessor<'_, E> {
    async fn refresh(&self, config: &ProjectConfig) -> Result<()> {
        self.regenerate(config)?;
        let container = config.proxy_container_name();
        if let Err(e) = self.engine.restart_container(&container).await {
            debug!("Proxy reload of '{}' skipped: {:#}", container, e);
        }
        Ok(())
    }
}

fn site_view(config: &ProjectConfig, name: &str, service: &Service) -> SiteView {
    let root = service.is_root_domain();
    let server_name = if root {
        config.domain.name.clone()
    } else {
        format!("{}.{}", service.sub_domain.trim(), config.domain.name)
    };

    let backend = match &service.docker.runtime_ip {
        Some(ip) => format!("{}:{}", ip, service.docker.expose_port.unwrap_or(PLACEHOLDER_PORT)),
        None => format!("{}:{}", PLACEHOLDER_IP, PLACEHOLDER_PORT),
    };

    let error_pages = service
        .web
        .resolved_error_pages
        .iter()
        .map(|(code, page)| ErrorPageView {
            code: code.clone(),
            filename: page.filename.clone(),
        })
        .collect();
    let error_locations = error_page_groups(service).into_keys().collect();

    let maintenance = service.web.maintenance_enabled();
    let locations: Vec<LocationView> = service
        .web
        .locations
        .iter()
        .map(|location| LocationView {
            location: substitute_location(config, location),
            guarded: maintenance && !location.internal,
        })
        .collect();
    let has_root_location = locations.iter().any(|l| {
        l.location.url.trim() == "/" && l.location.modifier.as_deref().unwrap_or("").is_empty()
    });

    SiteView {
        service: name.to_string(),
        upstream: format!("{}_upstream", config.container_name(name)),
        backend,
        server_name,
        ssl: config.domain.ssl_enabled,
        cert_dir: format!("{}/{}", CERTS_DIR, if root { "root" } else { "wildcard" }),
        maintenance,
        allowed_ips: service
            .web
            .maintenance
            .as_ref()
            .map(|m| m.allowed_ips.clone())
            .unwrap_or_default(),
        error_pages,
        error_locations,
        locations,
        has_root_location,
    }
}

fn substitute_location(config: &ProjectConfig, location: &AppLocation) -> AppLocation {
    let mut location = location.clone();
    location.alias = location.alias.map(|s| substitute_service_tokens(config, &s));
    location.proxy_pass = location
        .proxy_pass
        .map(|s| substitute_service_tokens(config, &s));
    location.directives = location
        .directives
        .iter()
        .map(|d| substitute_service_tokens(config, d))
        .collect();
    location
}

/// Replaces `$service$` with the service's current IP; tokens that name no service stay as written.
pub fn substitute_service_tokens(config: &ProjectConfig, text: &str) -> String {
    static TOKEN: OnceLock<Regex> = OnceLock::new();
    let token = TOKEN.get_or_init(|| Regex::new(r"\$([A-Za-z0-9_-]+)\$").expect("valid regex"));

    token
        .replace_all(text, |caps: &regex::Captures| match config.services.get(&caps[1]) {
            Some(service) => service
                .docker
                .runtime_ip
                .clone()
                .unwrap_or_else(|| PLACEHOLDER_IP.to_string()),
            None => caps[0].to_string(),
        })
        .into_owned()
}

pub fn proxy_run_spec(config: &ProjectConfig) -> RunSpec {
    let mut spec = RunSpec::new(
        config.proxy_container_name(),
        format!("{}/nginx:stable", config.project.docker_register),
        &config.paths.dist_path,
    );
    spec.network = Some("host".to_string());
    spec.ports.push(PortBinding {
        host: 80,
        container: 80,
        host_ip: None,
    });
    spec.volumes = [
        "./hooks/nginx/nginx.conf:/etc/nginx/nginx.conf:ro",
        "./hooks/nginx/conf:/etc/nginx/conf.d",
        "./hooks/nginx/uwsgi_params:/etc/nginx/uwsgi_params",
        "./data/static:/static",
        "./data/media:/media",
        "./data/nginx/logs:/var/log/nginx",
        "./data/nginx/static:/var/static",
    ]
    .iter()
    .map(|v| v.to_string())
    .collect();

    if config.domain.ssl_enabled {
        spec.ports.push(PortBinding {
            host: 443,
            container: 443,
            host_ip: None,
        });
        let certs = config.paths.ssl_path.join(&config.project.env);
        spec.volumes
            .push(format!("{}:{}", certs.display(), CERTS_DIR));
    }
    spec
}

/// Error page codes grouped by the file that serves them.
pub fn error_page_groups(service: &Service) -> BTreeMap<String, Vec<String>> {
    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (code, page) in &service.web.resolved_error_pages {
        groups.entry(page.filename.clone()).or_default().push(code.clone());
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::fake::FakeEngine;
    use crate::models::{ErrorPage, Maintenance, RuntimePaths};
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn page(filename: &str, source: PathBuf) -> ErrorPage {
        ErrorPage {
            filename: filename.to_string(),
            source,
        }
    }

    fn base_config(dir: &TempDir) -> ProjectConfig {
        let mut config = ProjectConfig::default();
        config.project.name = "shop".to_string();
        config.project.env = "prod".to_string();
        config.domain.name = "shop.test".to_string();
        config.paths = RuntimePaths::new(&dir.path().join("profile"), &dir.path().join("assets"));
        config
    }

    fn read_conf(config: &ProjectConfig, service: &str) -> String {
        fs::read_to_string(config.paths.nginx_conf_dir().join(format!("{}.conf", service))).unwrap()
    }

    #[test]
    fn test_shared_error_file_gets_one_location() {
        let dir = TempDir::new().unwrap();
        let mut config = base_config(&dir);
        let src = dir.path().join("50x.html");
        fs::write(&src, "<h1>down</h1>").unwrap();

        let mut web = Service::default();
        for code in ["500", "502", "504"] {
            web.web
                .resolved_error_pages
                .insert(code.to_string(), page("50x.html", src.clone()));
        }
        config.services.insert("web".to_string(), web);

        let engine = FakeEngine::new();
        ProxyProcessor::new(&engine).unwrap().regenerate(&config).unwrap();

        let conf = read_conf(&config, "web");
        assert_eq!(conf.matches("location = /50x.html").count(), 1);
        assert!(conf.contains("error_page 500 /50x.html;"));
        assert!(conf.contains("error_page 502 /50x.html;"));
        assert!(conf.contains("error_page 504 /50x.html;"));
        assert!(config.paths.nginx_static_dir().join("50x.html").is_file());
        assert_eq!(
            error_page_groups(&config.services["web"])["50x.html"],
            vec!["500", "502", "504"]
        );
    }

    #[test]
    fn test_same_error_file_name_per_service() {
        let dir = TempDir::new().unwrap();
        let mut config = base_config(&dir);
        let default_page = dir.path().join("default-404.html");
        let custom_page = dir.path().join("custom-404.html");
        fs::write(&default_page, "default").unwrap();
        fs::write(&custom_page, "custom").unwrap();

        let mut shop = Service {
            sub_domain: "shop".to_string(),
            ..Default::default()
        };
        shop.web
            .resolved_error_pages
            .insert("404".to_string(), page("shop/404.html", custom_page));
        let mut blog = Service {
            sub_domain: "blog".to_string(),
            ..Default::default()
        };
        blog.web
            .resolved_error_pages
            .insert("404".to_string(), page("blog/404.html", default_page));
        config.services.insert("shop".to_string(), shop);
        config.services.insert("blog".to_string(), blog);

        let engine = FakeEngine::new();
        ProxyProcessor::new(&engine).unwrap().regenerate(&config).unwrap();

        let static_dir = config.paths.nginx_static_dir();
        assert_eq!(fs::read_to_string(static_dir.join("shop/404.html")).unwrap(), "custom");
        assert_eq!(fs::read_to_string(static_dir.join("blog/404.html")).unwrap(), "default");
        assert!(read_conf(&config, "blog").contains("error_page 404 /blog/404.html;"));
        assert!(read_conf(&config, "shop").contains("location = /shop/404.html"));
    }

    #[test]
    fn test_root_and_sub_domain_certificates() {
        let dir = TempDir::new().unwrap();
        let mut config = base_config(&dir);
        config.domain.ssl_enabled = true;
        let web = Service {
            sub_domain: ".".to_string(),
            ..Default::default()
        };
        let admin = Service {
            sub_domain: "admin".to_string(),
            ..Default::default()
        };
        config.services.insert("web".to_string(), web);
        config.services.insert("admin".to_string(), admin);

        let engine = FakeEngine::new();
        ProxyProcessor::new(&engine).unwrap().regenerate(&config).unwrap();

        let web_conf = read_conf(&config, "web");
        assert!(web_conf.contains("ssl_certificate /etc/nginx/certs/root/cert.crt;"));
        assert!(web_conf.contains("server_name shop.test;"));
        assert!(web_conf.contains("return 301 https://$host$request_uri;"));
        assert!(web_conf.contains("listen 443 ssl;"));

        let admin_conf = read_conf(&config, "admin");
        assert!(admin_conf.contains("ssl_certificate /etc/nginx/certs/wildcard/cert.crt;"));
        assert!(admin_conf.contains("server_name admin.shop.test;"));
    }

    #[test]
    fn test_no_redirect_without_ssl() {
        let dir = TempDir::new().unwrap();
        let mut config = base_config(&dir);
        config.services.insert("web".to_string(), Service::default());

        let engine = FakeEngine::new();
        ProxyProcessor::new(&engine).unwrap().regenerate(&config).unwrap();
        let conf = read_conf(&config, "web");
        assert!(!conf.contains("return 301"));
        assert!(!conf.contains("ssl_certificate"));
        assert!(conf.contains("server 127.0.0.1:80;"));
        assert!(conf.contains("server 127.0.0.1:1 backup;"));
        assert!(conf.contains("proxy_pass http://shop_prod_web_upstream;"));
    }

    #[test]
    fn test_upstream_uses_runtime_ip_and_expose_port() {
        let dir = TempDir::new().unwrap();
        let mut config = base_config(&dir);
        let mut api = Service::default();
        api.docker.runtime_ip = Some("172.17.0.9".to_string());
        api.docker.expose_port = Some(3000);
        config.services.insert("api".to_string(), api);

        let view = site_view(&config, "api", &config.services["api"]);
        assert_eq!(view.backend, "172.17.0.9:3000");
    }

    #[test]
    fn test_service_tokens() {
        let dir = TempDir::new().unwrap();
        let mut config = base_config(&dir);
        let mut api = Service::default();
        api.docker.runtime_ip = Some("172.18.0.4".to_string());
        config.services.insert("api".to_string(), api);
        config.services.insert("pending".to_string(), Service::default());

        assert_eq!(
            substitute_service_tokens(&config, "http://$api$:8000"),
            "http://172.18.0.4:8000"
        );
        assert_eq!(
            substitute_service_tokens(&config, "http://$pending$"),
            "http://127.0.0.1"
        );
        assert_eq!(
            substitute_service_tokens(&config, "$ghost$ $host$request_uri"),
            "$ghost$ $host$request_uri"
        );
    }

    #[test]
    fn test_custom_locations_and_maintenance() {
        let dir = TempDir::new().unwrap();
        let mut config = base_config(&dir);
        let mut api = Service::default();
        api.docker.runtime_ip = Some("172.18.0.4".to_string());
        config.services.insert("api".to_string(), api);

        let mut web = Service::default();
        web.web.maintenance = Some(Maintenance {
            enabled: true,
            filename: None,
            allowed_ips: vec!["10.0.0.1".to_string()],
        });
        web.web.locations.push(AppLocation {
            url: "/api/".to_string(),
            proxy_pass: Some("http://$api$:8000/".to_string()),
            directives: vec!["client_max_body_size 20m;".to_string()],
            ..Default::default()
        });
        config.services.insert("web".to_string(), web);

        let engine = FakeEngine::new();
        ProxyProcessor::new(&engine).unwrap().regenerate(&config).unwrap();
        let conf = read_conf(&config, "web");
        assert!(conf.contains("location /api/ {"));
        assert!(conf.contains("proxy_pass http://172.18.0.4:8000/;"));
        assert!(conf.contains("client_max_body_size 20m;"));
        assert!(conf.contains("if ($remote_addr = 10.0.0.1) {"));
        assert_eq!(conf.matches("return 503;").count(), 2);
        assert!(conf.contains("location / {"));
    }

    #[test]
    fn test_disabled_service_conf_is_removed() {
        let dir = TempDir::new().unwrap();
        let mut config = base_config(&dir);
        config.services.insert("web".to_string(), Service::default());
        let engine = FakeEngine::new();
        let proxy = ProxyProcessor::new(&engine).unwrap();
        proxy.regenerate(&config).unwrap();

        config.services.get_mut("web").unwrap().disabled = true;
        proxy.regenerate(&config).unwrap();
        assert!(!config.paths.nginx_conf_dir().join("web.conf").exists());
    }

    #[tokio::test]
    async fn test_restart_launches_then_restarts() {
        let dir = TempDir::new().unwrap();
        let mut config = base_config(&dir);
        config.domain.ssl_enabled = true;
        let engine = FakeEngine::new();
        let proxy = ProxyProcessor::new(&engine).unwrap();

        proxy.restart(&config).await.unwrap();
        assert_eq!(engine.run_names(), vec!["shop_prod_nginx"]);
        let run = engine.runs.lock().unwrap()[0].clone();
        assert_eq!(run.image, "docker.io/nginx:stable");
        assert_eq!(run.network.as_deref(), Some("host"));
        assert_eq!(run.ports.len(), 2);
        assert!(run.volumes.last().unwrap().ends_with(":/etc/nginx/certs"));

        proxy.restart(&config).await.unwrap();
        proxy.ensure_running(&config).await.unwrap();
        assert_eq!(engine.run_names().len(), 1);
        assert_eq!(*engine.restarts.lock().unwrap(), vec!["shop_prod_nginx"]);
    }

    #[tokio::test]
    async fn test_refresh_regenerates_and_reloads() {
        let dir = TempDir::new().unwrap();
        let mut config = base_config(&dir);
        config.services.insert("web".to_string(), Service::default());
        let engine = FakeEngine::new();
        let proxy = ProxyProcessor::new(&engine).unwrap();

        proxy.refresh(&config).await.unwrap();
        assert!(config.paths.nginx_conf_dir().join("web.conf").is_file());
        assert_eq!(*engine.restarts.lock().unwrap(), vec!["shop_prod_nginx"]);
    }
}
