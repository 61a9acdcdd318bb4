use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, warn};

use crate::error::{DeployError, Result};
use crate::models::{
    ErrorPage, IpMapping, PortValue, ProjectConfig, RuntimePaths, WebSpec, NGINX_ERROR_PAGE_CODES,
    STATIC_NETWORK_NAME, STATIC_SUBNET_PREFIX,
};

const DEFAULT_PORT: u16 = 80;

/// Lowest last octet handed out; `.1` belongs to the network gateway.
const FIRST_STATIC_OCTET: u16 = 2;

/// Computes the derived runtime fields of services.
pub struct ServiceProcessor;

impl ServiceProcessor {
    /// Decorates the named services in place. Safe to call repeatedly: every derived
    /// field is recomputed and overwritten, and an assigned static IP is kept.
    pub fn normalize(service_names: &[String], config: &mut ProjectConfig) -> Result<()> {
        for name in service_names {
            if !config.services.contains_key(name) {
                warn!("Skipping unknown service '{}'", name);
                continue;
            }

            let static_ip = if config.project.ip_mapping == IpMapping::Static {
                match config.services[name].docker.ip.clone() {
                    Some(ip) => Some(ip),
                    None => Some(next_static_ip(config)?),
                }
            } else {
                None
            };

            let depend_containers = config.resolve_container_names(&config.services[name].docker.depends);
            let link_containers = config.resolve_container_names(&config.services[name].docker.links);
            for dep in &config.services[name].docker.depends {
                if !config.storages.contains_key(dep) && !config.services.contains_key(dep) {
                    warn!(
                        "Service '{}' depends on unknown name '{}'; it will never become ready",
                        name, dep
                    );
                }
            }

            let paths = config.paths.clone();
            let Some(service) = config.services.get_mut(name) else {
                continue;
            };

            if let Some(ip) = static_ip {
                service.docker.ip = Some(ip);
                service.docker.network = Some(STATIC_NETWORK_NAME.to_string());
            }

            let (host_port, expose_port) = parse_port_spec(name, service.docker.port.as_ref())?;
            service.docker.host_port = Some(host_port);
            service.docker.expose_port = Some(expose_port);
            service.docker.depend_containers = depend_containers;
            service.docker.link_containers = link_containers;
            service.docker.health_status = Some(crate::models::HealthStatus::Stopped);
            service.web.resolved_error_pages = resolve_error_pages(&paths, name, &service.web);

            debug!(
                "Normalized service '{}' (ports {}:{}, ip {:?})",
                name, host_port, expose_port, service.docker.ip
            );
        }
        Ok(())
    }
}

/// Splits a port spec into `(host, container)`. A bare port maps to itself; no spec means `80:80`.
pub fn parse_port_spec(service: &str, spec: Option<&PortValue>) -> Result<(u16, u16)> {
    let Some(spec) = spec else {
        return Ok((DEFAULT_PORT, DEFAULT_PORT));
    };
    let text = spec.to_string();
    let invalid = || DeployError::InvalidPort {
        service: service.to_string(),
        spec: text.clone(),
    };
    let parse = |s: &str| s.trim().parse::<u16>().map_err(|_| invalid());

    match text.split_once(':') {
        Some((host, container)) => Ok((parse(host)?, parse(container)?)),
        None => {
            let port = parse(&text)?;
            Ok((port, port))
        }
    }
}

/// Next free address in the static /24 block: one past the highest last octet already
/// in use by any service or storage, never below `.2`.
pub fn next_static_ip(config: &ProjectConfig) -> Result<String> {
    let prefix = format!("{}.", STATIC_SUBNET_PREFIX);
    let assigned = config
        .services
        .values()
        .filter_map(|s| s.docker.ip.as_deref())
        .chain(config.storages.values().filter_map(|s| s.ip.as_deref()));

    let max_octet = assigned
        .filter_map(|ip| ip.strip_prefix(&prefix))
        .filter_map(|octet| octet.parse::<u16>().ok())
        .max();

    let next = max_octet
        .map(|octet| octet + 1)
        .unwrap_or(FIRST_STATIC_OCTET)
        .max(FIRST_STATIC_OCTET);
    if next > 254 {
        return Err(DeployError::SubnetExhausted {
            prefix: STATIC_SUBNET_PREFIX.to_string(),
        });
    }
    Ok(format!("{}{}", prefix, next))
}

/// Every page is published as `<service>/<file>`, so services sharing the proxy's
/// static root never overwrite each other's pages.
fn resolve_error_pages(paths: &RuntimePaths, service: &str, web: &WebSpec) -> BTreeMap<String, ErrorPage> {
    let mut pages = BTreeMap::new();
    for code in NGINX_ERROR_PAGE_CODES {
        let page = match web.error_pages.get(code) {
            Some(custom) => custom_page(&paths.custom_path, service, custom),
            None => {
                let file = format!("{}.html", code);
                ErrorPage {
                    source: paths.env_path.join("static").join(&file),
                    filename: format!("{}/{}", service, file),
                }
            }
        };
        pages.insert(code.to_string(), page);
    }

    if let Some(maintenance) = web.maintenance.as_ref().filter(|m| m.enabled) {
        if let Some(filename) = &maintenance.filename {
            pages.insert("503".to_string(), custom_page(&paths.custom_path, service, filename));
        }
    }
    pages
}

fn custom_page(custom_dir: &Path, service: &str, relative: &str) -> ErrorPage {
    let source = custom_dir.join(relative);
    let file = source
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| relative.to_string());
    ErrorPage {
        filename: format!("{}/{}", service, file),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{HealthStatus, Maintenance, Service, Storage};
    use std::path::PathBuf;

    fn config_with(services: &[(&str, Service)]) -> ProjectConfig {
        let mut config = ProjectConfig::default();
        config.project.env = "prod".to_string();
        config.paths = RuntimePaths::new(Path::new("/profiles/shop"), Path::new("/opt/env"));
        for (name, service) in services {
            config.services.insert(name.to_string(), service.clone());
        }
        config
    }

    fn names(config: &ProjectConfig) -> Vec<String> {
        config.services.keys().cloned().collect()
    }

    #[test]
    fn test_port_spec_forms() {
        assert_eq!(parse_port_spec("a", None).unwrap(), (80, 80));
        assert_eq!(
            parse_port_spec("a", Some(&PortValue::Number(3000))).unwrap(),
            (3000, 3000)
        );
        assert_eq!(
            parse_port_spec("a", Some(&PortValue::Text("8080:80".to_string()))).unwrap(),
            (8080, 80)
        );
        assert!(matches!(
            parse_port_spec("a", Some(&PortValue::Text("http".to_string()))),
            Err(DeployError::InvalidPort { .. })
        ));
    }

    #[test]
    fn test_next_static_ip_starts_at_two() {
        let config = config_with(&[]);
        assert_eq!(next_static_ip(&config).unwrap(), "172.18.0.2");
    }

    #[test]
    fn test_next_static_ip_is_max_plus_one() {
        let mut config = config_with(&[]);
        let mut api = Service::default();
        api.docker.ip = Some("172.18.0.7".to_string());
        config.services.insert("api".to_string(), api);
        let mut outside = Service::default();
        outside.docker.ip = Some("10.0.0.50".to_string());
        config.services.insert("outside".to_string(), outside);
        config.storages.insert(
            "db".to_string(),
            Storage {
                ip: Some("172.18.0.3".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(next_static_ip(&config).unwrap(), "172.18.0.8");
    }

    #[test]
    fn test_next_static_ip_never_below_two() {
        let mut config = config_with(&[]);
        let mut gw = Service::default();
        gw.docker.ip = Some("172.18.0.1".to_string());
        config.services.insert("gw".to_string(), gw);
        assert_eq!(next_static_ip(&config).unwrap(), "172.18.0.2");
    }

    #[test]
    fn test_next_static_ip_exhausted() {
        let mut config = config_with(&[]);
        let mut last = Service::default();
        last.docker.ip = Some("172.18.0.254".to_string());
        config.services.insert("last".to_string(), last);
        assert!(matches!(
            next_static_ip(&config),
            Err(DeployError::SubnetExhausted { .. })
        ));
    }

    #[test]
    fn test_static_mode_assigns_distinct_ips() {
        let mut config = config_with(&[("api", Service::default()), ("web", Service::default())]);
        config.project.ip_mapping = IpMapping::Static;
        let all = names(&config);
        ServiceProcessor::normalize(&all, &mut config).unwrap();

        assert_eq!(config.services["api"].docker.ip.as_deref(), Some("172.18.0.2"));
        assert_eq!(config.services["web"].docker.ip.as_deref(), Some("172.18.0.3"));
        assert_eq!(
            config.services["web"].docker.network.as_deref(),
            Some(STATIC_NETWORK_NAME)
        );
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let mut api = Service::default();
        api.docker.depends = vec!["db".to_string()];
        api.docker.port = Some(PortValue::Text("8080:3000".to_string()));
        let mut config = config_with(&[("api", api)]);
        config.project.ip_mapping = IpMapping::Static;
        config.storages.insert("db".to_string(), Storage::default());

        let all = names(&config);
        ServiceProcessor::normalize(&all, &mut config).unwrap();
        ServiceProcessor::normalize(&all, &mut config).unwrap();

        let docker = &config.services["api"].docker;
        assert_eq!(docker.ip.as_deref(), Some("172.18.0.2"));
        assert_eq!(docker.depend_containers, vec!["sample_prod_db"]);
        assert_eq!(docker.host_port, Some(8080));
        assert_eq!(docker.expose_port, Some(3000));
        assert_eq!(docker.health_status, Some(HealthStatus::Stopped));
        assert_eq!(config.services["api"].web.resolved_error_pages.len(), 6);
    }

    #[test]
    fn test_dhcp_mode_leaves_ip_unset() {
        let mut config = config_with(&[("api", Service::default())]);
        let all = names(&config);
        ServiceProcessor::normalize(&all, &mut config).unwrap();
        assert_eq!(config.services["api"].docker.ip, None);
        assert_eq!(config.services["api"].docker.network, None);
    }

    #[test]
    fn test_dependencies_resolve_storages_first_and_drop_unknown() {
        let mut api = Service::default();
        api.docker.depends = vec!["cache".to_string(), "ghost".to_string(), "auth".to_string()];
        api.docker.links = vec!["auth".to_string()];
        let mut config = config_with(&[("api", api), ("auth", Service::default())]);
        config.storages.insert("cache".to_string(), Storage::default());

        ServiceProcessor::normalize(&["api".to_string()], &mut config).unwrap();
        let docker = &config.services["api"].docker;
        assert_eq!(docker.depend_containers, vec!["sample_prod_cache", "sample_prod_auth"]);
        assert_eq!(docker.link_containers, vec!["sample_prod_auth"]);
        // the declared list itself is not rewritten
        assert_eq!(docker.depends.len(), 3);
    }

    #[test]
    fn test_error_pages_custom_default_and_maintenance() {
        let mut web_service = Service::default();
        web_service
            .web
            .error_pages
            .insert("502".to_string(), "pages/50x.html".to_string());
        web_service
            .web
            .error_pages
            .insert("504".to_string(), "pages/50x.html".to_string());
        web_service.web.maintenance = Some(Maintenance {
            enabled: true,
            filename: Some("maintenance.html".to_string()),
            allowed_ips: vec![],
        });
        let mut config = config_with(&[("web", web_service)]);
        ServiceProcessor::normalize(&["web".to_string()], &mut config).unwrap();

        let pages = &config.services["web"].web.resolved_error_pages;
        assert_eq!(pages["404"].filename, "web/404.html");
        assert_eq!(pages["404"].source, PathBuf::from("/opt/env/static/404.html"));
        assert_eq!(pages["502"].filename, "web/50x.html");
        assert_eq!(
            pages["502"].source,
            PathBuf::from("/profiles/shop/custom/pages/50x.html")
        );
        assert_eq!(pages["504"].filename, "web/50x.html");
        assert_eq!(pages["503"].filename, "web/maintenance.html");
    }
}
