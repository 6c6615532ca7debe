//! Hostname-keyed routing table and the JSON configuration file it loads from.
//!
//! The table is built once at startup and shared read-only across connection
//! tasks; there is no hot reload.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

/// One hostname's routing policy.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    /// Configured domain, matched case-insensitively against the Host header.
    pub domain: String,
    /// Workspace folder placed in the `?folder=` login redirect.
    pub workspace_folder: String,
    /// Per-venture backend for this domain. Routes without a target share the
    /// process-wide default backend.
    #[serde(default, deserialize_with = "deserialize_target")]
    pub target: Option<String>,
    /// Stylesheet injected into the login page served for this domain.
    #[serde(default)]
    pub login_theme: Option<String>,
}

impl Route {
    /// Venture identity used for context headers: the first label of the
    /// configured domain (`mezzpro.xyz` -> `mezzpro`).
    pub fn venture_name(&self) -> &str {
        self.domain.split('.').next().unwrap_or(&self.domain)
    }
}

/// Immutable hostname -> [`Route`] table. The first entry is the designated
/// default route; resolution always succeeds.
#[derive(Clone, Debug)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    /// Builds a table from configured routes, falling back to the built-in
    /// defaults when the list is empty.
    pub fn new(routes: Vec<Route>) -> Self {
        if routes.is_empty() {
            return Self {
                routes: default_routes(),
            };
        }
        Self { routes }
    }

    /// Resolves a Host header value to a route. Exact case-insensitive match
    /// first; otherwise any hostname containing the first label of a
    /// configured domain matches that route, so staging and preview
    /// subdomains keep hitting their production entry. Unmatched hostnames
    /// get the default route.
    pub fn resolve(&self, hostname: &str) -> &Route {
        let host = host_without_port(hostname).to_ascii_lowercase();

        if let Some(route) = self
            .routes
            .iter()
            .find(|r| r.domain.eq_ignore_ascii_case(&host))
        {
            return route;
        }

        if let Some(route) = self.routes.iter().find(|r| {
            let label = r.domain.split('.').next().unwrap_or("");
            !label.is_empty() && host.contains(label)
        }) {
            return route;
        }

        self.default_route()
    }

    pub fn default_route(&self) -> &Route {
        &self.routes[0]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Route> {
        self.routes.iter()
    }
}

/// Venture path segment -> download backend. The `/downloads/<venture>/...`
/// subtree is routed through this table without touching the login redirect.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadTable {
    #[serde(default, deserialize_with = "deserialize_target_map")]
    ventures: BTreeMap<String, String>,
    /// Backend for venture segments not present in `ventures`. When absent
    /// the proxy's default backend takes the request.
    #[serde(default, deserialize_with = "deserialize_target")]
    default: Option<String>,
}

impl DownloadTable {
    pub fn new(ventures: BTreeMap<String, String>, default: Option<String>) -> Self {
        let ventures = ventures
            .into_iter()
            .map(|(k, v)| (k, normalize_target(&v)))
            .collect();
        Self {
            ventures,
            default: default.as_deref().map(normalize_target),
        }
    }

    /// Selects the backend for a venture segment: exact match, then prefix
    /// match, then the table default.
    pub fn resolve(&self, venture: &str) -> Option<&str> {
        if let Some(target) = self.ventures.get(venture) {
            return Some(target.as_str());
        }
        if let Some((_, target)) = self
            .ventures
            .iter()
            .find(|(prefix, _)| venture.starts_with(prefix.as_str()))
        {
            return Some(target.as_str());
        }
        self.default.as_deref()
    }
}

/// On-disk routing configuration, mirroring the deployment's
/// `routing-config.json` shape.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingConfig {
    pub routes: Vec<Route>,
    #[serde(default)]
    pub downloads: DownloadTable,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read routing config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse routing config: {0}")]
    Parse(#[from] serde_json::Error),
}

pub fn load_config(path: &Path) -> Result<RoutingConfig, ConfigError> {
    let raw = std::fs::read_to_string(path)?;
    let config: RoutingConfig = serde_json::from_str(&raw)?;
    Ok(config)
}

/// Built-in table matching the hosted deployment. Used when no config file
/// is given; the first route (admin workspace) is the default.
pub fn default_routes() -> Vec<Route> {
    fn route(domain: &str, workspace: &str, login_theme: Option<&str>) -> Route {
        Route {
            domain: domain.to_string(),
            workspace_folder: format!("/home/coder/workspace-{}", workspace),
            target: None,
            login_theme: login_theme.map(str::to_string),
        }
    }

    vec![
        route("cradlesystems.xyz", "admin", None),
        route("mezzpro.xyz", "mezzpro", Some("mezzpro-login.css")),
        route("minqro.xyz", "minqro", Some("minqro-login.css")),
        route("sobuai.xyz", "sobuai", Some("sobuai-login.css")),
        route("bizcradle.xyz", "bizcradle", Some("bizcradle-login.css")),
        route("localhost", "admin", None),
    ]
}

pub fn default_downloads() -> DownloadTable {
    let mut ventures = BTreeMap::new();
    ventures.insert("cradle".to_string(), "127.0.0.1:3001".to_string());
    ventures.insert("mezzpro".to_string(), "127.0.0.1:3002".to_string());
    ventures.insert("bizcradle".to_string(), "127.0.0.1:3003".to_string());
    DownloadTable::new(ventures, Some("127.0.0.1:3001".to_string()))
}

/// Backends are configured as either `host:port` or a full `http://` URL;
/// both collapse to the authority form used when building upstream URIs.
pub fn normalize_target(target: &str) -> String {
    let t = target.trim();
    let t = t.strip_prefix("http://").unwrap_or(t);
    t.trim_end_matches('/').to_string()
}

fn deserialize_target<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.as_deref().map(normalize_target))
}

fn deserialize_target_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: BTreeMap<String, String> = BTreeMap::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|(venture, target)| (venture, normalize_target(&target)))
        .collect())
}

pub fn host_without_port(raw: &str) -> &str {
    let trimmed = raw.trim();
    match trimmed.split_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => trimmed,
    }
}
