use octofhir_core::{FhirVersion, ResourceType};
use octofhir_cql_service::CqlConfig;
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, time::Duration};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub fhir: FhirSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// CQL evaluation limits
    #[serde(default)]
    pub cql: CqlConfig,
    /// Remote terminology access (`$cache-valuesets`)
    #[serde(default)]
    pub terminology: TerminologySettings,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("server.port must be > 0".into());
        }
        if self.server.body_limit_bytes == 0 {
            return Err("server.body_limit_bytes must be > 0".into());
        }
        if !self.fhir.base_path.starts_with('/') || self.fhir.base_path.len() < 2 {
            return Err("fhir.base_path must start with '/' and name a path segment".into());
        }
        if self.fhir.base_path.ends_with('/') {
            return Err("fhir.base_path must not end with '/'".into());
        }
        if self.fhir.resource_types.is_empty() {
            return Err("fhir.resource_types must not be empty".into());
        }
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        if self.cql.max_retrieve_size == 0 {
            return Err("cql.max_retrieve_size must be > 0".into());
        }
        if self.cql.evaluation_timeout_ms == 0 {
            return Err("cql.evaluation_timeout_ms must be > 0".into());
        }
        if self.terminology.timeout_ms == 0 {
            return Err("terminology.timeout_ms must be > 0".into());
        }
        Ok(())
    }

    pub fn addr(&self) -> SocketAddr {
        use std::net::{IpAddr, Ipv4Addr};
        let host: IpAddr = self
            .server
            .host
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)));
        SocketAddr::from((host, self.server.port))
    }

    /// Returns the base URL for the server.
    /// If `base_url` is configured, returns that; otherwise computes from host:port.
    pub fn base_url(&self) -> String {
        self.server
            .base_url
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", self.server.host, self.server.port))
    }

    /// Absolute FHIR base (`base_url` + `fhir.base_path`).
    pub fn fhir_base_url(&self) -> String {
        format!(
            "{}{}",
            self.base_url().trim_end_matches('/'),
            self.fhir.base_path
        )
    }

    pub fn terminology_timeout(&self) -> Duration {
        Duration::from_millis(self.terminology.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Base URL for the server, used in links and responses.
    /// If not set, defaults to http://{host}:{port}
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8080
}
fn default_body_limit() -> usize {
    4 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            base_url: None,
            body_limit_bytes: default_body_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FhirSettings {
    /// FHIR version served (R4, R4B, R5 or the full version string)
    #[serde(default)]
    pub version: FhirVersion,
    /// Mount point of the FHIR REST API
    #[serde(default = "default_base_path")]
    pub base_path: String,
    /// Resource types that get a data-access object and a resource provider
    #[serde(default = "default_resource_types")]
    pub resource_types: Vec<ResourceType>,
}

fn default_base_path() -> String {
    "/fhir".into()
}

fn default_resource_types() -> Vec<ResourceType> {
    ResourceType::ALL.to_vec()
}

impl Default for FhirSettings {
    fn default() -> Self {
        Self {
            version: FhirVersion::default(),
            base_path: default_base_path(),
            resource_types: default_resource_types(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminologySettings {
    /// Timeout for requests to remote terminology endpoints
    #[serde(default = "default_terminology_timeout")]
    pub timeout_ms: u64,
}

fn default_terminology_timeout() -> u64 {
    30_000
}

impl Default for TerminologySettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_terminology_timeout(),
        }
    }
}

pub mod loader {
    use super::AppConfig;
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    pub fn load_config(path: Option<&str>) -> Result<AppConfig, String> {
        let mut builder = Config::builder();
        let pathbuf = PathBuf::from(path.unwrap_or("octofhir.toml"));
        if pathbuf.exists() {
            builder = builder.add_source(File::from(pathbuf));
        } else if path.is_some() {
            tracing::warn!(path = %pathbuf.display(), "Configuration file not found, using defaults");
        }
        // Environment variable overrides, e.g., OCTOFHIR__SERVER__PORT=9090
        builder = builder.add_source(
            Environment::with_prefix("OCTOFHIR")
                .try_parsing(true)
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("fhir.resource_types"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }
}
