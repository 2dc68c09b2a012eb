//! The declarative configuration document and its loader.
//!
//! One yaml file declares the tailnet identity, the application surface and
//! every service the router publishes. Sections for external collaborators
//! (authentication, database, kubernetes, certificate manager) are parsed and
//! carried but not interpreted here.

use std::error::Error;
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use warptail_core::config::ServiceConfig;
use warptail_core::tailnet::TailscaleConfig;
use warptail_core::RouterError;

pub const ENV_CONFIG_PATH: &str = "CONFIG_PATH";
pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub tailscale: TailscaleConfig,
    #[serde(default)]
    pub application: ApplicationConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_manager: Option<CertificateManagerConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<AuthenticationConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<DatabaseConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes: Option<KubernetesConfig>,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    #[serde(default = "default_application_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_logo: Option<String>,
}

fn default_application_port() -> u16 {
    8080
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        ApplicationConfig {
            port: default_application_port(),
            site_name: None,
            site_logo: None,
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct CertificateManagerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_ssl_port")]
    pub ssl_port: u16,
    #[serde(default)]
    pub certificates_dir: String,
    #[serde(default)]
    pub portal_domain: String,
}

fn default_ssl_port() -> u16 {
    443
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct AuthenticationConfig {
    #[serde(rename = "baseURL", default)]
    pub base_url: String,
    #[serde(default)]
    pub session_secret: String,
    #[serde(default)]
    pub provider: AuthenticationProvider,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct AuthenticationProvider {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oidc: Option<OidcProvider>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic: Option<BasicProvider>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct OidcProvider {
    #[serde(rename = "clientID", default)]
    pub client_id: String,
    #[serde(rename = "providerURL", default)]
    pub provider_url: String,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct BasicProvider {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub connection_type: ConnectionType,
    #[serde(default)]
    pub connection: String,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    #[default]
    Sqlite,
    Postgres,
    Mysql,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct KubernetesConfig {
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub loadbalancer: NamedResource,
    #[serde(default)]
    pub ingress: IngressResource,
    #[serde(default)]
    pub certificate: CertificateResource,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct NamedResource {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct IngressResource {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub class: String,
    #[serde(default)]
    pub service: String,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct CertificateResource {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub secret_name: String,
}

impl KubernetesConfig {
    fn apply_defaults(&mut self) {
        if self.ingress.name.is_empty() {
            self.ingress.name = "warptail-route-ingress".to_string();
        }
        if self.loadbalancer.name.is_empty() {
            self.loadbalancer.name = "warptail-route-loadbalancer".to_string();
        }
        if self.certificate.name.is_empty() {
            self.certificate.name = "warptail-route-certificate".to_string();
        }
        if self.certificate.secret_name.is_empty() {
            self.certificate.secret_name = "warptail-certificate".to_string();
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Console,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[default]
    Info,
    Warn,
    Error,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Stdout,
    File,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default)]
    pub level: LogLevel,
    #[serde(default)]
    pub output: LogOutput,
    #[serde(default = "default_log_path")]
    pub path: String,
}

fn default_log_path() -> String {
    "/var/log/warptail".to_string()
}

#[derive(Debug)]
pub enum ConfigError {
    Io(io::Error),
    Parse(serde_yaml::Error),
    Invalid(RouterError),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "unable to read config: {}", e),
            ConfigError::Parse(e) => write!(f, "unable to parse config: {}", e),
            ConfigError::Invalid(e) => write!(f, "invalid config: {}", e),
        }
    }
}

impl Error for ConfigError {}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let raw = fs::read_to_string(path).map_err(ConfigError::Io)?;
    let mut config: Config = serde_yaml::from_str(&raw).map_err(ConfigError::Parse)?;
    if let Some(kubernetes) = &mut config.kubernetes {
        kubernetes.apply_defaults();
    }
    for service in &config.services {
        service.validate().map_err(ConfigError::Invalid)?;
    }
    Ok(config)
}

/// Content hash of the config file, used to tell our own writes apart from
/// external edits.
pub fn config_hash(path: &Path) -> io::Result<[u8; 32]> {
    let data = fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&data);
    Ok(hasher.finalize().into())
}

impl LogLevel {
    fn to_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Error => log::LevelFilter::Error,
        }
    }
}

pub fn setup_logging(config: &LoggingConfig) -> Result<(), Box<dyn Error>> {
    let mut dispatch = fern::Dispatch::new().level(config.level.to_filter());

    dispatch = match config.format {
        LogFormat::Console => dispatch.format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        }),
        LogFormat::Json => dispatch.format(|out, message, record| {
            out.finish(format_args!(
                "{}",
                serde_json::json!({
                    "time": chrono::Utc::now().to_rfc3339(),
                    "level": record.level().to_string().to_lowercase(),
                    "target": record.target(),
                    "msg": message.to_string(),
                })
            ))
        }),
    };

    dispatch = match config.output {
        LogOutput::Stdout => dispatch.chain(std::io::stdout()),
        LogOutput::File => {
            fs::create_dir_all(&config.path)?;
            let file = Path::new(&config.path).join("warptail.log");
            dispatch.chain(fern::log_file(file)?)
        }
    };

    dispatch.apply()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static FILE_SEQ: AtomicUsize = AtomicUsize::new(0);

    fn temp_config(content: &str) -> std::path::PathBuf {
        let seq = FILE_SEQ.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!(
            "warptail-conf-{}-{}.yaml",
            std::process::id(),
            seq
        ));
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    const SAMPLE: &str = r#"
tailscale:
  auth_key: tskey-abc
  hostname: gateway
application:
  port: 8080
logging:
  format: json
  level: warn
services:
  - name: db
    enabled: true
    routes:
      - type: tcp
        port: 15432
        machine:
          address: db.local
          port: 5432
  - name: web
    enabled: false
    routes:
      - type: http
        domain: app.example.com
        machine:
          address: app.local
          port: 3000
        proxy_settings:
          preserve_host: true
          rules:
            - path: /v1/
              target_host: api-v1
              target_port: 8080
              strip_path: true
"#;

    #[test]
    fn parses_a_full_document() {
        let path = temp_config(SAMPLE);
        let config = load_config(&path).unwrap();

        assert_eq!(config.tailscale.hostname, "gateway");
        assert_eq!(config.application.port, 8080);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.level, LogLevel::Warn);
        assert_eq!(config.services.len(), 2);

        let db = &config.services[0];
        assert!(db.enabled);
        assert_eq!(db.routes[0].port, 15432);
        assert_eq!(db.routes[0].machine.address, "db.local");

        let web = &config.services[1];
        let settings = web.routes[0].proxy_settings.as_ref().unwrap();
        assert!(settings.preserve_host);
        assert_eq!(settings.rules[0].target_host.as_deref(), Some("api-v1"));
        assert!(settings.rules[0].strip_path);
    }

    #[test]
    fn rejects_invalid_services() {
        let path = temp_config(
            r#"
services:
  - name: db
    routes:
      - type: tcp
        machine:
          address: db.local
          port: 5432
"#,
        );
        let err = load_config(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)), "got: {}", err);
        assert!(err.to_string().contains("missing `port`"));
    }

    #[test]
    fn kubernetes_names_default_to_warptail_routes() {
        let path = temp_config(
            r#"
kubernetes:
  namespace: warptail
  ingress:
    class: nginx
"#,
        );
        let config = load_config(&path).unwrap();
        let kubernetes = config.kubernetes.unwrap();
        assert_eq!(kubernetes.ingress.name, "warptail-route-ingress");
        assert_eq!(kubernetes.loadbalancer.name, "warptail-route-loadbalancer");
        assert_eq!(kubernetes.certificate.name, "warptail-route-certificate");
        assert_eq!(kubernetes.certificate.secret_name, "warptail-certificate");
        assert_eq!(kubernetes.ingress.class, "nginx");
    }

    #[test]
    fn hash_tracks_file_content() {
        let path = temp_config("application:\n  port: 8080\n");
        let before = config_hash(&path).unwrap();

        fs::write(&path, "application:\n  port: 9090\n").unwrap();
        let after = config_hash(&path).unwrap();
        assert_ne!(before, after);

        fs::write(&path, "application:\n  port: 8080\n").unwrap();
        assert_eq!(config_hash(&path).unwrap(), before);
    }

    #[test]
    fn document_round_trips_through_yaml() {
        let path = temp_config(SAMPLE);
        let config = load_config(&path).unwrap();

        let serialized = serde_yaml::to_string(&config).unwrap();
        let reparsed: Config = serde_yaml::from_str(&serialized).unwrap();
        assert_eq!(reparsed.services.len(), config.services.len());
        assert_eq!(reparsed.tailscale.auth_key, "tskey-abc");
    }
}
