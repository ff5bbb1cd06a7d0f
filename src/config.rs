//! Server configuration.
//!
//! The configuration file is a YAML mapping with optional `domains`,
//! `resources`, `policy` and `log` sections; command-line arguments
//! override file values. Raw serde structures are validated into the
//! typed configuration the rest of the server consumes.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::proto;
use crate::sd::{AccessPolicy, ResourceLimits};
use crate::transport::{ListenAddr, SocketConf, TlsAttrs, TransportError};

pub const DEFAULT_IDLE_MIN_S: u64 = 4;
pub const DEFAULT_IDLE_MAX_S: u64 = 30;
pub const DEFAULT_NOTIFICATION_DELAY_MS: u64 = 250;
pub const DEFAULT_LOG_FILE_MAX_SIZE: u64 = 1_000_000;

const FACILITIES: [&str; 20] = [
    "auth", "authpriv", "cron", "daemon", "ftp", "kern", "lpr", "mail", "news", "syslog", "user",
    "uucp", "local0", "local1", "local2", "local3", "local4", "local5", "local6", "local7",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("unable to parse configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid {field}: '{value}'")]
    Invalid { field: String, value: String },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("no domains configured")]
    NoDomains,
}

fn invalid(field: &str, value: impl fmt::Display) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        value: value.to_string(),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub fn parse(name: &str) -> Result<LogLevel, ConfigError> {
        Ok(match name {
            "debug" => LogLevel::Debug,
            "info" => LogLevel::Info,
            "warning" => LogLevel::Warning,
            "error" => LogLevel::Error,
            "critical" => LogLevel::Critical,
            _ => return Err(invalid("filter level", name)),
        })
    }
}

#[derive(Clone, Debug)]
pub struct LogSettings {
    pub console: bool,
    pub syslog: bool,
    pub syslog_socket: Option<String>,
    pub facility: String,
    pub filter: LogLevel,
    pub log_file: Option<PathBuf>,
    pub log_file_backup: u64,
    pub log_file_max_size: u64,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            console: false,
            syslog: true,
            syslog_socket: None,
            facility: "daemon".to_string(),
            filter: LogLevel::Info,
            log_file: None,
            log_file_backup: 0,
            log_file_max_size: DEFAULT_LOG_FILE_MAX_SIZE,
        }
    }
}

/// The per-connection idle-time range, in seconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdleLimits {
    pub min: u64,
    pub max: u64,
}

impl Default for IdleLimits {
    fn default() -> Self {
        Self {
            min: DEFAULT_IDLE_MIN_S,
            max: DEFAULT_IDLE_MAX_S,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VersionRange {
    pub min: u16,
    pub max: u16,
}

impl Default for VersionRange {
    fn default() -> Self {
        Self {
            min: proto::MIN_VERSION,
            max: proto::MAX_VERSION,
        }
    }
}

#[derive(Clone, Debug)]
pub struct DomainConf {
    pub name: Option<String>,
    pub sockets: Vec<SocketConf>,
    pub idle: IdleLimits,
    pub protocol: VersionRange,
    pub notification_delay_ms: u64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Resources {
    pub user: ResourceLimits,
    pub total: ResourceLimits,
}

#[derive(Clone, Debug, Default)]
pub struct Config {
    pub domains: Vec<DomainConf>,
    pub resources: Resources,
    pub policy: AccessPolicy,
    pub log: LogSettings,
}

/// Everything one domain's server needs to run.
#[derive(Clone, Debug)]
pub struct DomainSettings {
    pub name: Option<String>,
    pub sockets: Vec<SocketConf>,
    pub idle: IdleLimits,
    pub protocol: VersionRange,
    pub notification_delay_ms: u64,
    pub user_limits: ResourceLimits,
    pub total_limits: ResourceLimits,
    pub policy: AccessPolicy,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Config::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Config, ConfigError> {
        let raw: RawConf = serde_yaml::from_str(contents)?;
        validate(raw)
    }

    /// Replace the domain list with plain address groups, as given on
    /// the command line.
    pub fn set_domains(&mut self, groups: &[Vec<String>]) -> Result<(), ConfigError> {
        let mut domains = Vec::new();
        for group in groups {
            let mut sockets = Vec::new();
            for addr in group {
                sockets.push(SocketConf {
                    addr: ListenAddr::parse(addr)?,
                    tls: TlsAttrs::default(),
                });
            }
            domains.push(DomainConf {
                name: None,
                sockets,
                idle: IdleLimits::default(),
                protocol: VersionRange::default(),
                notification_delay_ms: DEFAULT_NOTIFICATION_DELAY_MS,
            });
        }
        self.domains = domains;
        Ok(())
    }

    pub fn domain_settings(&self) -> Vec<DomainSettings> {
        self.domains
            .iter()
            .map(|domain| DomainSettings {
                name: domain.name.clone(),
                sockets: domain.sockets.clone(),
                idle: domain.idle,
                protocol: domain.protocol,
                notification_delay_ms: domain.notification_delay_ms,
                user_limits: self.resources.user,
                total_limits: self.resources.total,
                policy: self.policy,
            })
            .collect()
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawConf {
    log: Option<RawLog>,
    domains: Option<Vec<RawDomain>>,
    resources: Option<RawResources>,
    policy: Option<RawPolicy>,
}

#[derive(Debug, Deserialize)]
struct RawLog {
    console: Option<bool>,
    syslog: Option<bool>,
    syslog_socket: Option<String>,
    facility: Option<String>,
    filter: Option<String>,
    log_file: Option<PathBuf>,
    log_file_backup: Option<u64>,
    log_file_max_size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawDomain {
    name: Option<String>,
    sockets: Option<Vec<RawSocket>>,
    /// Alternative key for `sockets`, kept for compatibility.
    addrs: Option<Vec<RawSocket>>,
    idle: Option<RawIdle>,
    protocol_version: Option<RawVersionRange>,
    notification_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawSocket {
    Addr(String),
    Full { addr: String, tls: Option<RawTls> },
}

#[derive(Debug, Deserialize)]
struct RawTls {
    cert: Option<PathBuf>,
    key: Option<PathBuf>,
    tc: Option<PathBuf>,
    crl: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct RawIdle {
    min: Option<u64>,
    max: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawVersionRange {
    min: Option<u16>,
    max: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct RawResources {
    user: Option<RawLimits>,
    total: Option<RawLimits>,
}

#[derive(Debug, Deserialize)]
struct RawLimits {
    clients: Option<u64>,
    services: Option<u64>,
    subscriptions: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawPolicy {
    cross_user_publish: Option<bool>,
    cross_user_unpublish: Option<bool>,
}

fn validate(raw: RawConf) -> Result<Config, ConfigError> {
    let mut config = Config::default();

    if let Some(log) = raw.log {
        if let Some(console) = log.console {
            config.log.console = console;
        }
        if let Some(syslog) = log.syslog {
            config.log.syslog = syslog;
        }
        config.log.syslog_socket = log.syslog_socket;
        if let Some(facility) = log.facility {
            if !FACILITIES.contains(&facility.as_str()) {
                return Err(invalid("log facility", facility));
            }
            config.log.facility = facility;
        }
        if let Some(filter) = log.filter {
            config.log.filter = LogLevel::parse(&filter)?;
        }
        config.log.log_file = log.log_file;
        if let Some(backup) = log.log_file_backup {
            config.log.log_file_backup = backup;
        }
        if let Some(max_size) = log.log_file_max_size {
            config.log.log_file_max_size = max_size;
        }
    }

    if let Some(domains) = raw.domains {
        for domain in domains {
            config.domains.push(validate_domain(domain)?);
        }
    }

    if let Some(resources) = raw.resources {
        if let Some(user) = resources.user {
            config.resources.user = limits(user);
        }
        if let Some(total) = resources.total {
            config.resources.total = limits(total);
        }
    }

    if let Some(policy) = raw.policy {
        if let Some(cross_user_publish) = policy.cross_user_publish {
            config.policy.cross_user_publish = cross_user_publish;
        }
        if let Some(cross_user_unpublish) = policy.cross_user_unpublish {
            config.policy.cross_user_unpublish = cross_user_unpublish;
        }
    }

    Ok(config)
}

fn validate_domain(raw: RawDomain) -> Result<DomainConf, ConfigError> {
    let sockets = raw
        .sockets
        .or(raw.addrs)
        .ok_or_else(|| invalid("domain", "missing 'sockets'"))?;
    let mut validated = Vec::new();
    for socket in sockets {
        validated.push(validate_socket(socket)?);
    }

    let idle = match raw.idle {
        Some(idle) => {
            let min = idle.min.unwrap_or(DEFAULT_IDLE_MIN_S);
            let max = idle.max.unwrap_or(DEFAULT_IDLE_MAX_S);
            if min < 1 || min > max {
                return Err(invalid("idle limits", format!("min {min}, max {max}")));
            }
            IdleLimits { min, max }
        }
        None => IdleLimits::default(),
    };

    let protocol = match raw.protocol_version {
        Some(range) => {
            let min = range.min.unwrap_or(proto::MIN_VERSION);
            let max = range.max.unwrap_or(proto::MAX_VERSION);
            if min > max || min < proto::MIN_VERSION || max > proto::MAX_VERSION {
                return Err(invalid(
                    "protocol version range",
                    format!("min {min}, max {max}"),
                ));
            }
            VersionRange { min, max }
        }
        None => VersionRange::default(),
    };

    Ok(DomainConf {
        name: raw.name,
        sockets: validated,
        idle,
        protocol,
        notification_delay_ms: raw
            .notification_delay_ms
            .unwrap_or(DEFAULT_NOTIFICATION_DELAY_MS),
    })
}

fn validate_socket(raw: RawSocket) -> Result<SocketConf, ConfigError> {
    match raw {
        RawSocket::Addr(addr) => Ok(SocketConf {
            addr: ListenAddr::parse(&addr)?,
            tls: TlsAttrs::default(),
        }),
        RawSocket::Full { addr, tls } => {
            let addr = ListenAddr::parse(&addr)?;
            let tls = match tls {
                Some(tls) => TlsAttrs {
                    cert: tls.cert,
                    key: tls.key,
                    tc: tls.tc,
                    crl: tls.crl,
                },
                None => TlsAttrs::default(),
            };
            if !tls.is_empty() && !addr.scheme.is_tls() {
                return Err(invalid("socket", format!("tls attributes on {addr}")));
            }
            Ok(SocketConf { addr, tls })
        }
    }
}

fn limits(raw: RawLimits) -> ResourceLimits {
    ResourceLimits {
        clients: raw.clients,
        services: raw.services,
        subscriptions: raw.subscriptions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_full_configuration() {
        let config = Config::parse(
            r#"
domains:
  - name: alpha
    sockets:
      - ux:/run/pf/alpha.sock
      - addr: tls:*:4711
        tls:
          cert: /etc/pf/cert.pem
          key: /etc/pf/key.pem
    idle:
      min: 2
      max: 10
    protocol_version:
      min: 3
      max: 3
    notification_delay_ms: 0
  - addrs:
      - tcp:127.0.0.1:4712
resources:
  total:
    clients: 100
  user:
    services: 10
    subscriptions: 5
policy:
  cross_user_unpublish: true
log:
  console: true
  syslog: false
  filter: debug
  log_file: /var/log/pathfinderd.log
  log_file_backup: 3
  log_file_max_size: 65536
"#,
        )
        .expect("config");

        assert_eq!(config.domains.len(), 2);
        let alpha = &config.domains[0];
        assert_eq!(alpha.name.as_deref(), Some("alpha"));
        assert_eq!(alpha.sockets.len(), 2);
        assert_eq!(alpha.idle, IdleLimits { min: 2, max: 10 });
        assert_eq!(alpha.protocol, VersionRange { min: 3, max: 3 });
        assert_eq!(alpha.notification_delay_ms, 0);
        assert!(alpha.sockets[1].tls.cert.is_some());

        // The `addrs` alias and the per-domain defaults.
        let beta = &config.domains[1];
        assert_eq!(beta.idle, IdleLimits::default());
        assert_eq!(beta.notification_delay_ms, DEFAULT_NOTIFICATION_DELAY_MS);

        assert_eq!(config.resources.total.clients, Some(100));
        assert_eq!(config.resources.user.services, Some(10));
        assert!(config.policy.cross_user_unpublish);
        assert!(!config.policy.cross_user_publish);

        assert!(config.log.console);
        assert!(!config.log.syslog);
        assert_eq!(config.log.filter, LogLevel::Debug);
        assert_eq!(config.log.log_file_backup, 3);
    }

    #[test]
    fn empty_configuration_is_all_defaults() {
        let config = Config::parse("{}").expect("config");
        assert!(config.domains.is_empty());
        assert!(config.log.syslog);
        assert_eq!(config.resources.total, ResourceLimits::default());
    }

    #[test]
    fn rejects_bad_idle_range() {
        let err = Config::parse("domains:\n  - sockets: [\"ux:/tmp/x\"]\n    idle: {min: 0}\n")
            .expect_err("idle");
        assert!(matches!(err, ConfigError::Invalid { .. }));

        let err =
            Config::parse("domains:\n  - sockets: [\"ux:/tmp/x\"]\n    idle: {min: 10, max: 5}\n")
                .expect_err("inverted");
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn rejects_out_of_range_protocol_versions() {
        let err = Config::parse(
            "domains:\n  - sockets: [\"ux:/tmp/x\"]\n    protocol_version: {min: 1}\n",
        )
        .expect_err("proto");
        assert!(matches!(err, ConfigError::Invalid { .. }));

        let err = Config::parse(
            "domains:\n  - sockets: [\"ux:/tmp/x\"]\n    protocol_version: {max: 4}\n",
        )
        .expect_err("proto");
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn rejects_tls_attrs_on_plain_sockets() {
        let err = Config::parse(
            "domains:\n  - sockets:\n      - addr: tcp:host:4711\n        tls: {cert: /x}\n",
        )
        .expect_err("tls attrs");
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn rejects_unknown_facility_and_level() {
        assert!(Config::parse("log: {facility: nope}\n").is_err());
        assert!(Config::parse("log: {filter: chatty}\n").is_err());
    }

    #[test]
    fn command_line_domains_replace_configured_ones() {
        let mut config = Config::parse("domains:\n  - sockets: [\"ux:/tmp/a\"]\n").expect("config");
        config
            .set_domains(&[
                vec!["ux:/tmp/b".to_string()],
                vec!["tcp:127.0.0.1:4711".to_string(), "ux:/tmp/c".to_string()],
            ])
            .expect("set");
        assert_eq!(config.domains.len(), 2);
        assert_eq!(config.domains[1].sockets.len(), 2);
    }
}
