//! Configuration for the oplogtail binary
//!
//! Values come from built-in defaults, then a TOML file (`--config <path>` or
//! `~/.oplogtail/config.toml`), then command-line flags.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use oplogtail_engine::{LogPosition, Since, TailOptions};
use oplogtail_store::{ConnectOptions, TlsSettings};

use crate::Args;

/// Host used when none is configured
const DEFAULT_HOST: &str = "localhost";

/// Contents of the config file
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub hosts: Vec<String>,
    pub namespace: Option<String>,
    pub pretty: Option<bool>,
    pub repl_set: Option<String>,
    pub since: Option<String>,
    pub collection: Option<String>,
    pub filter: Option<toml::Table>,
    pub ssl: SslConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SslConfig {
    pub enabled: bool,
    pub ca_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub pem_key_file: Option<PathBuf>,
    pub pem_key_password: Option<String>,
}

impl FileConfig {
    fn default_path() -> Option<PathBuf> {
        let home = dirs::home_dir()?;
        Some(home.join(".oplogtail").join("config.toml"))
    }

    /// Load `path`, or the default file when it exists
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match Self::default_path() {
                Some(path) if path.exists() => path,
                _ => return Ok(Self::default()),
            },
        };

        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }
}

/// Fully resolved settings
#[derive(Debug)]
pub struct Settings {
    pub uri: String,
    pub connect: ConnectOptions,
    pub tail: TailOptions,
}

impl Settings {
    /// Merge the config file with command-line flags
    pub fn resolve(args: Args, file: FileConfig) -> Result<Self> {
        let hosts = if !args.hosts.is_empty() {
            args.hosts
        } else if !file.hosts.is_empty() {
            file.hosts
        } else {
            vec![DEFAULT_HOST.to_string()]
        };
        let uri = format!("mongodb://{}/local", hosts.join(","));

        let since = match args.since.or(file.since) {
            Some(since) => parse_since(&since)?,
            None => Since::Now,
        };

        let filter = match (args.filter, file.filter) {
            (Some(json), _) => Some(
                serde_json::from_str(&json).context("--filter is not a valid JSON document")?,
            ),
            (None, Some(table)) => {
                Some(serde_json::to_value(table).context("config filter is not a document")?)
            }
            (None, None) => None,
        };

        let tls = TlsSettings {
            enabled: args.ssl || file.ssl.enabled,
            ca_file: args.ssl_ca_file.or(file.ssl.ca_file),
            cert_file: args.ssl_cert_file.or(file.ssl.cert_file),
            key_file: args.ssl_pem_key_file.or(file.ssl.pem_key_file),
            key_password: args.ssl_pem_key_password.or(file.ssl.pem_key_password),
        };

        Ok(Self {
            uri,
            connect: ConnectOptions {
                replica_set: args.repl_set.or(file.repl_set),
                tls,
            },
            tail: TailOptions {
                namespace: args.namespace.or(file.namespace),
                pretty: args.pretty || file.pretty.unwrap_or(false),
                since,
                collection: args.collection.or(file.collection),
                filter,
            },
        })
    }
}

/// `last` resumes after the newest entry, anything else is a position
fn parse_since(value: &str) -> Result<Since> {
    if value.eq_ignore_ascii_case("last") {
        return Ok(Since::LastEntry);
    }
    let position: LogPosition = value.parse()?;
    Ok(Since::Position(position))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use serde_json::json;

    fn args(argv: &[&str]) -> Args {
        Args::parse_from(std::iter::once("oplogtail").chain(argv.iter().copied()))
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::resolve(args(&[]), FileConfig::default()).unwrap();
        assert_eq!(settings.uri, "mongodb://localhost/local");
        assert_eq!(settings.tail.since, Since::Now);
        assert!(settings.tail.namespace.is_none());
        assert!(!settings.tail.pretty);
        assert!(!settings.connect.tls.is_enabled());
    }

    #[test]
    fn test_hosts_are_joined() {
        let settings =
            Settings::resolve(args(&["db1:27017", "db2:27017"]), FileConfig::default()).unwrap();
        assert_eq!(settings.uri, "mongodb://db1:27017,db2:27017/local");
    }

    #[test]
    fn test_flags_override_file() {
        let file = FileConfig::parse(
            r#"
            hosts = ["filehost"]
            namespace = "file.*"
            pretty = true
            repl_set = "rs-file"

            [ssl]
            ca_file = "/etc/ssl/ca.pem"
            "#,
        )
        .unwrap();
        let settings = Settings::resolve(
            args(&["--namespace", "cli.users", "--repl-set", "rs0"]),
            file,
        )
        .unwrap();

        assert_eq!(settings.uri, "mongodb://filehost/local");
        assert_eq!(settings.tail.namespace.as_deref(), Some("cli.users"));
        assert!(settings.tail.pretty);
        assert_eq!(settings.connect.replica_set.as_deref(), Some("rs0"));
        assert!(settings.connect.tls.is_enabled());
    }

    #[test]
    fn test_since_values() {
        let settings =
            Settings::resolve(args(&["--since", "1700000000.75"]), FileConfig::default()).unwrap();
        assert_eq!(
            settings.tail.since,
            Since::Position(LogPosition::from_seconds(1_700_000_000))
        );

        let settings =
            Settings::resolve(args(&["--since", "2023-11-14"]), FileConfig::default()).unwrap();
        assert_eq!(
            settings.tail.since,
            Since::Position(LogPosition::from_seconds(1_699_920_000))
        );

        let settings = Settings::resolve(args(&["--since", "last"]), FileConfig::default()).unwrap();
        assert_eq!(settings.tail.since, Since::LastEntry);

        assert!(Settings::resolve(args(&["--since", "soon"]), FileConfig::default()).is_err());
    }

    #[test]
    fn test_filter_sources() {
        let settings =
            Settings::resolve(args(&["--filter", r#"{"op": "i"}"#]), FileConfig::default()).unwrap();
        assert_eq!(settings.tail.filter, Some(json!({"op": "i"})));

        let file = FileConfig::parse("[filter]\nns = \"db.users\"\n").unwrap();
        let settings = Settings::resolve(args(&[]), file).unwrap();
        assert_eq!(settings.tail.filter, Some(json!({"ns": "db.users"})));

        assert!(Settings::resolve(args(&["--filter", "{"]), FileConfig::default()).is_err());
    }

    #[test]
    fn test_any_ssl_option_enables_tls() {
        let settings =
            Settings::resolve(args(&["--ssl-pem-key-file", "/tmp/key.pem"]), FileConfig::default())
                .unwrap();
        assert!(settings.connect.tls.is_enabled());
        assert_eq!(
            settings.connect.tls.key_file,
            Some(PathBuf::from("/tmp/key.pem"))
        );
    }

    #[test]
    fn test_unknown_config_keys_are_rejected() {
        assert!(FileConfig::parse("hostz = []").is_err());
    }

    #[test]
    fn test_missing_explicit_config_is_an_error() {
        assert!(FileConfig::load(Some(Path::new("/nonexistent/oplogtail.toml"))).is_err());
    }
}
