//! Daemon configuration with environment variable priority
//!
//! Configuration is resolved in this order (first found wins):
//! 1. Environment variables (SSMTUN_*)
//! 2. Config file (ssmtun.toml)
//! 3. Default values (where applicable)

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use ssmtun_common::{DEFAULT_PORT_RANGE, LOCAL_HOST};

use crate::credentials::{AwsCredentials, SecretRef};
use crate::tracker::{TrackerConfig, DEFAULT_GRACE_PERIOD};

/// Environment variable prefix
const ENV_PREFIX: &str = "SSMTUN";

pub const DEFAULT_CONTROL_PORT: u16 = 4750;

/// Daemon configuration (parsed from TOML, can be overridden by env)
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Port for the local control socket (always bound on 127.0.0.1)
    pub control_port: Option<u16>,

    /// Seconds a launch may run without failing before it counts as ready
    pub grace_period_secs: Option<u64>,

    /// Upper bound on one caller's wait, in seconds (0 or unset waits forever)
    pub wait_timeout_secs: Option<u64>,

    /// Range scanned for free local ports
    pub port_range: Option<(u16, u16)>,

    /// Host reported to callers for ready tunnels
    pub local_host: Option<String>,

    pub aws: Option<AwsConfig>,
}

/// AWS settings
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct AwsConfig {
    /// Region used when a request does not name one
    pub region: Option<String>,

    /// SSM target used when a request does not name one
    pub target: Option<String>,

    pub profile: Option<String>,

    /// Access key (env://, file://, or plain)
    pub access_key: Option<SecretRef>,

    /// Secret key (env://, file://, or plain)
    pub secret_key: Option<SecretRef>,

    /// Session token (env://, file://, or plain)
    pub session_token: Option<SecretRef>,

    pub shared_config_files: Vec<PathBuf>,

    /// AWS CLI executable
    pub cli_path: Option<String>,
}

/// Resolved daemon configuration with actual secret values
#[derive(Debug)]
pub struct ResolvedServerConfig {
    pub control_port: u16,
    pub grace_period: Duration,
    pub wait_timeout: Option<Duration>,
    pub port_range: (u16, u16),
    pub local_host: String,
    pub default_region: Option<String>,
    pub default_target: Option<String>,
    pub cli_path: String,
    pub credentials: AwsCredentials,
}

impl ResolvedServerConfig {
    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            grace_period: self.grace_period,
            wait_timeout: self.wait_timeout,
            local_host: self.local_host.clone(),
        }
    }
}

/// Get environment variable with prefix
fn get_env(name: &str) -> Option<String> {
    env::var(format!("{}_{}", ENV_PREFIX, name)).ok()
}

/// Parse a numeric override, rejecting garbage instead of ignoring it
fn parse_num<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> anyhow::Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(name)
        .map(|v| {
            v.trim()
                .parse()
                .with_context(|| format!("Invalid {}_{}: '{}'", ENV_PREFIX, name, v))
        })
        .transpose()
}

fn resolve_secret(source: Option<SecretRef>, what: &str) -> anyhow::Result<Option<String>> {
    source
        .map(|secret| {
            secret
                .resolve()
                .with_context(|| format!("Failed to resolve {}", what))
        })
        .transpose()
}

impl ServerConfig {
    /// Load configuration from a TOML file; a missing file yields defaults
    pub fn load(path: &str) -> anyhow::Result<Self> {
        if !Path::new(path).exists() {
            tracing::info!("No config file at {}, using defaults", path);
            return Ok(Self::default());
        }

        let content =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path))?;
        let config = toml::from_str(&content).with_context(|| format!("Failed to parse {}", path))?;
        tracing::info!("Loaded config from {}", path);
        Ok(config)
    }

    /// Resolve configuration from environment variables first, then config file
    pub fn resolve(self) -> anyhow::Result<ResolvedServerConfig> {
        self.resolve_with(get_env)
    }

    /// Resolve using `lookup` for the unprefixed environment overrides
    pub fn resolve_with(
        self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<ResolvedServerConfig> {
        // Control port: ENV > config > default 4750
        let control_port = parse_num(&lookup, "CONTROL_PORT")?
            .or(self.control_port)
            .unwrap_or(DEFAULT_CONTROL_PORT);

        let grace_period = parse_num(&lookup, "GRACE_PERIOD_SECS")?
            .or(self.grace_period_secs)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_GRACE_PERIOD);

        let wait_timeout = parse_num::<u64>(&lookup, "WAIT_TIMEOUT_SECS")?
            .or(self.wait_timeout_secs)
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        // Port range: ENV > config > default 16000-26000
        let port_start = parse_num(&lookup, "PORT_RANGE_START")?
            .or(self.port_range.map(|r| r.0))
            .unwrap_or(DEFAULT_PORT_RANGE.0);
        let port_end = parse_num(&lookup, "PORT_RANGE_END")?
            .or(self.port_range.map(|r| r.1))
            .unwrap_or(DEFAULT_PORT_RANGE.1);
        if port_start == 0 || port_start > port_end {
            anyhow::bail!("Invalid port range {}-{}", port_start, port_end);
        }

        let local_host = lookup("LOCAL_HOST")
            .or(self.local_host)
            .unwrap_or_else(|| LOCAL_HOST.to_string());

        let aws = self.aws.unwrap_or_default();

        let default_region = lookup("REGION").or(aws.region);
        let default_target = lookup("TARGET").or(aws.target);
        let cli_path = lookup("AWS_CLI")
            .or(aws.cli_path)
            .unwrap_or_else(|| "aws".to_string());
        let profile = lookup("PROFILE").or(aws.profile);

        let access_key_source = parse_secret(&lookup, "ACCESS_KEY")?.or(aws.access_key);
        let secret_key_source = parse_secret(&lookup, "SECRET_KEY")?.or(aws.secret_key);
        let session_token_source = parse_secret(&lookup, "SESSION_TOKEN")?.or(aws.session_token);

        let credentials = AwsCredentials {
            profile,
            access_key: resolve_secret(access_key_source, "AWS access key")?,
            secret_key: resolve_secret(secret_key_source, "AWS secret key")?,
            session_token: resolve_secret(session_token_source, "AWS session token")?,
            shared_config_files: aws.shared_config_files,
        };

        Ok(ResolvedServerConfig {
            control_port,
            grace_period,
            wait_timeout,
            port_range: (port_start, port_end),
            local_host,
            default_region,
            default_target,
            cli_path,
            credentials,
        })
    }

    /// Load config file and resolve with environment variable overrides
    pub fn load_and_resolve(path: &str) -> anyhow::Result<ResolvedServerConfig> {
        let config = Self::load(path)?;
        config.resolve()
    }
}

fn parse_secret(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> anyhow::Result<Option<SecretRef>> {
    lookup(name)
        .map(|v| {
            v.parse::<SecretRef>()
                .with_context(|| format!("Invalid {}_{}", ENV_PREFIX, name))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn env_of(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn test_env_prefix() {
        assert_eq!(ENV_PREFIX, "SSMTUN");
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default().resolve_with(no_env).unwrap();
        assert_eq!(config.control_port, 4750);
        assert_eq!(config.grace_period, Duration::from_secs(10));
        assert_eq!(config.wait_timeout, None);
        assert_eq!(config.port_range, (16000, 26000));
        assert_eq!(config.local_host, "127.0.0.1");
        assert_eq!(config.cli_path, "aws");
        assert_eq!(config.credentials, AwsCredentials::default());
    }

    #[test]
    fn test_file_overrides_defaults() {
        let config: ServerConfig = toml::from_str(
            r#"
            control_port = 5000
            grace_period_secs = 3
            wait_timeout_secs = 60
            port_range = [20000, 20100]

            [aws]
            region = "eu-west-1"
            target = "i-0abc"
            access_key = "AKIAFILE"
            secret_key = "file-secret"
            "#,
        )
        .unwrap();

        let resolved = config.resolve_with(no_env).unwrap();
        assert_eq!(resolved.control_port, 5000);
        assert_eq!(resolved.grace_period, Duration::from_secs(3));
        assert_eq!(resolved.wait_timeout, Some(Duration::from_secs(60)));
        assert_eq!(resolved.port_range, (20000, 20100));
        assert_eq!(resolved.default_region.as_deref(), Some("eu-west-1"));
        assert_eq!(resolved.default_target.as_deref(), Some("i-0abc"));
        assert_eq!(resolved.credentials.access_key.as_deref(), Some("AKIAFILE"));
    }

    #[test]
    fn test_env_overrides_file() {
        let config: ServerConfig = toml::from_str(
            r#"
            control_port = 5000
            port_range = [20000, 20100]

            [aws]
            region = "eu-west-1"
            access_key = "AKIAFILE"
            "#,
        )
        .unwrap();

        let resolved = config
            .resolve_with(env_of(&[
                ("CONTROL_PORT", "6000"),
                ("PORT_RANGE_END", "20200"),
                ("REGION", "us-east-2"),
                ("ACCESS_KEY", "AKIAENV"),
                ("WAIT_TIMEOUT_SECS", "0"),
            ]))
            .unwrap();

        assert_eq!(resolved.control_port, 6000);
        assert_eq!(resolved.port_range, (20000, 20200));
        assert_eq!(resolved.default_region.as_deref(), Some("us-east-2"));
        assert_eq!(resolved.credentials.access_key.as_deref(), Some("AKIAENV"));
        assert_eq!(resolved.wait_timeout, None);
    }

    #[test]
    fn test_secret_from_file_reference() {
        let mut secret = tempfile::NamedTempFile::new().unwrap();
        writeln!(secret, "wJalrXUtnFEMI").unwrap();
        let reference = format!("file://{}", secret.path().display());

        let resolved = ServerConfig::default()
            .resolve_with(env_of(&[("SECRET_KEY", reference.as_str())]))
            .unwrap();
        assert_eq!(
            resolved.credentials.secret_key.as_deref(),
            Some("wJalrXUtnFEMI")
        );
    }

    #[test]
    fn test_bad_values_rejected() {
        assert!(ServerConfig::default()
            .resolve_with(env_of(&[("CONTROL_PORT", "not-a-port")]))
            .is_err());
        assert!(ServerConfig::default()
            .resolve_with(env_of(&[("PORT_RANGE_START", "30000")]))
            .is_err());
        assert!(ServerConfig::default()
            .resolve_with(env_of(&[("ACCESS_KEY", "env://SSMTUN_DEFINITELY_UNSET_999")]))
            .is_err());
    }

    #[test]
    fn test_load_missing_and_present_file() {
        let config = ServerConfig::load("/definitely/not/ssmtun-12345.toml").unwrap();
        assert!(config.control_port.is_none());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "local_host = \"localhost\"").unwrap();
        let config = ServerConfig::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.local_host.as_deref(), Some("localhost"));

        let mut broken = tempfile::NamedTempFile::new().unwrap();
        writeln!(broken, "control_port = \"nope\"").unwrap();
        assert!(ServerConfig::load(broken.path().to_str().unwrap()).is_err());
    }
}
