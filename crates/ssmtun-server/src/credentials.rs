//! AWS credentials handed to the session process
//!
//! Secret-bearing settings may be written inline, as `env://VAR_NAME` or as
//! `file:///path/to/file`. They are resolved once at startup and passed to
//! the AWS CLI through its environment.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Deserializer};
use thiserror::Error;

/// Errors that can occur while resolving a secret reference
#[derive(Debug, Error)]
pub enum SecretError {
    #[error("Invalid secret reference '{reference}': {reason}")]
    InvalidReference { reference: String, reason: String },

    #[error("Environment variable '{var}' not set")]
    EnvNotSet { var: String },

    #[error("Failed to read file '{path}': {message}")]
    FileError { path: PathBuf, message: String },
}

/// Where a secret value comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretRef {
    /// Literal value
    Plain(String),
    /// `env://VAR_NAME`
    Env { var_name: String },
    /// `file:///path/to/file`
    File { path: PathBuf },
}

impl SecretRef {
    pub fn backend_name(&self) -> &'static str {
        match self {
            SecretRef::Plain(_) => "plain",
            SecretRef::Env { .. } => "env",
            SecretRef::File { .. } => "file",
        }
    }

    /// Resolve to the secret value, trimming surrounding whitespace
    pub fn resolve(&self) -> Result<String, SecretError> {
        tracing::debug!(backend = self.backend_name(), "Resolving secret");

        let value = match self {
            SecretRef::Plain(value) => value.clone(),
            SecretRef::Env { var_name } => {
                std::env::var(var_name).map_err(|_| SecretError::EnvNotSet {
                    var: var_name.clone(),
                })?
            }
            SecretRef::File { path } => read_secret_file(path)?,
        };
        Ok(value.trim().to_string())
    }
}

fn read_secret_file(path: &Path) -> Result<String, SecretError> {
    std::fs::read_to_string(path).map_err(|e| SecretError::FileError {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

impl FromStr for SecretRef {
    type Err = SecretError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(var_name) = s.strip_prefix("env://") {
            if var_name.is_empty() {
                return Err(invalid(s, "env reference must name a variable"));
            }
            Ok(SecretRef::Env {
                var_name: var_name.to_string(),
            })
        } else if let Some(path) = s.strip_prefix("file://") {
            if path.is_empty() {
                return Err(invalid(s, "file reference must specify a path"));
            }
            Ok(SecretRef::File {
                path: PathBuf::from(path),
            })
        } else {
            Ok(SecretRef::Plain(s.to_string()))
        }
    }
}

fn invalid(reference: &str, reason: &str) -> SecretError {
    SecretError::InvalidReference {
        reference: reference.to_string(),
        reason: reason.to_string(),
    }
}

impl<'de> Deserialize<'de> for SecretRef {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        SecretRef::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Resolved AWS credential settings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwsCredentials {
    pub profile: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub session_token: Option<String>,
    pub shared_config_files: Vec<PathBuf>,
}

impl AwsCredentials {
    /// Environment for the AWS CLI process.
    ///
    /// Shared config files win over static keys, which win over whatever the
    /// daemon's own environment provides. Static keys only apply when both the
    /// access key and the secret key are set.
    pub fn child_env(&self) -> Vec<(&'static str, String)> {
        let mut env = Vec::new();

        if let Some((first, rest)) = self.shared_config_files.split_first() {
            if !rest.is_empty() {
                tracing::warn!(
                    "Only the first shared config file is used ({}), ignoring {} more",
                    first.display(),
                    rest.len()
                );
            }
            env.push(("AWS_CONFIG_FILE", first.display().to_string()));
            env.push((
                "AWS_PROFILE",
                self.profile.clone().unwrap_or_else(|| "default".to_string()),
            ));
            return env;
        }

        if let (Some(access_key), Some(secret_key)) = (&self.access_key, &self.secret_key) {
            env.push(("AWS_ACCESS_KEY_ID", access_key.clone()));
            env.push(("AWS_SECRET_ACCESS_KEY", secret_key.clone()));
            if let Some(token) = &self.session_token {
                env.push(("AWS_SESSION_TOKEN", token.clone()));
            }
            return env;
        }

        if let Some(profile) = &self.profile {
            env.push(("AWS_PROFILE", profile.clone()));
        }
        env
    }

    /// Short description for startup logs; never includes secret values
    pub fn source(&self) -> &'static str {
        if !self.shared_config_files.is_empty() {
            "shared config file"
        } else if self.access_key.is_some() && self.secret_key.is_some() {
            "static keys"
        } else {
            "ambient environment"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_references() {
        assert_eq!(
            "env://AWS_SECRET".parse::<SecretRef>().unwrap(),
            SecretRef::Env {
                var_name: "AWS_SECRET".to_string()
            }
        );
        assert_eq!(
            "file:///run/secrets/aws".parse::<SecretRef>().unwrap(),
            SecretRef::File {
                path: PathBuf::from("/run/secrets/aws")
            }
        );
        assert_eq!(
            "AKIAEXAMPLE".parse::<SecretRef>().unwrap(),
            SecretRef::Plain("AKIAEXAMPLE".to_string())
        );
    }

    #[test]
    fn test_empty_references_rejected() {
        assert!("env://".parse::<SecretRef>().is_err());
        assert!("file://".parse::<SecretRef>().is_err());
    }

    #[test]
    fn test_resolve_env() {
        std::env::set_var("SSMTUN_TEST_SECRET_KEY", "from-env\n");
        let secret: SecretRef = "env://SSMTUN_TEST_SECRET_KEY".parse().unwrap();
        assert_eq!(secret.resolve().unwrap(), "from-env");
        std::env::remove_var("SSMTUN_TEST_SECRET_KEY");

        let missing: SecretRef = "env://SSMTUN_DEFINITELY_UNSET_12345".parse().unwrap();
        assert!(matches!(
            missing.resolve(),
            Err(SecretError::EnvNotSet { .. })
        ));
    }

    #[test]
    fn test_resolve_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "from-file").unwrap();

        let secret = SecretRef::File {
            path: file.path().to_path_buf(),
        };
        assert_eq!(secret.resolve().unwrap(), "from-file");

        let missing = SecretRef::File {
            path: PathBuf::from("/definitely/not/a/real/path/12345"),
        };
        assert!(matches!(
            missing.resolve(),
            Err(SecretError::FileError { .. })
        ));
    }

    #[test]
    fn test_deserialize_from_toml() {
        #[derive(Deserialize)]
        struct Holder {
            key: SecretRef,
        }
        let holder: Holder = toml::from_str(r#"key = "env://KEY""#).unwrap();
        assert_eq!(
            holder.key,
            SecretRef::Env {
                var_name: "KEY".to_string()
            }
        );
    }

    #[test]
    fn test_shared_config_wins() {
        let creds = AwsCredentials {
            profile: None,
            access_key: Some("AKIA".to_string()),
            secret_key: Some("secret".to_string()),
            session_token: None,
            shared_config_files: vec![PathBuf::from("/a/config"), PathBuf::from("/b/config")],
        };
        assert_eq!(
            creds.child_env(),
            vec![
                ("AWS_CONFIG_FILE", "/a/config".to_string()),
                ("AWS_PROFILE", "default".to_string()),
            ]
        );
        assert_eq!(creds.source(), "shared config file");
    }

    #[test]
    fn test_static_keys_need_both_halves() {
        let only_access = AwsCredentials {
            access_key: Some("AKIA".to_string()),
            ..AwsCredentials::default()
        };
        assert!(only_access.child_env().is_empty());
        assert_eq!(only_access.source(), "ambient environment");

        let both = AwsCredentials {
            access_key: Some("AKIA".to_string()),
            secret_key: Some("secret".to_string()),
            session_token: Some("token".to_string()),
            ..AwsCredentials::default()
        };
        assert_eq!(
            both.child_env(),
            vec![
                ("AWS_ACCESS_KEY_ID", "AKIA".to_string()),
                ("AWS_SECRET_ACCESS_KEY", "secret".to_string()),
                ("AWS_SESSION_TOKEN", "token".to_string()),
            ]
        );
    }

    #[test]
    fn test_ambient_profile() {
        let creds = AwsCredentials {
            profile: Some("staging".to_string()),
            ..AwsCredentials::default()
        };
        assert_eq!(
            creds.child_env(),
            vec![("AWS_PROFILE", "staging".to_string())]
        );
    }
}
