//! Configuration management for ratewarden.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::allowance::{DEFAULT_ALLOWANCE, DEFAULT_CACHE_KEY_PREFIX};
use crate::error::{RateLimiterError, Result};
use crate::ratelimit::{RateLimitDefinition, RateLimitSet, DEFAULT_IDENTITY};

/// Prefix of environment variables overriding file configuration,
/// e.g. `RATEWARDEN__LIMITER__IDENTITY=edge`.
pub const ENV_PREFIX: &str = "RATEWARDEN";

/// Main configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RatewardenConfig {
    /// Engine configuration
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Named rate limit definitions
    #[serde(default)]
    pub definitions: BTreeMap<String, DefinitionConfig>,

    /// Built-in observers
    #[serde(default)]
    pub handlers: HandlersConfig,
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Engine identity, the first component of every scope key
    #[serde(default = "default_identity")]
    pub identity: String,

    /// Owner tag for requests that do not carry one
    #[serde(default)]
    pub owner: Option<String>,

    /// Prefix of allowance cache keys
    #[serde(default = "default_cache_key_prefix")]
    pub cache_key_prefix: String,

    /// Allowance reported for scopes that have never been seen
    #[serde(default = "default_allowance")]
    pub default_allowance: i64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            identity: default_identity(),
            owner: None,
            cache_key_prefix: default_cache_key_prefix(),
            default_allowance: default_allowance(),
        }
    }
}

fn default_identity() -> String {
    DEFAULT_IDENTITY.to_string()
}

fn default_cache_key_prefix() -> String {
    DEFAULT_CACHE_KEY_PREFIX.to_string()
}

fn default_allowance() -> i64 {
    DEFAULT_ALLOWANCE
}

/// One rate limit as written in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefinitionConfig {
    /// Allowed hits per window
    pub limit: u64,

    /// Window duration in seconds
    pub window: u64,

    /// Where the bucket identifier comes from; global bucket when unset
    #[serde(default)]
    pub identifier: Option<IdentifierConfig>,

    /// Whether the limit is checked at all
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

/// Source of a bucket identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "from", rename_all = "snake_case")]
pub enum IdentifierConfig {
    /// A fixed identifier
    Constant { value: String },
    /// A request attribute, e.g. `ip`
    Attribute { name: String },
    /// The acting principal
    Principal,
}

impl DefinitionConfig {
    /// Validate and convert into a definition.
    pub fn into_definition(self) -> Result<RateLimitDefinition> {
        let definition =
            RateLimitDefinition::new(self.limit, self.window)?.with_active(self.active);

        Ok(match self.identifier {
            None => definition,
            Some(IdentifierConfig::Constant { value }) => definition.with_identifier(value),
            Some(IdentifierConfig::Attribute { name }) => definition
                .with_identifier_fn(move |ctx, _| ctx.attribute(&name).map(str::to_string)),
            Some(IdentifierConfig::Principal) => {
                definition.with_identifier_fn(|ctx, _| ctx.principal().map(str::to_string))
            }
        })
    }
}

/// Configuration of the built-in observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlersConfig {
    /// Prefixes of the limit/remaining/reset headers; empty disables them
    #[serde(default = "default_header_prefixes")]
    pub header_prefixes: Vec<String>,

    /// Name of the retry-after header; unset disables it
    #[serde(default = "default_retry_after_header")]
    pub retry_after_header: Option<String>,

    /// Reject the operation with an error when a limit is exceeded
    #[serde(default = "default_reject")]
    pub reject: bool,

    /// Message of the rejection error
    #[serde(default = "default_reject_message")]
    pub reject_message: String,
}

impl Default for HandlersConfig {
    fn default() -> Self {
        Self {
            header_prefixes: default_header_prefixes(),
            retry_after_header: default_retry_after_header(),
            reject: default_reject(),
            reject_message: default_reject_message(),
        }
    }
}

fn default_header_prefixes() -> Vec<String> {
    vec!["X-Rate-Limit-".to_string()]
}

fn default_retry_after_header() -> Option<String> {
    Some("Retry-After".to_string())
}

fn default_reject() -> bool {
    true
}

fn default_reject_message() -> String {
    "Rate limit exceeded.".to_string()
}

impl RatewardenConfig {
    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: RatewardenConfig = serde_yaml::from_str(yaml).map_err(|e| {
            RateLimiterError::Config(format!("Failed to parse configuration: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file, with `RATEWARDEN__*` environment
    /// variables taking precedence.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit configuration");

        let config: RatewardenConfig = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| {
                RateLimiterError::Config(format!("Failed to load {}: {}", path.display(), e))
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Check every definition without building anything.
    pub fn validate(&self) -> Result<()> {
        if self.limiter.identity.is_empty() {
            return Err(RateLimiterError::Config("limiter identity must not be empty".to_string()));
        }
        for (name, definition) in &self.definitions {
            RateLimitDefinition::new(definition.limit, definition.window).map_err(|e| {
                RateLimiterError::Config(format!("rate limit `{}`: {}", name, e))
            })?;
        }
        Ok(())
    }

    /// Build the configured rate limit set.
    pub fn rate_limit_set(&self) -> Result<RateLimitSet> {
        let mut set = RateLimitSet::new();
        for (name, definition) in &self.definitions {
            set.insert(name.clone(), definition.clone().into_definition()?);
        }
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{Context, LimitEntry};

    const YAML: &str = r#"
limiter:
  identity: edge
  owner: api
definitions:
  ip:
    limit: 100
    window: 7200
    identifier:
      from: attribute
      name: ip
  user:
    limit: 1000
    window: 3600
    identifier:
      from: principal
  admin:
    limit: 10
    window: 60
    active: false
handlers:
  header_prefixes: ["X-Rate-Limit-", "X-RateLimit-"]
  reject: false
"#;

    fn definition<'a>(set: &'a RateLimitSet, name: &str) -> &'a RateLimitDefinition {
        match set.get(name) {
            Some(LimitEntry::Definition(def)) => def,
            other => panic!("unexpected entry for {}: {:?}", name, other),
        }
    }

    #[test]
    fn test_defaults() {
        let config = RatewardenConfig::default();
        assert_eq!(config.limiter.identity, "ratewarden");
        assert_eq!(config.limiter.cache_key_prefix, "allowance");
        assert_eq!(config.limiter.default_allowance, i64::MAX);
        assert_eq!(config.handlers.header_prefixes, vec!["X-Rate-Limit-"]);
        assert_eq!(config.handlers.retry_after_header.as_deref(), Some("Retry-After"));
        assert!(config.handlers.reject);
        assert!(config.definitions.is_empty());
    }

    #[test]
    fn test_parse_yaml() {
        let config = RatewardenConfig::from_yaml(YAML).unwrap();

        assert_eq!(config.limiter.identity, "edge");
        assert_eq!(config.limiter.owner.as_deref(), Some("api"));
        assert_eq!(config.definitions.len(), 3);
        assert_eq!(
            config.definitions["ip"].identifier,
            Some(IdentifierConfig::Attribute { name: "ip".to_string() })
        );
        assert!(!config.definitions["admin"].active);
        assert!(!config.handlers.reject);
        assert_eq!(config.handlers.reject_message, "Rate limit exceeded.");
    }

    #[test]
    fn test_build_rate_limit_set() {
        let set = RatewardenConfig::from_yaml(YAML).unwrap().rate_limit_set().unwrap();
        let ctx = Context::new()
            .with_attribute("ip", "10.0.0.1")
            .with_principal("42");

        let ip = definition(&set, "ip");
        assert_eq!(ip.capacity(), 100);
        assert_eq!(ip.resolve_identifier(&ctx, "ip"), Some("10.0.0.1".to_string()));

        let user = definition(&set, "user");
        assert_eq!(user.resolve_identifier(&ctx, "user"), Some("42".to_string()));
        assert_eq!(user.resolve_identifier(&Context::new(), "user"), None);

        assert!(!definition(&set, "admin").is_active(&ctx, "admin"));
    }

    #[test]
    fn test_zero_limit_fails_fast() {
        let yaml = r#"
definitions:
  broken:
    limit: 0
    window: 60
"#;
        let err = RatewardenConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, RateLimiterError::Config(ref msg) if msg.contains("broken")));
    }

    #[test]
    fn test_malformed_yaml() {
        let err = RatewardenConfig::from_yaml("definitions: [").unwrap_err();
        assert!(matches!(err, RateLimiterError::Config(_)));
    }

    #[test]
    fn test_from_file() {
        let file = format!("ratewarden-config-{}.yaml", std::process::id());
        let path = std::env::temp_dir().join(file);
        std::fs::write(&path, YAML).unwrap();

        let config = RatewardenConfig::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.definitions["user"].limit, 1000);
        assert_eq!(config.definitions["ip"].window, 7200);
    }

    #[test]
    fn test_environment_overrides_file() {
        let file = format!("ratewarden-env-{}.yaml", std::process::id());
        let path = std::env::temp_dir().join(file);
        std::fs::write(&path, YAML).unwrap();

        std::env::set_var("RATEWARDEN__LIMITER__IDENTITY", "from-env");
        let loaded = RatewardenConfig::from_file(&path);
        std::env::remove_var("RATEWARDEN__LIMITER__IDENTITY");
        std::fs::remove_file(&path).unwrap();

        let config = loaded.unwrap();
        assert_eq!(config.limiter.identity, "from-env");
        assert_eq!(config.limiter.owner.as_deref(), Some("api"));
        assert_eq!(config.definitions["user"].limit, 1000);
    }
}
