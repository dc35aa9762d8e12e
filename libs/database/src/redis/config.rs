#[cfg(feature = "config")]
use core_config::{ConfigError, FromEnv, env_first};

/// Redis connection settings
#[derive(Clone, Debug)]
pub struct RedisConfig {
    pub url: String,
}

impl RedisConfig {
    /// Accepts a full `redis://` / `rediss://` URL or a bare `host[:port]`.
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        let url = if url.contains("://") {
            url
        } else {
            format!("redis://{url}")
        };
        Self { url }
    }

    /// Connection used for publishing, from `WRITER_REDIS_URL`, else a copy of `reader`.
    #[cfg(feature = "config")]
    pub fn writer_from_env(reader: &RedisConfig) -> Self {
        std::env::var("WRITER_REDIS_URL")
            .map(Self::new)
            .unwrap_or_else(|_| reader.clone())
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self::new("redis://127.0.0.1:6379")
    }
}

/// `REDIS_URL`, falling back to `REDIS_HOST`
#[cfg(feature = "config")]
impl FromEnv for RedisConfig {
    fn from_env() -> Result<Self, ConfigError> {
        env_first(&["REDIS_URL", "REDIS_HOST"])
            .map(Self::new)
            .ok_or_else(|| ConfigError::MissingEnvVar("REDIS_URL or REDIS_HOST".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_host_gets_scheme() {
        assert_eq!(RedisConfig::new("cache:6380").url, "redis://cache:6380");
        assert_eq!(
            RedisConfig::new("rediss://secure:6379").url,
            "rediss://secure:6379"
        );
    }

    #[cfg(feature = "config")]
    #[test]
    fn test_from_env_host_fallback() {
        temp_env::with_vars([("REDIS_URL", None), ("REDIS_HOST", Some("redis-svc"))], || {
            assert_eq!(RedisConfig::from_env().unwrap().url, "redis://redis-svc");
        });
    }

    #[cfg(feature = "config")]
    #[test]
    fn test_from_env_missing() {
        temp_env::with_vars_unset(["REDIS_URL", "REDIS_HOST"], || {
            assert!(RedisConfig::from_env().is_err());
        });
    }

    #[cfg(feature = "config")]
    #[test]
    fn test_writer_falls_back_to_reader() {
        let reader = RedisConfig::new("redis://reader:6379");
        temp_env::with_var_unset("WRITER_REDIS_URL", || {
            assert_eq!(RedisConfig::writer_from_env(&reader).url, reader.url);
        });
        temp_env::with_var("WRITER_REDIS_URL", Some("redis://writer:6379"), || {
            assert_eq!(
                RedisConfig::writer_from_env(&reader).url,
                "redis://writer:6379"
            );
        });
    }
}
