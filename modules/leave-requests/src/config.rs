use std::env;
use std::str::FromStr;
use std::time::Duration;

use event_bus::RetryPolicy;

use crate::services::approval_policy::DEFAULT_MAX_AUTO_APPROVE_DAYS;

/// Application configuration parsed from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bus_type: String,
    pub rabbitmq_url: String,
    pub host: String,
    pub port: u16,
    pub consumer_prefetch: u16,
    pub auto_approve_max_days: i64,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub idempotency_ttl: Duration,
    pub idempotency_sweep_interval: Duration,
}

fn parse_or<T: FromStr>(name: &str, default: T) -> Result<T, String> {
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| format!("{} must be a valid {}", name, std::any::type_name::<T>())),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let database_url = env::var("DATABASE_URL")
            .map_err(|_| "DATABASE_URL must be set".to_string())?;

        let bus_type = env::var("BUS_TYPE")
            .unwrap_or_else(|_| "amqp".to_string());

        let rabbitmq_url = env::var("RABBITMQ_URL")
            .unwrap_or_else(|_| "amqp://localhost:5672".to_string());

        let host = env::var("HOST")
            .unwrap_or_else(|_| "0.0.0.0".to_string());

        let port: u16 = parse_or("PORT", 8095)?;
        let consumer_prefetch: u16 = parse_or("CONSUMER_PREFETCH", 10)?;
        let auto_approve_max_days: i64 =
            parse_or("AUTO_APPROVE_MAX_DAYS", DEFAULT_MAX_AUTO_APPROVE_DAYS)?;
        let max_retries: u32 = parse_or("MAX_RETRIES", 3)?;
        let retry_backoff_ms: u64 = parse_or("RETRY_BACKOFF_MS", 100)?;
        let idempotency_ttl_secs: u64 = parse_or("IDEMPOTENCY_TTL_SECS", 24 * 60 * 60)?;
        let idempotency_sweep_secs: u64 = parse_or("IDEMPOTENCY_SWEEP_SECS", 300)?;

        if idempotency_sweep_secs == 0 {
            return Err("IDEMPOTENCY_SWEEP_SECS must be greater than 0".to_string());
        }

        Ok(Config {
            database_url,
            bus_type,
            rabbitmq_url,
            host,
            port,
            consumer_prefetch,
            auto_approve_max_days,
            max_retries,
            retry_backoff: Duration::from_millis(retry_backoff_ms),
            idempotency_ttl: Duration::from_secs(idempotency_ttl_secs),
            idempotency_sweep_interval: Duration::from_secs(idempotency_sweep_secs),
        })
    }

    /// Requeue policy derived from `MAX_RETRIES` and `RETRY_BACKOFF_MS`
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_backoff: self.retry_backoff,
            ..RetryPolicy::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "DATABASE_URL",
        "BUS_TYPE",
        "RABBITMQ_URL",
        "PORT",
        "CONSUMER_PREFETCH",
        "AUTO_APPROVE_MAX_DAYS",
        "MAX_RETRIES",
        "RETRY_BACKOFF_MS",
        "IDEMPOTENCY_TTL_SECS",
        "IDEMPOTENCY_SWEEP_SECS",
    ];

    fn clear() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear();
        env::set_var("DATABASE_URL", "postgres://localhost/leave");

        let config = Config::from_env().unwrap();
        assert_eq!(config.bus_type, "amqp");
        assert_eq!(config.rabbitmq_url, "amqp://localhost:5672");
        assert_eq!(config.port, 8095);
        assert_eq!(config.auto_approve_max_days, 2);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.idempotency_ttl, Duration::from_secs(86_400));
        assert_eq!(config.retry_policy().max_retries, 3);
        assert_eq!(config.retry_policy().initial_backoff, Duration::from_millis(100));
        clear();
    }

    #[test]
    #[serial]
    fn test_missing_database_url() {
        clear();
        assert!(Config::from_env().is_err());
    }

    #[test]
    #[serial]
    fn test_invalid_number_is_reported() {
        clear();
        env::set_var("DATABASE_URL", "postgres://localhost/leave");
        env::set_var("MAX_RETRIES", "three");

        let err = Config::from_env().unwrap_err();
        assert!(err.contains("MAX_RETRIES"));
        clear();
    }

    #[test]
    #[serial]
    fn test_overrides() {
        clear();
        env::set_var("DATABASE_URL", "postgres://localhost/leave");
        env::set_var("BUS_TYPE", "inmemory");
        env::set_var("AUTO_APPROVE_MAX_DAYS", "5");
        env::set_var("CONSUMER_PREFETCH", "1");

        let config = Config::from_env().unwrap();
        assert_eq!(config.bus_type, "inmemory");
        assert_eq!(config.auto_approve_max_days, 5);
        assert_eq!(config.consumer_prefetch, 1);
        clear();
    }
}
