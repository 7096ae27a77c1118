//! Configuration management for the marketplace consumer process.
//!
//! Loads configuration from environment variables (and a `.env` file when
//! present). Startup fails on missing or malformed values instead of falling
//! back silently.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use ticketbus_core::{
    ConsumerGroupIdentity, DEFAULT_ACK_WAIT, DEFAULT_MAX_IN_FLIGHT, InvalidIdentity, QueueGroup,
};
use ticketbus_runtime::DEFAULT_PUBLISH_TIMEOUT;

/// Errors raised while loading [`Config`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required variable is not set.
    #[error("{key} is not defined")]
    Missing {
        /// Environment variable name
        key: &'static str,
    },

    /// A variable is set but cannot be parsed.
    #[error("{key}={value:?} is invalid: {reason}")]
    Invalid {
        /// Environment variable name
        key: &'static str,
        /// Raw value
        value: String,
        /// Parse failure
        reason: String,
    },

    /// Cluster id, client id or queue group is blank.
    #[error(transparent)]
    Identity(#[from] InvalidIdentity),
}

/// Application configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Broker connection
    pub broker: BrokerConfig,
    /// Subscription settings shared by the ticket listeners
    pub listener: ListenerConfig,
    /// `PostgreSQL` URL for ticket replicas; in-memory replicas when unset
    pub database_url: Option<String>,
    /// Prometheus endpoint address; no exporter when unset
    pub metrics_addr: Option<SocketAddr>,
    /// Tracing filter directive
    pub log_level: String,
    /// Time allowed for listeners to drain on shutdown
    pub shutdown_timeout: Duration,
}

/// Broker connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Bootstrap servers (`BROKER_URL`)
    pub url: String,
    /// Cluster namespace (`BROKER_CLUSTER_ID`)
    pub cluster_id: String,
    /// Per-process client id (`BROKER_CLIENT_ID`)
    pub client_id: String,
    /// Producer acknowledgment mode (`PRODUCER_ACKS`)
    pub producer_acks: String,
    /// Publish confirmation deadline (`PUBLISH_TIMEOUT_MS`)
    pub publish_timeout: Duration,
}

/// Subscription settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerConfig {
    /// Queue group of this service (`QUEUE_GROUP`)
    pub queue_group: QueueGroup,
    /// Ack deadline (`ACK_WAIT_SECS`)
    pub ack_wait: Duration,
    /// Deliveries handled concurrently per listener (`MAX_IN_FLIGHT`)
    pub max_in_flight: usize,
}

impl Config {
    /// Load configuration from the process environment.
    ///
    /// Reads `.env` first if one exists; real environment variables win.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a required variable is missing or any value
    /// is malformed.
    pub fn from_env() -> Result<Self, ConfigError> {
        // A missing .env file is the normal case in containers.
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a required variable is missing or any value
    /// is malformed.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let url = get("BROKER_URL").ok_or(ConfigError::Missing { key: "BROKER_URL" })?;
        let queue_group = get("QUEUE_GROUP").unwrap_or_else(|| QueueGroup::ORDERS_SERVICE.to_string());
        let client_id = get("BROKER_CLIENT_ID")
            .unwrap_or_else(|| ConsumerGroupIdentity::unique_client_id(&queue_group));

        let config = Self {
            broker: BrokerConfig {
                url,
                cluster_id: get("BROKER_CLUSTER_ID").unwrap_or_else(|| "ticketing".to_string()),
                client_id,
                producer_acks: parse_acks(get("PRODUCER_ACKS"))?,
                publish_timeout: parse_or("PUBLISH_TIMEOUT_MS", get("PUBLISH_TIMEOUT_MS"), DEFAULT_PUBLISH_TIMEOUT, Duration::from_millis)?,
            },
            listener: ListenerConfig {
                queue_group: QueueGroup::new(queue_group),
                ack_wait: parse_or("ACK_WAIT_SECS", get("ACK_WAIT_SECS"), DEFAULT_ACK_WAIT, Duration::from_secs)?,
                max_in_flight: parse_or("MAX_IN_FLIGHT", get("MAX_IN_FLIGHT"), DEFAULT_MAX_IN_FLIGHT, |n: usize| n)?,
            },
            database_url: get("DATABASE_URL"),
            metrics_addr: get("METRICS_ADDR")
                .map(|value| parse("METRICS_ADDR", &value))
                .transpose()?,
            log_level: get("RUST_LOG").unwrap_or_else(|| "info".to_string()),
            shutdown_timeout: parse_or(
                "SHUTDOWN_TIMEOUT_SECS",
                get("SHUTDOWN_TIMEOUT_SECS"),
                Duration::from_secs(10),
                Duration::from_secs,
            )?,
        };

        if config.listener.ack_wait.is_zero() {
            return Err(ConfigError::Invalid {
                key: "ACK_WAIT_SECS",
                value: "0".to_string(),
                reason: "must be at least one second".to_string(),
            });
        }
        if config.listener.max_in_flight == 0 {
            return Err(ConfigError::Invalid {
                key: "MAX_IN_FLIGHT",
                value: "0".to_string(),
                reason: "must be at least one".to_string(),
            });
        }
        config.identity()?;
        Ok(config)
    }

    /// Identity of this process on the broker.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Identity`] if a field is blank.
    pub fn identity(&self) -> Result<ConsumerGroupIdentity, ConfigError> {
        Ok(ConsumerGroupIdentity::new(
            self.broker.cluster_id.clone(),
            self.broker.client_id.clone(),
            self.listener.queue_group.clone(),
        )?)
    }
}

fn parse<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_or<T, U>(
    key: &'static str,
    value: Option<String>,
    default: U,
    convert: impl FnOnce(T) -> U,
) -> Result<U, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.map_or(Ok(default), |value| parse(key, &value).map(convert))
}

fn parse_acks(value: Option<String>) -> Result<String, ConfigError> {
    match value.as_deref().map(str::trim) {
        None => Ok("all".to_string()),
        Some(acks @ ("1" | "all")) => Ok(acks.to_string()),
        Some(other) => Err(ConfigError::Invalid {
            key: "PRODUCER_ACKS",
            value: other.to_string(),
            reason: "expected \"1\" or \"all\"".to_string(),
        }),
    }
}
