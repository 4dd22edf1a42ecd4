// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::ServicesError;
use std::collections::HashSet;
use std::env;
use std::str::FromStr;
use uuid::Uuid;

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Configuration for the event log service.
#[derive(Debug, Clone)]
pub struct EventLogConfig {
    /// Address every listener binds to
    pub bind_ip: String,
    /// Length-delimited TCP stream of operation logs
    pub event_log_port: u16,
    /// Length-delimited TCP stream of container log frames
    pub docker_log_port: u16,
    /// WebSocket and HTTP control plane
    pub web_port: u16,
    /// Replication endpoint peers subscribe to
    pub cluster_pub_port: u16,
    /// UDP monitor samples
    pub monitor_udp_port: u16,
    /// Messages accepted per operation before the rest are dropped
    pub message_max_number: u64,
    /// Operation-log lines buffered per barrel before a flush
    pub message_cache_number: usize,
    /// Container-log lines buffered per barrel before a flush
    pub docker_cache_number: usize,
    pub handle_message_workers: usize,
    pub handle_sub_workers: usize,
    pub handle_docker_workers: usize,
    pub log_home: String,
    pub garbage_file: String,
    pub event_retention_days: i64,
    pub service_retention_days: i64,
    /// Keepalive deadline of WebSocket clients, pushed out by each pong
    pub websocket_timeout_secs: u64,
    /// Deadline for a WebSocket client's first frame and first pong
    pub websocket_handshake_timeout_secs: u64,
    pub metrics_path: String,
    pub cluster_mode: bool,
    pub etcd_endpoints: Vec<String>,
    pub etcd_home: String,
    pub host_ip: String,
    pub host_id: String,
    pub host_name: String,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            bind_ip: "0.0.0.0".to_string(),
            event_log_port: 6366,
            docker_log_port: 6362,
            web_port: 6363,
            cluster_pub_port: 6365,
            monitor_udp_port: 6166,
            message_max_number: 100_000,
            message_cache_number: 256,
            docker_cache_number: 512,
            handle_message_workers: 2,
            handle_sub_workers: 3,
            handle_docker_workers: 2,
            log_home: "/grdata/logs/".to_string(),
            garbage_file: "/var/log/envent_garbage_message.log".to_string(),
            event_retention_days: 3,
            service_retention_days: 7,
            websocket_timeout_secs: 60,
            websocket_handshake_timeout_secs: 60,
            metrics_path: "/metrics".to_string(),
            cluster_mode: false,
            etcd_endpoints: vec!["http://127.0.0.1:2379".to_string()],
            etcd_home: "/event".to_string(),
            host_ip: "127.0.0.1".to_string(),
            host_id: Uuid::new_v4().to_string(),
            host_name: "localhost".to_string(),
            log_level: "info".to_string(),
        }
    }
}

fn var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse<T: FromStr>(key: &str, default: T) -> Result<T, ServicesError> {
    match var(key) {
        Some(value) => value.trim().parse().map_err(|_| {
            ServicesError::InvalidConfig(format!("{} has an invalid value '{}'", key, value))
        }),
        None => Ok(default),
    }
}

impl EventLogConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ServicesError> {
        let defaults = Self::default();
        let config = Self {
            bind_ip: var("EVENTLOG_BIND_IP").unwrap_or(defaults.bind_ip),
            event_log_port: parse("EVENTLOG_EVENT_LOG_PORT", defaults.event_log_port)?,
            docker_log_port: parse("EVENTLOG_DOCKER_LOG_PORT", defaults.docker_log_port)?,
            web_port: parse("EVENTLOG_WEB_PORT", defaults.web_port)?,
            cluster_pub_port: parse("EVENTLOG_CLUSTER_PUB_PORT", defaults.cluster_pub_port)?,
            monitor_udp_port: parse("EVENTLOG_MONITOR_PORT", defaults.monitor_udp_port)?,
            message_max_number: parse("EVENTLOG_MESSAGE_MAX_NUMBER", defaults.message_max_number)?,
            message_cache_number: parse(
                "EVENTLOG_MESSAGE_CACHE_NUMBER",
                defaults.message_cache_number,
            )?,
            docker_cache_number: parse(
                "EVENTLOG_DOCKER_CACHE_NUMBER",
                defaults.docker_cache_number,
            )?,
            handle_message_workers: parse(
                "EVENTLOG_HANDLE_MESSAGE_CORES",
                defaults.handle_message_workers,
            )?,
            handle_sub_workers: parse("EVENTLOG_HANDLE_SUB_CORES", defaults.handle_sub_workers)?,
            handle_docker_workers: parse(
                "EVENTLOG_HANDLE_DOCKER_CORES",
                defaults.handle_docker_workers,
            )?,
            log_home: var("EVENTLOG_LOG_HOME").unwrap_or(defaults.log_home),
            garbage_file: var("EVENTLOG_GARBAGE_FILE").unwrap_or(defaults.garbage_file),
            event_retention_days: parse("EVENT_LOG_RETENTION_DAYS", defaults.event_retention_days)?,
            service_retention_days: parse("DOCKER_LOG_SAVE_DAY", defaults.service_retention_days)?,
            websocket_timeout_secs: parse(
                "EVENTLOG_WEBSOCKET_TIMEOUT",
                defaults.websocket_timeout_secs,
            )?,
            websocket_handshake_timeout_secs: parse(
                "EVENTLOG_WEBSOCKET_HANDSHAKE_TIMEOUT",
                defaults.websocket_handshake_timeout_secs,
            )?,
            metrics_path: var("EVENTLOG_METRICS_PATH").unwrap_or(defaults.metrics_path),
            cluster_mode: var("EVENTLOG_CLUSTER_MODE")
                .map(|val| val.to_lowercase() == "true")
                .unwrap_or(defaults.cluster_mode),
            etcd_endpoints: var("EVENTLOG_ETCD_ENDPOINTS")
                .map(|val| {
                    val.split(',')
                        .map(str::trim)
                        .filter(|endpoint| !endpoint.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or(defaults.etcd_endpoints),
            etcd_home: var("EVENTLOG_ETCD_HOME").unwrap_or(defaults.etcd_home),
            host_ip: var("EVENTLOG_HOST_IP").unwrap_or(defaults.host_ip),
            host_id: var("EVENTLOG_HOST_ID").unwrap_or(defaults.host_id),
            host_name: var("HOSTNAME").unwrap_or(defaults.host_name),
            log_level: var("EVENTLOG_LOG_LEVEL")
                .map(|val| val.to_lowercase())
                .unwrap_or(defaults.log_level),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ServicesError> {
        let ports = [
            ("event log", self.event_log_port),
            ("docker log", self.docker_log_port),
            ("web", self.web_port),
            ("cluster pub", self.cluster_pub_port),
            ("monitor", self.monitor_udp_port),
        ];
        let mut seen = HashSet::new();
        for (name, port) in ports {
            if port == 0 {
                return Err(ServicesError::InvalidConfig(format!(
                    "{} port must be greater than 0",
                    name
                )));
            }
            if !seen.insert(port) {
                return Err(ServicesError::InvalidConfig(format!(
                    "{} port {} is already used by another listener",
                    name, port
                )));
            }
        }

        if self.handle_message_workers == 0
            || self.handle_sub_workers == 0
            || self.handle_docker_workers == 0
        {
            return Err(ServicesError::InvalidConfig(
                "worker counts must be greater than 0".to_string(),
            ));
        }

        if self.message_cache_number == 0 || self.docker_cache_number == 0 {
            return Err(ServicesError::InvalidConfig(
                "cache numbers must be greater than 0".to_string(),
            ));
        }
        if self.message_cache_number as u64 > self.message_max_number {
            return Err(ServicesError::InvalidConfig(format!(
                "message cache number {} exceeds the max number {}",
                self.message_cache_number, self.message_max_number
            )));
        }

        if self.websocket_timeout_secs == 0 || self.websocket_handshake_timeout_secs == 0 {
            return Err(ServicesError::InvalidConfig(
                "websocket timeouts must be greater than 0".to_string(),
            ));
        }

        if self.log_home.trim().is_empty() {
            return Err(ServicesError::InvalidConfig(
                "EVENTLOG_LOG_HOME cannot be empty".to_string(),
            ));
        }

        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ServicesError::InvalidConfig(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        if self.cluster_mode && self.etcd_endpoints.is_empty() {
            return Err(ServicesError::InvalidConfig(
                "cluster mode requires at least one etcd endpoint".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: [&str; 12] = [
        "EVENTLOG_WEB_PORT",
        "EVENTLOG_LOG_LEVEL",
        "EVENTLOG_ETCD_ENDPOINTS",
        "EVENTLOG_CLUSTER_MODE",
        "EVENTLOG_HOST_ID",
        "EVENT_LOG_RETENTION_DAYS",
        "DOCKER_LOG_SAVE_DAY",
        "EVENTLOG_LOG_HOME",
        "EVENTLOG_EVENT_LOG_PORT",
        "EVENTLOG_DOCKER_LOG_PORT",
        "EVENTLOG_WEBSOCKET_TIMEOUT",
        "EVENTLOG_WEBSOCKET_HANDSHAKE_TIMEOUT",
    ];

    fn clear_env() {
        for key in VARS {
            env::remove_var(key);
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(EventLogConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_and_duplicate_ports() {
        let config = EventLogConfig {
            web_port: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = EventLogConfig {
            web_port: 6366,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("already used"));
    }

    #[test]
    fn test_validate_rejects_bad_sizes() {
        let config = EventLogConfig {
            handle_sub_workers: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = EventLogConfig {
            message_cache_number: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = EventLogConfig {
            message_cache_number: 300,
            message_max_number: 200,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = EventLogConfig {
            log_home: "  ".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = EventLogConfig {
            websocket_handshake_timeout_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_log_level_and_cluster() {
        let config = EventLogConfig {
            log_level: "verbose".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = EventLogConfig {
            cluster_mode: true,
            etcd_endpoints: Vec::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        clear_env();
        let config = EventLogConfig::from_env().expect("defaults are valid");
        assert_eq!(config.web_port, 6363);
        assert_eq!(config.event_retention_days, 3);
        assert_eq!(config.service_retention_days, 7);
        assert!(!config.cluster_mode);
        assert!(Uuid::parse_str(&config.host_id).is_ok());
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        clear_env();
        env::set_var("EVENTLOG_WEB_PORT", "7000");
        env::set_var("EVENTLOG_LOG_LEVEL", "DEBUG");
        env::set_var("EVENTLOG_CLUSTER_MODE", "true");
        env::set_var("EVENTLOG_ETCD_ENDPOINTS", "http://a:2379, http://b:2379");
        env::set_var("EVENTLOG_HOST_ID", "node-1");
        env::set_var("DOCKER_LOG_SAVE_DAY", "14");
        env::set_var("EVENTLOG_WEBSOCKET_TIMEOUT", "5");
        env::set_var("EVENTLOG_WEBSOCKET_HANDSHAKE_TIMEOUT", "2");

        let config = EventLogConfig::from_env().expect("valid overrides");
        assert_eq!(config.web_port, 7000);
        assert_eq!(config.log_level, "debug");
        assert!(config.cluster_mode);
        assert_eq!(config.etcd_endpoints, ["http://a:2379", "http://b:2379"]);
        assert_eq!(config.host_id, "node-1");
        assert_eq!(config.service_retention_days, 14);
        assert_eq!(config.websocket_timeout_secs, 5);
        assert_eq!(config.websocket_handshake_timeout_secs, 2);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_unparsable_values() {
        clear_env();
        env::set_var("EVENTLOG_WEB_PORT", "not-a-port");
        let err = EventLogConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("EVENTLOG_WEB_PORT"));

        env::set_var("EVENTLOG_WEB_PORT", "6366");
        assert!(EventLogConfig::from_env().is_err());
        clear_env();
    }
}
