//! Process configuration: a JSON document matching the external interface table, deserialized
//! with `serde`/`serde_json`. Loading and CLI parsing are ambient concerns (SPEC_FULL.md §6a);
//! this module owns only the shape and validation of the document, not how its path is chosen.

use std::path::Path;
use std::time::Duration;

use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::ser::{SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_DIAL_TIMEOUT, DEFAULT_FAKE_JOB_NOTIFY_INTERVAL, DEFAULT_IP_WORKER_NAME_FORMAT,
    DEFAULT_POOL_CONNECTIONS_PER_SUBACCOUNT, DEFAULT_READ_TIMEOUT, DOWN_SESSION_MAILBOX,
    SESSION_MANAGER_MAILBOX, UP_SESSION_MAILBOX, UP_SESSION_MANAGER_MAILBOX,
};
use crate::errors::ProxyError;

/// Seconds-denominated config value that converts to `Duration` at point of use.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Seconds(pub u64);

impl Seconds {
    pub fn get(self) -> Duration {
        Duration::from_secs(self.0)
    }
}

/// One upstream pool. Serializes as a JSON array `[host, port, sub_account, password]` to
/// match the wire shape in the original configuration format; `password` is a field this
/// implementation adds (SPEC_FULL.md §9) in place of the hard-coded placeholder it replaces.
#[derive(Debug, Clone)]
pub struct PoolInfo {
    pub host: String,
    pub port: u16,
    pub sub_account: String,
    pub password: String,
}

impl Serialize for PoolInfo {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(4))?;
        seq.serialize_element(&self.host)?;
        seq.serialize_element(&self.port)?;
        seq.serialize_element(&self.sub_account)?;
        seq.serialize_element(&self.password)?;
        seq.end()
    }
}

impl<'de> Deserialize<'de> for PoolInfo {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct PoolInfoVisitor;
        impl<'de> Visitor<'de> for PoolInfoVisitor {
            type Value = PoolInfo;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("an array [host, port, sub_account] or [host, port, sub_account, password]")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<PoolInfo, A::Error> {
                let host: String =
                    seq.next_element()?.ok_or_else(|| de::Error::invalid_length(0, &self))?;
                let port: u16 =
                    seq.next_element()?.ok_or_else(|| de::Error::invalid_length(1, &self))?;
                let sub_account: String = seq.next_element()?.unwrap_or_default();
                let password: String = seq.next_element()?.unwrap_or_default();
                Ok(PoolInfo { host, port, sub_account, password })
            }
        }
        deserializer.deserialize_seq(PoolInfoVisitor)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageQueueSize {
    #[serde(default = "default_session_manager_queue")]
    pub session_manager: usize,
    #[serde(default = "default_up_session_manager_queue")]
    pub pool_session_manager: usize,
    #[serde(default = "default_up_session_queue")]
    pub pool_session: usize,
    #[serde(default = "default_down_session_queue")]
    pub miner_session: usize,
}

fn default_session_manager_queue() -> usize {
    SESSION_MANAGER_MAILBOX
}
fn default_up_session_manager_queue() -> usize {
    UP_SESSION_MANAGER_MAILBOX
}
fn default_up_session_queue() -> usize {
    UP_SESSION_MAILBOX
}
fn default_down_session_queue() -> usize {
    DOWN_SESSION_MAILBOX
}

impl Default for MessageQueueSize {
    fn default() -> Self {
        Self {
            session_manager: SESSION_MANAGER_MAILBOX,
            pool_session_manager: UP_SESSION_MANAGER_MAILBOX,
            pool_session: UP_SESSION_MAILBOX,
            miner_session: DOWN_SESSION_MAILBOX,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Advanced {
    #[serde(default = "default_pool_connections")]
    pub pool_connection_number_per_subaccount: u8,
    #[serde(default = "default_dial_timeout")]
    pub pool_connection_dial_timeout_seconds: Seconds,
    #[serde(default = "default_read_timeout")]
    pub pool_connection_read_timeout_seconds: Seconds,
    #[serde(default = "default_fake_interval")]
    pub fake_job_notify_interval_seconds: Seconds,
    #[serde(default)]
    pub tls_skip_certificate_verify: bool,
    #[serde(default)]
    pub message_queue_size: MessageQueueSize,
}

fn default_pool_connections() -> u8 {
    DEFAULT_POOL_CONNECTIONS_PER_SUBACCOUNT
}
fn default_dial_timeout() -> Seconds {
    Seconds(DEFAULT_DIAL_TIMEOUT.as_secs())
}
fn default_read_timeout() -> Seconds {
    Seconds(DEFAULT_READ_TIMEOUT.as_secs())
}
fn default_fake_interval() -> Seconds {
    Seconds(DEFAULT_FAKE_JOB_NOTIFY_INTERVAL.as_secs())
}

impl Default for Advanced {
    fn default() -> Self {
        Self {
            pool_connection_number_per_subaccount: default_pool_connections(),
            pool_connection_dial_timeout_seconds: default_dial_timeout(),
            pool_connection_read_timeout_seconds: default_read_timeout(),
            fake_job_notify_interval_seconds: default_fake_interval(),
            tls_skip_certificate_verify: false,
            message_queue_size: MessageQueueSize::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpDebug {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub listen: String,
}

impl Default for HttpDebug {
    fn default() -> Self {
        Self { enable: false, listen: String::new() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    Btc,
    Eth,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub multi_user_mode: bool,
    pub agent_type: AgentType,
    pub always_keep_downconn: bool,
    pub disconnect_when_lost_asicboost: bool,
    pub use_ip_as_worker_name: bool,
    pub ip_worker_name_format: String,
    pub fixed_worker_name: String,
    pub submit_response_from_server: bool,
    pub agent_listen_ip: String,
    pub agent_listen_port: u16,
    pub proxy: Vec<String>,
    pub use_proxy: bool,
    pub direct_connect_with_proxy: bool,
    pub direct_connect_after_proxy: bool,
    pub pool_use_tls: bool,
    pub pools: Vec<PoolInfo>,
    pub http_debug: HttpDebug,
    pub advanced: Advanced,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            multi_user_mode: false,
            agent_type: AgentType::Btc,
            always_keep_downconn: true,
            disconnect_when_lost_asicboost: true,
            use_ip_as_worker_name: false,
            ip_worker_name_format: DEFAULT_IP_WORKER_NAME_FORMAT.to_string(),
            fixed_worker_name: String::new(),
            submit_response_from_server: false,
            agent_listen_ip: "0.0.0.0".to_string(),
            agent_listen_port: 3333,
            proxy: Vec::new(),
            use_proxy: true,
            direct_connect_with_proxy: false,
            direct_connect_after_proxy: true,
            pool_use_tls: false,
            pools: Vec::new(),
            http_debug: HttpDebug::default(),
            advanced: Advanced::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ProxyError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ProxyError::ConfigFatal(format!("cannot read {}: {e}", path.display())))?;
        let config: Config = serde_json::from_str(&text)
            .map_err(|e| ProxyError::ConfigFatal(format!("cannot parse {}: {e}", path.display())))?;
        Ok(config)
    }

    /// Applies the same normalization the source this was distilled from performs in
    /// `Init()`: reject unknown agent types, drop the proxy list when unused, and clear
    /// per-pool sub-accounts when miners are expected to supply their own.
    pub fn validate(&mut self) -> Result<(), ProxyError> {
        if self.agent_type != AgentType::Btc {
            return Err(ProxyError::ConfigFatal(
                "only agent_type \"btc\" is implemented by this proxy".to_string(),
            ));
        }
        if self.pools.is_empty() {
            return Err(ProxyError::ConfigFatal("at least one pool must be configured".to_string()));
        }
        if !self.use_proxy {
            self.proxy.clear();
        }
        if self.multi_user_mode {
            for pool in &mut self.pools {
                pool.sub_account.clear();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_info_round_trips_through_json_array() {
        let pool = PoolInfo {
            host: "pool.example".to_string(),
            port: 3333,
            sub_account: "user".to_string(),
            password: "x".to_string(),
        };
        let v = serde_json::to_value(&pool).unwrap();
        assert_eq!(v, serde_json::json!(["pool.example", 3333, "user", "x"]));
        let back: PoolInfo = serde_json::from_value(v).unwrap();
        assert_eq!(back.host, "pool.example");
    }

    #[test]
    fn pool_info_defaults_missing_trailing_fields() {
        let v = serde_json::json!(["pool.example", 3333]);
        let pool: PoolInfo = serde_json::from_value(v).unwrap();
        assert_eq!(pool.sub_account, "");
        assert_eq!(pool.password, "");
    }

    #[test]
    fn validate_rejects_eth_agent_type() {
        let mut config = Config { agent_type: AgentType::Eth, ..Config::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_clears_subaccounts_in_multi_user_mode() {
        let mut config = Config {
            multi_user_mode: true,
            pools: vec![PoolInfo {
                host: "h".into(),
                port: 1,
                sub_account: "should-be-cleared".into(),
                password: "p".into(),
            }],
            ..Config::default()
        };
        config.validate().unwrap();
        assert_eq!(config.pools[0].sub_account, "");
    }
}
