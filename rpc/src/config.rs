use serde::Deserialize;

/// Messaging configuration. Loadable from TOML; every field has a default so
/// partial config files work.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// `memory://{name}` or `tcp://{host}:{port}`.
    pub broker_url: String,
    /// Exchange that topic queues hang off.
    pub control_exchange: String,
    /// Reconnect backoff bounds, in milliseconds. The interval doubles from
    /// min up to max between attempts.
    pub reconnect_interval_min: u64,
    pub reconnect_interval_max: u64,
    /// Reconnect attempts before giving up. `None` retries forever.
    pub max_retries: Option<u32>,
    /// Heartbeat interval for the tcp transport, in seconds. 0 disables.
    pub heartbeat: u64,
    /// How long one consume-loop fetch blocks before re-polling, in
    /// milliseconds.
    pub consume_timeout_ms: u64,
    /// Default `call`/`multicall` deadline, in milliseconds.
    pub response_timeout_ms: u64,
    /// Wrap outgoing messages in the versioned envelope encoding.
    pub envelope: bool,
    /// Connection pool capacity.
    pub pool_size: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            broker_url: "memory://local".to_string(),
            control_exchange: "strand".to_string(),
            reconnect_interval_min: 1000,
            reconnect_interval_max: 30_000,
            max_retries: None,
            heartbeat: 0,
            consume_timeout_ms: 1000,
            response_timeout_ms: 60_000,
            envelope: true,
            pool_size: 30,
        }
    }
}

impl RpcConfig {
    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let conf = RpcConfig::from_toml(
            r#"
            broker_url = "tcp://127.0.0.1:5680"
            reconnect_interval_min = 100
            "#,
        )
        .unwrap();
        assert_eq!(conf.broker_url, "tcp://127.0.0.1:5680");
        assert_eq!(conf.reconnect_interval_min, 100);
        assert_eq!(conf.control_exchange, "strand");
        assert_eq!(conf.max_retries, None);
    }

    #[test]
    fn empty_config_is_all_defaults() {
        let conf = RpcConfig::from_toml("").unwrap();
        assert_eq!(conf.broker_url, "memory://local");
        assert!(conf.envelope);
    }
}
