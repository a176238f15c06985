//! Worker configuration

use std::collections::HashSet;

use crate::access::PeerId;
use crate::api::Namespace;
use crate::error::{Result, WorkerError};

/// Environment variable enabling/disabling the worker.
pub const ENABLED_ENV: &str = "KEYMANAGER_WORKER_ENABLED";

/// Environment variable controlling whether this node may generate
/// ephemeral secrets.
pub const MAY_GENERATE_ENV: &str = "KEYMANAGER_WORKER_MAY_GENERATE";

/// Environment variable holding the hex-encoded key manager runtime ID.
pub const RUNTIME_ID_ENV: &str = "KEYMANAGER_WORKER_RUNTIME_ID";

/// Key manager worker configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Runtime ID of the hosted key manager.
    pub runtime_id: Namespace,

    /// Whether the worker is enabled at all. A disabled worker signals
    /// initialization immediately and does nothing else.
    pub enabled: bool,

    /// Whether this node may generate ephemeral secrets.
    pub may_generate: bool,

    /// Peers that bypass the access-list policy checks.
    pub private_peers: HashSet<PeerId>,
}

impl Config {
    pub fn new(runtime_id: Namespace) -> Self {
        Self {
            runtime_id,
            enabled: true,
            may_generate: true,
            private_peers: HashSet::new(),
        }
    }

    /// Builds a config from the environment. `RUNTIME_ID_ENV` is required;
    /// the boolean knobs default to enabled.
    pub fn from_env() -> Result<Self> {
        let runtime_hex = std::env::var(RUNTIME_ID_ENV).map_err(|_| {
            WorkerError::InvalidArgument(format!("{RUNTIME_ID_ENV} is not set"))
        })?;
        let raw = hex::decode(runtime_hex.trim())
            .map_err(|e| WorkerError::InvalidArgument(format!("invalid runtime ID: {e}")))?;
        let mut cfg = Self::new(Namespace::from_slice(&raw)?);
        cfg.enabled = env_flag(ENABLED_ENV, true);
        cfg.may_generate = env_flag(MAY_GENERATE_ENV, true);
        Ok(cfg)
    }

    pub fn with_private_peers(mut self, peers: impl IntoIterator<Item = PeerId>) -> Self {
        self.private_peers.extend(peers);
        self
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => value == "1" || value.eq_ignore_ascii_case("true"),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::new(Namespace([7; 32]));
        assert!(cfg.enabled);
        assert!(cfg.may_generate);
        assert!(cfg.private_peers.is_empty());
    }

    #[test]
    fn test_env_flag_parsing() {
        std::env::set_var("KM_TEST_FLAG", "true");
        assert!(env_flag("KM_TEST_FLAG", false));
        std::env::set_var("KM_TEST_FLAG", "0");
        assert!(!env_flag("KM_TEST_FLAG", true));
        std::env::remove_var("KM_TEST_FLAG");
        assert!(env_flag("KM_TEST_FLAG", true));
    }
}
