// HA settings
// Timeouts and intervals that drive conversation and transaction reclamation

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tandem_common::TIMEOUT_MARGIN_MS;

const DEFAULT_LOCK_READ_TIMEOUT_MS: u64 = 20_000;
const DEFAULT_SWEEP_INTERVAL_MS: u64 = 1_000;
const DEFAULT_REAP_INTERVAL_MS: u64 = 1_000;

/// Settings for the master side of replication
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct HaSettings {
    /// Cluster member id of this master, stamped into the epoch
    pub server_id: i32,

    /// How long a replica waits for a lock response (default: 20000ms)
    /// Conversations and suspended transactions are abandoned after this plus a 5s margin
    pub lock_read_timeout_ms: u64,

    /// Interval between idle conversation sweeps (default: 1000ms)
    pub conversation_sweep_interval_ms: u64,

    /// Delay between stale transaction reaper runs (default: 1000ms)
    pub transaction_reap_interval_ms: u64,
}

impl Default for HaSettings {
    fn default() -> Self {
        Self {
            server_id: 0,
            lock_read_timeout_ms: DEFAULT_LOCK_READ_TIMEOUT_MS,
            conversation_sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
            transaction_reap_interval_ms: DEFAULT_REAP_INTERVAL_MS,
        }
    }
}

impl HaSettings {
    pub fn new(server_id: i32) -> Self {
        Self {
            server_id,
            ..Default::default()
        }
    }

    /// Read settings from the `tandem.ha.*` keys, falling back to defaults
    pub fn from_config(config: &config::Config) -> Self {
        let defaults = Self::default();
        Self {
            server_id: config
                .get_int("tandem.ha.server-id")
                .map(|v| v.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32)
                .unwrap_or(defaults.server_id),
            lock_read_timeout_ms: config
                .get_int("tandem.ha.lock-read-timeout-ms")
                .map(|v| v.max(0) as u64)
                .unwrap_or(defaults.lock_read_timeout_ms),
            conversation_sweep_interval_ms: config
                .get_int("tandem.ha.conversation-sweep-interval-ms")
                .map(|v| v.max(1) as u64)
                .unwrap_or(defaults.conversation_sweep_interval_ms),
            transaction_reap_interval_ms: config
                .get_int("tandem.ha.transaction-reap-interval-ms")
                .map(|v| v.max(1) as u64)
                .unwrap_or(defaults.transaction_reap_interval_ms),
        }
    }

    pub fn lock_read_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_read_timeout_ms)
    }

    /// Idle time after which a conversation is reaped
    pub fn conversation_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_read_timeout_ms.saturating_add(TIMEOUT_MARGIN_MS))
    }

    /// Suspension time after which a transaction is rolled back
    pub fn transaction_timeout(&self) -> Duration {
        self.conversation_timeout()
    }

    pub fn conversation_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.conversation_sweep_interval_ms)
    }

    pub fn transaction_reap_interval(&self) -> Duration {
        Duration::from_millis(self.transaction_reap_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = HaSettings::default();
        assert_eq!(settings.lock_read_timeout(), Duration::from_secs(20));
        assert_eq!(settings.conversation_timeout(), Duration::from_secs(25));
        assert_eq!(settings.transaction_timeout(), Duration::from_secs(25));
        assert_eq!(settings.conversation_sweep_interval(), Duration::from_secs(1));
        assert_eq!(settings.transaction_reap_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_from_config_overrides() {
        let config = config::Config::builder()
            .set_override("tandem.ha.server-id", 3)
            .unwrap()
            .set_override("tandem.ha.lock-read-timeout-ms", 1000)
            .unwrap()
            .build()
            .unwrap();

        let settings = HaSettings::from_config(&config);
        assert_eq!(settings.server_id, 3);
        assert_eq!(settings.conversation_timeout(), Duration::from_secs(6));
        assert_eq!(settings.conversation_sweep_interval_ms, 1_000);
    }

    #[test]
    fn test_out_of_range_server_id_is_not_truncated() {
        let config = config::Config::builder()
            .set_override("tandem.ha.server-id", 4_294_967_297_i64)
            .unwrap()
            .build()
            .unwrap();

        let settings = HaSettings::from_config(&config);
        assert_eq!(settings.server_id, i32::MAX);
        assert!(tandem_common::Epoch::for_server(settings.server_id, 0).is_err());
    }

    #[test]
    fn test_from_empty_config_uses_defaults() {
        let config = config::Config::builder().build().unwrap();
        assert_eq!(HaSettings::from_config(&config), HaSettings::default());
    }

    #[test]
    fn test_deserialize_kebab_case() {
        let config = config::Config::builder()
            .set_override("server-id", 9)
            .unwrap()
            .set_override("transaction-reap-interval-ms", 250)
            .unwrap()
            .build()
            .unwrap();

        let settings: HaSettings = config.try_deserialize().unwrap();
        assert_eq!(settings.server_id, 9);
        assert_eq!(settings.transaction_reap_interval(), Duration::from_millis(250));
        assert_eq!(settings.lock_read_timeout_ms, 20_000);
    }
}
