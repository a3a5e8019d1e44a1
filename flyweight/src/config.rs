use std::time::Duration;

use flyweight_helpers::RetryPolicy;
use serde::Deserialize;

use crate::{Channel, NetworkId, NO_PREFERRED_CHANNEL};

/// Controller settings. Every field has a default, so a config file only needs the overrides.
///
/// Durations are in milliseconds.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControllerConfig {
    pub network_id: NetworkId,
    /// Channel to use without scanning, or `NO_PREFERRED_CHANNEL` to scan at start.
    pub preferred_channel: Channel,
    pub sleep_seconds: u8,

    pub ack_timeout_ms: u64,
    pub ack_retries: u8,
    pub ack_queue_capacity: usize,
    pub query_timeout_ms: u64,
    pub query_retries: u8,

    pub send_buffer_capacity: usize,
    pub high_water: usize,
    pub event_interval_ms: u64,
    pub receive_backoff_ms: u64,
    pub start_delay_ms: u64,
    pub netcheck_delay_ms: u64,
    pub interface_check_interval_ms: u64,
    pub reset_cooldown_ms: u64,
    pub settle_delay_ms: u64,
    pub device_lost_timeout_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            network_id: NetworkId::DEFAULT,
            preferred_channel: NO_PREFERRED_CHANNEL,
            sleep_seconds: 0,

            ack_timeout_ms: 50,
            ack_retries: 5,
            ack_queue_capacity: 10,
            query_timeout_ms: 500,
            query_retries: 3,

            send_buffer_capacity: 100,
            high_water: 14,
            event_interval_ms: 50,
            receive_backoff_ms: 100,
            start_delay_ms: 2000,
            netcheck_delay_ms: 250,
            interface_check_interval_ms: 5000,
            reset_cooldown_ms: 5000,
            settle_delay_ms: 200,
            device_lost_timeout_ms: 5 * 60 * 1000,
        }
    }
}

impl ControllerConfig {
    pub fn ack_policy(&self) -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(self.ack_timeout_ms), self.ack_retries)
    }

    pub fn query_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.query_timeout_ms),
            self.query_retries,
        )
    }

    pub fn event_interval(&self) -> Duration {
        Duration::from_millis(self.event_interval_ms)
    }

    pub fn receive_backoff(&self) -> Duration {
        Duration::from_millis(self.receive_backoff_ms)
    }

    pub fn start_delay(&self) -> Duration {
        Duration::from_millis(self.start_delay_ms)
    }

    pub fn netcheck_delay(&self) -> Duration {
        Duration::from_millis(self.netcheck_delay_ms)
    }

    pub fn interface_check_interval(&self) -> Duration {
        Duration::from_millis(self.interface_check_interval_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn device_lost_timeout(&self) -> Duration {
        Duration::from_millis(self.device_lost_timeout_ms)
    }

    pub fn reset_cooldown(&self) -> Duration {
        Duration::from_millis(self.reset_cooldown_ms)
    }
}
