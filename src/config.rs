// Broker settings. Defaults come from constants.rs, from_env() lets a
// deployment override them:
//
// SHM_BROKER_SEGMENT            segment name
// SHM_BROKER_SIZE               segment size in bytes, used when creating it
// SHM_BROKER_EVENT_CAPACITY     event slots, used when creating the segment
// SHM_BROKER_PROCESS_CAPACITY   process slots, used when creating the segment
// SHM_BROKER_HEARTBEAT_SECS     how often a router checks in
// SHM_BROKER_INACTIVE_SECS      no check in for this long means inactive
// SHM_BROKER_MAINTENANCE_SECS   how often the elected process runs maintenance
// SHM_BROKER_SLEEP_SECS         longest a router sleeps without a wake up
// SHM_BROKER_EXPIRY_GRACE_SECS  extra time before an expired event is removed

use crate::constants::{
    DEFAULT_EVENT_CAPACITY, DEFAULT_EVENT_TTL_SECS, DEFAULT_PROCESS_CAPACITY,
    DEFAULT_SEGMENT_NAME, DEFAULT_SEGMENT_SIZE, EXPIRY_GRACE_SECS, HEARTBEAT_INTERVAL_SECS,
    INACTIVE_TIMEOUT_SECS, MAINTENANCE_INTERVAL_SECS, MAINT_EVENT_TTL_SECS, ROUTER_SLEEP_SECS,
    STATUS_EVENT_TTL_SECS,
};
use log::warn;
use std::str::FromStr;
use std::time::Duration;

pub const ENV_SEGMENT: &str = "SHM_BROKER_SEGMENT";
pub const ENV_SIZE: &str = "SHM_BROKER_SIZE";
pub const ENV_EVENT_CAPACITY: &str = "SHM_BROKER_EVENT_CAPACITY";
pub const ENV_PROCESS_CAPACITY: &str = "SHM_BROKER_PROCESS_CAPACITY";
pub const ENV_HEARTBEAT_SECS: &str = "SHM_BROKER_HEARTBEAT_SECS";
pub const ENV_INACTIVE_SECS: &str = "SHM_BROKER_INACTIVE_SECS";
pub const ENV_MAINTENANCE_SECS: &str = "SHM_BROKER_MAINTENANCE_SECS";
pub const ENV_SLEEP_SECS: &str = "SHM_BROKER_SLEEP_SECS";
pub const ENV_EXPIRY_GRACE_SECS: &str = "SHM_BROKER_EXPIRY_GRACE_SECS";

#[derive(Debug, Clone, PartialEq)]
pub struct BrokerConfig {
    pub segment_name: String,
    pub segment_size: usize,
    pub event_capacity: usize,
    pub process_capacity: usize,
    pub heartbeat_interval: Duration,
    pub inactive_timeout: Duration,
    pub maintenance_interval: Duration,
    pub router_sleep: Duration,
    pub expiry_grace: Duration,
    pub default_event_ttl: Duration,
    /// Lifetime of the maintenance start and end events.
    pub maintenance_event_ttl: Duration,
    pub status_event_ttl: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        return BrokerConfig {
            segment_name: DEFAULT_SEGMENT_NAME.to_string(),
            segment_size: DEFAULT_SEGMENT_SIZE,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            process_capacity: DEFAULT_PROCESS_CAPACITY,
            heartbeat_interval: Duration::from_secs(HEARTBEAT_INTERVAL_SECS),
            inactive_timeout: Duration::from_secs(INACTIVE_TIMEOUT_SECS),
            maintenance_interval: Duration::from_secs(MAINTENANCE_INTERVAL_SECS),
            router_sleep: Duration::from_secs(ROUTER_SLEEP_SECS),
            expiry_grace: Duration::from_secs(EXPIRY_GRACE_SECS),
            default_event_ttl: Duration::from_secs(DEFAULT_EVENT_TTL_SECS),
            maintenance_event_ttl: Duration::from_secs(MAINT_EVENT_TTL_SECS),
            status_event_ttl: Duration::from_secs(STATUS_EVENT_TTL_SECS),
        };
    }
}

fn parse_or_keep<T: FromStr>(name: &str, raw: Option<String>, current: T) -> T {
    let raw = match raw {
        Some(raw) => raw,
        None => return current,
    };
    return match raw.trim().parse::<T>() {
        Ok(value) => value,
        Err(_) => {
            warn!("ignoring {}={:?}, not a valid value", name, raw);
            current
        }
    };
}

impl BrokerConfig {
    /// Defaults overridden by the SHM_BROKER_* environment variables.
    pub fn from_env() -> BrokerConfig {
        return BrokerConfig::default().overlay(|name| std::env::var(name).ok());
    }

    /// Same as a segment name override, for tests and tools.
    pub fn with_segment(mut self, name: &str) -> BrokerConfig {
        self.segment_name = name.to_string();
        return self;
    }

    pub fn overlay(mut self, lookup: impl Fn(&str) -> Option<String>) -> BrokerConfig {
        if let Some(name) = lookup(ENV_SEGMENT) {
            if !name.trim().is_empty() {
                self.segment_name = name.trim().to_string();
            }
        }
        self.segment_size = parse_or_keep(ENV_SIZE, lookup(ENV_SIZE), self.segment_size);
        self.event_capacity =
            parse_or_keep(ENV_EVENT_CAPACITY, lookup(ENV_EVENT_CAPACITY), self.event_capacity);
        self.process_capacity = parse_or_keep(
            ENV_PROCESS_CAPACITY,
            lookup(ENV_PROCESS_CAPACITY),
            self.process_capacity,
        );

        let secs = |name: &str, current: Duration| -> Duration {
            return Duration::from_secs(parse_or_keep(name, lookup(name), current.as_secs()));
        };
        self.heartbeat_interval = secs(ENV_HEARTBEAT_SECS, self.heartbeat_interval);
        self.inactive_timeout = secs(ENV_INACTIVE_SECS, self.inactive_timeout);
        self.maintenance_interval = secs(ENV_MAINTENANCE_SECS, self.maintenance_interval);
        self.router_sleep = secs(ENV_SLEEP_SECS, self.router_sleep);
        self.expiry_grace = secs(ENV_EXPIRY_GRACE_SECS, self.expiry_grace);
        return self;
    }
}
