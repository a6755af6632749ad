// One entry of the process registry.

use crate::constants::{ADDR_SIZE, WAKE_NAME_SIZE, WAKE_SUFFIX};
use crate::fixed::FixedString;
use crate::record_vector::Record;
use crate::segment::SharedObject;
use crate::utils::{duration_micros, format_micros};
use std::fmt;
use std::time::Duration;

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct ProcessRecord {
    key: u64,
    registered_at: u64,
    last_checkin: u64,
    last_maintenance: u64,
    created_at: u64,
    updated_at: u64,
    pid: u32,
    bid: i32,
    in_use: bool,
    id: FixedString<ADDR_SIZE>,
    wake_name: FixedString<WAKE_NAME_SIZE>,
}

unsafe impl SharedObject for ProcessRecord {
    fn type_tag() -> String {
        return "process_record".to_string();
    }
}

/// Name of the semaphore a process sleeps on, derived from its id.
pub fn wake_name_for(id: &str) -> String {
    return format!("{}{}", id, WAKE_SUFFIX);
}

impl ProcessRecord {
    pub fn new(id: &str, bid: i32, now: u64) -> ProcessRecord {
        let mut record = ProcessRecord::default();
        record.id.set(id);
        record.wake_name.set(&wake_name_for(record.id.as_str()));
        record.pid = std::process::id();
        record.bid = bid;
        record.registered_at = now;
        record.last_checkin = now;
        return record;
    }

    pub fn key(&self) -> u64 {
        return self.key;
    }

    pub fn id(&self) -> &str {
        return self.id.as_str();
    }

    pub fn is_id(&self, id: &str) -> bool {
        return self.id.eq_ignore_case(id);
    }

    pub fn pid(&self) -> u32 {
        return self.pid;
    }

    pub fn wake_name(&self) -> &str {
        return self.wake_name.as_str();
    }

    pub fn bid(&self) -> i32 {
        return self.bid;
    }

    pub fn set_bid(&mut self, bid: i32) {
        self.bid = bid;
    }

    pub fn registered_at(&self) -> u64 {
        return self.registered_at;
    }

    pub fn set_registered_at(&mut self, micros: u64) {
        self.registered_at = micros;
    }

    pub fn last_checkin(&self) -> u64 {
        return self.last_checkin;
    }

    pub fn set_last_checkin(&mut self, micros: u64) {
        self.last_checkin = micros;
    }

    pub fn last_maintenance(&self) -> u64 {
        return self.last_maintenance;
    }

    pub fn set_last_maintenance(&mut self, micros: u64) {
        self.last_maintenance = micros;
    }

    /// Checked in within `inactive_timeout` of `now`.
    pub fn is_active(&self, now: u64, inactive_timeout: Duration) -> bool {
        return self.in_use
            && self.last_checkin.saturating_add(duration_micros(inactive_timeout)) >= now;
    }

    pub fn row(&self, now: u64, inactive_timeout: Duration) -> Vec<String> {
        return vec![
            self.key.to_string(),
            self.id().to_string(),
            self.pid.to_string(),
            self.bid.to_string(),
            if self.is_active(now, inactive_timeout) {
                "active"
            } else {
                "inactive"
            }
            .to_string(),
            format_micros(self.registered_at),
            format_micros(self.last_checkin),
            format_micros(self.last_maintenance),
            self.wake_name().to_string(),
        ];
    }

    pub const ROW_HEADER: [&'static str; 9] = [
        "key",
        "id",
        "pid",
        "bid",
        "state",
        "registered",
        "checkin",
        "maintenance",
        "wake signal",
    ];
}

impl Record for ProcessRecord {
    fn key(&self) -> u64 {
        return self.key;
    }

    fn set_key(&mut self, key: u64) {
        self.key = key;
    }

    fn in_use(&self) -> bool {
        return self.in_use;
    }

    fn set_in_use(&mut self, in_use: bool) {
        self.in_use = in_use;
    }

    fn created_at(&self) -> u64 {
        return self.created_at;
    }

    fn set_created_at(&mut self, micros: u64) {
        self.created_at = micros;
    }

    fn set_updated_at(&mut self, micros: u64) {
        self.updated_at = micros;
    }

    fn describe(&self) -> String {
        return format!(
            "process key {} id {:?} pid {} bid {}",
            self.key,
            self.id(),
            self.pid,
            self.bid
        );
    }
}

impl fmt::Debug for ProcessRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        return f
            .debug_struct("ProcessRecord")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("bid", &self.bid)
            .field("in_use", &self.in_use)
            .field("last_checkin", &self.last_checkin)
            .field("last_maintenance", &self.last_maintenance)
            .finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn liveness_follows_checkin() {
        let now = 1_000_000_000;
        let mut p = ProcessRecord::new("A", 5, now);
        // not stored yet
        assert!(!p.is_active(now, Duration::from_secs(10)));
        p.set_in_use(true);
        assert!(p.is_active(now + 5_000_000, Duration::from_secs(10)));
        assert!(!p.is_active(now + 11_000_000, Duration::from_secs(10)));
        p.set_last_checkin(now + 10_000_000);
        assert!(p.is_active(now + 11_000_000, Duration::from_secs(10)));
    }

    #[test]
    fn wake_name_is_derived_from_id() {
        let p = ProcessRecord::new("obs-plugin", 1, 0);
        assert_eq!(p.wake_name(), "obs-plugin.wake");
        assert!(p.is_id("OBS-Plugin"));
        assert_eq!(p.pid(), std::process::id());
    }
}
