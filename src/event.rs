/*
 * The event record as it is stored in the segment. Everything is inline and
 * fixed size, strings and payloads that do not fit are truncated.
 *
 * Timestamps are micros since the epoch, 0 means "never" (not read yet, or
 * for expires_at, does not expire).
 */
use crate::constants::{
    ADDR_SIZE, DEFAULT_EVENT_TTL_SECS, MAX_READERS, PAYLOAD_SIZE, TOPIC_SIZE,
};
use crate::error::{Error, Result};
use crate::fixed::{FixedBytes, FixedString};
use crate::record_vector::Record;
use crate::segment::SharedObject;
use crate::utils::{
    duration_micros, format_duration_micros, format_micros, now_micros, parse_duration_micros,
};
use log::warn;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

const HOUR_MICROS: u64 = 3600 * 1_000_000;
const DAY_MICROS: u64 = 24 * HOUR_MICROS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum EventKind {
    NotInUse = 0,
    Generic = 1,
    Timed = 2,
    PostIt = 3,
    Ping = 4,
    Start = 5,
    Shutdown = 6,
    DoLogin = 7,
    LoginDeny = 8,
    LoginAuth = 9,
    SetMask = 10,
    DoCredentials = 11,
    Log = 12,
    System = 9000,
    MaintenanceStart = 9001,
    MaintenanceEnd = 9002,
    MaintenanceStatus = 9003,
    Heartbeat = 9004,
}

impl EventKind {
    pub const ALL: [EventKind; 18] = [
        EventKind::NotInUse,
        EventKind::Generic,
        EventKind::Timed,
        EventKind::PostIt,
        EventKind::Ping,
        EventKind::Start,
        EventKind::Shutdown,
        EventKind::DoLogin,
        EventKind::LoginDeny,
        EventKind::LoginAuth,
        EventKind::SetMask,
        EventKind::DoCredentials,
        EventKind::Log,
        EventKind::System,
        EventKind::MaintenanceStart,
        EventKind::MaintenanceEnd,
        EventKind::MaintenanceStatus,
        EventKind::Heartbeat,
    ];

    pub fn from_i32(value: i32) -> Option<EventKind> {
        return EventKind::ALL.iter().copied().find(|k| *k as i32 == value);
    }

    /// Name used in logs and dumps.
    pub fn name(&self) -> &'static str {
        return match self {
            EventKind::NotInUse => "empty",
            EventKind::Generic => "Generic",
            EventKind::Timed => "Timed",
            EventKind::PostIt => "Post it",
            EventKind::Ping => "Ping",
            EventKind::Start => "Start",
            EventKind::Shutdown => "Shutdown",
            EventKind::DoLogin => "DoLogin",
            EventKind::LoginDeny => "Login Deny",
            EventKind::LoginAuth => "Login Auth",
            EventKind::SetMask => "SetMsk",
            EventKind::DoCredentials => "Credentials",
            EventKind::Log => "Log",
            EventKind::System => "System",
            EventKind::MaintenanceStart => "Maint Start",
            EventKind::MaintenanceEnd => "Maint End",
            EventKind::MaintenanceStatus => "Shmem Status",
            EventKind::Heartbeat => "Heartbeat",
        };
    }

    /// Accepts the display name, ignoring case, spaces and underscores.
    pub fn from_name(name: &str) -> Option<EventKind> {
        let squash = |s: &str| -> String {
            s.chars()
                .filter(|c| !c.is_whitespace() && *c != '_')
                .flat_map(|c| c.to_lowercase())
                .collect()
        };
        let wanted = squash(name);
        return EventKind::ALL
            .iter()
            .copied()
            .find(|k| squash(k.name()) == wanted || squash(&format!("{:?}", k)) == wanted);
    }
}

pub fn type_name(value: i32) -> &'static str {
    return match EventKind::from_i32(value) {
        Some(kind) => kind.name(),
        None => "unk type",
    };
}

/// How long a read counts for, for messages that should come back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ReadFrequency {
    Once = 0,
    Hourly = 1,
    Daily = 2,
    Login = 3,
}

impl ReadFrequency {
    pub fn from_u32(value: u32) -> ReadFrequency {
        return match value {
            1 => ReadFrequency::Hourly,
            2 => ReadFrequency::Daily,
            3 => ReadFrequency::Login,
            _ => ReadFrequency::Once,
        };
    }
}

#[repr(C)]
#[derive(Clone, Copy, Default, Debug, PartialEq)]
pub struct ReadMark {
    reader: FixedString<ADDR_SIZE>,
    read_at: u64,
}

impl ReadMark {
    pub fn reader(&self) -> &str {
        return self.reader.as_str();
    }

    pub fn read_at(&self) -> u64 {
        return self.read_at;
    }
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct Event {
    key: u64,
    created_at: u64,
    expires_at: u64,
    read_at: u64,
    updated_at: u64,
    kind: i32,
    read_frequency: u32,
    in_use: bool,
    topic: FixedString<TOPIC_SIZE>,
    to: FixedString<ADDR_SIZE>,
    from: FixedString<ADDR_SIZE>,
    payload: FixedBytes<PAYLOAD_SIZE>,
    read_by: [ReadMark; MAX_READERS],
}

unsafe impl SharedObject for Event {
    fn type_tag() -> String {
        return "event".to_string();
    }
}

impl Event {
    /// A new, not yet stored event that expires DEFAULT_EVENT_TTL_SECS from
    /// now.
    pub fn new(topic: &str, to: &str, from: &str, kind: EventKind) -> Event {
        let mut event = Event::default();
        event.topic.set(topic);
        event.to.set(to);
        event.from.set(from);
        event.kind = kind as i32;
        event.set_expires_in(Duration::from_secs(DEFAULT_EVENT_TTL_SECS));
        return event;
    }

    pub fn key(&self) -> u64 {
        return self.key;
    }

    pub fn topic(&self) -> &str {
        return self.topic.as_str();
    }

    pub fn set_topic(&mut self, topic: &str) {
        self.topic.set(topic);
    }

    pub fn to(&self) -> &str {
        return self.to.as_str();
    }

    pub fn set_to(&mut self, to: &str) {
        self.to.set(to);
    }

    pub fn from(&self) -> &str {
        return self.from.as_str();
    }

    pub fn set_from(&mut self, from: &str) {
        self.from.set(from);
    }

    pub(crate) fn topic_field(&self) -> &FixedString<TOPIC_SIZE> {
        return &self.topic;
    }

    pub(crate) fn to_field(&self) -> &FixedString<ADDR_SIZE> {
        return &self.to;
    }

    pub(crate) fn from_field(&self) -> &FixedString<ADDR_SIZE> {
        return &self.from;
    }

    pub fn event_type(&self) -> i32 {
        return self.kind;
    }

    pub fn set_event_type(&mut self, kind: i32) {
        self.kind = kind;
    }

    pub fn kind(&self) -> Option<EventKind> {
        return EventKind::from_i32(self.kind);
    }

    pub fn set_kind(&mut self, kind: EventKind) {
        self.kind = kind as i32;
    }

    pub fn type_name(&self) -> &'static str {
        return type_name(self.kind);
    }

    pub fn payload(&self) -> &[u8] {
        return self.payload.as_slice();
    }

    pub fn payload_str(&self) -> String {
        return self.payload.to_string_lossy();
    }

    /// Returns false if the payload was truncated.
    pub fn set_payload(&mut self, data: &[u8]) -> bool {
        return self.payload.set(data);
    }

    pub fn set_payload_str(&mut self, text: &str) -> bool {
        return self.payload.set_str(text);
    }

    /// Stores `value` as JSON. Returns Ok(false) if it did not fit and was
    /// truncated, which leaves a payload nobody can decode.
    pub fn set_payload_json<T: Serialize>(&mut self, value: &T) -> Result<bool> {
        let text = serde_json::to_string(value)?;
        let complete = self.payload.set_str(&text);
        if !complete {
            warn!(
                "json payload of {} bytes truncated to {} for {}",
                text.len(),
                PAYLOAD_SIZE,
                self.describe()
            );
        }
        return Ok(complete);
    }

    pub fn payload_json<T: DeserializeOwned>(&self) -> Result<T> {
        return Ok(serde_json::from_slice(self.payload.as_slice())?);
    }

    pub fn created_at(&self) -> u64 {
        return self.created_at;
    }

    pub fn updated_at(&self) -> u64 {
        return self.updated_at;
    }

    pub fn expires_at(&self) -> u64 {
        return self.expires_at;
    }

    /// 0 means the event never expires.
    pub fn set_expires_at(&mut self, micros: u64) {
        self.expires_at = micros;
    }

    pub fn set_expires_in(&mut self, ttl: Duration) {
        self.expires_at = now_micros().saturating_add(duration_micros(ttl));
    }

    pub fn set_expires_in_hours(&mut self, hours: u64) {
        self.set_expires_in(Duration::from_secs(hours * 3600));
    }

    pub fn set_expires_in_days(&mut self, days: u64) {
        self.set_expires_in(Duration::from_secs(days * 24 * 3600));
    }

    /// Expiry relative to now as "[-]h[h][:mm][:ss][.fff]", a negative
    /// value gives an event that is already expired.
    pub fn set_expiration_from_str(&mut self, text: &str) -> Result<()> {
        let offset = parse_duration_micros(text)
            .ok_or_else(|| Error::InvalidDuration(text.to_string()))?;
        let now = now_micros() as i64;
        self.expires_at = now.saturating_add(offset).max(1) as u64;
        return Ok(());
    }

    /// Time left before expiry, negative once expired.
    pub fn expiration_string(&self) -> String {
        if self.expires_at == 0 {
            return "never".to_string();
        }
        return format_duration_micros(self.expires_at as i64 - now_micros() as i64);
    }

    pub fn is_expired(&self, grace: Duration) -> bool {
        return self.is_expired_at(now_micros(), grace);
    }

    pub fn is_expired_at(&self, now: u64, grace: Duration) -> bool {
        if self.expires_at == 0 {
            return false;
        }
        return self.expires_at.saturating_add(duration_micros(grace)) < now;
    }

    pub fn is_read(&self) -> bool {
        return self.read_at != 0;
    }

    /// Last time anybody read this event.
    pub fn read_at(&self) -> u64 {
        return self.read_at;
    }

    pub fn read_frequency(&self) -> ReadFrequency {
        return ReadFrequency::from_u32(self.read_frequency);
    }

    pub fn set_read_frequency(&mut self, frequency: ReadFrequency) {
        self.read_frequency = frequency as u32;
    }

    pub fn readers(&self) -> impl Iterator<Item = &ReadMark> {
        return self.read_by.iter().filter(|m| !m.reader.is_empty());
    }

    pub fn time_of_last_read(&self, reader: &str) -> Option<u64> {
        return self
            .readers()
            .find(|m| m.reader.eq_ignore_case(reader))
            .map(|m| m.read_at);
    }

    pub fn mark_read_by(&mut self, reader: &str, at: u64) {
        self.read_at = at;
        if let Some(mark) = self
            .read_by
            .iter_mut()
            .find(|m| !m.reader.is_empty() && m.reader.eq_ignore_case(reader))
        {
            mark.read_at = at;
            return;
        }

        let index = match self.read_by.iter().position(|m| m.reader.is_empty()) {
            Some(free) => free,
            None => {
                let mut oldest = 0;
                for (i, m) in self.read_by.iter().enumerate() {
                    if m.read_at < self.read_by[oldest].read_at {
                        oldest = i;
                    }
                }
                warn!(
                    "read list of {} is full, forgetting reader {}",
                    self.describe(),
                    self.read_by[oldest].reader
                );
                oldest
            }
        };
        self.read_by[index].reader.set(reader);
        self.read_by[index].read_at = at;
    }

    /// Whether `reader` has read this event recently enough for its read
    /// frequency. `login_at` is when the reader registered.
    pub fn is_read_by(&self, reader: &str, now: u64, login_at: u64) -> bool {
        let last = match self.time_of_last_read(reader) {
            Some(at) => at,
            None => return false,
        };
        return match self.read_frequency() {
            ReadFrequency::Once => true,
            ReadFrequency::Hourly => now.saturating_sub(last) < HOUR_MICROS,
            ReadFrequency::Daily => now.saturating_sub(last) < DAY_MICROS,
            ReadFrequency::Login => login_at == 0 || last >= login_at,
        };
    }

    pub fn clear_read_by(&mut self) {
        self.read_by = [ReadMark::default(); MAX_READERS];
        self.read_at = 0;
    }

    /// Wipes what the event carried, leaving the key and timestamps behind
    /// in the freed slot.
    pub fn clear_content(&mut self) {
        self.topic.clear();
        self.to.clear();
        self.from.clear();
        self.payload.clear();
        self.kind = EventKind::NotInUse as i32;
        self.read_frequency = 0;
        self.clear_read_by();
    }

    /// Columns of the diagnostics dump.
    pub fn row(&self) -> Vec<String> {
        let readers: Vec<String> = self
            .readers()
            .map(|m| format!("{}@{}", m.reader, format_micros(m.read_at)))
            .collect();
        return vec![
            self.key.to_string(),
            if self.in_use { "yes" } else { "no" }.to_string(),
            self.topic().to_string(),
            self.to().to_string(),
            self.from().to_string(),
            self.type_name().to_string(),
            format_micros(self.created_at),
            self.expiration_string(),
            format_micros(self.read_at),
            readers.join(" "),
            self.payload_str(),
        ];
    }

    pub const ROW_HEADER: [&'static str; 11] = [
        "key", "in use", "topic", "to", "from", "type", "created", "expires", "read",
        "read by", "payload",
    ];
}

impl Record for Event {
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
            "event key {} topic {:?} to {:?} from {:?} type {}",
            self.key,
            self.topic(),
            self.to(),
            self.from(),
            self.type_name()
        );
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        return f
            .debug_struct("Event")
            .field("key", &self.key)
            .field("in_use", &self.in_use)
            .field("topic", &self.topic)
            .field("to", &self.to)
            .field("from", &self.from)
            .field("type", &self.type_name())
            .field("expires", &self.expiration_string())
            .field("read_at", &self.read_at)
            .field("payload", &self.payload)
            .finish();
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        return f.write_str(&self.describe());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn kinds_and_names() {
        assert_eq!(EventKind::from_i32(6), Some(EventKind::Shutdown));
        assert_eq!(EventKind::from_i32(9001), Some(EventKind::MaintenanceStart));
        assert_eq!(EventKind::from_i32(77), None);
        assert_eq!(type_name(77), "unk type");
        assert_eq!(type_name(9003), "Shmem Status");
        assert_eq!(EventKind::from_name("shutdown"), Some(EventKind::Shutdown));
        assert_eq!(EventKind::from_name("Maint Start"), Some(EventKind::MaintenanceStart));
        assert_eq!(EventKind::from_name("post_it"), Some(EventKind::PostIt));
    }

    #[test]
    fn expiry() {
        let mut e = Event::new("t", "to", "from", EventKind::Generic);
        assert!(!e.is_expired(Duration::ZERO));

        e.set_expiration_from_str("-0:00:10").unwrap();
        assert!(e.is_expired(Duration::ZERO));
        // still inside the grace period
        assert!(!e.is_expired(Duration::from_secs(60)));

        e.set_expires_in_hours(1);
        assert!(!e.is_expired(Duration::ZERO));
        assert!(e.set_expiration_from_str("soon").is_err());
        assert!(matches!(
            e.set_expiration_from_str("9999999999999999"),
            Err(Error::InvalidDuration(_))
        ));
        assert!(!e.is_expired(Duration::ZERO));

        e.set_expires_at(0);
        assert!(!e.is_expired(Duration::ZERO));
        assert_eq!(e.expiration_string(), "never");
    }

    #[test]
    fn read_once() {
        let mut e = Event::new("t", "X", "A", EventKind::Shutdown);
        let now = now_micros();
        assert!(!e.is_read());
        assert!(!e.is_read_by("X", now, 0));
        e.mark_read_by("X", now);
        assert!(e.is_read());
        assert!(e.is_read_by("x", now + DAY_MICROS * 10, 0));
        assert!(!e.is_read_by("Y", now, 0));
        assert_eq!(e.time_of_last_read("X"), Some(now));

        // marking again does not add a second entry
        e.mark_read_by("X", now + 1);
        assert_eq!(e.readers().count(), 1);
        e.clear_read_by();
        assert!(!e.is_read());
        assert_eq!(e.readers().count(), 0);
    }

    #[test]
    fn read_frequencies() {
        let mut e = Event::new("t", "X", "A", EventKind::PostIt);
        let t0 = 1_000 * DAY_MICROS;
        e.mark_read_by("X", t0);

        e.set_read_frequency(ReadFrequency::Hourly);
        assert!(e.is_read_by("X", t0 + HOUR_MICROS / 2, 0));
        assert!(!e.is_read_by("X", t0 + HOUR_MICROS * 2, 0));

        e.set_read_frequency(ReadFrequency::Daily);
        assert!(e.is_read_by("X", t0 + HOUR_MICROS * 2, 0));
        assert!(!e.is_read_by("X", t0 + DAY_MICROS * 2, 0));

        // read before the reader's current login does not count
        e.set_read_frequency(ReadFrequency::Login);
        assert!(e.is_read_by("X", t0, t0 - 10));
        assert!(!e.is_read_by("X", t0 + 20, t0 + 10));
    }

    #[test]
    fn full_read_list_forgets_oldest() {
        let mut e = Event::new("t", "X", "A", EventKind::Generic);
        for i in 0..MAX_READERS {
            e.mark_read_by(&format!("r{}", i), 100 + i as u64);
        }
        e.mark_read_by("late", 1_000);
        assert_eq!(e.readers().count(), MAX_READERS);
        assert_eq!(e.time_of_last_read("r0"), None);
        assert_eq!(e.time_of_last_read("late"), Some(1_000));
    }

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Report {
        count: u32,
        name: String,
    }

    #[test]
    fn json_payload() {
        let mut e = Event::new("t", "X", "A", EventKind::Log);
        let report = Report {
            count: 3,
            name: "maint".to_string(),
        };
        assert!(e.set_payload_json(&report).unwrap());
        assert_eq!(e.payload_json::<Report>().unwrap(), report);

        e.set_payload_str("{not json");
        assert!(matches!(
            e.payload_json::<Report>(),
            Err(Error::Deserialization(_))
        ));

        let long = "x".repeat(PAYLOAD_SIZE + 10);
        assert!(!e.set_payload_str(&long));
        assert_eq!(e.payload().len(), PAYLOAD_SIZE);
    }

    #[test]
    fn clearing_keeps_key() {
        let mut e = Event::new("t", "X", "A", EventKind::Generic);
        e.set_key(42);
        e.set_payload_str("data");
        e.mark_read_by("X", 5);
        e.clear_content();
        assert_eq!(e.key(), 42);
        assert_eq!(e.topic(), "");
        assert!(e.payload().is_empty());
        assert_eq!(e.kind(), Some(EventKind::NotInUse));
        assert!(!e.is_read());
    }
}
