// Structured state carried in event payloads. A consumer keeps the last value
// that decoded cleanly; a malformed payload is logged and the old value stays.

use crate::error::Result;
use crate::event::Event;
use log::warn;
use serde::de::DeserializeOwned;

#[derive(Debug, Clone)]
pub struct LatestPayload<T> {
    value: Option<T>,
    key: u64,
    failures: usize,
}

impl<T> Default for LatestPayload<T> {
    fn default() -> Self {
        return LatestPayload {
            value: None,
            key: 0,
            failures: 0,
        };
    }
}

impl<T: DeserializeOwned> LatestPayload<T> {
    pub fn new() -> LatestPayload<T> {
        return LatestPayload::default();
    }

    /// Starts from a known good value.
    pub fn with_value(value: T) -> LatestPayload<T> {
        return LatestPayload {
            value: Some(value),
            key: 0,
            failures: 0,
        };
    }

    /// Decodes the event's payload. On failure the previous value is kept
    /// and the error returned for the caller to inspect if it cares.
    pub fn apply(&mut self, event: &Event) -> Result<&T> {
        match event.payload_json::<T>() {
            Ok(value) => {
                self.key = event.key();
                let value: &T = self.value.insert(value);
                return Ok(value);
            }
            Err(e) => {
                self.failures += 1;
                warn!(
                    "keeping previous state, payload of event {} ({}) is malformed: {}",
                    event.key(),
                    event.topic(),
                    e
                );
                return Err(e);
            }
        }
    }

    /// Like apply(), for callers that only want the current value.
    pub fn update(&mut self, event: &Event) -> Option<&T> {
        let _ = self.apply(event);
        return self.value.as_ref();
    }

    pub fn get(&self) -> Option<&T> {
        return self.value.as_ref();
    }

    /// Key of the event the current value came from, 0 if none.
    pub fn source_key(&self) -> u64 {
        return self.key;
    }

    pub fn failures(&self) -> usize {
        return self.failures;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use crate::record_vector::Record;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Credentials {
        user: String,
        token: String,
    }

    fn event_with(key: u64, payload: &str) -> Event {
        let mut e = Event::new("login", "X", "A", EventKind::DoCredentials);
        e.set_key(key);
        e.set_payload_str(payload);
        return e;
    }

    #[test]
    fn malformed_payload_keeps_previous_value() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut latest = LatestPayload::<Credentials>::new();
        assert!(latest.get().is_none());

        let good = event_with(1, r#"{"user":"amy","token":"t1"}"#);
        assert_eq!(latest.apply(&good).unwrap().user, "amy");

        let bad = event_with(2, r#"{"user":"bob","tok"#);
        assert!(latest.apply(&bad).is_err());
        assert_eq!(latest.get().unwrap().token, "t1");
        assert_eq!(latest.source_key(), 1);
        assert_eq!(latest.failures(), 1);

        let newer = event_with(3, r#"{"user":"bob","token":"t2"}"#);
        assert_eq!(latest.update(&newer).unwrap().user, "bob");
        assert_eq!(latest.source_key(), 3);
    }

    #[test]
    fn starts_from_given_value() {
        let start = Credentials {
            user: "amy".to_string(),
            token: "t0".to_string(),
        };
        let mut latest = LatestPayload::with_value(start.clone());
        assert_eq!(latest.update(&event_with(1, "not json")), Some(&start));
    }
}
