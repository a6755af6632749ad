/*
 * Selecting events.
 *
 * A Filter is a conjunction: every field that is set has to match, a filter
 * with nothing set matches every event. A FilterSet is a disjunction of
 * filters, and an empty set matches every event as well.
 *
 * String fields compare without regard to case, unless the value starts
 * with REGEX_MARKER, in which case the rest is a regex that has to match the
 * whole field. Patterns are compiled once, when the filter is built.
 */
use crate::constants::REGEX_MARKER;
use crate::error::{Error, Result};
use crate::event::{Event, EventKind};
use crate::record_vector::RecordVector;
use crate::utils::now_micros;
use log::{debug, trace};
use regex::Regex;
use std::time::Duration;

#[derive(Debug, Clone)]
enum Matcher {
    Exact(String),
    Pattern { source: String, regex: Regex },
}

impl Matcher {
    fn parse(value: &str) -> Result<Matcher> {
        let pattern = match value.strip_prefix(REGEX_MARKER) {
            Some(p) => p,
            None => return Ok(Matcher::Exact(value.to_string())),
        };
        let regex = Regex::new(&format!("^(?:{})$", pattern)).map_err(|source| {
            Error::InvalidPattern {
                pattern: pattern.to_string(),
                source,
            }
        })?;
        return Ok(Matcher::Pattern {
            source: value.to_string(),
            regex,
        });
    }

    fn matches(&self, field: &str) -> bool {
        return match self {
            Matcher::Exact(value) => {
                if value.is_ascii() && field.is_ascii() {
                    value.eq_ignore_ascii_case(field)
                } else {
                    value.to_lowercase() == field.to_lowercase()
                }
            }
            Matcher::Pattern { regex, .. } => regex.is_match(field),
        };
    }

    fn as_str(&self) -> &str {
        return match self {
            Matcher::Exact(value) => value,
            Matcher::Pattern { source, .. } => source,
        };
    }
}

/// What a check needs to know besides the event itself.
#[derive(Debug, Clone, Copy)]
pub struct CheckContext {
    pub now: u64,
    /// When the reader registered, for events read once per login.
    pub login_at: u64,
    /// Grace period added to expires_at.
    pub grace: Duration,
}

impl CheckContext {
    pub fn now() -> CheckContext {
        return CheckContext {
            now: now_micros(),
            login_at: 0,
            grace: Duration::ZERO,
        };
    }
}

impl Default for CheckContext {
    fn default() -> Self {
        return CheckContext::now();
    }
}

#[derive(Debug, Clone, Default)]
pub struct Filter {
    // who is asking when checking is_read, the event's `to` if unset
    client_id: Option<String>,
    key: Option<u64>,
    topic: Option<Matcher>,
    to: Option<Matcher>,
    from: Option<Matcher>,
    payload: Option<Matcher>,
    is_read: Option<bool>,
    is_expired: Option<bool>,
    event_type: Option<i32>,
}

impl Filter {
    pub fn new() -> Filter {
        return Filter::default();
    }

    pub fn client_id(mut self, id: &str) -> Filter {
        self.client_id = Some(id.to_string());
        return self;
    }

    pub fn key(mut self, key: u64) -> Filter {
        self.key = Some(key);
        return self;
    }

    pub fn topic(mut self, topic: &str) -> Result<Filter> {
        self.topic = Some(Matcher::parse(topic)?);
        return Ok(self);
    }

    pub fn to(mut self, to: &str) -> Result<Filter> {
        self.to = Some(Matcher::parse(to)?);
        return Ok(self);
    }

    pub fn from(mut self, from: &str) -> Result<Filter> {
        self.from = Some(Matcher::parse(from)?);
        return Ok(self);
    }

    pub fn payload(mut self, payload: &str) -> Result<Filter> {
        self.payload = Some(Matcher::parse(payload)?);
        return Ok(self);
    }

    pub fn is_read(mut self, read: bool) -> Filter {
        self.is_read = Some(read);
        return self;
    }

    pub fn is_expired(mut self, expired: bool) -> Filter {
        self.is_expired = Some(expired);
        return self;
    }

    pub fn event_type(mut self, kind: i32) -> Filter {
        self.event_type = Some(kind);
        return self;
    }

    pub fn kind(self, kind: EventKind) -> Filter {
        return self.event_type(kind as i32);
    }

    pub fn is_open(&self) -> bool {
        return self.key.is_none()
            && self.topic.is_none()
            && self.to.is_none()
            && self.from.is_none()
            && self.payload.is_none()
            && self.is_read.is_none()
            && self.is_expired.is_none()
            && self.event_type.is_none();
    }

    pub fn check(&self, event: &Event) -> bool {
        return self.check_at(event, &CheckContext::now());
    }

    pub fn check_at(&self, event: &Event, ctx: &CheckContext) -> bool {
        if let Some(key) = self.key {
            if event.key() != key {
                return false;
            }
        }
        if let Some(kind) = self.event_type {
            if event.event_type() != kind {
                return false;
            }
        }
        let strings = [
            (&self.topic, event.topic()),
            (&self.to, event.to()),
            (&self.from, event.from()),
        ];
        for (matcher, field) in strings {
            if let Some(m) = matcher {
                if !m.matches(field) {
                    return false;
                }
            }
        }
        if let Some(m) = &self.payload {
            if !m.matches(&event.payload_str()) {
                return false;
            }
        }
        if let Some(want) = self.is_read {
            let reader = self.client_id.as_deref().unwrap_or(event.to());
            if event.is_read_by(reader, ctx.now, ctx.login_at) != want {
                return false;
            }
        }
        if let Some(want) = self.is_expired {
            if event.is_expired_at(ctx.now, ctx.grace) != want {
                return false;
            }
        }
        return true;
    }

    pub fn log(&self, msg: &str) {
        debug!(
            "filter {}: id {:?} key {:?} topic {:?} to {:?} from {:?} payload {:?} \
            read {:?} expired {:?} type {:?}",
            msg,
            self.client_id,
            self.key,
            self.topic.as_ref().map(|m| m.as_str()),
            self.to.as_ref().map(|m| m.as_str()),
            self.from.as_ref().map(|m| m.as_str()),
            self.payload.as_ref().map(|m| m.as_str()),
            self.is_read,
            self.is_expired,
            self.event_type
        );
    }
}

/// Any of the filters, or everything if there are none.
#[derive(Debug, Clone, Default)]
pub struct FilterSet {
    filters: Vec<Filter>,
}

impl FilterSet {
    pub fn new() -> FilterSet {
        return FilterSet::default();
    }

    pub fn len(&self) -> usize {
        return self.filters.len();
    }

    pub fn is_empty(&self) -> bool {
        return self.filters.is_empty();
    }

    pub fn clear(&mut self) {
        self.filters.clear();
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Filter> {
        return self.filters.iter();
    }

    pub fn add_filter(&mut self, filter: Filter) {
        self.filters.push(filter);
    }

    pub fn append(&mut self, other: &FilterSet) {
        self.filters.extend(other.filters.iter().cloned());
    }

    pub fn add_key(&mut self, key: u64) {
        self.add_filter(Filter::new().key(key));
    }

    pub fn add_topic(&mut self, topic: &str) -> Result<()> {
        self.add_filter(Filter::new().topic(topic)?);
        return Ok(());
    }

    pub fn add_to(&mut self, to: &str) -> Result<()> {
        self.add_filter(Filter::new().to(to)?);
        return Ok(());
    }

    pub fn add_from(&mut self, from: &str) -> Result<()> {
        self.add_filter(Filter::new().from(from)?);
        return Ok(());
    }

    pub fn add_payload(&mut self, payload: &str) -> Result<()> {
        self.add_filter(Filter::new().payload(payload)?);
        return Ok(());
    }

    pub fn add_is_read(&mut self, read: bool) {
        self.add_filter(Filter::new().is_read(read));
    }

    pub fn add_is_expired(&mut self, expired: bool) {
        self.add_filter(Filter::new().is_expired(expired));
    }

    pub fn add_event_type(&mut self, kind: i32) {
        self.add_filter(Filter::new().event_type(kind));
    }

    pub fn add_kind(&mut self, kind: EventKind) {
        self.add_event_type(kind as i32);
    }

    /// Events addressed to `id` that `id` has not read yet.
    pub fn add_pending_events(&mut self, id: &str) -> Result<()> {
        self.add_filter(Filter::new().to(id)?.client_id(id).is_read(false));
        return Ok(());
    }

    /// Unread maintenance start, end and status events.
    pub fn add_pending_maintenance_events(&mut self) {
        for kind in [
            EventKind::MaintenanceStart,
            EventKind::MaintenanceEnd,
            EventKind::MaintenanceStatus,
        ] {
            self.add_filter(Filter::new().is_read(false).kind(kind));
        }
    }

    pub fn check(&self, event: &Event) -> bool {
        return self.check_at(event, &CheckContext::now());
    }

    pub fn check_at(&self, event: &Event, ctx: &CheckContext) -> bool {
        return self.filters.is_empty() || self.filters.iter().any(|f| f.check_at(event, ctx));
    }

    pub fn log(&self, msg: &str) {
        debug!("filter set {}: {} filters", msg, self.filters.len());
        for filter in &self.filters {
            filter.log(msg);
        }
    }
}

/// A process local snapshot of the events a filter set selects. Subscribe
/// once, then fetch as often as needed.
#[derive(Debug, Clone, Default)]
pub struct EventList {
    filters: FilterSet,
    events: Vec<Event>,
}

impl EventList {
    pub fn new(filters: FilterSet) -> EventList {
        return EventList {
            filters,
            events: Vec::new(),
        };
    }

    pub fn filters(&self) -> &FilterSet {
        return &self.filters;
    }

    pub fn filters_mut(&mut self) -> &mut FilterSet {
        return &mut self.filters;
    }

    pub fn events(&self) -> &[Event] {
        return &self.events;
    }

    pub fn len(&self) -> usize {
        return self.events.len();
    }

    pub fn is_empty(&self) -> bool {
        return self.events.is_empty();
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Event> {
        return self.events.iter();
    }

    /// Drops the collected events and the filters.
    pub fn reset(&mut self) {
        self.filters.clear();
        self.events.clear();
    }

    /// Drops the collected events only.
    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn find_event(&self, key: u64) -> Option<&Event> {
        if key == 0 {
            return None;
        }
        return self.events.iter().find(|e| e.key() == key);
    }

    /// Appends unless an event with the same key is already listed. Events
    /// that were never stored (key 0) are always appended.
    pub fn push(&mut self, event: Event) -> bool {
        if event.key() != 0 && self.find_event(event.key()).is_some() {
            return false;
        }
        self.events.push(event);
        return true;
    }

    /// Adds the matching events of `vector` that are not listed yet and
    /// returns how many were added.
    pub fn fetch(&mut self, vector: &RecordVector<Event>) -> usize {
        return self.fetch_at(vector, &CheckContext::now());
    }

    pub fn fetch_at(&mut self, vector: &RecordVector<Event>, ctx: &CheckContext) -> usize {
        let matching = vector.collect(|e| self.filters.check_at(e, ctx));
        let mut added = 0;
        for event in matching {
            if self.push(event) {
                added += 1;
            }
        }
        trace!("fetched {} new events from {}", added, vector.name());
        return added;
    }

    /// Like fetch, starting from an empty list.
    pub fn fetch_fresh(&mut self, vector: &RecordVector<Event>) -> usize {
        self.events.clear();
        return self.fetch(vector);
    }

    pub fn log(&self, msg: &str) {
        debug!("event list {}: {} events", msg, self.events.len());
        for event in &self.events {
            debug!("  {:?}", event);
        }
    }
}

impl<'a> IntoIterator for &'a EventList {
    type Item = &'a Event;
    type IntoIter = std::slice::Iter<'a, Event>;

    fn into_iter(self) -> Self::IntoIter {
        return self.events.iter();
    }
}

impl IntoIterator for EventList {
    type Item = Event;
    type IntoIter = std::vec::IntoIter<Event>;

    fn into_iter(self) -> Self::IntoIter {
        return self.events.into_iter();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record_vector::Record;
    use crate::segment::Segment;
    use crate::utils::unique_name;

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn shutdown_event() -> Event {
        let mut e = Event::new("Shutdown", "X", "A", EventKind::Shutdown);
        e.set_key(7);
        e.set_payload_str("now please");
        return e;
    }

    #[test]
    fn empty_filter_and_set_match_everything() {
        let e = shutdown_event();
        let blank = Event::default();
        assert!(Filter::new().is_open());
        assert!(Filter::new().check(&e));
        assert!(Filter::new().check(&blank));
        assert!(FilterSet::new().check(&e));
        assert!(FilterSet::new().check(&blank));
    }

    #[test]
    fn fields_are_a_conjunction() {
        let e = shutdown_event();
        assert!(Filter::new().to("x").unwrap().check(&e));
        assert!(Filter::new()
            .to("X")
            .unwrap()
            .kind(EventKind::Shutdown)
            .key(7)
            .check(&e));
        assert!(!Filter::new()
            .to("X")
            .unwrap()
            .kind(EventKind::Ping)
            .check(&e));
        assert!(!Filter::new().from("B").unwrap().check(&e));
        assert!(Filter::new().payload("NOW PLEASE").unwrap().check(&e));
    }

    #[test]
    fn sets_are_a_disjunction() {
        let e = shutdown_event();
        let mut set = FilterSet::new();
        set.add_topic("Other").unwrap();
        assert!(!set.check(&e));
        set.add_from("A").unwrap();
        assert!(set.check(&e));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn patterns_match_whole_field() {
        let e = shutdown_event();
        assert!(Filter::new().topic("/:Shut.*").unwrap().check(&e));
        assert!(!Filter::new().topic("/:Shut").unwrap().check(&e));
        assert!(Filter::new().to("/:[XY]").unwrap().check(&e));
        assert!(matches!(
            Filter::new().topic("/:(unclosed"),
            Err(Error::InvalidPattern { .. })
        ));
    }

    #[test]
    fn read_and_expired_state() {
        let mut e = shutdown_event();
        let mut pending = FilterSet::new();
        pending.add_pending_events("X").unwrap();
        assert!(pending.check(&e));

        e.mark_read_by("X", now_micros());
        assert!(!pending.check(&e));
        // someone else reading it does not matter to Y
        let unread_by_y = Filter::new().client_id("Y").is_read(false);
        assert!(unread_by_y.check(&e));

        assert!(Filter::new().is_expired(false).check(&e));
        e.set_expiration_from_str("-1").unwrap();
        assert!(Filter::new().is_expired(true).check(&e));
        let ctx = CheckContext {
            grace: Duration::from_secs(7200),
            ..CheckContext::now()
        };
        assert!(Filter::new().is_expired(false).check_at(&e, &ctx));
    }

    #[test]
    fn maintenance_filters() {
        let mut set = FilterSet::new();
        set.add_pending_maintenance_events();
        assert_eq!(set.len(), 3);
        let start = Event::new("Maint Status", "System", "Maint", EventKind::MaintenanceStart);
        let status = Event::new("Shmem Status", "System", "Maint", EventKind::MaintenanceStatus);
        assert!(set.check(&start));
        assert!(set.check(&status));
        assert!(!set.check(&shutdown_event()));
    }

    #[test]
    fn list_fetch_deduplicates() {
        init();
        let name = unique_name("shm_broker_test");
        let segment = Segment::open_or_create(&name, 200_000).unwrap();
        let vector = RecordVector::<Event>::get_or_create(&segment, "events", 8).unwrap();

        let mut a = Event::new("Shutdown", "X", "A", EventKind::Shutdown);
        let mut b = Event::new("Ping", "Y", "A", EventKind::Ping);
        vector.update_add(&mut a);
        vector.update_add(&mut b);

        let mut set = FilterSet::new();
        set.add_to("X").unwrap();
        let mut list = EventList::new(set);
        assert_eq!(list.fetch(&vector), 1);
        assert_eq!(list.fetch(&vector), 0);
        assert_eq!(list.len(), 1);
        assert!(list.find_event(a.key()).is_some());
        assert_eq!(list.fetch_fresh(&vector), 1);

        // unsaved events are never considered duplicates
        assert!(list.push(Event::default()));
        assert!(list.push(Event::default()));
        assert!(!list.push(a));
        assert_eq!(list.len(), 3);

        list.reset();
        assert!(list.filters().is_empty());
        assert_eq!(list.fetch(&vector), 2);
        Segment::reset(&name).unwrap();
    }
}
