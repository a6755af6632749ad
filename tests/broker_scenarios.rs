// Several simulated processes share one segment, each with its own Broker
// mapping, the way separate executables would.

use shm_broker::utils::{now_micros, unique_name};
use shm_broker::{
    Broker, BrokerConfig, Event, EventKind, EventList, Filter, FilterSet, Record, Router,
    UpsertOutcome,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct TestSegment {
    config: BrokerConfig,
}

impl TestSegment {
    fn new(event_capacity: usize) -> TestSegment {
        init();
        let config = BrokerConfig {
            event_capacity,
            process_capacity: 8,
            heartbeat_interval: Duration::from_millis(10),
            maintenance_interval: Duration::from_millis(50),
            router_sleep: Duration::from_millis(10),
            ..BrokerConfig::default()
        }
        .with_segment(&unique_name("broker_scenarios"));
        return TestSegment { config };
    }

    // A new mapping, as another process would have.
    fn open(&self) -> Arc<Broker> {
        return Broker::open(self.config.clone()).unwrap();
    }
}

impl Drop for TestSegment {
    fn drop(&mut self) {
        let _ = Broker::reset(&self.config.segment_name);
    }
}

fn event(topic: &str) -> Event {
    return Event::new(topic, "X", "A", EventKind::Generic);
}

fn wait_for(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    return done();
}

#[test]
fn full_table_evicts_the_oldest() {
    let segment = TestSegment::new(4);
    let broker = segment.open();
    let mut keys = Vec::new();
    for i in 0..4 {
        let mut e = event(&format!("t{}", i));
        keys.push(broker.send_event(&mut e, false).key());
        std::thread::sleep(Duration::from_millis(1));
    }

    let mut e = event("t4");
    let outcome = broker.send_event(&mut e, false);
    assert!(matches!(outcome, UpsertOutcome::Evicted { evicted, .. } if evicted == keys[0]));
    let mut e = event("t5");
    let outcome = broker.send_event(&mut e, false);
    assert!(matches!(outcome, UpsertOutcome::Evicted { evicted, .. } if evicted == keys[1]));

    assert_eq!(broker.events().count_in_use(), 4);
    assert!(broker.events().find(keys[0]).is_none());
    assert!(broker.events().find(keys[2]).is_some());
}

#[test]
fn updating_a_missing_key_changes_nothing() {
    let segment = TestSegment::new(8);
    let broker = segment.open();
    let mut stored = event("kept");
    broker.send_event(&mut stored, false);

    let mut ghost = event("ghost");
    ghost.set_key(stored.key() + 100);
    assert!(!broker.events().update(&mut ghost));

    let all = broker.events().collect(|_| true);
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].topic(), "kept");
}

#[test]
fn removed_records_are_only_seen_by_for_each_all() {
    let segment = TestSegment::new(8);
    let broker = segment.open();
    let mut e = event("gone");
    let key = broker.send_event(&mut e, false).key();
    assert!(broker.events().remove(key, |slot| slot.clear_content()));

    let mut live = 0;
    broker.events().for_each(|r| {
        if r.key() == key {
            live += 1;
        }
    });
    let mut all = 0;
    broker.events().for_each_all(|r| {
        if r.key() == key {
            all += 1;
        }
    });
    assert_eq!(live, 0);
    assert_eq!(all, 1);
}

#[test]
fn empty_filters_match_everything() {
    let e = event("anything");
    assert!(Filter::new().check(&e));
    assert!(FilterSet::new().check(&e));

    let segment = TestSegment::new(8);
    let broker = segment.open();
    for topic in ["a", "b", "c"] {
        broker.send_event(&mut event(topic), false);
    }
    let mut list = EventList::new(FilterSet::new());
    assert_eq!(list.fetch(broker.events()), 3);
}

#[test]
fn keys_increase_across_processes() {
    let segment = TestSegment::new(8);
    let first = segment.open();
    let second = segment.open();
    let mut last = 0;
    for i in 0..20 {
        let broker = if i % 2 == 0 { &first } else { &second };
        let key = broker.send_event(&mut event("k"), false).key();
        assert!(key > last);
        last = key;
    }
}

#[test]
fn maintenance_removes_each_event_once() {
    let segment = TestSegment::new(64);
    let setup = segment.open();
    let mut expected = HashSet::new();
    for _ in 0..40 {
        let mut e = event("old");
        e.set_expiration_from_str("-1").unwrap();
        expected.insert(setup.send_event(&mut e, false).key());
    }

    let notified = Arc::new(Mutex::new(Vec::new()));
    let mut threads = Vec::new();
    for id in 0..4 {
        let broker = segment.open();
        let notified = notified.clone();
        threads.push(std::thread::spawn(move || {
            for _ in 0..5 {
                broker.perform_maintenance(&format!("p{}", id), |batch| {
                    let mut notified = notified.lock().unwrap();
                    notified.extend(batch.iter().map(|e| e.key()));
                });
            }
        }));
    }
    for t in threads {
        t.join().unwrap();
    }

    let notified = notified.lock().unwrap();
    let unique: HashSet<u64> = notified.iter().copied().collect();
    assert_eq!(notified.len(), unique.len());
    assert_eq!(unique, expected);
}

#[test]
fn highest_bid_runs_maintenance() {
    let segment = TestSegment::new(32);
    // B first, so A never sees itself as the only candidate
    let b = Router::new(segment.open(), "B").unwrap();
    b.start(10).unwrap();
    let a = Router::new(segment.open(), "A").unwrap();
    a.start(5).unwrap();

    assert!(b.is_maintenance_process());
    assert!(!a.is_maintenance_process());
    assert!(wait_for(|| {
        b.own_process_record()
            .map(|p| p.last_maintenance() > 0)
            .unwrap_or(false)
    }));
    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(a.own_process_record().unwrap().last_maintenance(), 0);
}

#[test]
fn shutdown_reaches_its_addressee_once() {
    let segment = TestSegment::new(32);
    let a = Router::new(segment.open(), "A").unwrap();
    a.start(0).unwrap();

    let b = Router::new(segment.open(), "B").unwrap();
    let received = Arc::new(Mutex::new(Vec::new()));
    let handler = b.register_handler("X");
    {
        let mut handler = handler.lock();
        handler.add_to("X").unwrap();
        let received = received.clone();
        handler.set_incoming_func(move |e| received.lock().unwrap().push(*e));
    }
    b.start(0).unwrap();

    let key = a
        .send(
            "Shutdown",
            "X",
            "A",
            EventKind::Shutdown,
            Duration::from_secs(3600),
            "",
        )
        .key();
    assert!(wait_for(|| received.lock().unwrap().len() == 1));
    let got = received.lock().unwrap()[0];
    assert_eq!(got.key(), key);
    assert_eq!(got.kind(), Some(EventKind::Shutdown));
    assert_eq!(got.from(), "A");

    assert!(wait_for(|| {
        b.broker()
            .events()
            .find(key)
            .map(|e| e.is_read_by("X", now_micros(), 0))
            .unwrap_or(false)
    }));
    let mut unread = FilterSet::new();
    unread.add_filter(Filter::new().key(key).is_read(false));
    let mut list = EventList::new(unread);
    assert_eq!(b.fetch(&mut list), 0);

    b.trigger_wake();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(received.lock().unwrap().len(), 1);
}

#[test]
fn expired_events_stay_until_maintenance() {
    let segment = TestSegment::new(16);
    let broker = segment.open();
    let mut e = event("stale");
    e.set_expiration_from_str("-1").unwrap();
    let key = broker.send_event(&mut e, false).key();

    let stored = broker.events().find(key).unwrap();
    assert!(stored.is_expired(Duration::ZERO));
    let mut list = EventList::new(FilterSet::new());
    list.fetch(broker.events());
    assert!(list.find_event(key).is_some());

    let report = broker.perform_maintenance("tester", |_| {}).unwrap();
    assert_eq!(report.records_processed, 1);
    assert!(broker.events().find(key).is_none());
}
