/*
 * One router per process. It registers the process, then a background thread
 * sleeps on the process's wake semaphore and on every wake up:
 *
 * - checks in when the heartbeat is due,
 * - tells the local handlers about processes that came or went,
 * - runs maintenance when the interval is up and this process is elected,
 * - hands matching events to the local handlers and marks them read.
 *
 * Senders post every wake semaphore after storing an event, so a router
 * normally reacts right away and the timeout only bounds how long a missed
 * post can go unnoticed.
 */
use crate::broker::{Broker, MaintenanceReport};
use crate::constants::ADDR_SIZE;
use crate::error::{Error, Result};
use crate::event::{Event, EventKind};
use crate::filter::{CheckContext, EventList};
use crate::fixed::FixedString;
use crate::handler::{EventHandler, EventHandlerHandle, HandlerRegistry};
use crate::process_record::ProcessRecord;
use crate::record_vector::{Record, UpsertOutcome};
use crate::signal::NamedSemaphore;
use crate::utils::now_micros;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterState {
    Unregistered,
    Registered,
    Running,
    Exiting,
    Stopped,
}

// State shared with the background thread.
struct Inner {
    broker: Arc<Broker>,
    id: String,
    handlers: HandlerRegistry,
    wake: NamedSemaphore,
    state: Mutex<RouterState>,
    exit: AtomicBool,
    ready: AtomicBool,
    manual_maintenance: AtomicBool,
    manual_dispatch: AtomicBool,
    process_key: AtomicU64,
    registered_at: AtomicU64,
    bid: AtomicI32,
}

pub struct Router {
    inner: Arc<Inner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Router {
    /// A router for the process `id`. Ids longer than the record field are
    /// cut, the router uses the stored form everywhere.
    pub fn new(broker: Arc<Broker>, id: &str) -> Result<Router> {
        let stored = FixedString::<ADDR_SIZE>::from(id);
        if stored.len() < id.len() {
            warn!("process id {:?} is too long, using {:?}", id, stored.as_str());
        }
        let id = stored.as_str().to_string();
        let wake = broker.wake_signal(&crate::process_record::wake_name_for(&id))?;
        return Ok(Router {
            inner: Arc::new(Inner {
                broker,
                id,
                handlers: HandlerRegistry::default(),
                wake,
                state: Mutex::new(RouterState::Unregistered),
                exit: AtomicBool::new(false),
                ready: AtomicBool::new(false),
                manual_maintenance: AtomicBool::new(false),
                manual_dispatch: AtomicBool::new(false),
                process_key: AtomicU64::new(0),
                registered_at: AtomicU64::new(0),
                bid: AtomicI32::new(0),
            }),
            thread: Mutex::new(None),
        });
    }

    pub fn id(&self) -> &str {
        return &self.inner.id;
    }

    pub fn broker(&self) -> &Arc<Broker> {
        return &self.inner.broker;
    }

    pub fn state(&self) -> RouterState {
        return *self.inner.state.lock();
    }

    /// True while the background thread is running.
    pub fn is_ready(&self) -> bool {
        return self.inner.ready.load(Ordering::SeqCst);
    }

    /// Registers the process with maintenance bid `bid` (0 or less never
    /// runs maintenance) and starts the background thread.
    pub fn start(&self, bid: i32) -> Result<()> {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return Err(Error::AlreadyStarted);
        }
        let inner = &self.inner;
        inner.exit.store(false, Ordering::SeqCst);
        inner.bid.store(bid, Ordering::SeqCst);

        // posts meant for an earlier run of this process
        while inner.wake.try_wait() {}

        inner.register();
        inner.set_state(RouterState::Registered);
        // let everybody else see the new process
        inner.broker.trigger_processes();

        let known = inner.other_processes();
        let worker = inner.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("router-{}", inner.id))
            .spawn(move || worker.run(known));
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                inner.unregister();
                inner.set_state(RouterState::Stopped);
                return Err(e.into());
            }
        };
        *thread = Some(handle);
        inner.ready.store(true, Ordering::SeqCst);
        inner.set_state(RouterState::Running);
        info!("router {} started with bid {}", inner.id, bid);
        return Ok(());
    }

    /// Stops the background thread and removes this process from the
    /// registry. Maintenance already in progress finishes first.
    pub fn stop(&self) -> Result<()> {
        let handle = match self.thread.lock().take() {
            Some(handle) => handle,
            None => return Err(Error::NotStarted),
        };
        let inner = &self.inner;
        inner.set_state(RouterState::Exiting);
        inner.exit.store(true, Ordering::SeqCst);
        inner.wake.post();
        if handle.join().is_err() {
            warn!("router {}: background thread panicked", inner.id);
        }
        inner.ready.store(false, Ordering::SeqCst);
        inner.unregister();
        inner.broker.trigger_processes();
        inner.set_state(RouterState::Stopped);
        info!("router {} stopped", inner.id);
        return Ok(());
    }

    pub fn register_handler(&self, id: &str) -> EventHandlerHandle {
        return self.inner.handlers.register(EventHandler::new(id));
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        return &self.inner.handlers;
    }

    pub fn send_event(&self, event: &mut Event, trigger: bool) -> UpsertOutcome {
        return self.inner.broker.send_event(event, trigger);
    }

    /// Stores a new event expiring after `ttl` and wakes every process.
    pub fn send(
        &self,
        topic: &str,
        to: &str,
        from: &str,
        kind: EventKind,
        ttl: Duration,
        payload: &str,
    ) -> UpsertOutcome {
        let mut event = Event::new(topic, to, from, kind);
        event.set_expires_in(ttl);
        return self.send_prepared(event, payload);
    }

    /// Like send() with an absolute expiry time, 0 for never.
    pub fn send_until(
        &self,
        topic: &str,
        to: &str,
        from: &str,
        kind: EventKind,
        expires_at: u64,
        payload: &str,
    ) -> UpsertOutcome {
        let mut event = Event::new(topic, to, from, kind);
        event.set_expires_at(expires_at);
        return self.send_prepared(event, payload);
    }

    fn send_prepared(&self, mut event: Event, payload: &str) -> UpsertOutcome {
        if !event.set_payload_str(payload) {
            warn!(
                "payload for {} cut to {} bytes",
                event.topic(),
                event.payload().len()
            );
        }
        return self.send_event(&mut event, true);
    }

    /// Writes back an event fetched earlier. Events without a key were never
    /// stored and are ignored.
    pub fn update_event(&self, event: &mut Event) -> bool {
        if event.key() == 0 {
            return false;
        }
        return self.inner.broker.events().update(event);
    }

    pub fn remove_event(&self, key: u64) -> bool {
        return self
            .inner
            .broker
            .events()
            .remove(key, |e| e.clear_content());
    }

    /// Returns how many of them were still stored.
    pub fn remove_events(&self, events: &[Event]) -> usize {
        return events
            .iter()
            .filter(|e| e.key() != 0 && self.remove_event(e.key()))
            .count();
    }

    pub fn all_events(&self) -> Vec<Event> {
        return self.inner.broker.events().collect(|_| true);
    }

    /// Fetches into `list` as this process sees it, so events read once per
    /// login use this router's registration time.
    pub fn fetch(&self, list: &mut EventList) -> usize {
        let ctx = self.inner.context();
        return list.fetch_at(self.inner.broker.events(), &ctx);
    }

    pub fn process_record(&self, id: &str) -> Option<ProcessRecord> {
        return self.inner.broker.find_process(id);
    }

    pub fn own_process_record(&self) -> Option<ProcessRecord> {
        let key = self.inner.process_key.load(Ordering::SeqCst);
        return self.inner.broker.processes().find(key);
    }

    /// When start() registered this process, 0 before that.
    pub fn register_time(&self) -> u64 {
        return self.inner.registered_at.load(Ordering::SeqCst);
    }

    pub fn shmem_version(&self) -> String {
        return self.inner.broker.shmem_version();
    }

    pub fn trigger_processes(&self) -> usize {
        return self.inner.broker.trigger_processes();
    }

    /// Wakes this process's own router thread.
    pub fn trigger_wake(&self) {
        self.inner.wake.post();
    }

    /// Runs maintenance now, elected or not. None if another process is
    /// running it.
    pub fn trigger_maintenance(&self) -> Option<MaintenanceReport> {
        return self.inner.maintain();
    }

    /// Delivers pending events on the calling thread, returns how many were
    /// handed out. Meant for manual dispatch mode.
    pub fn trigger_dispatch(&self) -> usize {
        return self.inner.dispatch();
    }

    pub fn set_manual_maintenance(&self, manual: bool) {
        self.inner.manual_maintenance.store(manual, Ordering::SeqCst);
    }

    pub fn is_manual_maintenance(&self) -> bool {
        return self.inner.manual_maintenance.load(Ordering::SeqCst);
    }

    pub fn set_manual_dispatch(&self, manual: bool) {
        self.inner.manual_dispatch.store(manual, Ordering::SeqCst);
    }

    pub fn is_manual_dispatch(&self) -> bool {
        return self.inner.manual_dispatch.load(Ordering::SeqCst);
    }

    pub fn is_maintenance_process(&self) -> bool {
        return self.inner.is_maintenance_process();
    }

    pub fn events_as_rows(&self, all: bool) -> Vec<Vec<String>> {
        return self.inner.broker.events_as_rows(all);
    }

    pub fn processes_as_rows(&self, all: bool) -> Vec<Vec<String>> {
        return self.inner.broker.processes_as_rows(all);
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        if self.thread.get_mut().is_some() {
            let _ = self.stop();
        }
    }
}

impl Inner {
    fn set_state(&self, state: RouterState) {
        *self.state.lock() = state;
    }

    fn is_exiting(&self) -> bool {
        return self.exit.load(Ordering::SeqCst);
    }

    fn context(&self) -> CheckContext {
        return CheckContext {
            now: now_micros(),
            login_at: self.registered_at.load(Ordering::SeqCst),
            grace: self.broker.config().expiry_grace,
        };
    }

    // Creates or refreshes this process's record, keeping the slot of an
    // earlier run with the same id.
    fn register(&self) {
        let now = now_micros();
        let mut record = ProcessRecord::new(&self.id, self.bid.load(Ordering::SeqCst), now);
        if let Some(existing) = self.broker.find_process(&self.id) {
            record.set_key(existing.key());
            record.set_created_at(existing.created_at());
            record.set_last_maintenance(existing.last_maintenance());
        }
        let outcome = self.broker.processes().update_add(&mut record);
        debug!("router {}: registered as {:?}", self.id, outcome);
        self.process_key.store(outcome.key(), Ordering::SeqCst);
        self.registered_at.store(now, Ordering::SeqCst);
    }

    fn unregister(&self) {
        let key = self.process_key.swap(0, Ordering::SeqCst);
        self.broker.processes().remove(key, |_| {});
    }

    fn heartbeat(&self) {
        let key = self.process_key.load(Ordering::SeqCst);
        let now = now_micros();
        if !self
            .broker
            .processes()
            .modify(key, |p| p.set_last_checkin(now))
        {
            warn!("router {}: process record {} is gone, registering again", self.id, key);
            self.register();
        }
    }

    // `known` holds the other processes as of registration.
    fn run(&self, mut known: HashMap<u64, ProcessRecord>) {
        debug!("router {}: thread running", self.id);
        let config = self.broker.config().clone();
        let mut last_heartbeat = Instant::now();
        let mut last_maintenance = Instant::now();

        while !self.is_exiting() {
            self.wake.timed_wait(config.router_sleep);
            if self.is_exiting() {
                break;
            }

            if last_heartbeat.elapsed() >= config.heartbeat_interval {
                self.heartbeat();
                last_heartbeat = Instant::now();
            }

            self.check_processes(&mut known);

            let manual_maintenance = self.manual_maintenance.load(Ordering::SeqCst);
            if !manual_maintenance && last_maintenance.elapsed() >= config.maintenance_interval {
                self.maintain_if_elected();
                last_maintenance = Instant::now();
            }

            if !self.manual_dispatch.load(Ordering::SeqCst) {
                let delivered = self.dispatch();
                if delivered == 0 && !manual_maintenance && !self.is_exiting() {
                    self.maintain_if_elected();
                }
            }
        }
        debug!("router {}: thread done", self.id);
    }

    // Live processes other than this one. A process that stopped checking
    // in counts as gone even while its record is still in use.
    fn other_processes(&self) -> HashMap<u64, ProcessRecord> {
        let own = self.process_key.load(Ordering::SeqCst);
        let now = now_micros();
        let inactive = self.broker.config().inactive_timeout;
        return self
            .broker
            .processes()
            .collect(|p| p.key() != own && p.is_active(now, inactive))
            .into_iter()
            .map(|p| (p.key(), p))
            .collect();
    }

    fn check_processes(&self, known: &mut HashMap<u64, ProcessRecord>) {
        let current = self.other_processes();
        let attached: Vec<&ProcessRecord> = current
            .values()
            .filter(|p| !known.contains_key(&p.key()))
            .collect();
        let detached: Vec<&ProcessRecord> = known
            .values()
            .filter(|p| !current.contains_key(&p.key()))
            .collect();

        if !attached.is_empty() || !detached.is_empty() {
            for handler in self.handlers.snapshot() {
                let mut handler = handler.lock();
                for process in &attached {
                    handler.attached(process);
                }
                for process in &detached {
                    handler.detached(process);
                }
            }
            for process in &attached {
                info!("router {}: process {} attached", self.id, process.id());
            }
            for process in &detached {
                info!("router {}: process {} detached", self.id, process.id());
            }
        }
        *known = current;
    }

    fn is_maintenance_process(&self) -> bool {
        return match self.broker.maintenance_winner() {
            Some(winner) => winner.is_id(&self.id),
            None => false,
        };
    }

    fn maintain_if_elected(&self) -> Option<MaintenanceReport> {
        if !self.is_maintenance_process() {
            return None;
        }
        return self.maintain();
    }

    fn maintain(&self) -> Option<MaintenanceReport> {
        let handlers = self.handlers.snapshot();
        return self.broker.perform_maintenance(&self.id, |batch| {
            for handler in &handlers {
                handler.lock().post_remove(batch);
            }
        });
    }

    // Hands each handler the events it wants, then marks them read by it
    // without waking anybody.
    fn dispatch(&self) -> usize {
        let handlers = self.handlers.snapshot();
        if handlers.is_empty() {
            return 0;
        }
        let ctx = self.context();
        let events = self.broker.events().collect(|_| true);
        let mut delivered = 0;

        for handler in handlers {
            let mut handler = handler.lock();
            let batch: Vec<Event> = events
                .iter()
                .filter(|e| handler.wants(e, &ctx))
                .copied()
                .collect();
            if batch.is_empty() {
                continue;
            }
            debug!(
                "router {}: {} events for handler {}",
                self.id,
                batch.len(),
                handler.id()
            );
            handler.deliver(&batch);
            let reader = handler.id().to_string();
            drop(handler);

            for event in &batch {
                self.broker
                    .events()
                    .modify(event.key(), |e| e.mark_read_by(&reader, ctx.now));
            }
            delivered += batch.len();
            if self.is_exiting() {
                break;
            }
        }
        return delivered;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;
    use crate::filter::FilterSet;
    use crate::utils::unique_name;

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn quick_config(segment: &str) -> BrokerConfig {
        return BrokerConfig {
            event_capacity: 16,
            process_capacity: 4,
            heartbeat_interval: Duration::from_millis(10),
            maintenance_interval: Duration::from_secs(3600),
            router_sleep: Duration::from_millis(20),
            ..BrokerConfig::default()
        }
        .with_segment(segment);
    }

    struct Cleanup(String);

    impl Drop for Cleanup {
        fn drop(&mut self) {
            let _ = Broker::reset(&self.0);
        }
    }

    fn wait_for(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        return done();
    }

    #[test]
    fn start_and_stop() {
        init();
        let name = unique_name("router_test");
        let _cleanup = Cleanup(name.clone());
        let broker = Broker::open(quick_config(&name)).unwrap();
        let router = Router::new(broker.clone(), "A").unwrap();
        assert_eq!(router.state(), RouterState::Unregistered);
        assert!(matches!(router.stop(), Err(Error::NotStarted)));

        router.start(5).unwrap();
        assert_eq!(router.state(), RouterState::Running);
        assert!(router.is_ready());
        assert!(matches!(router.start(5), Err(Error::AlreadyStarted)));
        let record = router.own_process_record().unwrap();
        assert_eq!(record.bid(), 5);
        assert_eq!(record.registered_at(), router.register_time());

        router.stop().unwrap();
        assert_eq!(router.state(), RouterState::Stopped);
        assert!(!router.is_ready());
        assert!(broker.find_process("A").is_none());
    }

    #[test]
    fn heartbeat_moves_checkin() {
        init();
        let name = unique_name("router_test");
        let _cleanup = Cleanup(name.clone());
        let broker = Broker::open(quick_config(&name)).unwrap();
        let router = Router::new(broker.clone(), "A").unwrap();
        router.start(0).unwrap();
        let first = router.own_process_record().unwrap().last_checkin();
        assert!(wait_for(|| {
            router.own_process_record().unwrap().last_checkin() > first
        }));
    }

    #[test]
    fn direct_mail_is_delivered_once() {
        init();
        let name = unique_name("router_test");
        let _cleanup = Cleanup(name.clone());
        let broker = Broker::open(quick_config(&name)).unwrap();
        let router = Router::new(broker.clone(), "B").unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let handler = router.register_handler("X");
        {
            let received = received.clone();
            handler
                .lock()
                .set_incoming_func(move |e| received.lock().push(e.key()));
        }
        router.start(0).unwrap();

        let key = router
            .send("Shutdown", "X", "A", EventKind::Shutdown, Duration::from_secs(3600), "")
            .key();
        router.send("Other", "Y", "A", EventKind::Generic, Duration::from_secs(3600), "");
        assert!(wait_for(|| received.lock().len() == 1));
        assert!(wait_for(|| {
            broker.events().find(key).map(|e| e.is_read()).unwrap_or(false)
        }));

        router.trigger_wake();
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(*received.lock(), vec![key]);
    }

    #[test]
    fn manual_dispatch_waits_for_trigger() {
        init();
        let name = unique_name("router_test");
        let _cleanup = Cleanup(name.clone());
        let broker = Broker::open(quick_config(&name)).unwrap();
        let router = Router::new(broker.clone(), "B").unwrap();
        let count = Arc::new(Mutex::new(0));
        let handler = router.register_handler("B");
        {
            let count = count.clone();
            handler
                .lock()
                .set_incoming_list_func(move |events| *count.lock() += events.len());
        }
        router.set_manual_dispatch(true);
        router.start(0).unwrap();

        router.send("t", "B", "A", EventKind::Generic, Duration::from_secs(60), "hi");
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(*count.lock(), 0);

        assert_eq!(router.trigger_dispatch(), 1);
        assert_eq!(*count.lock(), 1);
        assert_eq!(router.trigger_dispatch(), 0);
    }

    #[test]
    fn attach_and_detach_are_reported() {
        init();
        let name = unique_name("router_test");
        let _cleanup = Cleanup(name.clone());
        let a = Router::new(Broker::open(quick_config(&name)).unwrap(), "A").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler = a.register_handler("A");
        {
            let seen = seen.clone();
            handler
                .lock()
                .set_attach_process_func(move |p| seen.lock().push(format!("+{}", p.id())));
        }
        {
            let seen = seen.clone();
            handler
                .lock()
                .set_detach_process_func(move |p| seen.lock().push(format!("-{}", p.id())));
        }
        a.start(0).unwrap();

        let b = Router::new(Broker::open(quick_config(&name)).unwrap(), "B").unwrap();
        b.start(0).unwrap();
        assert!(wait_for(|| seen.lock().len() == 1));
        b.stop().unwrap();
        assert!(wait_for(|| seen.lock().len() == 2));
        assert_eq!(*seen.lock(), vec!["+B".to_string(), "-B".to_string()]);
    }

    #[test]
    fn silent_process_is_detached() {
        init();
        let name = unique_name("router_test");
        let _cleanup = Cleanup(name.clone());
        let broker = Broker::open(quick_config(&name)).unwrap();
        let router = Router::new(broker.clone(), "A").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler = router.register_handler("A");
        {
            let seen = seen.clone();
            handler
                .lock()
                .set_attach_process_func(move |p| seen.lock().push(format!("+{}", p.id())));
        }
        {
            let seen = seen.clone();
            handler
                .lock()
                .set_detach_process_func(move |p| seen.lock().push(format!("-{}", p.id())));
        }
        router.start(0).unwrap();

        // a process that crashed without stopping its router
        let mut ghost = ProcessRecord::new("ghost", 0, now_micros());
        let key = broker.processes().update_add(&mut ghost).key();
        assert!(wait_for(|| seen.lock().len() == 1));
        broker.processes().modify(key, |p| p.set_last_checkin(1));
        assert!(wait_for(|| seen.lock().len() == 2));
        assert_eq!(*seen.lock(), vec!["+ghost".to_string(), "-ghost".to_string()]);
    }

    #[test]
    fn remove_and_fetch() {
        init();
        let name = unique_name("router_test");
        let _cleanup = Cleanup(name.clone());
        let broker = Broker::open(quick_config(&name)).unwrap();
        let router = Router::new(broker, "A").unwrap();
        let first = router
            .send("t", "X", "A", EventKind::Generic, Duration::from_secs(60), "")
            .key();
        let second = router
            .send("t", "X", "A", EventKind::Generic, Duration::from_secs(60), "")
            .key();

        let mut list = EventList::new(FilterSet::new());
        assert_eq!(router.fetch(&mut list), 2);
        assert!(router.remove_event(first));
        assert!(!router.remove_event(first));
        assert_eq!(router.all_events().len(), 1);

        let mut event = router.all_events()[0];
        event.set_payload_str("changed");
        assert!(router.update_event(&mut event));
        assert_eq!(router.remove_events(list.events()), 1);
        assert!(router.all_events().is_empty());
        assert!(!router.remove_event(second));
    }

    #[test]
    fn manual_maintenance_runs_unelected() {
        init();
        let name = unique_name("router_test");
        let _cleanup = Cleanup(name.clone());
        let broker = Broker::open(quick_config(&name)).unwrap();
        let router = Router::new(broker, "A").unwrap();
        assert!(!router.is_maintenance_process());

        let mut dead = Event::new("t", "X", "A", EventKind::Generic);
        dead.set_expiration_from_str("-1").unwrap();
        router.send_event(&mut dead, false);

        let removed = Arc::new(Mutex::new(0));
        let handler = router.register_handler("A");
        {
            let removed = removed.clone();
            handler
                .lock()
                .set_remove_func(move |_| *removed.lock() += 1);
        }
        let report = router.trigger_maintenance().unwrap();
        assert_eq!(report.records_processed, 1);
        assert_eq!(*removed.lock(), 1);
    }
}
