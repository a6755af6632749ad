/*
 * The process wide handle on the broker: the mapped segment and the named
 * containers in it. Open one per process (tests open several, one per
 * simulated process) and hand the Arc to whatever needs it.
 *
 * Maintenance lives here rather than in the router so tools can run it
 * without registering as a process.
 */
use crate::config::BrokerConfig;
use crate::constants::{
    EVENT_CONTAINER_NAME, MAINTENANCE_MUTEX_NAME, MAINT_FROM, MAINT_STATUS_TOPIC, MAINT_TO,
    PROCESS_CONTAINER_NAME, SCHEMA_VERSION, SHMEM_STATUS_TOPIC, VERSION_STRING_NAME,
};
use crate::container::SharedString;
use crate::error::Result;
use crate::event::{Event, EventKind};
use crate::process_record::ProcessRecord;
use crate::record_vector::{Record, RecordVector, UpsertOutcome};
use crate::segment::{Segment, SegmentStatus};
use crate::signal::{NamedMutex, NamedSemaphore, NamedSignal};
use crate::utils::{format_micros, now_micros};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Payload of the maintenance end event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub process: String,
    pub pid: u32,
    pub time: u64,
    pub records_processed: usize,
    pub elapsed_ms: u64,
}

/// Payload of the shared memory status event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShmemStatus {
    pub segment: String,
    pub size: usize,
    pub free: usize,
    pub objects: usize,
    pub events: usize,
    pub event_capacity: usize,
    pub processes: usize,
    pub process_capacity: usize,
}

pub struct Broker {
    config: BrokerConfig,
    segment: Arc<Segment>,
    events: RecordVector<Event>,
    processes: RecordVector<ProcessRecord>,
    maintenance: NamedMutex,
    version: SharedString,
}

impl Broker {
    pub fn open(config: BrokerConfig) -> Result<Arc<Broker>> {
        let segment = Segment::open_or_create(&config.segment_name, config.segment_size)?;
        let events =
            RecordVector::get_or_create(&segment, EVENT_CONTAINER_NAME, config.event_capacity)?;
        let processes = RecordVector::get_or_create(
            &segment,
            PROCESS_CONTAINER_NAME,
            config.process_capacity,
        )?;
        let maintenance = NamedMutex::get_or_create(&segment, MAINTENANCE_MUTEX_NAME)?;
        let version = SharedString::get_or_create(&segment, VERSION_STRING_NAME, SCHEMA_VERSION)?;
        let stored = version.get();
        if stored != SCHEMA_VERSION {
            warn!(
                "{} was created with schema {}, this build uses {}",
                segment.name(),
                stored,
                SCHEMA_VERSION
            );
        }

        info!(
            "broker on {}: {} event slots, {} process slots, schema {}",
            segment.name(),
            events.capacity(),
            processes.capacity(),
            stored
        );
        return Ok(Arc::new(Broker {
            config,
            segment,
            events,
            processes,
            maintenance,
            version,
        }));
    }

    /// Destroys the segment and everything in it. Only safe while no
    /// process has it open.
    pub fn reset(name: &str) -> Result<bool> {
        return Segment::reset(name);
    }

    pub fn config(&self) -> &BrokerConfig {
        return &self.config;
    }

    pub fn segment(&self) -> &Arc<Segment> {
        return &self.segment;
    }

    pub fn events(&self) -> &RecordVector<Event> {
        return &self.events;
    }

    pub fn processes(&self) -> &RecordVector<ProcessRecord> {
        return &self.processes;
    }

    pub fn maintenance_mutex(&self) -> &NamedMutex {
        return &self.maintenance;
    }

    pub fn shmem_version(&self) -> String {
        return self.version.get();
    }

    pub fn segment_status(&self) -> SegmentStatus {
        return self.segment.status();
    }

    pub fn status(&self) -> ShmemStatus {
        let segment = self.segment.status();
        return ShmemStatus {
            segment: segment.name,
            size: segment.size,
            free: segment.free,
            objects: segment.objects,
            events: self.events.count_in_use(),
            event_capacity: self.events.capacity(),
            processes: self.processes.count_in_use(),
            process_capacity: self.processes.capacity(),
        };
    }

    pub fn wake_signal(&self, wake_name: &str) -> Result<NamedSemaphore> {
        return NamedSemaphore::get_or_create(&self.segment, wake_name);
    }

    pub fn find_process(&self, id: &str) -> Option<ProcessRecord> {
        let mut found = None;
        self.processes.for_each(|p| {
            if found.is_none() && p.is_id(id) {
                found = Some(*p);
            }
        });
        return found;
    }

    /// Registered processes that checked in recently enough.
    pub fn live_processes(&self) -> Vec<ProcessRecord> {
        let now = now_micros();
        let inactive = self.config.inactive_timeout;
        return self.processes.collect(|p| p.is_active(now, inactive));
    }

    /// The live process with the highest positive bid, the first one found
    /// wins a tie.
    pub fn maintenance_winner(&self) -> Option<ProcessRecord> {
        let mut winner: Option<ProcessRecord> = None;
        for process in self.live_processes() {
            if process.bid() <= 0 {
                continue;
            }
            let better = match &winner {
                Some(best) => process.bid() > best.bid(),
                None => true,
            };
            if better {
                winner = Some(process);
            }
        }
        return winner;
    }

    /// Posts the wake signal of every registered process. Returns how many
    /// were posted.
    pub fn trigger_processes(&self) -> usize {
        let mut names = Vec::new();
        self.processes
            .for_each(|p| names.push(p.wake_name().to_string()));

        let mut posted = 0;
        for name in names {
            match self.wake_signal(&name) {
                Ok(signal) => {
                    signal.post();
                    posted += 1;
                }
                Err(e) => warn!("cannot wake {}: {}", name, e),
            }
        }
        return posted;
    }

    /// Stores the event and optionally wakes every process.
    pub fn send_event(&self, event: &mut Event, trigger: bool) -> UpsertOutcome {
        let outcome = self.events.update_add(event);
        debug!("sent {} ({:?})", event.describe(), outcome);
        if trigger {
            self.trigger_processes();
        }
        return outcome;
    }

    // Reuses the in use event of this kind from maintenance if there is one.
    fn post_maintenance_event<T: Serialize>(
        &self,
        kind: EventKind,
        topic: &str,
        ttl: Duration,
        payload: &T,
    ) {
        let mut existing = 0;
        self.events.for_each(|e| {
            if existing == 0 && e.kind() == Some(kind) && e.from_field().eq_ignore_case(MAINT_FROM)
            {
                existing = e.key();
            }
        });

        let mut event = Event::new(topic, MAINT_TO, MAINT_FROM, kind);
        event.set_key(existing);
        event.set_expires_in(ttl);
        if let Err(e) = event.set_payload_json(payload) {
            warn!("cannot encode {} payload: {}", kind.name(), e);
        }
        let outcome = self.events.update_add(&mut event);
        // a vanished key (removed between the scan and here) gets a new slot
        if existing != 0 && outcome.key() != existing {
            debug!("{} event {} was replaced by {}", kind.name(), existing, outcome.key());
        }
    }

    /// Removes the expired events, at most one process at a time. `actor`
    /// is the id of the process doing the work, whose last maintenance time
    /// is updated. `on_remove` sees the batch before it is removed.
    ///
    /// Returns None if another process holds the maintenance lock.
    pub fn perform_maintenance(
        &self,
        actor: &str,
        mut on_remove: impl FnMut(&[Event]),
    ) -> Option<MaintenanceReport> {
        let _guard = match self.maintenance.try_lock() {
            Some(guard) => guard,
            None => {
                debug!("{}: maintenance is already running, skipping", actor);
                return None;
            }
        };
        let started = Instant::now();
        let now = now_micros();

        if let Some(process) = self.find_process(actor) {
            self.processes
                .modify(process.key(), |p| p.set_last_maintenance(now));
        }

        #[derive(Serialize)]
        struct Started<'a> {
            process: &'a str,
            pid: u32,
            time: u64,
        }
        self.post_maintenance_event(
            EventKind::MaintenanceStart,
            MAINT_STATUS_TOPIC,
            self.config.maintenance_event_ttl,
            &Started {
                process: actor,
                pid: std::process::id(),
                time: now,
            },
        );

        self.remove_stale_processes(now);

        let grace = self.config.expiry_grace;
        let expired = self.events.collect(|e| e.is_expired_at(now, grace));
        if !expired.is_empty() {
            on_remove(&expired);
        }
        let mut removed = 0;
        for event in &expired {
            let gone = self.events.remove(event.key(), |slot| {
                info!("maintenance removed expired {}", slot.describe());
                slot.clear_content();
            });
            if gone {
                removed += 1;
            }
        }

        let report = MaintenanceReport {
            process: actor.to_string(),
            pid: std::process::id(),
            time: now,
            records_processed: removed,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        self.post_maintenance_event(
            EventKind::MaintenanceEnd,
            MAINT_STATUS_TOPIC,
            self.config.maintenance_event_ttl,
            &report,
        );
        self.post_maintenance_event(
            EventKind::MaintenanceStatus,
            SHMEM_STATUS_TOPIC,
            self.config.status_event_ttl,
            &self.status(),
        );

        debug!(
            "{}: maintenance removed {} events in {} ms",
            actor, report.records_processed, report.elapsed_ms
        );
        return Some(report);
    }

    /// Frees the records of processes that stopped checking in, returns how
    /// many went. A process that is only slow registers again on its next
    /// heartbeat.
    pub fn remove_stale_processes(&self, now: u64) -> usize {
        let inactive = self.config.inactive_timeout;
        let stale = self.processes.collect(|p| !p.is_active(now, inactive));
        let mut removed = 0;
        for process in &stale {
            let gone = self.processes.remove(process.key(), |slot| {
                warn!(
                    "removing process {} (pid {}), last check in {}",
                    slot.id(),
                    slot.pid(),
                    format_micros(slot.last_checkin())
                );
            });
            if gone {
                removed += 1;
            }
        }
        return removed;
    }

    pub fn events_as_rows(&self, all: bool) -> Vec<Vec<String>> {
        let mut rows = Vec::new();
        if all {
            self.events.for_each_all(|e| rows.push(e.row()));
        } else {
            self.events.for_each(|e| rows.push(e.row()));
        }
        return rows;
    }

    pub fn processes_as_rows(&self, all: bool) -> Vec<Vec<String>> {
        let now = now_micros();
        let inactive = self.config.inactive_timeout;
        let mut rows = Vec::new();
        if all {
            self.processes
                .for_each_all(|p| rows.push(p.row(now, inactive)));
        } else {
            self.processes
                .for_each(|p| rows.push(p.row(now, inactive)));
        }
        return rows;
    }
}
