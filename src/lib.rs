mod broker;
mod config;
pub mod constants;
mod container;
mod error;
mod event;
mod filter;
mod fixed;
mod futex;
mod handler;
mod payload;
mod process_record;
mod record_vector;
mod router;
mod segment;
mod signal;
pub mod utils;

pub use crate::broker::{Broker, MaintenanceReport, ShmemStatus};
pub use crate::config::BrokerConfig;
pub use crate::container::{SharedScalar, SharedString};
pub use crate::error::{Error, Result};
pub use crate::event::{type_name, Event, EventKind, ReadFrequency, ReadMark};
pub use crate::filter::{CheckContext, EventList, Filter, FilterSet};
pub use crate::fixed::{FixedBytes, FixedString};
pub use crate::handler::{EventHandler, EventHandlerHandle, HandlerRegistry};
pub use crate::payload::LatestPayload;
pub use crate::process_record::{wake_name_for, ProcessRecord};
pub use crate::record_vector::{Record, RecordVector, UpsertOutcome};
pub use crate::router::{Router, RouterState};
pub use crate::segment::{Segment, SegmentStatus, Shared, SharedArray, SharedObject};
pub use crate::signal::{MutexGuard, NamedMutex, NamedSemaphore, NamedSignal};
