// Every object in the segment is addressed by name, never by offset, so the
// layout can only grow by adding new names.

// Segment header layout (see segment.rs)
//  0  -- u64 magic
//  8  -- u32 layout fingerprint (crc32 of record sizes + LAYOUT_VERSION)
// 12  -- u32 directory entry count
// 16  -- u64 total size
// 24  -- u64 bump pointer (next free byte)
// 32  -- allocation mutex (futex word + owner pad)
// 64  -- directory, MAX_NAMED_OBJECTS entries
// ... -- named objects, each aligned to OBJECT_ALIGN

pub const SEGMENT_MAGIC: u64 = 0x5348_4d42_524b_0001; // "SHMBRK" v1
pub const LAYOUT_VERSION: u32 = 1;

pub const MAX_NAMED_OBJECTS: usize = 256;
pub const MAX_OBJECT_NAME: usize = 64;
pub const OBJECT_ALIGN: usize = 64;
pub const SEGMENT_HEADER_SIZE: usize = 64;

pub const DEFAULT_SEGMENT_NAME: &str = "/shm_broker.mem";
pub const DEFAULT_SEGMENT_SIZE: usize = 1_000_000;

// container names
pub const EVENT_CONTAINER_NAME: &str = "broker.events";
pub const PROCESS_CONTAINER_NAME: &str = "broker.processes";
pub const MAINTENANCE_MUTEX_NAME: &str = "broker.maintenance";
pub const VERSION_STRING_NAME: &str = "broker.version";
pub const SCHEMA_VERSION: &str = "1.0.0.0";

// suffixes appended to a container name for its companions
pub const MUTEX_SUFFIX: &str = "_MUTEX";
pub const COUNTER_SUFFIX: &str = "_COUNTER";
pub const WAKE_SUFFIX: &str = ".wake";

pub const DEFAULT_EVENT_CAPACITY: usize = 200;
pub const DEFAULT_PROCESS_CAPACITY: usize = 20;

// record field capacities
pub const PAYLOAD_SIZE: usize = 1024;
pub const ADDR_SIZE: usize = 32;
pub const TOPIC_SIZE: usize = 32;
pub const WAKE_NAME_SIZE: usize = 64;
pub const MAX_READERS: usize = 10;

// router timing, seconds
pub const HEARTBEAT_INTERVAL_SECS: u64 = 5;
pub const INACTIVE_TIMEOUT_SECS: u64 = 600;
pub const MAINTENANCE_INTERVAL_SECS: u64 = 90;
pub const ROUTER_SLEEP_SECS: u64 = 60;
pub const EXPIRY_GRACE_SECS: u64 = 0;
pub const DEFAULT_EVENT_TTL_SECS: u64 = 360;

// maintenance bookkeeping events
pub const MAINT_TO: &str = "System";
pub const MAINT_FROM: &str = "Maint";
pub const MAINT_STATUS_TOPIC: &str = "Maint Status";
pub const SHMEM_STATUS_TOPIC: &str = "Shmem Status";
pub const MAINT_EVENT_TTL_SECS: u64 = 12 * 60 * 60;
pub const STATUS_EVENT_TTL_SECS: u64 = 24 * 60 * 60;

// a filter value starting with this is compiled as a regex
pub const REGEX_MARKER: &str = "/:";

// a mutex waiter re-checks the owner's liveness this often
pub const MUTEX_OWNER_CHECK_MILLIS: u64 = 500;
