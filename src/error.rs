use thiserror::Error as ThisError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, ThisError)]
pub enum Error {
    /// The OS refused to create or map the segment. Fatal for this process,
    /// the broker must be treated as unavailable.
    #[error("shared memory segment {name} unavailable: {source}")]
    SegmentUnavailable {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid shared memory name: {0}")]
    InvalidName(String),

    #[error("segment directory is full, cannot add {name}")]
    DirectoryFull { name: String },

    #[error("not enough segment memory for {name}: requested {requested}, available {available}")]
    OutOfSegmentMemory {
        name: String,
        requested: usize,
        available: usize,
    },

    #[error("named object {name} has type fingerprint {found:#010x}, expected {expected:#010x}")]
    TypeMismatch {
        name: String,
        expected: u32,
        found: u32,
    },

    #[error("segment layout {found:#010x} does not match this build ({expected:#010x})")]
    LayoutMismatch { expected: u32, found: u32 },

    #[error("invalid filter pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("malformed payload: {0}")]
    Deserialization(#[from] serde_json::Error),

    #[error("invalid duration {0:?}, expected [-]h[h][:mm][:ss][.fff]")]
    InvalidDuration(String),

    #[error("router has not been started")]
    NotStarted,

    #[error("router is already running")]
    AlreadyStarted,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn segment_unavailable(name: &str, source: std::io::Error) -> Error {
        return Error::SegmentUnavailable {
            name: name.to_string(),
            source,
        };
    }
}
