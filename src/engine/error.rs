use ulid::Ulid;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(String),
    /// Overlaps an existing, non-rejected pass of the same requester.
    Conflict(Ulid),
    CapacityExceeded(u32),
    InvalidDateRange,
    AlreadyResolved(Ulid),
    InvalidState(&'static str),
    RoomOccupied(Ulid),
    GuestBlacklisted,
    Forbidden(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
    FileError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(key) => write!(f, "already exists: {key}"),
            EngineError::Conflict(id) => write!(f, "dates conflict with pass: {id}"),
            EngineError::CapacityExceeded(cap) => {
                write!(f, "capacity {cap} exceeded: room is full")
            }
            EngineError::InvalidDateRange => write!(f, "end date is before start date"),
            EngineError::AlreadyResolved(id) => write!(f, "already resolved: {id}"),
            EngineError::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            EngineError::RoomOccupied(id) => {
                write!(f, "cannot delete room {id}: has residents")
            }
            EngineError::GuestBlacklisted => write!(f, "guest is blacklisted"),
            EngineError::Forbidden(msg) => write!(f, "permission denied: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
            EngineError::FileError(e) => write!(f, "file error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
