use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, used for audit timestamps.
pub type Ms = i64;

/// Inclusive calendar range `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    /// Returns `None` when `end` is before `start`.
    pub fn new(start: NaiveDate, end: NaiveDate) -> Option<Self> {
        if end < start {
            return None;
        }
        Some(Self { start, end })
    }

    /// Number of nights covered, counting both ends.
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    /// Inclusive overlap: a range ending on the day another begins overlaps it.
    pub fn overlaps(&self, other: &DateRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn contains(&self, day: NaiveDate) -> bool {
        self.start <= day && day <= self.end
    }
}

// ── Accounts ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Admin,
    Student,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccountStatus {
    Pending,
    Active,
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: Ulid,
    /// Lowercased; also the wire login name.
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub phone: Option<String>,
    pub role: Role,
    pub status: AccountStatus,
    pub student_number: Option<String>,
    /// Only ever set for students, and only through resident assignment.
    pub room_id: Option<Ulid>,
    pub status_changed_by: Option<Ulid>,
    pub status_reason: Option<String>,
    pub created_at: Ms,
}

impl Account {
    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }
}

// ── Rooms ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: Ulid,
    pub number: String,
    pub room_type: Option<String>,
    pub building: Option<String>,
    pub floor: Option<i32>,
    pub capacity: u32,
    /// `None` is treated as zero everywhere.
    pub occupancy: Option<u32>,
    pub last_maintenance: Option<NaiveDate>,
}

impl Room {
    pub fn new(id: Ulid, number: String, capacity: u32) -> Self {
        Self {
            id,
            number,
            room_type: None,
            building: None,
            floor: None,
            capacity,
            occupancy: Some(0),
            last_maintenance: None,
        }
    }

    pub fn occupancy(&self) -> u32 {
        self.occupancy.unwrap_or(0)
    }

    pub fn needs_maintenance(&self, cutoff: NaiveDate) -> bool {
        self.last_maintenance.is_none_or(|d| d < cutoff)
    }
}

/// Capacity used when a room is created without one.
pub fn default_capacity(room_type: Option<&str>) -> u32 {
    match room_type.map(|t| t.to_uppercase()).as_deref() {
        Some("SINGLE") => 1,
        Some("DOUBLE") => 2,
        Some("TRIPLE") => 3,
        Some("QUAD") => 4,
        _ => 1,
    }
}

// ── Guest passes ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PassStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestDetails {
    pub name: String,
    pub surname: String,
    pub id_number: String,
    pub contact: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestPass {
    pub id: Ulid,
    pub requester_id: Ulid,
    pub room_id: Option<Ulid>,
    pub guest: GuestDetails,
    pub dates: DateRange,
    pub status: PassStatus,
    pub resolved_by: Option<Ulid>,
    pub resolved_at: Option<Ms>,
    pub comments: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

/// All passes held by one requester. Conflict checks and writes for a
/// requester happen under this book's lock.
#[derive(Debug, Clone)]
pub struct PassBook {
    pub requester_id: Ulid,
    pub passes: Vec<GuestPass>,
}

impl PassBook {
    pub fn new(requester_id: Ulid) -> Self {
        Self {
            requester_id,
            passes: Vec::new(),
        }
    }

    pub fn get(&self, id: Ulid) -> Option<&GuestPass> {
        self.passes.iter().find(|p| p.id == id)
    }

    pub fn get_mut(&mut self, id: Ulid) -> Option<&mut GuestPass> {
        self.passes.iter_mut().find(|p| p.id == id)
    }

    pub fn remove(&mut self, id: Ulid) -> Option<GuestPass> {
        let pos = self.passes.iter().position(|p| p.id == id)?;
        Some(self.passes.remove(pos))
    }
}

// ── Maintenance ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TicketStatus {
    Pending,
    InProgress,
    Resolved,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceTicket {
    pub id: Ulid,
    pub student_id: Option<Ulid>,
    pub room_id: Ulid,
    pub issue_type: String,
    pub description: Option<String>,
    pub priority: Priority,
    pub status: TicketStatus,
    pub assigned_to: Option<Ulid>,
    pub notes: Option<String>,
    pub reported_at: Ms,
    pub resolved_at: Option<Ms>,
}

// ── Files ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: Ulid,
    /// The record this file belongs to (ticket, pass, account).
    pub owner_id: Ulid,
    pub uploader_id: Option<Ulid>,
    pub file_name: String,
    pub content_type: Option<String>,
    pub size: u64,
    pub crc32: u32,
    pub created_at: Ms,
}

/// The event types. This is the WAL record format.
///
/// `*Created`/`*Opened`/`*Requested`/`*Stored` carry full records so that a
/// compacted log is just one of those per live entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    AccountCreated(Account),
    AccountStatusChanged {
        id: Ulid,
        status: AccountStatus,
        by: Option<Ulid>,
        reason: Option<String>,
    },
    /// Profile fields after the edit, in full.
    AccountUpdated {
        id: Ulid,
        first_name: String,
        last_name: String,
        phone: Option<String>,
        student_number: Option<String>,
    },
    AccountDeleted {
        id: Ulid,
    },
    RoomCreated(Room),
    RoomUpdated {
        id: Ulid,
        number: String,
        room_type: Option<String>,
        building: Option<String>,
        floor: Option<i32>,
        capacity: u32,
    },
    RoomDeleted {
        id: Ulid,
    },
    ResidentAssigned {
        student_id: Ulid,
        room_id: Ulid,
        previous_room_id: Option<Ulid>,
    },
    ResidentRemoved {
        student_id: Ulid,
        room_id: Ulid,
    },
    RoomReset {
        room_id: Ulid,
        residents: Vec<Ulid>,
    },
    PassRequested(GuestPass),
    PassEdited {
        id: Ulid,
        requester_id: Ulid,
        guest: GuestDetails,
        dates: DateRange,
        at: Ms,
    },
    PassResolved {
        id: Ulid,
        requester_id: Ulid,
        status: PassStatus,
        by: Option<Ulid>,
        comments: Option<String>,
        at: Ms,
    },
    PassDeleted {
        id: Ulid,
        requester_id: Ulid,
    },
    GuestBlacklisted {
        id_number: String,
        reason: Option<String>,
    },
    GuestUnblacklisted {
        id_number: String,
    },
    TicketOpened(MaintenanceTicket),
    TicketAssigned {
        id: Ulid,
        admin_id: Ulid,
    },
    TicketResolved {
        id: Ulid,
        room_id: Ulid,
        notes: Option<String>,
        at: Ms,
        day: NaiveDate,
    },
    TicketDeleted {
        id: Ulid,
    },
    AttachmentStored(Attachment),
    AttachmentDeleted {
        id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlacklistEntry {
    pub id_number: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OccupancyReport {
    pub rooms: u64,
    pub total_capacity: u64,
    pub total_occupancy: u64,
    pub full_rooms: u64,
    pub available_rooms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub total: u64,
    pub pending: u64,
    pub approved: u64,
    pub rejected: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub total: u64,
    pub pending: u64,
    pub in_progress: u64,
    pub resolved: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AccountReport {
    pub total: u64,
    pub students: u64,
    pub admins: u64,
    pub pending: u64,
    pub active: u64,
    pub disabled: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HallReport {
    pub generated_at: Ms,
    pub occupancy: OccupancyReport,
    pub passes: PassReport,
    pub maintenance: MaintenanceReport,
    pub accounts: AccountReport,
}
