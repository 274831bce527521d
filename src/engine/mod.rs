mod accounts;
mod attachments;
mod conflict;
mod error;
mod locks;
pub mod occupancy;
mod passes;
mod queries;
mod rooms;
#[cfg(test)]
mod tests;
mod tickets;

pub use accounts::{AccountChanges, NewAccount};
pub use attachments::NewAttachment;
pub use passes::{PassChanges, PassRequest};
pub use queries::{PassFilter, RoomFilter, TicketFilter};
pub use rooms::{NewRoom, RoomChanges};
pub use tickets::NewTicket;

pub use conflict::{find_conflict, has_conflict};
pub use error::EngineError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock};
use ulid::Ulid;

use crate::files::FileStore;
use crate::model::*;
use crate::wal::{Wal, WalHandle};

use locks::KeyedLocks;

pub type SharedRoom = Arc<RwLock<Room>>;
pub type SharedPassBook = Arc<RwLock<PassBook>>;

/// Who is calling. `id` is `None` for the built-in superuser and for
/// anonymous callers; `role` is `None` only for anonymous callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub id: Option<Ulid>,
    pub role: Option<Role>,
}

impl Actor {
    pub fn superuser() -> Self {
        Self {
            id: None,
            role: Some(Role::Admin),
        }
    }

    pub fn anonymous() -> Self {
        Self { id: None, role: None }
    }

    /// Non-active accounts act as anonymous.
    pub fn of(account: &Account) -> Self {
        if !account.is_active() {
            return Self::anonymous();
        }
        Self {
            id: Some(account.id),
            role: Some(account.role),
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Some(Role::Admin)
    }

    pub(crate) fn require_admin(&self) -> Result<(), EngineError> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(EngineError::Forbidden("administrator only"))
        }
    }

    pub(crate) fn require_known(&self) -> Result<(), EngineError> {
        if self.role.is_some() {
            Ok(())
        } else {
            Err(EngineError::Forbidden("unknown or inactive user"))
        }
    }

    /// The caller's own account id; the superuser has none.
    pub(crate) fn require_account(&self) -> Result<Ulid, EngineError> {
        self.require_known()?;
        self.id
            .ok_or(EngineError::Forbidden("this login has no account"))
    }
}

/// All state of one residence hall.
///
/// Rooms and pass books sit behind their own `RwLock`s so that the
/// capacity / conflict read and the write that depends on it happen under
/// one lock. Everything else is a plain `DashMap` entry.
pub struct Engine {
    accounts: DashMap<Ulid, Account>,
    emails: DashMap<String, Ulid>,
    student_numbers: DashMap<String, Ulid>,
    rooms: DashMap<Ulid, SharedRoom>,
    room_numbers: DashMap<String, Ulid>,
    pass_books: DashMap<Ulid, SharedPassBook>,
    /// pass id → requester id
    pass_owner: DashMap<Ulid, Ulid>,
    tickets: DashMap<Ulid, MaintenanceTicket>,
    blacklist: DashMap<String, Option<String>>,
    attachments: DashMap<Ulid, Attachment>,
    files: FileStore,
    /// Per-student and per-ticket serialization.
    record_locks: KeyedLocks,
    /// Serializes creation, renumbering and deletion of accounts and rooms,
    /// which touch the unique-key indexes.
    registry: Mutex<()>,
    /// Mutations hold this shared; compaction holds it exclusively so the
    /// snapshot cannot miss an event appended while it is written.
    commit_gate: RwLock<()>,
    wal: WalHandle,
}

/// Apply an event to a room; the caller holds the room's write lock.
fn apply_to_room(room: &mut Room, event: &Event) {
    match event {
        Event::RoomUpdated {
            number,
            room_type,
            building,
            floor,
            capacity,
            ..
        } => {
            room.number = number.clone();
            room.room_type = room_type.clone();
            room.building = building.clone();
            room.floor = *floor;
            room.capacity = *capacity;
        }
        Event::ResidentAssigned {
            room_id,
            previous_room_id,
            ..
        } => {
            if *room_id == room.id {
                if let Err(e) = occupancy::increment(room) {
                    tracing::warn!("room {}: {e} while applying assignment", room.id);
                }
            } else if *previous_room_id == Some(room.id) {
                occupancy::decrement(room);
            }
        }
        Event::ResidentRemoved { .. } => occupancy::decrement(room),
        Event::RoomReset { .. } => occupancy::reset(room),
        Event::TicketResolved { day, .. } => room.last_maintenance = Some(*day),
        _ => {}
    }
}

/// Apply an event to a requester's pass book; the caller holds its lock.
fn apply_to_book(book: &mut PassBook, event: &Event) {
    match event {
        Event::PassRequested(pass) => book.passes.push(pass.clone()),
        Event::PassEdited {
            id,
            guest,
            dates,
            at,
            ..
        } => {
            if let Some(pass) = book.get_mut(*id) {
                pass.guest = guest.clone();
                pass.dates = *dates;
                pass.updated_at = *at;
            }
        }
        Event::PassResolved {
            id,
            status,
            by,
            comments,
            at,
            ..
        } => {
            if let Some(pass) = book.get_mut(*id) {
                pass.status = *status;
                pass.resolved_by = *by;
                pass.resolved_at = Some(*at);
                pass.comments = comments.clone();
                pass.updated_at = *at;
            }
        }
        Event::PassDeleted { id, .. } => {
            book.remove(*id);
        }
        _ => {}
    }
}

fn apply_to_account(account: &mut Account, event: &Event) {
    match event {
        Event::AccountStatusChanged {
            status, by, reason, ..
        } => {
            account.status = *status;
            account.status_changed_by = *by;
            account.status_reason = reason.clone();
        }
        Event::AccountUpdated {
            first_name,
            last_name,
            phone,
            student_number,
            ..
        } => {
            account.first_name = first_name.clone();
            account.last_name = last_name.clone();
            account.phone = phone.clone();
            account.student_number = student_number.clone();
        }
        Event::ResidentAssigned { room_id, .. } => account.room_id = Some(*room_id),
        Event::ResidentRemoved { .. } | Event::RoomReset { .. } => account.room_id = None,
        _ => {}
    }
}

/// Rooms whose lock-protected state an event touches.
fn event_room_ids(event: &Event) -> Vec<Ulid> {
    match event {
        Event::RoomUpdated { id, .. } => vec![*id],
        Event::ResidentAssigned {
            room_id,
            previous_room_id,
            ..
        } => std::iter::once(*room_id).chain(*previous_room_id).collect(),
        Event::ResidentRemoved { room_id, .. }
        | Event::RoomReset { room_id, .. }
        | Event::TicketResolved { room_id, .. } => vec![*room_id],
        _ => Vec::new(),
    }
}

fn event_requester_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::PassRequested(pass) => Some(pass.requester_id),
        Event::PassEdited { requester_id, .. }
        | Event::PassResolved { requester_id, .. }
        | Event::PassDeleted { requester_id, .. } => Some(*requester_id),
        _ => None,
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, files_dir: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = WalHandle::spawn(Wal::open(&wal_path)?);

        let engine = Self {
            accounts: DashMap::new(),
            emails: DashMap::new(),
            student_numbers: DashMap::new(),
            rooms: DashMap::new(),
            room_numbers: DashMap::new(),
            pass_books: DashMap::new(),
            pass_owner: DashMap::new(),
            tickets: DashMap::new(),
            blacklist: DashMap::new(),
            attachments: DashMap::new(),
            files: FileStore::new(files_dir),
            record_locks: KeyedLocks::default(),
            registry: Mutex::new(()),
            commit_gate: RwLock::new(()),
            wal,
        };

        // Nothing else holds these Arcs yet, so try_write always succeeds.
        // blocking_write would panic when a hall is opened from async code.
        for event in &events {
            engine.apply_shared(event);
            for room_id in event_room_ids(event) {
                if let Some(room) = engine.get_room(&room_id) {
                    let mut guard = room.try_write().expect("replay: uncontended write");
                    apply_to_room(&mut guard, event);
                }
            }
            if let Some(requester_id) = event_requester_id(event) {
                let book = engine.book(requester_id);
                let mut guard = book.try_write().expect("replay: uncontended write");
                apply_to_book(&mut guard, event);
            }
        }
        tracing::debug!(
            "replayed {} events from {}",
            events.len(),
            wal_path.display()
        );

        Ok(engine)
    }

    /// State changes that live directly in the `DashMap`s.
    fn apply_shared(&self, event: &Event) {
        match event {
            Event::AccountCreated(account) => {
                self.emails.insert(account.email.clone(), account.id);
                if let Some(ref number) = account.student_number {
                    self.student_numbers.insert(number.clone(), account.id);
                }
                self.accounts.insert(account.id, account.clone());
            }
            Event::AccountUpdated {
                id, student_number, ..
            } => {
                if let Some(mut account) = self.accounts.get_mut(id) {
                    if let Some(ref old) = account.student_number {
                        self.student_numbers.remove(old);
                    }
                    if let Some(number) = student_number {
                        self.student_numbers.insert(number.clone(), *id);
                    }
                    apply_to_account(&mut account, event);
                }
            }
            Event::AccountStatusChanged { id, .. }
            | Event::ResidentAssigned { student_id: id, .. }
            | Event::ResidentRemoved { student_id: id, .. } => {
                if let Some(mut account) = self.accounts.get_mut(id) {
                    apply_to_account(&mut account, event);
                }
            }
            Event::RoomReset { residents, .. } => {
                for id in residents {
                    if let Some(mut account) = self.accounts.get_mut(id) {
                        apply_to_account(&mut account, event);
                    }
                }
            }
            Event::AccountDeleted { id } => {
                if let Some((_, account)) = self.accounts.remove(id) {
                    self.emails.remove(&account.email);
                    if let Some(number) = account.student_number {
                        self.student_numbers.remove(&number);
                    }
                }
                self.record_locks.forget(id);
            }
            Event::RoomCreated(room) => {
                self.room_numbers.insert(room.number.clone(), room.id);
                self.rooms
                    .insert(room.id, Arc::new(RwLock::new(room.clone())));
            }
            Event::RoomUpdated { id, number, .. } => {
                self.room_numbers.retain(|_, room_id| room_id != id);
                self.room_numbers.insert(number.clone(), *id);
            }
            Event::RoomDeleted { id } => {
                self.rooms.remove(id);
                self.room_numbers.retain(|_, room_id| room_id != id);
            }
            Event::PassRequested(pass) => {
                self.pass_owner.insert(pass.id, pass.requester_id);
            }
            Event::PassDeleted { id, .. } => {
                self.pass_owner.remove(id);
            }
            Event::GuestBlacklisted { id_number, reason } => {
                self.blacklist.insert(id_number.clone(), reason.clone());
            }
            Event::GuestUnblacklisted { id_number } => {
                self.blacklist.remove(id_number);
            }
            Event::TicketOpened(ticket) => {
                self.tickets.insert(ticket.id, ticket.clone());
            }
            Event::TicketAssigned { id, admin_id } => {
                if let Some(mut ticket) = self.tickets.get_mut(id) {
                    ticket.assigned_to = Some(*admin_id);
                    ticket.status = TicketStatus::InProgress;
                }
            }
            Event::TicketResolved { id, notes, at, .. } => {
                if let Some(mut ticket) = self.tickets.get_mut(id) {
                    ticket.status = TicketStatus::Resolved;
                    ticket.notes = notes.clone();
                    ticket.resolved_at = Some(*at);
                }
            }
            Event::TicketDeleted { id } => {
                self.tickets.remove(id);
                self.record_locks.forget(id);
            }
            Event::AttachmentStored(attachment) => {
                self.attachments.insert(attachment.id, attachment.clone());
            }
            Event::AttachmentDeleted { id } => {
                self.attachments.remove(id);
            }
            Event::PassEdited { .. } | Event::PassResolved { .. } => {}
        }
    }

    /// Durably log `event`, then apply its `DashMap`-level effects. Effects on
    /// rooms and pass books are applied by the caller, which holds their locks.
    async fn commit(&self, event: &Event) -> Result<(), EngineError> {
        self.wal
            .append(event.clone())
            .await
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        self.apply_shared(event);
        Ok(())
    }

    pub fn get_room(&self, id: &Ulid) -> Option<SharedRoom> {
        self.rooms.get(id).map(|e| e.value().clone())
    }

    /// True while `room` is still the instance registered under its id. A
    /// caller that fetched the Arc before a concurrent delete must bail.
    fn is_live_room(&self, id: &Ulid, room: &SharedRoom) -> bool {
        self.rooms
            .get(id)
            .is_some_and(|current| Arc::ptr_eq(current.value(), room))
    }

    /// The requester's pass book, created empty on first use.
    fn book(&self, requester_id: Ulid) -> SharedPassBook {
        self.pass_books
            .entry(requester_id)
            .or_insert_with(|| Arc::new(RwLock::new(PassBook::new(requester_id))))
            .clone()
    }

    pub fn get_account(&self, id: &Ulid) -> Option<Account> {
        self.accounts.get(id).map(|e| e.value().clone())
    }

    /// Owner of a student number, if any.
    fn student_number_owner(&self, number: &str) -> Option<Ulid> {
        self.student_numbers.get(number).map(|e| *e.value())
    }

    pub fn account_by_email(&self, email: &str) -> Option<Account> {
        let id = *self.emails.get(&email.to_lowercase())?;
        self.get_account(&id)
    }

    /// Map a wire login to an actor: the superuser name is an administrator,
    /// any other name is looked up by email.
    pub fn resolve_actor(&self, login: &str, superuser: &str) -> Actor {
        if login == superuser {
            return Actor::superuser();
        }
        match self.account_by_email(login) {
            Some(account) => Actor::of(&account),
            None => Actor::anonymous(),
        }
    }

    /// Rewrite the WAL as one record per live entity.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;

        let mut events = Vec::new();
        let room_arcs: Vec<SharedRoom> = self.rooms.iter().map(|e| e.value().clone()).collect();
        for room in room_arcs {
            events.push(Event::RoomCreated(room.read().await.clone()));
        }
        for entry in self.accounts.iter() {
            events.push(Event::AccountCreated(entry.value().clone()));
        }
        let books: Vec<SharedPassBook> =
            self.pass_books.iter().map(|e| e.value().clone()).collect();
        for book in books {
            let guard = book.read().await;
            events.extend(guard.passes.iter().cloned().map(Event::PassRequested));
        }
        for entry in self.blacklist.iter() {
            events.push(Event::GuestBlacklisted {
                id_number: entry.key().clone(),
                reason: entry.value().clone(),
            });
        }
        for entry in self.tickets.iter() {
            events.push(Event::TicketOpened(entry.value().clone()));
        }
        for entry in self.attachments.iter() {
            events.push(Event::AttachmentStored(entry.value().clone()));
        }

        let count = events.len();
        self.wal
            .rewrite(events)
            .await
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        tracing::debug!("compacted WAL to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        self.wal.appends_since_compact().await
    }
}
