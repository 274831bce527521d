use chrono::NaiveDate;
use dashmap::mapref::entry::Entry;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, now_ms, validate_dates, validate_len};
use super::{apply_to_book, Actor, Engine, EngineError};

#[derive(Debug, Clone)]
pub struct PassRequest {
    pub id: Ulid,
    /// Defaults to the caller. Only administrators may name someone else.
    pub requester_id: Option<Ulid>,
    pub room_id: Option<Ulid>,
    pub guest: GuestDetails,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// Edits to a pending pass; `None` keeps the current value.
#[derive(Debug, Clone, Default)]
pub struct PassChanges {
    pub guest_name: Option<String>,
    pub guest_surname: Option<String>,
    pub guest_id_number: Option<String>,
    pub guest_contact: Option<String>,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl PassChanges {
    pub fn is_empty(&self) -> bool {
        self.guest_name.is_none()
            && self.guest_surname.is_none()
            && self.guest_id_number.is_none()
            && self.guest_contact.is_none()
            && self.start.is_none()
            && self.end.is_none()
    }
}

fn validate_guest(guest: &GuestDetails) -> Result<(), EngineError> {
    if guest.id_number.trim().is_empty() {
        return Err(EngineError::InvalidState("guest identity number is required"));
    }
    validate_len(&guest.name, MAX_NAME_LEN, "guest name too long")?;
    validate_len(&guest.surname, MAX_NAME_LEN, "guest surname too long")?;
    validate_len(&guest.id_number, MAX_NAME_LEN, "guest id number too long")?;
    if let Some(ref c) = guest.contact {
        validate_len(c, MAX_NAME_LEN, "guest contact too long")?;
    }
    Ok(())
}

impl Engine {
    fn check_not_blacklisted(&self, id_number: &str) -> Result<(), EngineError> {
        if self.blacklist.contains_key(id_number) {
            return Err(EngineError::GuestBlacklisted);
        }
        Ok(())
    }

    /// Request a sleepover pass.
    ///
    /// Checks run in order: dates, blacklist, then overlap against the
    /// requester's other passes. The overlap check and the insert happen
    /// under the requester's pass-book lock, so two overlapping requests
    /// racing each other cannot both succeed.
    pub async fn request_pass(&self, actor: &Actor, req: PassRequest) -> Result<GuestPass, EngineError> {
        actor.require_known()?;
        let requester_id = match req.requester_id {
            None => actor.require_account()?,
            Some(r) if actor.is_admin() || actor.id == Some(r) => r,
            Some(_) => {
                return Err(EngineError::Forbidden(
                    "only administrators may request passes for others",
                ));
            }
        };
        if !self.accounts.contains_key(&requester_id) {
            return Err(EngineError::NotFound(requester_id));
        }
        validate_guest(&req.guest)?;
        let dates = validate_dates(req.start, req.end)?;
        self.check_not_blacklisted(&req.guest.id_number)?;
        if let Some(room_id) = req.room_id
            && !self.rooms.contains_key(&room_id)
        {
            return Err(EngineError::NotFound(room_id));
        }

        let _gate = self.commit_gate.read().await;
        let book = self.book(requester_id);
        let mut guard = book.write().await;
        if guard.passes.len() >= MAX_PASSES_PER_REQUESTER {
            return Err(EngineError::LimitExceeded("too many passes for requester"));
        }

        let now = now_ms();
        let pass = GuestPass {
            id: req.id,
            requester_id,
            room_id: req.room_id,
            guest: req.guest,
            dates,
            status: PassStatus::Pending,
            resolved_by: None,
            resolved_at: None,
            comments: None,
            created_at: now,
            updated_at: now,
        };
        check_no_conflict(&pass, &guard.passes, None)?;

        // The book lock covers one requester only; the owner index is what
        // keeps a pass id unique across all of them. Claim it before the
        // WAL write and release it if that fails.
        match self.pass_owner.entry(pass.id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(pass.id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(requester_id);
            }
        }
        let event = Event::PassRequested(pass.clone());
        if let Err(e) = self.commit(&event).await {
            self.pass_owner.remove(&pass.id);
            return Err(e);
        }
        apply_to_book(&mut guard, &event);
        tracing::debug!("pass {} requested by {requester_id}", pass.id);
        Ok(pass)
    }

    /// Only the requester may edit, and only while the pass is pending.
    pub async fn edit_pass(
        &self,
        actor: &Actor,
        id: Ulid,
        changes: PassChanges,
    ) -> Result<GuestPass, EngineError> {
        let caller = actor.require_account()?;
        let _gate = self.commit_gate.read().await;
        let requester_id = *self.pass_owner.get(&id).ok_or(EngineError::NotFound(id))?;
        let book = self.book(requester_id);
        let mut guard = book.write().await;
        let current = guard.get(id).ok_or(EngineError::NotFound(id))?;
        if current.requester_id != caller {
            return Err(EngineError::Forbidden("only the requester may edit a pass"));
        }
        if current.status != PassStatus::Pending {
            return Err(EngineError::InvalidState("only pending passes can be edited"));
        }

        let mut edited = current.clone();
        if let Some(v) = changes.guest_name {
            edited.guest.name = v;
        }
        if let Some(v) = changes.guest_surname {
            edited.guest.surname = v;
        }
        if let Some(v) = changes.guest_id_number {
            edited.guest.id_number = v;
        }
        if let Some(v) = changes.guest_contact {
            edited.guest.contact = Some(v);
        }
        validate_guest(&edited.guest)?;
        edited.dates = validate_dates(
            changes.start.unwrap_or(edited.dates.start),
            changes.end.unwrap_or(edited.dates.end),
        )?;
        self.check_not_blacklisted(&edited.guest.id_number)?;
        check_no_conflict(&edited, &guard.passes, Some(id))?;

        let event = Event::PassEdited {
            id,
            requester_id,
            guest: edited.guest.clone(),
            dates: edited.dates,
            at: now_ms(),
        };
        self.commit(&event).await?;
        apply_to_book(&mut guard, &event);
        guard.get(id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Approve or reject a pending pass. A pass is resolved at most once.
    pub async fn resolve_pass(
        &self,
        actor: &Actor,
        id: Ulid,
        status: PassStatus,
        comments: Option<String>,
    ) -> Result<GuestPass, EngineError> {
        actor.require_admin()?;
        if status == PassStatus::Pending {
            return Err(EngineError::InvalidState("a pass can only be approved or rejected"));
        }
        if let Some(ref c) = comments {
            validate_len(c, MAX_TEXT_LEN, "comments too long")?;
        }

        let _gate = self.commit_gate.read().await;
        let requester_id = *self.pass_owner.get(&id).ok_or(EngineError::NotFound(id))?;
        let book = self.book(requester_id);
        let mut guard = book.write().await;
        let current = guard.get(id).ok_or(EngineError::NotFound(id))?;
        if current.status != PassStatus::Pending {
            return Err(EngineError::AlreadyResolved(id));
        }

        let event = Event::PassResolved {
            id,
            requester_id,
            status,
            by: actor.id,
            comments,
            at: now_ms(),
        };
        self.commit(&event).await?;
        apply_to_book(&mut guard, &event);
        tracing::debug!("pass {id} resolved as {status:?}");
        guard.get(id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// The requester or an administrator may delete a pass.
    pub async fn delete_pass(&self, actor: &Actor, id: Ulid) -> Result<(), EngineError> {
        actor.require_known()?;
        let _gate = self.commit_gate.read().await;
        let requester_id = *self.pass_owner.get(&id).ok_or(EngineError::NotFound(id))?;
        if !actor.is_admin() && actor.id != Some(requester_id) {
            return Err(EngineError::Forbidden("only the requester or an administrator may delete a pass"));
        }
        let book = self.book(requester_id);
        let mut guard = book.write().await;
        if guard.get(id).is_none() {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::PassDeleted { id, requester_id };
        self.commit(&event).await?;
        apply_to_book(&mut guard, &event);
        Ok(())
    }

    pub async fn add_to_blacklist(
        &self,
        actor: &Actor,
        id_number: String,
        reason: Option<String>,
    ) -> Result<(), EngineError> {
        actor.require_admin()?;
        validate_len(&id_number, MAX_NAME_LEN, "id number too long")?;
        if let Some(ref r) = reason {
            validate_len(r, MAX_TEXT_LEN, "reason too long")?;
        }
        let _gate = self.commit_gate.read().await;
        if self.blacklist.contains_key(&id_number) {
            return Err(EngineError::AlreadyExists(id_number));
        }
        if self.blacklist.len() >= MAX_BLACKLIST_ENTRIES {
            return Err(EngineError::LimitExceeded("blacklist is full"));
        }
        self.commit(&Event::GuestBlacklisted { id_number, reason }).await
    }

    pub async fn remove_from_blacklist(&self, actor: &Actor, id_number: String) -> Result<(), EngineError> {
        actor.require_admin()?;
        let _gate = self.commit_gate.read().await;
        if !self.blacklist.contains_key(&id_number) {
            return Err(EngineError::InvalidState("guest is not blacklisted"));
        }
        self.commit(&Event::GuestUnblacklisted { id_number }).await
    }
}
