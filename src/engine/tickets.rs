use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{now_ms, today, validate_len};
use super::{apply_to_room, Actor, Engine, EngineError};

#[derive(Debug, Clone)]
pub struct NewTicket {
    pub id: Ulid,
    pub room_id: Ulid,
    pub issue_type: String,
    pub priority: Priority,
    pub description: Option<String>,
}

impl Engine {
    /// Open a ticket against a room. The caller is recorded as the reporter.
    pub async fn open_ticket(&self, actor: &Actor, new: NewTicket) -> Result<MaintenanceTicket, EngineError> {
        actor.require_known()?;
        if new.issue_type.trim().is_empty() {
            return Err(EngineError::InvalidState("issue type is required"));
        }
        validate_len(&new.issue_type, MAX_NAME_LEN, "issue type too long")?;
        if let Some(ref d) = new.description {
            validate_len(d, MAX_TEXT_LEN, "description too long")?;
        }
        if !self.rooms.contains_key(&new.room_id) {
            return Err(EngineError::NotFound(new.room_id));
        }

        let _gate = self.commit_gate.read().await;
        let _ticket = self.record_locks.lock(new.id).await;
        if self.tickets.contains_key(&new.id) {
            return Err(EngineError::AlreadyExists(new.id.to_string()));
        }
        if self.tickets.len() >= MAX_TICKETS_PER_HALL {
            return Err(EngineError::LimitExceeded("too many tickets"));
        }

        let ticket = MaintenanceTicket {
            id: new.id,
            student_id: actor.id,
            room_id: new.room_id,
            issue_type: new.issue_type,
            description: new.description,
            priority: new.priority,
            status: TicketStatus::Pending,
            assigned_to: None,
            notes: None,
            reported_at: now_ms(),
            resolved_at: None,
        };
        self.commit(&Event::TicketOpened(ticket.clone())).await?;
        tracing::debug!("ticket {} opened for room {}", ticket.id, ticket.room_id);
        Ok(ticket)
    }

    /// Hand a ticket to an administrator; the ticket moves to in-progress.
    pub async fn assign_ticket(&self, actor: &Actor, id: Ulid, admin_id: Ulid) -> Result<(), EngineError> {
        actor.require_admin()?;
        let _gate = self.commit_gate.read().await;
        let _ticket = self.record_locks.lock(id).await;
        let status = self
            .tickets
            .get(&id)
            .map(|t| t.status)
            .ok_or(EngineError::NotFound(id))?;
        if status == TicketStatus::Resolved {
            return Err(EngineError::AlreadyResolved(id));
        }
        let assignee = self.get_account(&admin_id).ok_or(EngineError::NotFound(admin_id))?;
        if assignee.role != Role::Admin {
            return Err(EngineError::InvalidState("tickets can only be assigned to administrators"));
        }
        self.commit(&Event::TicketAssigned { id, admin_id }).await?;
        tracing::debug!("ticket {id} assigned to {admin_id}");
        Ok(())
    }

    /// Resolve a ticket and stamp the room's last maintenance date.
    pub async fn resolve_ticket(
        &self,
        actor: &Actor,
        id: Ulid,
        notes: Option<String>,
    ) -> Result<MaintenanceTicket, EngineError> {
        actor.require_admin()?;
        if let Some(ref n) = notes {
            validate_len(n, MAX_TEXT_LEN, "notes too long")?;
        }
        let _gate = self.commit_gate.read().await;
        let _ticket = self.record_locks.lock(id).await;
        let (status, room_id) = self
            .tickets
            .get(&id)
            .map(|t| (t.status, t.room_id))
            .ok_or(EngineError::NotFound(id))?;
        if status == TicketStatus::Resolved {
            return Err(EngineError::AlreadyResolved(id));
        }

        // The room may have been deleted since the ticket was opened.
        let room = self.get_room(&room_id);
        let mut guard = match room {
            Some(room) => Some(room.write_owned().await),
            None => None,
        };
        let event = Event::TicketResolved {
            id,
            room_id,
            notes,
            at: now_ms(),
            day: today(),
        };
        self.commit(&event).await?;
        if let Some(ref mut guard) = guard {
            apply_to_room(guard, &event);
        }
        tracing::debug!("ticket {id} resolved");
        self.tickets
            .get(&id)
            .map(|t| t.value().clone())
            .ok_or(EngineError::NotFound(id))
    }

    pub async fn delete_ticket(&self, actor: &Actor, id: Ulid) -> Result<(), EngineError> {
        actor.require_admin()?;
        let _gate = self.commit_gate.read().await;
        let _ticket = self.record_locks.lock(id).await;
        if !self.tickets.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        self.commit(&Event::TicketDeleted { id }).await
    }
}
