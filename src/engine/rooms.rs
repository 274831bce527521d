use tokio::sync::OwnedRwLockWriteGuard;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::validate_len;
use super::{apply_to_room, occupancy, Actor, Engine, EngineError, SharedRoom};

#[derive(Debug, Clone)]
pub struct NewRoom {
    pub id: Ulid,
    pub number: String,
    /// Defaults by room type when absent.
    pub capacity: Option<u32>,
    pub room_type: Option<String>,
    pub building: Option<String>,
    pub floor: Option<i32>,
}

/// Fields to change; `None` leaves a field as it is.
#[derive(Debug, Clone, Default)]
pub struct RoomChanges {
    pub number: Option<String>,
    pub capacity: Option<u32>,
    pub room_type: Option<String>,
    pub building: Option<String>,
    pub floor: Option<i32>,
}

fn validate_capacity(capacity: u32) -> Result<(), EngineError> {
    if capacity == 0 {
        return Err(EngineError::InvalidState("capacity must be at least 1"));
    }
    if capacity > MAX_ROOM_CAPACITY {
        return Err(EngineError::LimitExceeded("room capacity too large"));
    }
    Ok(())
}

fn validate_number(number: &str) -> Result<(), EngineError> {
    if number.trim().is_empty() {
        return Err(EngineError::InvalidState("room number must not be empty"));
    }
    validate_len(number, MAX_NAME_LEN, "room number too long")
}

type RoomGuard = OwnedRwLockWriteGuard<Room>;

impl Engine {
    pub async fn create_room(&self, actor: &Actor, new: NewRoom) -> Result<Room, EngineError> {
        actor.require_admin()?;
        validate_number(&new.number)?;
        for field in [&new.room_type, &new.building].into_iter().flatten() {
            validate_len(field, MAX_NAME_LEN, "field too long")?;
        }
        let capacity = new
            .capacity
            .unwrap_or_else(|| default_capacity(new.room_type.as_deref()));
        validate_capacity(capacity)?;

        let _gate = self.commit_gate.read().await;
        let _registry = self.registry.lock().await;
        if self.rooms.len() >= MAX_ROOMS_PER_HALL {
            return Err(EngineError::LimitExceeded("too many rooms"));
        }
        if self.rooms.contains_key(&new.id) {
            return Err(EngineError::AlreadyExists(new.id.to_string()));
        }
        if self.room_numbers.contains_key(&new.number) {
            return Err(EngineError::AlreadyExists(new.number));
        }

        let mut room = Room::new(new.id, new.number, capacity);
        room.room_type = new.room_type;
        room.building = new.building;
        room.floor = new.floor;
        self.commit(&Event::RoomCreated(room.clone())).await?;
        tracing::debug!("room {} ({}) created, capacity {capacity}", room.id, room.number);
        Ok(room)
    }

    pub async fn update_room(
        &self,
        actor: &Actor,
        id: Ulid,
        changes: RoomChanges,
    ) -> Result<Room, EngineError> {
        actor.require_admin()?;
        if let Some(ref n) = changes.number {
            validate_number(n)?;
        }
        for field in [&changes.room_type, &changes.building].into_iter().flatten() {
            validate_len(field, MAX_NAME_LEN, "field too long")?;
        }
        if let Some(c) = changes.capacity {
            validate_capacity(c)?;
        }

        let _gate = self.commit_gate.read().await;
        let _registry = self.registry.lock().await;
        let mut guard = self.lock_room(id).await?;

        let number = changes.number.unwrap_or_else(|| guard.number.clone());
        let taken = self.room_numbers.get(&number).is_some_and(|owner| *owner != id);
        if taken {
            return Err(EngineError::AlreadyExists(number));
        }
        let capacity = changes.capacity.unwrap_or(guard.capacity);
        if capacity < guard.occupancy() {
            return Err(EngineError::InvalidState("capacity below current occupancy"));
        }

        let event = Event::RoomUpdated {
            id,
            number,
            room_type: changes.room_type.or_else(|| guard.room_type.clone()),
            building: changes.building.or_else(|| guard.building.clone()),
            floor: changes.floor.or(guard.floor),
            capacity,
        };
        self.commit(&event).await?;
        apply_to_room(&mut guard, &event);
        Ok(guard.clone())
    }

    /// Only an empty room can be deleted.
    pub async fn delete_room(&self, actor: &Actor, id: Ulid) -> Result<(), EngineError> {
        actor.require_admin()?;
        let _gate = self.commit_gate.read().await;
        let _registry = self.registry.lock().await;
        let guard = self.lock_room(id).await?;
        if guard.occupancy() > 0 {
            return Err(EngineError::RoomOccupied(id));
        }
        self.commit(&Event::RoomDeleted { id }).await?;
        tracing::debug!("room {id} deleted");
        Ok(())
    }

    /// Move a student into `room_id`, out of whatever room they held.
    ///
    /// Assigning a student to the room they already live in changes nothing.
    pub async fn assign_resident(
        &self,
        actor: &Actor,
        student_id: Ulid,
        room_id: Ulid,
    ) -> Result<(), EngineError> {
        actor.require_admin()?;
        let _gate = self.commit_gate.read().await;
        let _student = self.record_locks.lock(student_id).await;

        loop {
            let account = self
                .get_account(&student_id)
                .ok_or(EngineError::NotFound(student_id))?;
            if account.role != Role::Student {
                return Err(EngineError::InvalidState("only students can be assigned a room"));
            }
            if !account.is_active() {
                return Err(EngineError::InvalidState("account is not active"));
            }
            let previous = account.room_id;
            if previous == Some(room_id) {
                return Ok(());
            }

            let target = self.get_room(&room_id).ok_or(EngineError::NotFound(room_id))?;
            let mut rooms: Vec<(Ulid, SharedRoom)> = vec![(room_id, target)];
            if let Some(prev_id) = previous
                && let Some(prev) = self.get_room(&prev_id)
            {
                rooms.push((prev_id, prev));
            }
            let mut guards = lock_sorted(rooms).await;

            if !guards
                .iter()
                .any(|(id, room, _)| *id == room_id && self.is_live_room(id, room))
            {
                return Err(EngineError::NotFound(room_id));
            }
            // A reset of the old room may have cleared the assignment while
            // we waited for its lock.
            let current = self.get_account(&student_id).and_then(|a| a.room_id);
            if current != previous {
                continue;
            }

            let Some((_, _, target)) = guards.iter().find(|(id, _, _)| *id == room_id) else {
                return Err(EngineError::NotFound(room_id));
            };
            if !occupancy::is_available(target) {
                metrics::counter!(crate::observability::CAPACITY_REJECTIONS_TOTAL).increment(1);
                return Err(EngineError::CapacityExceeded(target.capacity));
            }

            let event = Event::ResidentAssigned {
                student_id,
                room_id,
                previous_room_id: previous,
            };
            self.commit(&event).await?;
            for (_, _, guard) in guards.iter_mut() {
                apply_to_room(guard, &event);
            }
            tracing::debug!("student {student_id} assigned to room {room_id}");
            return Ok(());
        }
    }

    /// Take a student out of their room. With `room_id` given, the student
    /// must actually live there.
    pub async fn remove_resident(
        &self,
        actor: &Actor,
        student_id: Ulid,
        room_id: Option<Ulid>,
    ) -> Result<(), EngineError> {
        actor.require_admin()?;
        let _gate = self.commit_gate.read().await;
        let _student = self.record_locks.lock(student_id).await;

        let account = self
            .get_account(&student_id)
            .ok_or(EngineError::NotFound(student_id))?;
        let current = account
            .room_id
            .ok_or(EngineError::InvalidState("student has no room"))?;
        if room_id.is_some_and(|r| r != current) {
            return Err(EngineError::InvalidState("student is not assigned to this room"));
        }

        let mut guard = self.lock_room(current).await?;
        if self.get_account(&student_id).and_then(|a| a.room_id) != Some(current) {
            return Err(EngineError::InvalidState("student is not assigned to this room"));
        }
        let event = Event::ResidentRemoved {
            student_id,
            room_id: current,
        };
        self.commit(&event).await?;
        apply_to_room(&mut guard, &event);
        tracing::debug!("student {student_id} removed from room {current}");
        Ok(())
    }

    /// Empty a room: every resident loses their assignment.
    pub async fn reset_room(&self, actor: &Actor, room_id: Ulid) -> Result<Vec<Ulid>, EngineError> {
        actor.require_admin()?;
        let _gate = self.commit_gate.read().await;
        let mut guard = self.lock_room(room_id).await?;

        let mut residents: Vec<Ulid> = self
            .accounts
            .iter()
            .filter(|a| a.room_id == Some(room_id))
            .map(|a| a.id)
            .collect();
        residents.sort();

        let event = Event::RoomReset {
            room_id,
            residents: residents.clone(),
        };
        self.commit(&event).await?;
        apply_to_room(&mut guard, &event);
        tracing::debug!("room {room_id} reset, {} residents removed", residents.len());
        Ok(residents)
    }

    /// Write-lock a room, failing if it is gone or was deleted while waiting.
    async fn lock_room(&self, id: Ulid) -> Result<RoomGuard, EngineError> {
        let room = self.get_room(&id).ok_or(EngineError::NotFound(id))?;
        let guard = room.clone().write_owned().await;
        if !self.is_live_room(&id, &room) {
            return Err(EngineError::NotFound(id));
        }
        Ok(guard)
    }
}

/// Write-lock rooms in id order so that two moves in opposite directions
/// cannot deadlock.
async fn lock_sorted(mut rooms: Vec<(Ulid, SharedRoom)>) -> Vec<(Ulid, SharedRoom, RoomGuard)> {
    rooms.sort_by_key(|(id, _)| *id);
    rooms.dedup_by_key(|(id, _)| *id);
    let mut guards = Vec::with_capacity(rooms.len());
    for (id, room) in rooms {
        let guard = room.clone().write_owned().await;
        guards.push((id, room, guard));
    }
    guards
}
