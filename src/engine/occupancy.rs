//! Occupancy ledger: keeps `0 <= occupancy <= capacity` for a room.
//!
//! Increment fails loudly when the room is full; decrement clamps silently
//! at zero. Persisting the mutated room is the caller's job.

use crate::model::Room;

use super::EngineError;

/// Take one more resident. On a full room nothing is mutated.
pub fn increment(room: &mut Room) -> Result<(), EngineError> {
    let current = room.occupancy();
    if current >= room.capacity {
        return Err(EngineError::CapacityExceeded(room.capacity));
    }
    room.occupancy = Some(current + 1);
    Ok(())
}

/// Release one resident. Never errors and never goes below zero.
pub fn decrement(room: &mut Room) {
    room.occupancy = Some(room.occupancy().saturating_sub(1));
}

pub fn is_available(room: &Room) -> bool {
    match room.occupancy {
        None => true,
        Some(n) => n < room.capacity,
    }
}

pub fn reset(room: &mut Room) {
    room.occupancy = Some(0);
}
