use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::conflict::now_ms;
use super::{occupancy, Actor, Engine, EngineError, SharedPassBook, SharedRoom};

#[derive(Debug, Clone, Default)]
pub struct RoomFilter {
    pub available: Option<bool>,
    pub building: Option<String>,
    pub floor: Option<i32>,
    pub room_type: Option<String>,
    /// Rooms never maintained, or last maintained before this date.
    pub maintained_before: Option<NaiveDate>,
}

impl RoomFilter {
    fn matches(&self, room: &Room) -> bool {
        self.available
            .is_none_or(|a| occupancy::is_available(room) == a)
            && self
                .building
                .as_ref()
                .is_none_or(|b| room.building.as_ref() == Some(b))
            && self.floor.is_none_or(|f| room.floor == Some(f))
            && self.room_type.as_ref().is_none_or(|t| {
                room.room_type
                    .as_ref()
                    .is_some_and(|rt| rt.eq_ignore_ascii_case(t))
            })
            && self
                .maintained_before
                .is_none_or(|cutoff| room.needs_maintenance(cutoff))
    }
}

#[derive(Debug, Clone, Default)]
pub struct PassFilter {
    pub id: Option<Ulid>,
    pub requester_id: Option<Ulid>,
    pub status: Option<PassStatus>,
}

#[derive(Debug, Clone, Default)]
pub struct TicketFilter {
    pub status: Option<TicketStatus>,
    pub room_id: Option<Ulid>,
    pub student_id: Option<Ulid>,
}

impl Engine {
    async fn room_snapshot(&self) -> Vec<Room> {
        let arcs: Vec<SharedRoom> = self.rooms.iter().map(|e| e.value().clone()).collect();
        let mut rooms = Vec::with_capacity(arcs.len());
        for room in arcs {
            rooms.push(room.read().await.clone());
        }
        rooms.sort_by(|a, b| a.number.cmp(&b.number));
        rooms
    }

    async fn pass_snapshot(&self, requester: Option<Ulid>) -> Vec<GuestPass> {
        let books: Vec<SharedPassBook> = match requester {
            Some(r) => self
                .pass_books
                .get(&r)
                .map(|b| b.value().clone())
                .into_iter()
                .collect(),
            None => self.pass_books.iter().map(|e| e.value().clone()).collect(),
        };
        let mut passes = Vec::new();
        for book in books {
            passes.extend(book.read().await.passes.iter().cloned());
        }
        passes.sort_by_key(|p| p.id);
        passes
    }

    pub fn list_accounts(
        &self,
        actor: &Actor,
        role: Option<Role>,
        status: Option<AccountStatus>,
    ) -> Result<Vec<Account>, EngineError> {
        actor.require_admin()?;
        let mut accounts: Vec<Account> = self
            .accounts
            .iter()
            .filter(|a| role.is_none_or(|r| a.role == r))
            .filter(|a| status.is_none_or(|s| a.status == s))
            .map(|a| a.value().clone())
            .collect();
        accounts.sort_by_key(|a| a.id);
        Ok(accounts)
    }

    pub async fn list_rooms(&self, actor: &Actor, filter: &RoomFilter) -> Result<Vec<Room>, EngineError> {
        actor.require_known()?;
        let mut rooms = self.room_snapshot().await;
        rooms.retain(|r| filter.matches(r));
        Ok(rooms)
    }

    /// Students only ever see their own passes.
    pub async fn list_passes(&self, actor: &Actor, filter: &PassFilter) -> Result<Vec<GuestPass>, EngineError> {
        actor.require_known()?;
        let requester = if actor.is_admin() {
            filter.requester_id
        } else {
            let own = actor.require_account()?;
            if filter.requester_id.is_some_and(|r| r != own) {
                return Ok(Vec::new());
            }
            Some(own)
        };
        let mut passes = self.pass_snapshot(requester).await;
        passes.retain(|p| {
            filter.id.is_none_or(|id| p.id == id) && filter.status.is_none_or(|s| p.status == s)
        });
        Ok(passes)
    }

    pub fn list_blacklist(&self, actor: &Actor) -> Result<Vec<BlacklistEntry>, EngineError> {
        actor.require_admin()?;
        let mut entries: Vec<BlacklistEntry> = self
            .blacklist
            .iter()
            .map(|e| BlacklistEntry {
                id_number: e.key().clone(),
                reason: e.value().clone(),
            })
            .collect();
        entries.sort_by(|a, b| a.id_number.cmp(&b.id_number));
        Ok(entries)
    }

    /// Students only ever see tickets they reported.
    pub fn list_tickets(&self, actor: &Actor, filter: &TicketFilter) -> Result<Vec<MaintenanceTicket>, EngineError> {
        actor.require_known()?;
        let reporter = if actor.is_admin() {
            filter.student_id
        } else {
            let own = actor.require_account()?;
            if filter.student_id.is_some_and(|s| s != own) {
                return Ok(Vec::new());
            }
            Some(own)
        };
        let mut tickets: Vec<MaintenanceTicket> = self
            .tickets
            .iter()
            .filter(|t| filter.status.is_none_or(|s| t.status == s))
            .filter(|t| filter.room_id.is_none_or(|r| t.room_id == r))
            .filter(|t| reporter.is_none_or(|s| t.student_id == Some(s)))
            .map(|t| t.value().clone())
            .collect();
        tickets.sort_by_key(|t| t.id);
        Ok(tickets)
    }

    pub fn list_attachments(&self, actor: &Actor, owner_id: Option<Ulid>) -> Result<Vec<Attachment>, EngineError> {
        actor.require_known()?;
        let mut attachments: Vec<Attachment> = self
            .attachments
            .iter()
            .filter(|a| owner_id.is_none_or(|o| a.owner_id == o))
            .filter(|a| actor.is_admin() || owner_id.is_some() || a.uploader_id == actor.id)
            .map(|a| a.value().clone())
            .collect();
        attachments.sort_by_key(|a| a.id);
        Ok(attachments)
    }

    // ── Reports ──────────────────────────────────────────────

    pub async fn occupancy_report(&self, actor: &Actor) -> Result<OccupancyReport, EngineError> {
        actor.require_admin()?;
        let mut report = OccupancyReport::default();
        for room in self.room_snapshot().await {
            report.rooms += 1;
            report.total_capacity += u64::from(room.capacity);
            report.total_occupancy += u64::from(room.occupancy());
            if occupancy::is_available(&room) {
                report.available_rooms += 1;
            } else {
                report.full_rooms += 1;
            }
        }
        Ok(report)
    }

    pub async fn pass_report(&self, actor: &Actor) -> Result<PassReport, EngineError> {
        actor.require_admin()?;
        let mut report = PassReport::default();
        for pass in self.pass_snapshot(None).await {
            report.total += 1;
            match pass.status {
                PassStatus::Pending => report.pending += 1,
                PassStatus::Approved => report.approved += 1,
                PassStatus::Rejected => report.rejected += 1,
            }
        }
        Ok(report)
    }

    pub fn maintenance_report(&self, actor: &Actor) -> Result<MaintenanceReport, EngineError> {
        actor.require_admin()?;
        let mut report = MaintenanceReport::default();
        for ticket in self.tickets.iter() {
            report.total += 1;
            match ticket.status {
                TicketStatus::Pending => report.pending += 1,
                TicketStatus::InProgress => report.in_progress += 1,
                TicketStatus::Resolved => report.resolved += 1,
            }
        }
        Ok(report)
    }

    pub fn account_report(&self, actor: &Actor) -> Result<AccountReport, EngineError> {
        actor.require_admin()?;
        let mut report = AccountReport::default();
        for account in self.accounts.iter() {
            report.total += 1;
            match account.role {
                Role::Student => report.students += 1,
                Role::Admin => report.admins += 1,
            }
            match account.status {
                AccountStatus::Pending => report.pending += 1,
                AccountStatus::Active => report.active += 1,
                AccountStatus::Disabled => report.disabled += 1,
            }
        }
        Ok(report)
    }

    pub async fn hall_report(&self, actor: &Actor) -> Result<HallReport, EngineError> {
        Ok(HallReport {
            generated_at: now_ms(),
            occupancy: self.occupancy_report(actor).await?,
            passes: self.pass_report(actor).await?,
            maintenance: self.maintenance_report(actor)?,
            accounts: self.account_report(actor)?,
        })
    }
}
