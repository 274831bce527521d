use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{now_ms, validate_len};
use super::{Actor, Engine, EngineError};

#[derive(Debug, Clone)]
pub struct NewAccount {
    pub id: Ulid,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub role: Role,
    pub student_number: Option<String>,
    pub phone: Option<String>,
}

/// Profile edits; `None` keeps the current value.
#[derive(Debug, Clone, Default)]
pub struct AccountChanges {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<String>,
    pub student_number: Option<String>,
}

impl AccountChanges {
    pub fn is_empty(&self) -> bool {
        self.first_name.is_none()
            && self.last_name.is_none()
            && self.phone.is_none()
            && self.student_number.is_none()
    }
}

fn validate_profile(new: &NewAccount) -> Result<String, EngineError> {
    let email = new.email.trim().to_lowercase();
    if !email.contains('@') {
        return Err(EngineError::InvalidState("email must contain '@'"));
    }
    validate_len(&email, MAX_NAME_LEN, "email too long")?;
    validate_len(&new.first_name, MAX_NAME_LEN, "first name too long")?;
    validate_len(&new.last_name, MAX_NAME_LEN, "last name too long")?;
    for field in [&new.student_number, &new.phone].into_iter().flatten() {
        validate_len(field, MAX_NAME_LEN, "field too long")?;
    }
    Ok(email)
}

fn is_blank(field: &Option<String>) -> bool {
    field.as_deref().is_none_or(|v| v.trim().is_empty())
}

impl Engine {
    /// Accounts created by an administrator start out active.
    pub async fn create_account(&self, actor: &Actor, new: NewAccount) -> Result<Account, EngineError> {
        actor.require_admin()?;
        let email = validate_profile(&new)?;
        let account = self
            .register(new, email, AccountStatus::Active, actor.id)
            .await?;
        tracing::debug!("account {} created as {:?}", account.id, account.role);
        Ok(account)
    }

    /// Student self-registration. The caller's login must be the email being
    /// registered, and the account waits as `Pending` for an administrator.
    pub async fn sign_up(&self, login: &str, new: NewAccount) -> Result<Account, EngineError> {
        let email = validate_profile(&new)?;
        if !login.trim().eq_ignore_ascii_case(&email) {
            return Err(EngineError::Forbidden("sign up with the email you log in as"));
        }
        if new.role != Role::Student {
            return Err(EngineError::Forbidden("only student accounts can sign up"));
        }
        if is_blank(&new.student_number) || is_blank(&new.phone) {
            return Err(EngineError::InvalidState(
                "student number and phone are required to sign up",
            ));
        }
        let account = self.register(new, email, AccountStatus::Pending, None).await?;
        tracing::info!("student {} signed up, pending approval", account.id);
        Ok(account)
    }

    async fn register(
        &self,
        new: NewAccount,
        email: String,
        status: AccountStatus,
        by: Option<Ulid>,
    ) -> Result<Account, EngineError> {
        let _gate = self.commit_gate.read().await;
        let _registry = self.registry.lock().await;
        if self.accounts.len() >= MAX_ACCOUNTS_PER_HALL {
            return Err(EngineError::LimitExceeded("too many accounts"));
        }
        if self.accounts.contains_key(&new.id) {
            return Err(EngineError::AlreadyExists(new.id.to_string()));
        }
        if self.emails.contains_key(&email) {
            return Err(EngineError::AlreadyExists(email));
        }
        if let Some(ref number) = new.student_number
            && self.student_number_owner(number).is_some()
        {
            return Err(EngineError::AlreadyExists(number.clone()));
        }

        let account = Account {
            id: new.id,
            email,
            first_name: new.first_name,
            last_name: new.last_name,
            phone: new.phone,
            role: new.role,
            status,
            student_number: new.student_number,
            room_id: None,
            status_changed_by: by,
            status_reason: None,
            created_at: now_ms(),
        };
        self.commit(&Event::AccountCreated(account.clone())).await?;
        Ok(account)
    }

    /// The owner may edit their own profile; an administrator any profile.
    pub async fn update_account(
        &self,
        actor: &Actor,
        id: Ulid,
        changes: AccountChanges,
    ) -> Result<Account, EngineError> {
        actor.require_known()?;
        if !actor.is_admin() && actor.id != Some(id) {
            return Err(EngineError::Forbidden("only the owner or an administrator may edit a profile"));
        }
        if changes.is_empty() {
            return Err(EngineError::InvalidState("nothing to update"));
        }
        for field in [&changes.first_name, &changes.last_name, &changes.phone, &changes.student_number]
            .into_iter()
            .flatten()
        {
            validate_len(field, MAX_NAME_LEN, "field too long")?;
        }

        let _gate = self.commit_gate.read().await;
        let _registry = self.registry.lock().await;
        let _student = self.record_locks.lock(id).await;
        let current = self.get_account(&id).ok_or(EngineError::NotFound(id))?;
        if let Some(ref number) = changes.student_number
            && self.student_number_owner(number).is_some_and(|owner| owner != id)
        {
            return Err(EngineError::AlreadyExists(number.clone()));
        }

        let event = Event::AccountUpdated {
            id,
            first_name: changes.first_name.unwrap_or(current.first_name),
            last_name: changes.last_name.unwrap_or(current.last_name),
            phone: changes.phone.or(current.phone),
            student_number: changes.student_number.or(current.student_number),
        };
        self.commit(&event).await?;
        tracing::debug!("account {id} profile updated");
        self.get_account(&id).ok_or(EngineError::NotFound(id))
    }

    pub async fn set_account_status(
        &self,
        actor: &Actor,
        id: Ulid,
        status: AccountStatus,
        reason: Option<String>,
    ) -> Result<(), EngineError> {
        actor.require_admin()?;
        if let Some(ref r) = reason {
            validate_len(r, MAX_TEXT_LEN, "reason too long")?;
        }
        let _gate = self.commit_gate.read().await;
        let _student = self.record_locks.lock(id).await;
        if !self.accounts.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::AccountStatusChanged {
            id,
            status,
            by: actor.id,
            reason,
        };
        self.commit(&event).await?;
        tracing::debug!("account {id} is now {status:?}");
        Ok(())
    }

    /// A resident has to be removed from their room first.
    pub async fn delete_account(&self, actor: &Actor, id: Ulid) -> Result<(), EngineError> {
        actor.require_admin()?;
        let _gate = self.commit_gate.read().await;
        let _registry = self.registry.lock().await;
        let _student = self.record_locks.lock(id).await;
        let account = self.get_account(&id).ok_or(EngineError::NotFound(id))?;
        if account.room_id.is_some() {
            return Err(EngineError::InvalidState("account still holds a room"));
        }
        self.commit(&Event::AccountDeleted { id }).await?;
        tracing::debug!("account {id} deleted");
        Ok(())
    }
}
