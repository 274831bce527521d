use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{now_ms, validate_len};
use super::{Actor, Engine, EngineError};

#[derive(Debug, Clone)]
pub struct NewAttachment {
    pub id: Ulid,
    pub owner_id: Ulid,
    pub file_name: String,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

impl Engine {
    /// Write the blob first, then log its metadata. A blob without a log
    /// record is removed again; one that survives a crash is never listed.
    pub async fn store_attachment(&self, actor: &Actor, new: NewAttachment) -> Result<Attachment, EngineError> {
        actor.require_known()?;
        if new.file_name.trim().is_empty() {
            return Err(EngineError::InvalidState("file name is required"));
        }
        validate_len(&new.file_name, MAX_NAME_LEN, "file name too long")?;
        if let Some(ref ct) = new.content_type {
            validate_len(ct, MAX_NAME_LEN, "content type too long")?;
        }
        if new.data.len() > MAX_ATTACHMENT_BYTES {
            return Err(EngineError::LimitExceeded("attachment too large"));
        }

        let _gate = self.commit_gate.read().await;
        let _lock = self.record_locks.lock(new.id).await;
        if self.attachments.contains_key(&new.id) {
            return Err(EngineError::AlreadyExists(new.id.to_string()));
        }
        let crc32 = self
            .files
            .write(new.id, &new.data)
            .await
            .map_err(|e| EngineError::FileError(e.to_string()))?;

        let attachment = Attachment {
            id: new.id,
            owner_id: new.owner_id,
            uploader_id: actor.id,
            file_name: new.file_name,
            content_type: new.content_type,
            size: new.data.len() as u64,
            crc32,
            created_at: now_ms(),
        };
        if let Err(e) = self.commit(&Event::AttachmentStored(attachment.clone())).await {
            if let Err(rm) = self.files.remove(new.id).await {
                tracing::warn!("orphaned attachment blob {}: {rm}", new.id);
            }
            return Err(e);
        }
        tracing::debug!("attachment {} stored ({} bytes)", attachment.id, attachment.size);
        Ok(attachment)
    }

    /// Metadata plus contents, checksum-verified.
    pub async fn read_attachment(&self, actor: &Actor, id: Ulid) -> Result<(Attachment, Vec<u8>), EngineError> {
        actor.require_known()?;
        let attachment = self
            .attachments
            .get(&id)
            .map(|a| a.value().clone())
            .ok_or(EngineError::NotFound(id))?;
        let data = self
            .files
            .read(id, attachment.crc32)
            .await
            .map_err(|e| EngineError::FileError(e.to_string()))?;
        Ok((attachment, data))
    }

    /// The uploader or an administrator may delete a file.
    pub async fn delete_attachment(&self, actor: &Actor, id: Ulid) -> Result<(), EngineError> {
        actor.require_known()?;
        let _gate = self.commit_gate.read().await;
        let _lock = self.record_locks.lock(id).await;
        let uploader = self
            .attachments
            .get(&id)
            .map(|a| a.uploader_id)
            .ok_or(EngineError::NotFound(id))?;
        if !actor.is_admin() && (uploader.is_none() || uploader != actor.id) {
            return Err(EngineError::Forbidden("only the uploader or an administrator may delete a file"));
        }
        self.commit(&Event::AttachmentDeleted { id }).await?;
        if let Err(e) = self.files.remove(id).await {
            tracing::warn!("attachment {id} deleted but blob remains: {e}");
        }
        self.record_locks.forget(&id);
        Ok(())
    }
}
