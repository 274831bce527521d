use std::io;
use std::path::{Path, PathBuf};

use ulid::Ulid;

/// Blob storage for attachments: one file per attachment id under a hall's
/// files directory. Metadata lives in the event log, not here.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: Ulid) -> PathBuf {
        self.dir.join(id.to_string())
    }

    /// Write and fsync. Returns the CRC32 of `data`.
    pub async fn write(&self, id: Ulid, data: &[u8]) -> io::Result<u32> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(id);
        let tmp = path.with_extension("tmp");
        {
            use tokio::io::AsyncWriteExt;
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
        }
        tokio::fs::rename(&tmp, &path).await?;
        Ok(crc32fast::hash(data))
    }

    /// Read a blob and verify it against the recorded checksum.
    pub async fn read(&self, id: Ulid, expected_crc: u32) -> io::Result<Vec<u8>> {
        let data = tokio::fs::read(self.path_for(id)).await?;
        if crc32fast::hash(&data) != expected_crc {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("checksum mismatch for attachment {id}"),
            ));
        }
        Ok(data)
    }

    /// Missing files are not an error.
    pub async fn remove(&self, id: Ulid) -> io::Result<()> {
        match tokio::fs::remove_file(self.path_for(id)).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}
