use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;

use crate::compactor;
use crate::engine::Engine;
use crate::limits::*;

/// Manages per-hall engines. Each hall gets its own Engine, WAL, file
/// store and compactor. Hall = database name from the pgwire connection.
pub struct HallManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
}

impl HallManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
        }
    }

    /// Get or lazily create the engine for the given hall.
    pub fn get_or_create(&self, hall: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(hall) {
            return Ok(engine.value().clone());
        }
        if hall.len() > MAX_HALL_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "hall name too long",
            ));
        }
        let safe_name = sanitize(hall);
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty hall name",
            ));
        }
        // The name is also the file stem, so two names must never share one.
        if safe_name != hall {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid hall name {hall:?}: use only [A-Za-z0-9_-]"),
            ));
        }

        if self.engines.len() >= MAX_HALLS {
            return Err(std::io::Error::other("too many halls"));
        }

        // One engine, and so one WAL writer, per hall. `len` must not be
        // called while the entry holds its shard.
        let entry = self.engines.entry(hall.to_string());
        if let dashmap::mapref::entry::Entry::Occupied(existing) = &entry {
            return Ok(existing.get().clone());
        }

        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let files_dir = self.data_dir.join(format!("{safe_name}.files"));
        let engine = Arc::new(Engine::new(wal_path, files_dir)?);

        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            compactor::run_compactor(compactor_engine, safe_name, threshold).await;
        });

        entry.insert(engine.clone());
        metrics::gauge!(crate::observability::HALLS_ACTIVE).set(self.engines.len() as f64);
        tracing::info!("opened hall {hall}");
        Ok(engine)
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }
}

/// Strip everything but `[A-Za-z0-9_-]` so a hall name is a safe file stem.
fn sanitize(hall: &str) -> String {
    hall.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Actor, NewRoom, RoomFilter};
    use std::fs;
    use ulid::Ulid;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("hallkeep_test_halls").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn room(id: Ulid, number: &str) -> NewRoom {
        NewRoom {
            id,
            number: number.into(),
            capacity: None,
            room_type: Some("DOUBLE".into()),
            building: None,
            floor: None,
        }
    }

    #[tokio::test]
    async fn hall_isolation() {
        let dir = test_data_dir("isolation");
        let halls = HallManager::new(dir, 1000);
        let admin = Actor::superuser();

        let north = halls.get_or_create("north").unwrap();
        let south = halls.get_or_create("south").unwrap();

        // Same id and number in both halls.
        let rid = Ulid::new();
        north.create_room(&admin, room(rid, "101")).await.unwrap();
        south.create_room(&admin, room(rid, "101")).await.unwrap();
        north.delete_room(&admin, rid).await.unwrap();

        let all = RoomFilter::default();
        assert!(north.list_rooms(&admin, &all).await.unwrap().is_empty());
        assert_eq!(south.list_rooms(&admin, &all).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn hall_lazy_creation() {
        let dir = test_data_dir("lazy");
        let halls = HallManager::new(dir.clone(), 1000);

        let entries: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert!(entries.is_empty());
        assert!(halls.is_empty());

        let _engine = halls.get_or_create("my_hall").unwrap();
        assert!(dir.join("my_hall.wal").exists());
        assert_eq!(halls.len(), 1);
    }

    #[tokio::test]
    async fn hall_same_engine_returned() {
        let dir = test_data_dir("same_engine");
        let halls = HallManager::new(dir, 1000);

        let a = halls.get_or_create("foo").unwrap();
        let b = halls.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn hall_name_with_unsafe_chars_rejected() {
        let dir = test_data_dir("sanitize");
        let halls = HallManager::new(dir.clone(), 1000);

        let err = halls.get_or_create("../evil").err().unwrap();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
        assert!(!dir.join("evil.wal").exists());

        assert!(halls.get_or_create("../..").is_err());
        assert!(halls.is_empty());
    }

    #[tokio::test]
    async fn names_that_clean_alike_never_share_a_log() {
        let dir = test_data_dir("clean_alike");
        let admin = Actor::superuser();
        let all = RoomFilter::default();

        {
            let halls = HallManager::new(dir.clone(), 1000);
            assert!(halls.get_or_create("north.wing").is_err());
            let plain = halls.get_or_create("northwing").unwrap();
            plain
                .create_room(&admin, room(Ulid::new(), "B1"))
                .await
                .unwrap();
            assert_eq!(halls.len(), 1);
        }

        // Reopen from disk: only the one hall's rooms come back.
        let halls = HallManager::new(dir, 1000);
        let plain = halls.get_or_create("northwing").unwrap();
        let numbers: Vec<String> = plain
            .list_rooms(&admin, &all)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.number)
            .collect();
        assert_eq!(numbers, vec!["B1".to_string()]);
    }

    #[tokio::test]
    async fn hall_name_too_long() {
        let dir = test_data_dir("name_too_long");
        let halls = HallManager::new(dir, 1000);

        let long_name = "x".repeat(MAX_HALL_NAME_LEN + 1);
        let err = halls.get_or_create(&long_name).err().unwrap();
        assert!(err.to_string().contains("hall name too long"));
    }

    #[test]
    fn sanitize_keeps_safe_chars() {
        assert_eq!(sanitize("Hall-7_east"), "Hall-7_east");
        assert_eq!(sanitize("a/b\\c.d"), "abcd");
        assert_eq!(sanitize("résidence"), "rsidence");
    }
}
