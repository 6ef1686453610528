use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::Result;
use crate::model::ClosedWindowRecord;
use crate::services::history::MAX_CLOSED_WINDOWS;

/// Хранилище истории закрытых окон между запусками
pub trait HistoryStore: Send + Sync {
    fn load(&self) -> Result<Vec<ClosedWindowRecord>>;
    fn save(&self, records: &[ClosedWindowRecord]) -> Result<()>;
}

/// JSON-массив записей в файле настроек пользователя
#[derive(Debug, Clone)]
pub struct JsonHistoryStore {
    path: PathBuf,
}

impl JsonHistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl HistoryStore for JsonHistoryStore {
    fn load(&self) -> Result<Vec<ClosedWindowRecord>> {
        if !self.path.exists() {
            debug!("Файл истории {:?} не найден, начинаем с пустой истории", self.path);
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }

        let mut records: Vec<ClosedWindowRecord> = serde_json::from_str(&content)?;
        records.retain(|record| !record.location.trim().is_empty());
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records.truncate(MAX_CLOSED_WINDOWS);

        info!("Загружено {} записей истории из {:?}", records.len(), self.path);
        Ok(records)
    }

    fn save(&self, records: &[ClosedWindowRecord]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let records = &records[..records.len().min(MAX_CLOSED_WINDOWS)];
        let json = serde_json::to_string_pretty(records)?;

        // Запись через временный файл, чтобы не оставить обрезанный JSON
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;

        debug!("Сохранено {} записей истории в {:?}", records.len(), self.path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_is_empty_history() {
        let dir = tempdir().unwrap();
        let store = JsonHistoryStore::new(dir.path().join("absent.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_save_then_load_in_nested_dir() {
        let dir = tempdir().unwrap();
        let store = JsonHistoryStore::new(dir.path().join("nested").join("closed_windows.json"));
        let created = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

        let records = vec![ClosedWindowRecord::new("C:\\Work")
            .with_name("Work")
            .with_selection(vec!["a.txt".to_string()])
            .with_created_at(created)
            .with_restore(true)];
        store.save(&records).unwrap();

        let content = fs::read_to_string(store.path()).unwrap();
        assert!(content.contains("\"Location\""));
        assert!(content.contains("\"CreatedAt\""));

        assert_eq!(store.load().unwrap(), records);
    }

    #[test]
    fn test_load_sorts_and_caps() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.json");
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

        let records: Vec<ClosedWindowRecord> = (0..120)
            .map(|i| {
                ClosedWindowRecord::new(format!("C:\\Dir{}", i))
                    .with_created_at(base + chrono::Duration::seconds(i))
            })
            .collect();
        fs::write(&path, serde_json::to_string(&records).unwrap()).unwrap();

        let loaded = JsonHistoryStore::new(&path).load().unwrap();
        assert_eq!(loaded.len(), MAX_CLOSED_WINDOWS);
        assert_eq!(loaded[0].location, "C:\\Dir119");
    }

    #[test]
    fn test_corrupt_file_is_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{not json").unwrap();
        assert!(JsonHistoryStore::new(&path).load().is_err());
    }
}
