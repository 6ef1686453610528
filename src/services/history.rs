use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::debug;

use crate::model::ClosedWindowRecord;
use crate::services::path_resolver::PathResolver;

/// Максимальный размер истории закрытых окон
pub const MAX_CLOSED_WINDOWS: usize = 100;

/// Ограниченная история закрытых окон без повторов расположений.
///
/// Записи хранятся от самой свежей к самой старой. Вставка записи с уже
/// известным расположением заменяет старую запись.
#[derive(Debug)]
pub struct ClosedWindowHistory {
    records: Mutex<VecDeque<ClosedWindowRecord>>,
    resolver: PathResolver,
    capacity: usize,
}

impl Default for ClosedWindowHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl ClosedWindowHistory {
    pub fn new() -> Self {
        Self::with_capacity(MAX_CLOSED_WINDOWS)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity.min(MAX_CLOSED_WINDOWS))),
            resolver: PathResolver::new(),
            capacity: capacity.clamp(1, MAX_CLOSED_WINDOWS),
        }
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn push(&self, record: ClosedWindowRecord) {
        if record.location.trim().is_empty() {
            return;
        }
        let mut records = self.records.lock();
        Self::insert_locked(&mut records, record, &self.resolver, self.capacity);
    }

    pub fn extend<I>(&self, items: I)
    where
        I: IntoIterator<Item = ClosedWindowRecord>,
    {
        let mut records = self.records.lock();
        for record in items {
            if !record.location.trim().is_empty() {
                Self::insert_locked(&mut records, record, &self.resolver, self.capacity);
            }
        }
    }

    /// Загрузить сохранённые записи (один раз при старте); порядок восстанавливается по времени
    pub fn load(&self, mut items: Vec<ClosedWindowRecord>) {
        items.sort_by_key(|record| record.created_at);
        self.extend(items);
    }

    fn insert_locked(
        records: &mut VecDeque<ClosedWindowRecord>,
        record: ClosedWindowRecord,
        resolver: &PathResolver,
        capacity: usize,
    ) {
        let id = resolver.path_to_id(&record.location).ok();
        let duplicate = records.iter().position(|existing| match &id {
            Some(id) => resolver.id_equivalent_to_path(id, &existing.location),
            None => existing.location == record.location,
        });

        if let Some(index) = duplicate {
            if records[index].created_at > record.created_at {
                // Уже есть более свежая запись для этого расположения
                return;
            }
            records.remove(index);
        }

        // Вставка с сохранением порядка "свежие первыми"
        let position = records
            .iter()
            .position(|existing| existing.created_at <= record.created_at)
            .unwrap_or(records.len());
        records.insert(position, record);

        while records.len() > capacity {
            if let Some(dropped) = records.pop_back() {
                debug!("История переполнена, удалена запись {}", dropped);
            }
        }
    }

    /// Забрать самую свежую запись
    pub fn pop_latest(&self) -> Option<ClosedWindowRecord> {
        self.records.lock().pop_front()
    }

    /// Удалить запись с эквивалентным расположением
    pub fn remove(&self, location: &str) -> Option<ClosedWindowRecord> {
        let mut records = self.records.lock();
        let index = records
            .iter()
            .position(|record| self.resolver.paths_equivalent(&record.location, location))?;
        records.remove(index)
    }

    /// Найти запись для эвристики повторного присоединения: то же расположение,
    /// закрыта не раньше чем `window` назад
    pub fn find_recent(&self, location: &str, now: DateTime<Utc>, window: Duration) -> Option<ClosedWindowRecord> {
        let id = self.resolver.path_to_id(location).ok()?;
        let window = chrono::Duration::from_std(window).ok()?;
        self.records
            .lock()
            .iter()
            .find(|record| {
                let age = now.signed_duration_since(record.created_at);
                age >= chrono::Duration::zero()
                    && age <= window
                    && self.resolver.id_equivalent_to_path(&id, &record.location)
            })
            .cloned()
    }

    /// Забрать все записи с пометкой восстановления
    pub fn take_restorable(&self) -> Vec<ClosedWindowRecord> {
        let mut records = self.records.lock();
        let (restore, keep): (Vec<_>, Vec<_>) = records.drain(..).partition(|record| record.restore);
        records.extend(keep);
        restore
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }

    /// Снимок от самой свежей к самой старой
    pub fn snapshot(&self) -> Vec<ClosedWindowRecord> {
        self.records.lock().iter().cloned().collect()
    }

    /// Список для сохранения: история плюс открытые окна (помеченные на восстановление),
    /// без повторов расположений, не длиннее лимита
    pub fn merged_for_persistence(&self, open_windows: Vec<ClosedWindowRecord>) -> Vec<ClosedWindowRecord> {
        let merged = ClosedWindowHistory::with_capacity(self.capacity);
        merged.extend(self.snapshot());
        merged.extend(open_windows);
        merged.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn at(base: DateTime<Utc>, ms: i64) -> DateTime<Utc> {
        base + chrono::Duration::milliseconds(ms)
    }

    #[test]
    fn test_history_keeps_most_recent_hundred() {
        let history = ClosedWindowHistory::new();
        let base = Utc::now();

        for i in 0..150 {
            history.push(ClosedWindowRecord::new(format!("C:\\Dir{}", i)).with_created_at(at(base, i)));
        }

        let snapshot = history.snapshot();
        assert_eq!(snapshot.len(), MAX_CLOSED_WINDOWS);
        assert_eq!(snapshot.first().map(|r| r.location.as_str()), Some("C:\\Dir149"));
        assert_eq!(snapshot.last().map(|r| r.location.as_str()), Some("C:\\Dir50"));
    }

    #[test]
    fn test_equal_location_replaces_record() {
        let history = ClosedWindowHistory::new();
        let base = Utc::now();

        history.push(ClosedWindowRecord::new("C:\\Work").with_name("old").with_created_at(at(base, 0)));
        history.push(ClosedWindowRecord::new("D:\\Other").with_created_at(at(base, 1)));
        history.push(ClosedWindowRecord::new("c:/work/").with_name("new").with_created_at(at(base, 2)));

        let snapshot = history.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].name, "new");

        // Более старая запись не вытесняет свежую
        history.push(ClosedWindowRecord::new("C:\\Work").with_name("stale").with_created_at(at(base, -10)));
        assert_eq!(history.len(), 2);
        assert_eq!(history.snapshot()[0].name, "new");
    }

    #[test]
    fn test_reattachment_window() {
        let history = ClosedWindowHistory::new();
        let closed_at = Utc::now();
        history.push(ClosedWindowRecord::new("C:\\Projects").with_created_at(closed_at));

        let window = Duration::from_millis(2000);
        assert!(history.find_recent("c:\\projects", at(closed_at, 500), window).is_some());
        assert!(history.find_recent("C:\\Projects", at(closed_at, 3000), window).is_none());
        assert!(history.find_recent("C:\\Elsewhere", at(closed_at, 500), window).is_none());
    }

    #[test]
    fn test_pop_remove_and_restorable() {
        let history = ClosedWindowHistory::new();
        let base = Utc::now();
        history.push(ClosedWindowRecord::new("C:\\A").with_created_at(at(base, 0)).with_restore(true));
        history.push(ClosedWindowRecord::new("C:\\B").with_created_at(at(base, 1)));
        history.push(ClosedWindowRecord::new("C:\\C").with_created_at(at(base, 2)).with_restore(true));

        assert_eq!(history.pop_latest().map(|r| r.location), Some("C:\\C".to_string()));
        assert!(history.remove("c:\\b").is_some());
        assert!(history.remove("C:\\B").is_none());

        let restorable = history.take_restorable();
        assert_eq!(restorable.len(), 1);
        assert!(history.is_empty());
    }

    #[test]
    fn test_load_sorts_by_time_and_ignores_empty() {
        let history = ClosedWindowHistory::new();
        let base = Utc::now();
        history.load(vec![
            ClosedWindowRecord::new("C:\\New").with_created_at(at(base, 10)),
            ClosedWindowRecord::new("  ").with_created_at(at(base, 20)),
            ClosedWindowRecord::new("C:\\Old").with_created_at(at(base, 0)),
        ]);

        let locations: Vec<String> = history.snapshot().into_iter().map(|r| r.location).collect();
        assert_eq!(locations, vec!["C:\\New".to_string(), "C:\\Old".to_string()]);
    }

    #[test]
    fn test_merged_for_persistence_prefers_newer() {
        let history = ClosedWindowHistory::new();
        let base = Utc::now();
        history.push(ClosedWindowRecord::new("C:\\A").with_created_at(at(base, 0)));
        history.push(ClosedWindowRecord::new("C:\\B").with_created_at(at(base, 5)));

        let open = vec![ClosedWindowRecord::new("c:\\a").with_created_at(at(base, 10)).with_restore(true)];
        let merged = history.merged_for_persistence(open);

        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].location, "c:\\a");
        assert!(merged[0].restore);
        // Сама история не изменилась
        assert_eq!(history.len(), 2);
    }
}
