use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

use super::window::Hwnd;

/// Запись о закрытом окне/вкладке. Формат полей совпадает с внешним JSON настроек.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClosedWindowRecord {
    pub location: String,
    #[serde(default)]
    pub name: String,
    /// Хэндл на момент закрытия, может быть уже недействителен
    #[serde(default, deserialize_with = "deserialize_handle")]
    pub handle: Option<Hwnd>,
    #[serde(default)]
    pub selected_items: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub restore: bool,
}

impl ClosedWindowRecord {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            name: String::new(),
            handle: None,
            selected_items: Vec::new(),
            created_at: Utc::now(),
            restore: false,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_handle(mut self, handle: Option<Hwnd>) -> Self {
        self.handle = handle;
        self
    }

    pub fn with_selection(mut self, items: Vec<String>) -> Self {
        self.selected_items = items;
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn with_restore(mut self, restore: bool) -> Self {
        self.restore = restore;
        self
    }
}

impl fmt::Display for ClosedWindowRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\"", self.location)?;
        if self.restore {
            write!(f, " [restore]")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordKind {
    Open,
    Closed,
}

/// Строка списка окон для поиска/переключения вкладок
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowRecord {
    pub location: String,
    pub name: String,
    pub handle: Option<Hwnd>,
    pub selected_items: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub restore: bool,
    pub kind: RecordKind,
}

impl From<ClosedWindowRecord> for WindowRecord {
    fn from(record: ClosedWindowRecord) -> Self {
        Self {
            location: record.location,
            name: record.name,
            handle: record.handle,
            selected_items: record.selected_items,
            created_at: record.created_at,
            restore: record.restore,
            kind: RecordKind::Closed,
        }
    }
}

/// Внешние файлы пишут отсутствующий хэндл как 0
fn deserialize_handle<'de, D>(deserializer: D) -> Result<Option<Hwnd>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<u64>::deserialize(deserializer)?;
    Ok(raw.and_then(Hwnd::new))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_record_uses_settings_field_names() {
        let created_at = DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let record = ClosedWindowRecord::new("C:\\Work")
            .with_name("Work")
            .with_handle(Hwnd::new(42))
            .with_selection(vec!["a.txt".to_string()])
            .with_created_at(created_at)
            .with_restore(true);

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["Location"], "C:\\Work");
        assert_eq!(json["Handle"], 42);
        assert_eq!(json["SelectedItems"][0], "a.txt");
        assert_eq!(json["Restore"], true);
        assert_eq!(json["CreatedAt"], "2024-05-01T10:00:00Z");
    }

    #[test]
    fn test_record_tolerates_missing_optional_fields() {
        let record: ClosedWindowRecord = serde_json::from_str(
            r#"{"Location":"D:\\","CreatedAt":"2024-05-01T10:00:00Z"}"#,
        )
        .unwrap();

        assert_eq!(record.location, "D:\\");
        assert_eq!(record.handle, None);
        assert!(record.selected_items.is_empty());
        assert!(!record.restore);
    }

    #[test]
    fn test_zero_handle_reads_as_none() {
        let record: ClosedWindowRecord = serde_json::from_str(
            r#"{"Location":"D:\\","Handle":0,"CreatedAt":"2024-05-01T10:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(record.handle, None);

        let record: ClosedWindowRecord = serde_json::from_str(
            r#"{"Location":"D:\\","Handle":null,"CreatedAt":"2024-05-01T10:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(record.handle, None);
    }

    #[test]
    fn test_closed_record_converts_to_window_record() {
        let record = ClosedWindowRecord::new("C:\\Temp").with_restore(true);
        let row = WindowRecord::from(record);
        assert_eq!(row.kind, RecordKind::Closed);
        assert!(row.restore);
    }
}
