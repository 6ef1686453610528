use serde::{Deserialize, Serialize};
use std::fmt;

/// Действие, привязанное к горячей клавише во внешнем UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HotkeyAction {
    Open,
    OpenNewTab,
    Duplicate,
    ReopenClosed,
    DetachTab,
    SetTargetWindow,
    NavigateBack,
    NavigateForward,
    SelectLastTab,
    ToggleReuse,
    ToggleHooks,
}

/// Где профиль горячей клавиши срабатывает
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HotkeyScope {
    #[default]
    Global,
    /// Только когда на переднем плане окно файлового менеджера
    FileManager,
}

/// Профиль горячей клавиши: что делать, когда внешний хук сообщил о нажатии
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HotkeyProfile {
    pub action: HotkeyAction,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub as_tab: bool,
    #[serde(default)]
    pub delay_ms: u64,
    #[serde(default)]
    pub scope: HotkeyScope,
}

impl HotkeyProfile {
    pub fn new(action: HotkeyAction) -> Self {
        Self {
            action,
            path: None,
            as_tab: false,
            delay_ms: 0,
            scope: HotkeyScope::Global,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn as_tab(mut self, as_tab: bool) -> Self {
        self.as_tab = as_tab;
        self
    }

    pub fn with_scope(mut self, scope: HotkeyScope) -> Self {
        self.scope = scope;
        self
    }
}

impl fmt::Display for HotkeyProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(path) => write!(f, "{:?}(\"{}\", tab: {})", self.action, path, self.as_tab),
            None => write!(f, "{:?}", self.action),
        }
    }
}
