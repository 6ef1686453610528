use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroU64;
use std::time::{Duration, Instant};

/// Непрозрачный идентификатор объекта автоматизации оболочки.
///
/// Объект принадлежит оболочке, реестр лишь заимствует его и обязан
/// освободить через `ShellAutomation::release` при удалении записи.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AutomationId(pub u64);

impl AutomationId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for AutomationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "com#{}", self.0)
    }
}

/// Нативный хэндл окна (или вкладки). Нулевой хэндл не представим,
/// отсутствие хэндла выражается через `Option<Hwnd>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Hwnd(NonZeroU64);

impl Hwnd {
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    pub fn value(&self) -> u64 {
        self.0.get()
    }
}

impl From<NonZeroU64> for Hwnd {
    fn from(raw: NonZeroU64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for Hwnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:X}", self.0)
    }
}

/// Способ спрятать окно до слияния
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HideMode {
    /// Перенос за пределы экрана
    OffScreen,
    /// Полная прозрачность (совместимо с темами, ломающими перенос)
    Transparent,
}

/// Состояние окна в реестре; незарегистрированных и закрытых окон в реестре нет
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WindowState {
    Registering,
    MergeEligible,
    StandaloneTracked,
}

/// Метаданные живого окна в реестре
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowEntry {
    pub created_at: Instant,
    pub location: String,
    pub name: String,
    pub navigate_subscribed: bool,
    pub state: WindowState,
}

impl WindowEntry {
    pub fn new(location: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            created_at: Instant::now(),
            location: location.into(),
            name: name.into(),
            navigate_subscribed: false,
            state: WindowState::Registering,
        }
    }

    pub fn with_created_at(mut self, created_at: Instant) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn with_navigate_subscribed(mut self, subscribed: bool) -> Self {
        self.navigate_subscribed = subscribed;
        self
    }

    /// Окно создано не раньше чем `window` назад
    pub fn is_younger_than(&self, window: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) < window
    }
}

impl fmt::Display for WindowEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            write!(f, "\"{}\" [{:?}]", self.location, self.state)
        } else {
            write!(f, "\"{}\" ({}) [{:?}]", self.name, self.location, self.state)
        }
    }
}
