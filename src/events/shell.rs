use serde::{Deserialize, Serialize};
use std::fmt;

use crate::model::{AutomationId, Hwnd};

/// Уведомления оболочки, приходящие с произвольных нативных потоков
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShellEvent {
    /// Оболочка зарегистрировала новое окно верхнего уровня (сам объект ещё надо найти)
    WindowRegistered,
    /// Объект автоматизации закрыт
    WindowQuit { id: AutomationId },
    /// Навигация вкладки завершена
    NavigateComplete { id: AutomationId, location: String },
    /// Окно стало видимым (уровень accessibility-событий)
    WindowShown { hwnd: Hwnd },
}

impl fmt::Display for ShellEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShellEvent::WindowRegistered => write!(f, "WindowRegistered"),
            ShellEvent::WindowQuit { id } => write!(f, "WindowQuit({})", id),
            ShellEvent::NavigateComplete { id, location } => {
                write!(f, "NavigateComplete({} -> \"{}\")", id, location)
            }
            ShellEvent::WindowShown { hwnd } => write!(f, "WindowShown({})", hwnd),
        }
    }
}
