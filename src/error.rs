use thiserror::Error;

use crate::model::AutomationId;

#[derive(Error, Debug)]
pub enum ShellTabsError {
    #[error("Ошибка конфигурации: {0}")]
    Config(#[from] anyhow::Error),

    #[error("Ошибка ввода-вывода: {0}")]
    Io(#[from] std::io::Error),

    #[error("Ошибка JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Ошибка диспетчера COM-потока: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Объект автоматизации {0} больше не существует")]
    StaleReference(AutomationId),

    #[error("Истекло время ожидания: {0}")]
    Timeout(String),

    #[error("Конфликт ключей: {0}")]
    KeyConflict(String),

    #[error("Ключ уже зарегистрирован: {0}")]
    DuplicateKey(String),

    #[error("Оболочка недоступна: {0}")]
    ShellUnavailable(String),

    #[error("Не найдено: {0}")]
    NotFound(String),

    #[error("Внутренняя ошибка: {0}")]
    Internal(String),
}

/// Ошибки, наблюдаемые через хэндл задачи диспетчера
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("диспетчер остановлен и не принимает задачи")]
    Closed,

    #[error("задача завершилась паникой: {0}")]
    Panicked(String),

    #[error("результат задачи потерян")]
    Dropped,
}

impl ShellTabsError {
    pub fn not_found<T>(msg: impl Into<String>) -> Result<T> {
        Err(ShellTabsError::NotFound(msg.into()))
    }

    /// Ошибка означает, что окно уже закрыто и запись можно выбросить
    pub fn is_stale(&self) -> bool {
        matches!(self, ShellTabsError::StaleReference(_))
    }
}

pub type Result<T> = std::result::Result<T, ShellTabsError>;

// Удобные макросы для создания ошибок
#[macro_export]
macro_rules! tabs_error {
    (timeout, $($arg:tt)*) => {
        $crate::error::ShellTabsError::Timeout(format!($($arg)*))
    };
    (not_found, $($arg:tt)*) => {
        $crate::error::ShellTabsError::NotFound(format!($($arg)*))
    };
    (key_conflict, $($arg:tt)*) => {
        $crate::error::ShellTabsError::KeyConflict(format!($($arg)*))
    };
    (duplicate_key, $($arg:tt)*) => {
        $crate::error::ShellTabsError::DuplicateKey(format!($($arg)*))
    };
    (shell_unavailable, $($arg:tt)*) => {
        $crate::error::ShellTabsError::ShellUnavailable(format!($($arg)*))
    };
    (internal, $($arg:tt)*) => {
        $crate::error::ShellTabsError::Internal(format!($($arg)*))
    };
}
