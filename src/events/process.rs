use serde::{Deserialize, Serialize};
use std::fmt;

/// Событие жизненного цикла процесса оболочки
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessEvent {
    Created { pid: u32, name: String, session_id: Option<u32> },
    Terminated { pid: u32, name: String, session_id: Option<u32> },
}

impl ProcessEvent {
    pub fn pid(&self) -> u32 {
        match self {
            ProcessEvent::Created { pid, .. } | ProcessEvent::Terminated { pid, .. } => *pid,
        }
    }
}

impl fmt::Display for ProcessEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessEvent::Created { pid, name, session_id } => {
                write!(f, "Created {} (pid {}, session {:?})", name, pid, session_id)
            }
            ProcessEvent::Terminated { pid, name, session_id } => {
                write!(f, "Terminated {} (pid {}, session {:?})", name, pid, session_id)
            }
        }
    }
}
