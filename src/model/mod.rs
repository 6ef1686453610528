pub mod record;
pub mod window;

pub use record::{ClosedWindowRecord, RecordKind, WindowRecord};
pub use window::{AutomationId, HideMode, Hwnd, WindowEntry, WindowState};
