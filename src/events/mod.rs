pub mod hotkey;
pub mod process;
pub mod shell;

pub use hotkey::{HotkeyAction, HotkeyProfile, HotkeyScope};
pub use process::ProcessEvent;
pub use shell::ShellEvent;
