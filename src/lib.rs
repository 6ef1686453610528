//! Превращение новых окон файлового менеджера во вкладки уже открытого окна.

pub mod config;
pub mod error;
pub mod events;
pub mod model;
pub mod services;
pub mod utils;

pub use config::Config;
pub use error::{Result, ShellTabsError};
pub use services::WindowOrchestrator;
