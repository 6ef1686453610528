//! Граница с оболочкой ОС.
//!
//! Этот модуль отвечает ТОЛЬКО за вызовы объектов автоматизации и за доставку
//! уведомлений оболочки. Никакой политики (слияние, история, поиск вкладок)
//! здесь нет: все решения принимает WindowOrchestrator.

mod dry_run;
mod simulated;
mod r#trait;

pub use self::dry_run::DryRunShellDriver;
pub use self::r#trait::{create_shell_driver, ShellAutomation, ShellDriverTrait, TabList};
pub use self::simulated::SimulatedShell;
