pub mod dispatcher;
pub mod history;
pub mod orchestrator;
pub mod path_resolver;
pub mod process_monitor;
pub mod registry;
pub mod shell;
pub mod storage;

pub use dispatcher::ComThreadDispatcher;
pub use history::ClosedWindowHistory;
pub use orchestrator::WindowOrchestrator;
pub use path_resolver::PathResolver;
pub use process_monitor::{ProcessLifecycleMonitor, SystemProcessSource};
pub use registry::ShellWindowRegistry;
pub use shell::{create_shell_driver, ShellAutomation};
pub use storage::{HistoryStore, JsonHistoryStore};
