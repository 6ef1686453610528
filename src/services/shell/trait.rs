use smallvec::SmallVec;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::error::Result;
use crate::events::{HotkeyProfile, ShellEvent};
use crate::model::{AutomationId, HideMode, Hwnd};
use crate::tabs_error;

/// Список вкладок окна верхнего уровня; окон больше восьми вкладок почти не бывает
pub type TabList = SmallVec<[Hwnd; 8]>;

/// Вызовы объектов автоматизации оболочки.
///
/// Все методы синхронные и должны вызываться только из потока
/// `ComThreadDispatcher`. Обращение к уничтоженному объекту возвращает
/// `ShellTabsError::StaleReference`.
pub trait ShellAutomation: Send + Sync {
    /// Отвечает ли процесс оболочки
    fn is_available(&self) -> bool;

    /// Подписаться на уведомления о регистрации окон, закрытии, навигации и показе окон
    fn subscribe_events(&self, sink: mpsc::UnboundedSender<ShellEvent>) -> Result<()>;

    /// Все живые объекты автоматизации (по одному на вкладку)
    fn windows(&self) -> Result<Vec<AutomationId>>;

    fn tab_handle(&self, id: AutomationId) -> Result<Hwnd>;
    fn top_level_of(&self, tab: Hwnd) -> Result<Hwnd>;
    fn location(&self, id: AutomationId) -> Result<String>;
    fn name(&self, id: AutomationId) -> Result<String>;

    fn selected_items(&self, id: AutomationId) -> Result<Vec<String>>;
    fn select_items(&self, id: AutomationId, items: &[String]) -> Result<()>;

    fn navigate(&self, id: AutomationId, location: &str) -> Result<()>;
    fn go_back(&self, id: AutomationId) -> Result<()>;
    fn go_forward(&self, id: AutomationId) -> Result<()>;

    /// Включить уведомления NavigateComplete для объекта; повторный вызов ничего не делает
    fn subscribe_navigation(&self, id: AutomationId) -> Result<()>;

    /// Закрыть вкладку (окно закрывается вместе с последней вкладкой)
    fn quit(&self, id: AutomationId) -> Result<()>;

    /// Отпустить ссылку на объект
    fn release(&self, id: AutomationId);

    fn tabs_of(&self, window: Hwnd) -> Result<TabList>;
    fn active_tab(&self, window: Hwnd) -> Result<Option<Hwnd>>;

    /// Попросить окно открыть новую вкладку; она появляется асинхронно
    fn request_new_tab(&self, window: Hwnd) -> Result<()>;
    fn select_tab(&self, tab: Hwnd) -> Result<()>;

    fn hide_window(&self, window: Hwnd, mode: HideMode) -> Result<()>;
    fn show_window(&self, window: Hwnd) -> Result<()>;
    fn bring_to_front(&self, window: Hwnd) -> Result<()>;
    fn foreground_window(&self) -> Option<Hwnd>;

    /// Открыть новое окно файлового менеджера
    fn open_new_window(&self, location: &str) -> Result<()>;

    /// Открыть URL или файл обработчиком по умолчанию
    fn open_with_default_handler(&self, target: &str) -> Result<()>;

    /// Зажат ли жест обхода (Shift-клик при открытии окна)
    fn bypass_gesture_active(&self) -> bool;
}

/// Trait for shell drivers that can run in different modes
#[async_trait::async_trait]
pub trait ShellDriverTrait {
    /// Run the shell driver
    async fn run(self: Box<Self>) -> Result<()>;
}

/// Factory function to create the shell backend and its driver based on the dry_run flag
pub fn create_shell_driver(
    config: Arc<Config>,
    hotkeys: mpsc::UnboundedSender<HotkeyProfile>,
    dry_run: bool,
) -> Result<(Arc<dyn ShellAutomation>, Box<dyn ShellDriverTrait + Send>)> {
    if dry_run {
        let simulated = Arc::new(super::simulated::SimulatedShell::new());
        let driver = super::dry_run::DryRunShellDriver::new(config, Arc::clone(&simulated), hotkeys);
        let shell: Arc<dyn ShellAutomation> = simulated;
        let driver: Box<dyn ShellDriverTrait + Send> = Box::new(driver);
        Ok((shell, driver))
    } else {
        Err(tabs_error!(
            shell_unavailable,
            "нативный бэкенд автоматизации оболочки не подключён в этой сборке, используйте --dry-run"
        ))
    }
}
