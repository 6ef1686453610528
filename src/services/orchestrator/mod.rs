//! Оркестратор окон: превращает новые окна файлового менеджера во вкладки,
//! ведёт историю закрытых окон и переживает падения процесса оболочки.
//!
//! Уведомления оболочки, процессов и горячих клавиш приходят в `run` через
//! каналы; каждое обрабатывается отдельной задачей, ошибки только логируются.
//! Все вызовы объектов автоматизации идут через `ComThreadDispatcher`.

mod eligibility;
mod expiring;
mod lifecycle;
mod location;
mod operations;


pub use self::eligibility::{is_merge_eligible, MergeContext, MIN_OTHER_WINDOWS_FOR_MERGE};
pub use self::expiring::ExpiringSet;
pub use self::location::{classify_location, normalize_location, LocationKind};
pub use self::operations::NavigationDirection;

use chrono::Utc;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Semaphore, SemaphorePermit};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::events::{HotkeyProfile, ProcessEvent, ShellEvent};
use crate::model::{AutomationId, ClosedWindowRecord, HideMode, Hwnd, WindowEntry};
use crate::services::dispatcher::ComThreadDispatcher;
use crate::services::history::ClosedWindowHistory;
use crate::services::path_resolver::PathResolver;
use crate::services::registry::ShellWindowRegistry;
use crate::services::shell::ShellAutomation;
use crate::services::storage::HistoryStore;
use crate::{debug_if_enabled, tabs_error};

/// Сколько помнить уже обработанные объекты автоматизации
const SEEN_TTL: Duration = Duration::from_secs(30);
/// Сколько ждать окно, открытое как самостоятельное по нашей просьбе
const STANDALONE_REQUEST_TTL: Duration = Duration::from_secs(5);

/// Активная вкладка окна на переднем плане
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveTab {
    pub id: AutomationId,
    pub tab: Hwnd,
    pub window: Hwnd,
}

pub struct WindowOrchestrator {
    config: Arc<Config>,
    shell: Arc<dyn ShellAutomation>,
    dispatcher: Arc<ComThreadDispatcher>,
    registry: ShellWindowRegistry,
    history: ClosedWindowHistory,
    resolver: PathResolver,
    store: Option<Arc<dyn HistoryStore>>,
    /// Отправитель, который отдаётся оболочке при каждой (пере)подписке
    events: mpsc::UnboundedSender<ShellEvent>,
    seen: ExpiringSet<AutomationId>,
    processed: ExpiringSet<Hwnd>,
    pending_hide: DashMap<Hwnd, HideMode>,
    /// Окна, закрываемые после слияния; в историю не попадают
    merging: DashSet<AutomationId>,
    navigation_waiters: DashMap<AutomationId, Vec<oneshot::Sender<String>>>,
    /// Выделение, которое надо применить к окну, когда оно зарегистрируется
    pending_selections: DashMap<String, Vec<String>>,
    standalone_requests: Mutex<Vec<Instant>>,
    /// Одна последовательность "новая вкладка + навигация" за раз
    open_gate: Semaphore,
    target_window: Mutex<Option<Hwnd>>,
    reuse_tabs: AtomicBool,
    hook_windows: AtomicBool,
    host_alive: AtomicBool,
    reinitializing: AtomicBool,
}

impl WindowOrchestrator {
    /// Создать оркестратор; приёмник уведомлений оболочки передаётся в `run`
    pub fn new(
        config: Arc<Config>,
        shell: Arc<dyn ShellAutomation>,
        dispatcher: Arc<ComThreadDispatcher>,
        store: Option<Arc<dyn HistoryStore>>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ShellEvent>) {
        info!("Инициализация WindowOrchestrator");
        let (events, receiver) = mpsc::unbounded_channel();

        let orchestrator = Arc::new(Self {
            reuse_tabs: AtomicBool::new(config.behavior.reuse_tabs),
            hook_windows: AtomicBool::new(config.behavior.hook_windows),
            processed: ExpiringSet::new(config.timing.processed_handle_ttl()),
            config,
            shell,
            dispatcher,
            registry: ShellWindowRegistry::new(),
            history: ClosedWindowHistory::new(),
            resolver: PathResolver::new(),
            store,
            events,
            seen: ExpiringSet::new(SEEN_TTL),
            pending_hide: DashMap::new(),
            merging: DashSet::new(),
            navigation_waiters: DashMap::new(),
            pending_selections: DashMap::new(),
            standalone_requests: Mutex::new(Vec::new()),
            open_gate: Semaphore::new(1),
            target_window: Mutex::new(None),
            host_alive: AtomicBool::new(false),
            reinitializing: AtomicBool::new(false),
        });
        (orchestrator, receiver)
    }

    /// Загрузить историю, подписаться на оболочку и восстановить помеченные окна
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.load_history();
        self.initialize().await?;
        if self.config.behavior.restore_previous_windows {
            let restored = self.restore_pending_windows().await;
            if restored > 0 {
                info!("Восстановлено {} окон предыдущего сеанса", restored);
            }
        }
        Ok(())
    }

    /// Главный цикл: раздаёт события обработчикам
    pub async fn run(
        self: Arc<Self>,
        mut shell_events: mpsc::UnboundedReceiver<ShellEvent>,
        mut process_events: mpsc::UnboundedReceiver<ProcessEvent>,
        mut hotkeys: mpsc::UnboundedReceiver<HotkeyProfile>,
    ) {
        info!("WindowOrchestrator запущен");

        loop {
            tokio::select! {
                Some(event) = shell_events.recv() => {
                    debug_if_enabled!("Событие оболочки: {}", event);
                    let this = Arc::clone(&self);
                    tokio::spawn(async move { this.handle_shell_event(event).await });
                }
                Some(event) = process_events.recv() => {
                    debug_if_enabled!("Событие процесса: {}", event);
                    let this = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = this.handle_process_event(event).await {
                            warn!("Ошибка обработки события процесса: {}", e);
                        }
                    });
                }
                Some(profile) = hotkeys.recv() => {
                    let this = Arc::clone(&self);
                    tokio::spawn(async move { this.handle_hotkey(profile).await });
                }
                else => break,
            }
        }

        info!("Каналы событий закрыты, WindowOrchestrator остановлен");
    }

    /// Вызов объектов автоматизации в потоке диспетчера
    pub(crate) async fn com<T, F>(&self, func: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn ShellAutomation) -> Result<T> + Send + 'static,
    {
        let shell = Arc::clone(&self.shell);
        self.dispatcher.schedule_and_get(move || func(shell.as_ref())).await?
    }

    /// То же, но запись об объекте выбрасывается, если он уже уничтожен
    pub(crate) async fn com_on<T, F>(&self, id: AutomationId, func: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn ShellAutomation) -> Result<T> + Send + 'static,
    {
        let result = self.com(func).await;
        if let Err(e) = &result {
            if e.is_stale() {
                debug!("Объект {} уничтожен, запись удаляется", id);
                self.retire(id, true);
            }
        }
        result
    }

    /// Освободить объект без ожидания
    fn release_later(&self, id: AutomationId) {
        let shell = Arc::clone(&self.shell);
        // Хэндл не нужен: release не может завершиться ошибкой
        drop(self.dispatcher.schedule(move || shell.release(id)));
    }

    /// Удалить запись реестра, освободить объект и, если нужно, запомнить окно в истории
    fn retire(&self, id: AutomationId, record_history: bool) -> Option<WindowEntry> {
        let (hwnd, entry) = self.registry.remove(id)?;
        self.release_later(id);
        self.navigation_waiters.remove(&id);

        if record_history && !entry.location.is_empty() {
            let record = ClosedWindowRecord::new(entry.location.clone())
                .with_name(entry.name.clone())
                .with_handle(hwnd)
                .with_created_at(Utc::now());
            debug!("Окно {} закрыто, в историю: {}", id, record);
            self.history.push(record);
        }
        Some(entry)
    }

    fn load_history(&self) {
        let Some(store) = &self.store else {
            return;
        };
        if !self.config.behavior.persists_history() {
            return;
        }
        match store.load() {
            Ok(records) => self.history.load(records),
            Err(e) => warn!("Не удалось загрузить историю закрытых окон: {}", e),
        }
    }

    /// Сохранить историю; открытые окна добавляются с пометкой восстановления
    pub(crate) async fn persist(&self, include_open: bool) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let behavior = &self.config.behavior;
        if !behavior.persists_history() {
            return Ok(());
        }

        let mut open = Vec::new();
        if include_open && behavior.restore_previous_windows {
            let now = Utc::now();
            for snapshot in self.registry.snapshot() {
                let id = snapshot.id;
                let selection = self.com(move |shell| shell.selected_items(id)).await.unwrap_or_default();
                open.push(
                    ClosedWindowRecord::new(snapshot.entry.location)
                        .with_name(snapshot.entry.name)
                        .with_handle(snapshot.hwnd)
                        .with_selection(selection)
                        .with_created_at(now)
                        .with_restore(true),
                );
            }
        }

        let mut records = self.history.merged_for_persistence(open);
        if !behavior.save_closed_history {
            records.retain(|record| record.restore);
        }
        store.save(&records)
    }

    /// Сохранить состояние и отпустить все объекты
    pub async fn shutdown(self: &Arc<Self>) -> Result<()> {
        info!("Остановка WindowOrchestrator");

        let hidden: Vec<Hwnd> = self.pending_hide.iter().map(|entry| *entry.key()).collect();
        for window in hidden {
            self.reveal(window).await;
        }

        let persisted = self.persist(true).await;

        for snapshot in self.registry.drain() {
            self.release_later(snapshot.id);
        }
        self.navigation_waiters.clear();

        persisted
    }

    // --- Доступ к состоянию ---

    pub fn registry(&self) -> &ShellWindowRegistry {
        &self.registry
    }

    pub fn history(&self) -> &ClosedWindowHistory {
        &self.history
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn target_window(&self) -> Option<Hwnd> {
        *self.target_window.lock()
    }

    pub fn reuse_enabled(&self) -> bool {
        self.reuse_tabs.load(Ordering::Relaxed)
    }

    pub fn hooks_enabled(&self) -> bool {
        self.hook_windows.load(Ordering::Relaxed)
    }

    pub fn is_host_alive(&self) -> bool {
        self.host_alive.load(Ordering::SeqCst)
    }

    pub fn toggle_reuse(&self) -> bool {
        let enabled = !self.reuse_tabs.fetch_xor(true, Ordering::Relaxed);
        info!("Переиспользование вкладок: {}", if enabled { "включено" } else { "выключено" });
        enabled
    }

    pub fn toggle_hooks(&self) -> bool {
        let enabled = !self.hook_windows.fetch_xor(true, Ordering::Relaxed);
        info!("Перехват новых окон: {}", if enabled { "включён" } else { "выключен" });
        enabled
    }

    // --- Общие помощники ---

    /// Показать окно, спрятанное в ожидании слияния
    async fn reveal(&self, window: Hwnd) {
        if self.pending_hide.remove(&window).is_some() {
            if let Err(e) = self.com(move |shell| shell.show_window(window)).await {
                debug!("Не удалось показать окно {}: {}", window, e);
            }
        }
    }

    /// Есть ли у окна верхнего уровня хотя бы одна отслеживаемая вкладка
    async fn is_tracked_window(&self, window: Hwnd) -> bool {
        match self.com(move |shell| shell.tabs_of(window)).await {
            Ok(tabs) => tabs.iter().any(|tab| self.registry.get_by_hwnd(*tab).is_some()),
            Err(_) => false,
        }
    }

    /// Главное окно: целевое, иначе отслеживаемое окно на переднем плане, иначе самое старое
    async fn main_window(&self, exclude: Option<Hwnd>) -> Option<Hwnd> {
        let target = self.target_window();
        if let Some(target) = target.filter(|window| Some(*window) != exclude) {
            if self.is_tracked_window(target).await {
                return Some(target);
            }
            let mut current = self.target_window.lock();
            if *current == Some(target) {
                debug!("Целевое окно {} больше не существует", target);
                *current = None;
            }
        }

        let foreground = self.com(|shell| Ok(shell.foreground_window())).await.ok().flatten();
        if let Some(window) = foreground.filter(|window| Some(*window) != exclude) {
            if self.is_tracked_window(window).await {
                return Some(window);
            }
        }

        for snapshot in self.registry.snapshot() {
            let Some(tab) = snapshot.hwnd else {
                continue;
            };
            if let Ok(window) = self.com(move |shell| shell.top_level_of(tab)).await {
                if Some(window) != exclude {
                    return Some(window);
                }
            }
        }
        None
    }

    /// Разрешение на открытие окна или вкладки; одновременно открывается что-то одно
    async fn acquire_open_gate(&self) -> Result<SemaphorePermit<'_>> {
        self.open_gate
            .acquire()
            .await
            .map_err(|_| tabs_error!(internal, "семафор открытия окон закрыт"))
    }

    fn request_standalone(&self) {
        self.standalone_requests.lock().push(Instant::now());
    }

    fn cancel_standalone(&self) {
        self.standalone_requests.lock().pop();
    }

    /// Забрать одну свежую просьбу открыть окно самостоятельным
    fn take_standalone_request(&self) -> bool {
        let mut requests = self.standalone_requests.lock();
        let now = Instant::now();
        requests.retain(|at| now.saturating_duration_since(*at) < STANDALONE_REQUEST_TTL);
        requests.pop().is_some()
    }

    fn remember_selection(&self, location: &str, selection: Vec<String>) {
        if selection.is_empty() {
            return;
        }
        if let Some(key) = self.resolver.canonical_key(location) {
            self.pending_selections.insert(key, selection);
        }
    }

    fn take_selection(&self, location: &str) -> Option<Vec<String>> {
        let key = self.resolver.canonical_key(location)?;
        self.pending_selections.remove(&key).map(|(_, selection)| selection)
    }
}
