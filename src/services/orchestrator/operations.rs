//! Операции, которые запрашивает пользователь (горячие клавиши, поиск вкладок, IPC).

use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::location::{classify_location, normalize_location, LocationKind};
use super::WindowOrchestrator;
use crate::error::Result;
use crate::events::{HotkeyAction, HotkeyProfile, HotkeyScope};
use crate::model::{AutomationId, ClosedWindowRecord, Hwnd, RecordKind, WindowRecord};
use crate::tabs_error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationDirection {
    Back,
    Forward,
}

impl WindowOrchestrator {
    /// Открыть расположение: URL и файлы уходят обработчику по умолчанию,
    /// папки открываются вкладкой или окном
    pub async fn open(
        self: &Arc<Self>,
        location: &str,
        as_tab: bool,
        window: Option<Hwnd>,
        delay: Duration,
    ) -> Result<()> {
        if !delay.is_zero() {
            sleep(delay).await;
        }

        let location = normalize_location(location);
        if location.is_empty() {
            return Err(tabs_error!(not_found, "пустое расположение"));
        }

        match classify_location(&location) {
            LocationKind::Url | LocationKind::File => {
                info!("Открытие \"{}\" обработчиком по умолчанию", location);
                let target = location.clone();
                return self.com(move |shell| shell.open_with_default_handler(&target)).await;
            }
            LocationKind::Folder => {}
        }

        if as_tab && self.reuse_enabled() {
            if let Some(tab) = self.search_for_tab(&location) {
                info!("\"{}\" уже открыто, переключение на вкладку {}", location, tab);
                return self.select_tab_by_handle(tab).await;
            }
        }

        let window = match window {
            Some(handle) => Some(self.com(move |shell| shell.top_level_of(handle)).await?),
            None => None,
        };
        self.open_location(&location, Vec::new(), as_tab, window).await
    }

    /// Новая вкладка в главном окне с расположением по умолчанию
    pub async fn open_new_tab(self: &Arc<Self>) -> Result<()> {
        let location = self.config.behavior.new_tab_location.clone();
        self.open_location(&location, Vec::new(), true, None).await
    }

    /// Копия активной вкладки рядом с ней, вместе с выделением
    pub async fn duplicate_active_tab(self: &Arc<Self>) -> Result<AutomationId> {
        let active = self.active_tab().await?;
        let id = active.id;
        let (location, selection) = self
            .com_on(id, move |shell| Ok((shell.location(id)?, shell.selected_items(id)?)))
            .await?;

        info!("Дублирование вкладки {} \"{}\"", id, location);
        self.open_tab_and_navigate(active.window, &location, selection).await
    }

    /// Снова открыть последнее закрытое окно (вкладкой, если есть куда)
    pub async fn reopen_closed_tab(self: &Arc<Self>) -> Result<()> {
        let record = self
            .history
            .pop_latest()
            .ok_or_else(|| tabs_error!(not_found, "история закрытых окон пуста"))?;

        info!("Повторное открытие {}", record);
        let result = self
            .open_location(&record.location, record.selected_items.clone(), true, None)
            .await;
        if result.is_err() {
            // Запись расходуется только при успешном открытии
            self.history.push(record);
        }
        result
    }

    /// Вынести активную вкладку в отдельное окно, сохранив выделение
    pub async fn detach_current_tab(self: &Arc<Self>) -> Result<()> {
        let active = self.active_tab().await?;
        let id = active.id;
        let window = active.window;

        let tab_count = self.com(move |shell| Ok(shell.tabs_of(window)?.len())).await?;
        if tab_count < 2 {
            debug!("В окне {} одна вкладка, отделять нечего", window);
            return Ok(());
        }

        let (location, selection) = self
            .com_on(id, move |shell| Ok((shell.location(id)?, shell.selected_items(id)?)))
            .await?;

        // Запись в истории подхватит эвристика повторного присоединения
        let name = self.registry.get(id).map(|entry| entry.name).unwrap_or_default();
        self.history.push(
            ClosedWindowRecord::new(location.clone())
                .with_name(name)
                .with_handle(Some(active.tab))
                .with_selection(selection)
                .with_created_at(Utc::now()),
        );

        self.merging.insert(id);
        if let Err(e) = self.com(move |shell| shell.quit(id)).await {
            self.merging.remove(&id);
            return Err(e);
        }
        self.retire(id, false);

        info!("Вкладка {} \"{}\" вынесена в отдельное окно", id, location);
        let _permit = self.acquire_open_gate().await?;
        self.com(move |shell| shell.open_new_window(&location)).await
    }

    /// Назначить окно на переднем плане целевым (повторно снимает назначение)
    pub async fn set_target_window(self: &Arc<Self>) -> Result<Option<Hwnd>> {
        let window = self
            .com(|shell| Ok(shell.foreground_window()))
            .await?
            .ok_or_else(|| tabs_error!(not_found, "нет окна на переднем плане"))?;
        if !self.is_tracked_window(window).await {
            return Err(tabs_error!(not_found, "окно {} не является окном файлового менеджера", window));
        }

        let mut target = self.target_window.lock();
        *target = if *target == Some(window) { None } else { Some(window) };
        match *target {
            Some(window) => info!("Целевое окно: {}", window),
            None => info!("Целевое окно сброшено"),
        }
        Ok(*target)
    }

    pub async fn navigate_back_forward(self: &Arc<Self>, direction: NavigationDirection) -> Result<()> {
        let id = self.active_tab().await?.id;
        match direction {
            NavigationDirection::Back => self.com_on(id, move |shell| shell.go_back(id)).await,
            NavigationDirection::Forward => self.com_on(id, move |shell| shell.go_forward(id)).await,
        }
    }

    /// Сделать вкладку активной и вывести её окно на передний план
    pub async fn select_tab_by_handle(&self, tab: Hwnd) -> Result<()> {
        let window = self.com(move |shell| shell.top_level_of(tab)).await?;
        self.processed.insert(window);
        self.com(move |shell| {
            shell.select_tab(tab)?;
            shell.show_window(window)?;
            shell.bring_to_front(window)
        })
        .await
    }

    /// Перейти на последнюю вкладку окна на переднем плане
    pub async fn select_last_tab(self: &Arc<Self>) -> Result<()> {
        let window = self
            .com(|shell| Ok(shell.foreground_window()))
            .await?
            .ok_or_else(|| tabs_error!(not_found, "нет окна на переднем плане"))?;
        let last = self
            .com(move |shell| shell.tabs_of(window))
            .await?
            .last()
            .copied()
            .ok_or_else(|| tabs_error!(not_found, "у окна {} нет вкладок", window))?;
        self.select_tab_by_handle(last).await
    }

    /// Переключиться на живую вкладку по хэндлу или открыть расположение заново
    pub async fn switch_to(
        self: &Arc<Self>,
        location: &str,
        handle: Option<Hwnd>,
        selected_items: Vec<String>,
        as_tab: bool,
        duplicate: bool,
    ) -> Result<()> {
        if !duplicate {
            if let Some((id, tab)) = handle.and_then(|tab| self.registry.get_by_hwnd(tab).map(|(id, _)| (id, tab))) {
                self.select_tab_by_handle(tab).await?;
                if !selected_items.is_empty() {
                    self.com_on(id, move |shell| shell.select_items(id, &selected_items)).await?;
                }
                return Ok(());
            }
        }

        self.open_location(location, selected_items, as_tab, None).await?;
        if !duplicate {
            self.history.remove(location);
        }
        Ok(())
    }

    /// Найти вкладку с эквивалентным расположением; совсем новые окна не в счёт
    pub fn search_for_tab(&self, location: &str) -> Option<Hwnd> {
        self.search_for_tab_excluding(location, None)
    }

    pub(crate) fn search_for_tab_excluding(&self, location: &str, exclude: Option<AutomationId>) -> Option<Hwnd> {
        let id = self.resolver.path_to_id(location).ok()?;
        let exclusion = self.config.timing.recent_window_exclusion();
        let now = Instant::now();

        self.registry
            .snapshot()
            .into_iter()
            .filter(|snapshot| Some(snapshot.id) != exclude)
            .filter(|snapshot| !snapshot.entry.is_younger_than(exclusion, now))
            .find(|snapshot| self.resolver.id_equivalent_to_path(&id, &snapshot.entry.location))
            .and_then(|snapshot| snapshot.hwnd)
    }

    /// Открытые окна без повторов расположений, затем история закрытых
    pub fn get_windows(&self) -> Vec<WindowRecord> {
        let now = Instant::now();
        let now_utc = Utc::now();
        let mut keys = HashSet::new();
        let mut records = Vec::new();

        for snapshot in self.registry.snapshot() {
            let entry = snapshot.entry;
            let key = self
                .resolver
                .canonical_key(&entry.location)
                .unwrap_or_else(|| entry.location.to_lowercase());
            if !keys.insert(key) {
                continue;
            }

            let age = chrono::Duration::from_std(now.saturating_duration_since(entry.created_at))
                .unwrap_or_else(|_| chrono::Duration::zero());
            records.push(WindowRecord {
                location: entry.location,
                name: entry.name,
                handle: snapshot.hwnd,
                selected_items: Vec::new(),
                created_at: now_utc - age,
                restore: false,
                kind: RecordKind::Open,
            });
        }

        records.extend(self.history.snapshot().into_iter().map(WindowRecord::from));
        records
    }

    pub async fn clear_closed_windows(&self) -> Result<()> {
        let count = self.history.len();
        self.history.clear();
        info!("История закрытых окон очищена ({} записей)", count);
        self.persist(false).await
    }

    /// Открыть окна, помеченные на восстановление; возвращает число открытых.
    /// Неоткрытые записи возвращаются в историю с прежней пометкой
    pub async fn restore_pending_windows(self: &Arc<Self>) -> usize {
        let records = self.history.take_restorable();
        let mut restored = 0;
        let mut failed = Vec::new();

        // От старых к новым, чтобы сохранился исходный порядок вкладок
        for record in records.into_iter().rev() {
            match self
                .open_location(&record.location, record.selected_items.clone(), true, None)
                .await
            {
                Ok(()) => restored += 1,
                Err(e) => {
                    warn!("Не удалось восстановить {}: {}", record, e);
                    failed.push(record);
                }
            }
        }

        if !failed.is_empty() {
            self.history.extend(failed);
        }
        restored
    }

    /// Выполнить профиль горячей клавиши; ошибки только логируются
    pub async fn handle_hotkey(self: &Arc<Self>, profile: HotkeyProfile) {
        if let Err(e) = self.run_hotkey(&profile).await {
            warn!("Горячая клавиша {} не выполнена: {}", profile, e);
        }
    }

    async fn run_hotkey(self: &Arc<Self>, profile: &HotkeyProfile) -> Result<()> {
        if profile.scope == HotkeyScope::FileManager {
            let foreground = self.com(|shell| Ok(shell.foreground_window())).await?;
            let in_file_manager = match foreground {
                Some(window) => self.is_tracked_window(window).await,
                None => false,
            };
            if !in_file_manager {
                debug!("Горячая клавиша {} вне окна файлового менеджера, пропуск", profile);
                return Ok(());
            }
        }

        if profile.delay_ms > 0 {
            sleep(Duration::from_millis(profile.delay_ms)).await;
        }

        match profile.action {
            HotkeyAction::Open => {
                let location = profile
                    .path
                    .clone()
                    .unwrap_or_else(|| self.config.behavior.new_tab_location.clone());
                self.open(&location, profile.as_tab, None, Duration::ZERO).await
            }
            HotkeyAction::OpenNewTab => self.open_new_tab().await,
            HotkeyAction::Duplicate => self.duplicate_active_tab().await.map(drop),
            HotkeyAction::ReopenClosed => self.reopen_closed_tab().await,
            HotkeyAction::DetachTab => self.detach_current_tab().await,
            HotkeyAction::SetTargetWindow => self.set_target_window().await.map(drop),
            HotkeyAction::NavigateBack => self.navigate_back_forward(NavigationDirection::Back).await,
            HotkeyAction::NavigateForward => self.navigate_back_forward(NavigationDirection::Forward).await,
            HotkeyAction::SelectLastTab => self.select_last_tab().await,
            HotkeyAction::ToggleReuse => {
                self.toggle_reuse();
                Ok(())
            }
            HotkeyAction::ToggleHooks => {
                self.toggle_hooks();
                Ok(())
            }
        }
    }

    /// Вкладкой в окне (указанном или главном), иначе самостоятельным окном
    pub(crate) async fn open_location(
        self: &Arc<Self>,
        location: &str,
        selection: Vec<String>,
        as_tab: bool,
        window: Option<Hwnd>,
    ) -> Result<()> {
        if as_tab {
            let target = match window {
                Some(window) => Some(window),
                None => self.main_window(None).await,
            };
            if let Some(target) = target {
                self.open_tab_and_navigate(target, location, selection).await?;
                return Ok(());
            }
        }

        debug!("Открытие \"{}\" отдельным окном", location);
        let _permit = self.acquire_open_gate().await?;
        self.remember_selection(location, selection);
        self.request_standalone();
        let target = location.to_string();
        if let Err(e) = self.com(move |shell| shell.open_new_window(&target)).await {
            self.cancel_standalone();
            self.take_selection(location);
            return Err(e);
        }
        Ok(())
    }
}
