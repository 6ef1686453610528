//! Жизненный цикл окон: регистрация, слияние во вкладки, закрытие,
//! навигация и восстановление после падения оболочки.

use chrono::Utc;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

use super::eligibility::{is_merge_eligible, MergeContext, MIN_OTHER_WINDOWS_FOR_MERGE};
use super::WindowOrchestrator;
use crate::error::Result;
use crate::events::{ProcessEvent, ShellEvent};
use crate::model::{AutomationId, ClosedWindowRecord, Hwnd, WindowEntry, WindowState};
use crate::{tabs_error, trace_if_enabled};

const HOST_POLL_INTERVAL: Duration = Duration::from_millis(250);

impl WindowOrchestrator {
    pub(crate) async fn handle_shell_event(self: Arc<Self>, event: ShellEvent) {
        let result = match &event {
            ShellEvent::WindowRegistered => self.handle_window_registered().await,
            ShellEvent::WindowQuit { id } => {
                self.handle_window_quit(*id);
                Ok(())
            }
            ShellEvent::NavigateComplete { id, location } => {
                self.handle_navigate_complete(*id, location.clone()).await;
                Ok(())
            }
            ShellEvent::WindowShown { hwnd } => self.handle_window_shown(*hwnd).await,
        };

        if let Err(e) = result {
            warn!("Ошибка обработки события {}: {}", event, e);
        }
    }

    /// Подписаться на оболочку и взять на учёт уже открытые окна (без слияния)
    pub(crate) async fn initialize(self: &Arc<Self>) -> Result<()> {
        let sink = self.events.clone();
        self.com(move |shell| shell.subscribe_events(sink)).await?;

        let ids = self.com(|shell| shell.windows()).await?;
        for id in ids {
            self.seen.insert(id);
            if let Err(e) = self.track_object(id, WindowState::StandaloneTracked).await {
                debug!("Объект {} пропущен при инициализации: {}", id, e);
            }
        }

        self.host_alive.store(true, Ordering::SeqCst);
        info!(
            "Подписка на оболочку установлена, отслеживается {} окон",
            self.registry.len()
        );
        Ok(())
    }

    /// Новое окно: объект автоматизации появляется не сразу, поэтому опрашиваем
    async fn handle_window_registered(self: &Arc<Self>) -> Result<()> {
        let retries = self.config.timing.registration_retries.max(1);

        for attempt in 0..retries {
            let ids = self.com(|shell| shell.windows()).await?;
            let fresh: Vec<AutomationId> = ids
                .into_iter()
                .filter(|id| !self.registry.contains(*id) && self.seen.insert(*id))
                .collect();

            if !fresh.is_empty() {
                for id in fresh {
                    if let Err(e) = self.register_window(id).await {
                        warn!("Не удалось зарегистрировать окно {}: {}", id, e);
                    }
                }
                return Ok(());
            }

            trace_if_enabled!("Новый объект ещё не виден, попытка {}/{}", attempt + 1, retries);
            sleep(self.config.timing.poll_interval()).await;
        }

        debug!("Новый объект автоматизации не найден за {} попыток", retries);
        Ok(())
    }

    /// Прочитать вкладку и внести её в реестр; None, если запись уже есть
    pub(crate) async fn track_object(&self, id: AutomationId, state: WindowState) -> Result<Option<(Hwnd, String)>> {
        let (tab, location, name) = self
            .com_on(id, move |shell| Ok((shell.tab_handle(id)?, shell.location(id)?, shell.name(id)?)))
            .await?;

        let subscribed = self.config.behavior.track_locations
            && self.com(move |shell| shell.subscribe_navigation(id)).await.is_ok();

        let mut entry = WindowEntry::new(location.clone(), name).with_navigate_subscribed(subscribed);
        entry.state = state;

        if let Err(e) = self.registry.add(id, entry, Some(tab)) {
            debug!("Окно {} уже в реестре: {}", id, e);
            return Ok(None);
        }

        info!("Зарегистрировано окно {} ({}) \"{}\"", id, tab, location);
        Ok(Some((tab, location)))
    }

    /// Регистрация нового окна с решением о слиянии
    async fn register_window(self: &Arc<Self>, id: AutomationId) -> Result<()> {
        let Some((tab, location)) = self.track_object(id, WindowState::Registering).await? else {
            return Ok(());
        };
        let window = self.com(move |shell| shell.top_level_of(tab)).await?;

        if let Some(selection) = self.take_selection(&location) {
            let items = selection.clone();
            if let Err(e) = self.com_on(id, move |shell| shell.select_items(id, &items)).await {
                debug!("Не удалось применить выделение к {}: {}", id, e);
            }
        }

        if self.reattach(id, &location).await {
            self.finish_standalone(id, window).await;
            return Ok(());
        }

        let (tab_count, bypass) = self
            .com(move |shell| Ok((shell.tabs_of(window)?.len(), shell.bypass_gesture_active())))
            .await?;

        if tab_count == 1 && self.take_standalone_request() {
            debug!("Окно {} открыто самостоятельным по запросу", id);
            self.finish_standalone(id, window).await;
            return Ok(());
        }

        let ctx = MergeContext {
            hooks_active: self.hooks_enabled(),
            reuse_enabled: self.reuse_enabled(),
            tracked_windows: self.registry.len().saturating_sub(1),
            is_main_window: self.target_window() == Some(window),
            tab_count,
            bypass,
        };

        if !is_merge_eligible(&ctx) {
            debug!("Окно {} остаётся самостоятельным: {:?}", id, ctx);
            self.finish_standalone(id, window).await;
            return Ok(());
        }

        self.registry.update(id, |entry| entry.state = WindowState::MergeEligible);
        let mode = self.config.behavior.hide_mode();
        self.pending_hide.insert(window, mode);
        if let Err(e) = self.com(move |shell| shell.hide_window(window, mode)).await {
            debug!("Не удалось спрятать окно {}: {}", window, e);
        }

        self.merge_into_main(id, window, location).await;
        Ok(())
    }

    async fn finish_standalone(&self, id: AutomationId, window: Hwnd) {
        self.registry.update(id, |entry| entry.state = WindowState::StandaloneTracked);
        self.processed.insert(window);
        self.reveal(window).await;
    }

    /// Окно открылось там же, где только что закрылось другое: это вкладку
    /// перетащили в отдельное окно, выделение переносится, слияния нет
    async fn reattach(&self, id: AutomationId, location: &str) -> bool {
        let window = self.config.timing.reattach_window();
        let Some(record) = self.history.find_recent(location, Utc::now(), window) else {
            return false;
        };
        self.history.remove(&record.location);
        info!("Окно {} присоединено повторно к {}", id, record);

        if !record.selected_items.is_empty() {
            let items = record.selected_items;
            if let Err(e) = self.com_on(id, move |shell| shell.select_items(id, &items)).await {
                debug!("Не удалось восстановить выделение в {}: {}", id, e);
            }
        }
        true
    }

    async fn merge_into_main(self: &Arc<Self>, id: AutomationId, window: Hwnd, location: String) {
        match self.try_merge(id, window, &location).await {
            Ok(()) => info!("Окно {} влито вкладкой: \"{}\"", id, location),
            Err(e) => {
                warn!("Слияние окна {} не удалось, окно остаётся самостоятельным: {}", id, e);
                self.merging.remove(&id);
                self.finish_standalone(id, window).await;
            }
        }
    }

    async fn try_merge(self: &Arc<Self>, id: AutomationId, window: Hwnd, location: &str) -> Result<()> {
        let main = self
            .main_window(Some(window))
            .await
            .ok_or_else(|| tabs_error!(not_found, "нет главного окна для слияния"))?;
        let selection = self.com(move |shell| shell.selected_items(id)).await.unwrap_or_default();

        let existing = if self.reuse_enabled() {
            self.search_for_tab_excluding(location, Some(id))
        } else {
            None
        };

        match existing {
            Some(tab) => {
                debug!("Расположение \"{}\" уже открыто во вкладке {}", location, tab);
                self.select_tab_by_handle(tab).await?;
                if let Some((existing_id, _)) = self.registry.get_by_hwnd(tab) {
                    if !selection.is_empty() {
                        self.com_on(existing_id, move |shell| shell.select_items(existing_id, &selection))
                            .await?;
                    }
                }
            }
            None => {
                self.open_tab_and_navigate(main, location, selection).await?;
            }
        }

        self.merging.insert(id);
        self.com(move |shell| shell.quit(id)).await?;
        self.pending_hide.remove(&window);
        Ok(())
    }

    /// Открыть вкладку в окне, дождаться её объекта, перейти и применить выделение
    pub(crate) async fn open_tab_and_navigate(
        &self,
        window: Hwnd,
        location: &str,
        selection: Vec<String>,
    ) -> Result<AutomationId> {
        let timing = &self.config.timing;

        let new_tab = {
            let _permit = self.acquire_open_gate().await?;

            let before = self.com(move |shell| shell.tabs_of(window)).await?;
            self.com(move |shell| shell.request_new_tab(window)).await?;

            let deadline = Instant::now() + timing.new_tab_timeout();
            loop {
                let tabs = self.com(move |shell| shell.tabs_of(window)).await?;
                if let Some(tab) = tabs.iter().find(|tab| !before.contains(tab)) {
                    break *tab;
                }
                if Instant::now() >= deadline {
                    return Err(tabs_error!(
                        timeout,
                        "новая вкладка в окне {} не появилась за {:?}",
                        window,
                        timing.new_tab_timeout()
                    ));
                }
                sleep(timing.poll_interval()).await;
            }
        };

        let id = self.wait_for_object(new_tab).await?;

        let waiter = self.navigation_waiter(id);
        if self.com(move |shell| shell.subscribe_navigation(id)).await.is_ok() {
            self.registry.update(id, |entry| entry.navigate_subscribed = true);
        }

        let target = location.to_string();
        self.com_on(id, move |shell| shell.navigate(id, &target)).await?;
        match timeout(timing.navigate_timeout(), waiter).await {
            Ok(Ok(reached)) => debug!("Вкладка {} перешла в \"{}\"", id, reached),
            _ => debug!("Навигация вкладки {} не подтверждена за {:?}", id, timing.navigate_timeout()),
        }

        let name = self.com(move |shell| shell.name(id)).await.unwrap_or_default();
        let location = location.to_string();
        self.registry.update(id, |entry| {
            entry.location = location;
            entry.name = name;
        });

        if !selection.is_empty() {
            if let Err(e) = self.com(move |shell| shell.select_items(id, &selection)).await {
                debug!("Не удалось выделить элементы во вкладке {}: {}", id, e);
            }
        }

        self.processed.insert(window);
        self.com(move |shell| {
            shell.select_tab(new_tab)?;
            shell.bring_to_front(window)
        })
        .await?;

        Ok(id)
    }

    /// Дождаться объекта автоматизации для вкладки
    async fn wait_for_object(&self, tab: Hwnd) -> Result<AutomationId> {
        let timing = &self.config.timing;
        let deadline = Instant::now() + timing.object_timeout();

        loop {
            if let Some((id, _)) = self.registry.get_by_hwnd(tab) {
                return Ok(id);
            }

            let ids = self.com(|shell| shell.windows()).await?;
            for id in ids.into_iter().filter(|id| !self.registry.contains(*id)) {
                let handle = self.com(move |shell| shell.tab_handle(id)).await;
                // Если объект уже забрал обработчик события, ждём его записи в реестре
                if matches!(handle, Ok(found) if found == tab) && self.seen.insert(id) {
                    self.track_object(id, WindowState::StandaloneTracked).await?;
                }
            }

            if self.registry.get_by_hwnd(tab).is_none() && Instant::now() >= deadline {
                return Err(tabs_error!(
                    timeout,
                    "объект автоматизации вкладки {} не появился за {:?}",
                    tab,
                    timing.object_timeout()
                ));
            }
            sleep(timing.poll_interval()).await;
        }
    }

    pub(crate) async fn active_tab(&self) -> Result<super::ActiveTab> {
        let window = self
            .com(|shell| Ok(shell.foreground_window()))
            .await?
            .ok_or_else(|| tabs_error!(not_found, "нет окна на переднем плане"))?;
        let tab = self
            .com(move |shell| shell.active_tab(window))
            .await?
            .ok_or_else(|| tabs_error!(not_found, "у окна {} нет активной вкладки", window))?;

        let id = match self.registry.get_by_hwnd(tab) {
            Some((id, _)) => id,
            None => self.wait_for_object(tab).await?,
        };
        Ok(super::ActiveTab { id, tab, window })
    }

    fn navigation_waiter(&self, id: AutomationId) -> oneshot::Receiver<String> {
        let (tx, rx) = oneshot::channel();
        self.navigation_waiters.entry(id).or_default().push(tx);
        rx
    }

    fn handle_window_quit(&self, id: AutomationId) {
        let merged = self.merging.remove(&id).is_some();
        if self.retire(id, !merged).is_none() {
            debug!("WindowQuit для неизвестного объекта {}", id);
        }
    }

    async fn handle_navigate_complete(&self, id: AutomationId, location: String) {
        if let Some((_, waiters)) = self.navigation_waiters.remove(&id) {
            for waiter in waiters {
                let _ = waiter.send(location.clone());
            }
        }

        if !self.config.behavior.track_locations || !self.registry.contains(id) {
            return;
        }
        let name = self.com(move |shell| shell.name(id)).await.ok();
        self.registry.update(id, |entry| {
            entry.location = location;
            if let Some(name) = name {
                entry.name = name;
            }
        });
    }

    /// Окно стало видимым: прячем заранее, если оно, скорее всего, станет вкладкой
    async fn handle_window_shown(&self, window: Hwnd) -> Result<()> {
        if self.processed.contains(&window) {
            return Ok(());
        }

        if let Some(mode) = self.pending_hide.get(&window).map(|entry| *entry.value()) {
            self.com(move |shell| shell.hide_window(window, mode)).await?;
            return Ok(());
        }

        if !self.hooks_enabled() || self.registry.len() < MIN_OTHER_WINDOWS_FOR_MERGE {
            return Ok(());
        }
        if self.is_tracked_window(window).await {
            self.processed.insert(window);
            return Ok(());
        }
        if self.com(|shell| Ok(shell.bypass_gesture_active())).await? {
            return Ok(());
        }

        let mode = self.config.behavior.hide_mode();
        self.pending_hide.insert(window, mode);
        self.com(move |shell| shell.hide_window(window, mode)).await?;

        // Регистрация могла решить судьбу окна, пока мы его прятали
        if self.processed.contains(&window) {
            self.reveal(window).await;
        }
        Ok(())
    }

    pub(crate) async fn handle_process_event(self: &Arc<Self>, event: ProcessEvent) -> Result<()> {
        match event {
            ProcessEvent::Created { pid, .. } => {
                if !self.is_host_alive() {
                    info!("Запущен процесс оболочки {}, ожидание готовности", pid);
                    self.spawn_reinitialize();
                }
            }
            ProcessEvent::Terminated { pid, .. } => {
                if !self.is_host_alive() {
                    return Ok(());
                }
                let available = self.com(|shell| Ok(shell.is_available())).await.unwrap_or(false);
                if available {
                    debug!("Процесс {} завершился, оболочка жива: проверка записей", pid);
                    self.prune_stale().await;
                } else {
                    self.recover_from_crash().await;
                }
            }
        }
        Ok(())
    }

    /// Выбросить записи об объектах, которые больше не отвечают
    async fn prune_stale(&self) {
        for snapshot in self.registry.snapshot() {
            let id = snapshot.id;
            if let Err(e) = self.com_on(id, move |shell| shell.location(id)).await {
                debug!("Проверка {}: {}", id, e);
            }
        }
    }

    /// Оболочка упала: все объекты мертвы, окна с отслеживанием навигации
    /// запоминаются для восстановления
    pub(crate) async fn recover_from_crash(self: &Arc<Self>) {
        if !self.host_alive.swap(false, Ordering::SeqCst) {
            return;
        }
        warn!("Процесс оболочки завершился, сброс отслеживаемых окон");

        let restore = self.config.behavior.restore_previous_windows;
        let now = Utc::now();
        let entries = self.registry.drain();
        let total = entries.len();
        let mut remembered = 0;

        for snapshot in entries {
            self.release_later(snapshot.id);
            if restore && snapshot.entry.navigate_subscribed && !snapshot.entry.location.is_empty() {
                self.history.push(
                    ClosedWindowRecord::new(snapshot.entry.location)
                        .with_name(snapshot.entry.name)
                        .with_handle(snapshot.hwnd)
                        .with_created_at(now)
                        .with_restore(true),
                );
                remembered += 1;
            }
        }

        self.pending_hide.clear();
        self.merging.clear();
        self.navigation_waiters.clear();
        self.pending_selections.clear();
        self.standalone_requests.lock().clear();
        self.seen.clear();
        self.processed.clear();
        *self.target_window.lock() = None;

        info!("Сброшено {} окон, {} помечено на восстановление", total, remembered);
        if let Err(e) = self.persist(false).await {
            error!("Не удалось сохранить историю после падения оболочки: {}", e);
        }

        self.spawn_reinitialize();
    }

    fn spawn_reinitialize(self: &Arc<Self>) {
        if self.reinitializing.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let result = this.await_host_and_reinitialize().await;
            this.reinitializing.store(false, Ordering::SeqCst);
            if let Err(e) = result {
                error!("Повторная инициализация после падения оболочки не удалась: {}", e);
            }
        });
    }

    async fn await_host_and_reinitialize(self: &Arc<Self>) -> Result<()> {
        let limit = self.config.timing.host_restart_timeout();
        let deadline = Instant::now() + limit;

        while !self.com(|shell| Ok(shell.is_available())).await? {
            if Instant::now() >= deadline {
                return Err(tabs_error!(timeout, "оболочка не поднялась за {:?}", limit));
            }
            sleep(HOST_POLL_INTERVAL).await;
        }

        info!("Оболочка снова доступна, повторная подписка");
        self.initialize().await?;
        if self.config.behavior.restore_previous_windows {
            let restored = self.restore_pending_windows().await;
            info!("После перезапуска оболочки восстановлено {} окон", restored);
        }
        Ok(())
    }
}
