//! Оболочка в памяти: окна, вкладки, история навигации и выделение.
//!
//! Используется в dry-run режиме и в тестах. Методы без трейта изображают
//! действия пользователя (открыл окно, закрыл вкладку, процесс упал).

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::num::NonZeroU64;
use std::thread::{self, ThreadId};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::r#trait::{ShellAutomation, TabList};
use crate::error::{Result, ShellTabsError};
use crate::events::ShellEvent;
use crate::model::{AutomationId, HideMode, Hwnd};
use crate::tabs_error;

const FIRST_HANDLE: NonZeroU64 = NonZeroU64::MIN.saturating_add(0x0FFF);
const NEW_TAB_LOCATION: &str = "This PC";

#[derive(Debug)]
struct SimTab {
    id: AutomationId,
    window: Hwnd,
    history: Vec<String>,
    position: usize,
    selection: Vec<String>,
    navigate_events: bool,
}

impl SimTab {
    fn location(&self) -> &str {
        self.history.get(self.position).map(String::as_str).unwrap_or_default()
    }
}

#[derive(Debug, Default)]
struct SimWindow {
    tabs: Vec<Hwnd>,
    active: Option<Hwnd>,
    hidden: Option<HideMode>,
}

#[derive(Debug)]
struct SimState {
    next_handle: NonZeroU64,
    available: bool,
    bypass: bool,
    windows: BTreeMap<Hwnd, SimWindow>,
    tabs: HashMap<Hwnd, SimTab>,
    objects: HashMap<AutomationId, Hwnd>,
    foreground: Option<Hwnd>,
    sink: Option<mpsc::UnboundedSender<ShellEvent>>,
    released: Vec<AutomationId>,
    default_handler: Vec<String>,
    hide_calls: Vec<(Hwnd, HideMode)>,
}

impl SimState {
    fn next(&mut self) -> NonZeroU64 {
        let value = self.next_handle;
        self.next_handle = value.saturating_add(1);
        value
    }

    fn emit(&self, event: ShellEvent) {
        if let Some(sink) = &self.sink {
            if sink.send(event).is_err() {
                debug!("Подписчик событий оболочки отключён");
            }
        }
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available {
            Ok(())
        } else {
            Err(tabs_error!(shell_unavailable, "процесс оболочки не отвечает"))
        }
    }

    fn tab_by_id(&self, id: AutomationId) -> Result<&SimTab> {
        self.ensure_available()?;
        self.objects
            .get(&id)
            .and_then(|hwnd| self.tabs.get(hwnd))
            .ok_or(ShellTabsError::StaleReference(id))
    }

    fn tab_by_id_mut(&mut self, id: AutomationId) -> Result<&mut SimTab> {
        self.ensure_available()?;
        let hwnd = *self.objects.get(&id).ok_or(ShellTabsError::StaleReference(id))?;
        self.tabs.get_mut(&hwnd).ok_or(ShellTabsError::StaleReference(id))
    }

    fn window(&self, window: Hwnd) -> Result<&SimWindow> {
        self.ensure_available()?;
        self.windows
            .get(&window)
            .ok_or_else(|| tabs_error!(not_found, "окно {} не существует", window))
    }

    fn window_mut(&mut self, window: Hwnd) -> Result<&mut SimWindow> {
        self.ensure_available()?;
        self.windows
            .get_mut(&window)
            .ok_or_else(|| tabs_error!(not_found, "окно {} не существует", window))
    }

    fn create_window(&mut self, location: &str) -> (AutomationId, Hwnd) {
        let window = Hwnd::from(self.next());
        self.windows.insert(window, SimWindow::default());
        let id = self.create_tab(window, location);
        self.foreground = Some(window);
        self.emit(ShellEvent::WindowRegistered);
        self.emit(ShellEvent::WindowShown { hwnd: window });
        (id, window)
    }

    fn create_tab(&mut self, window: Hwnd, location: &str) -> AutomationId {
        let id = AutomationId(self.next().get());
        let tab = Hwnd::from(self.next());
        self.tabs.insert(
            tab,
            SimTab {
                id,
                window,
                history: vec![location.to_string()],
                position: 0,
                selection: Vec::new(),
                navigate_events: false,
            },
        );
        self.objects.insert(id, tab);
        if let Some(entry) = self.windows.get_mut(&window) {
            entry.tabs.push(tab);
            entry.active = Some(tab);
        }
        id
    }

    fn remove_tab(&mut self, id: AutomationId) -> Result<()> {
        self.ensure_available()?;
        let tab = self.objects.remove(&id).ok_or(ShellTabsError::StaleReference(id))?;
        let Some(removed) = self.tabs.remove(&tab) else {
            return Err(ShellTabsError::StaleReference(id));
        };

        let window_closed = match self.windows.get_mut(&removed.window) {
            Some(window) => {
                window.tabs.retain(|hwnd| *hwnd != tab);
                if window.active == Some(tab) {
                    window.active = window.tabs.last().copied();
                }
                window.tabs.is_empty()
            }
            None => false,
        };
        if window_closed {
            self.windows.remove(&removed.window);
            if self.foreground == Some(removed.window) {
                self.foreground = self.windows.keys().next_back().copied();
            }
        }

        self.emit(ShellEvent::WindowQuit { id });
        Ok(())
    }

    fn set_location(&mut self, id: AutomationId, location: &str) -> Result<()> {
        let tab = self.tab_by_id_mut(id)?;
        tab.history.truncate(tab.position + 1);
        tab.history.push(location.to_string());
        tab.position = tab.history.len() - 1;
        tab.selection.clear();
        let notify = tab.navigate_events;
        if notify {
            self.emit(ShellEvent::NavigateComplete {
                id,
                location: location.to_string(),
            });
        }
        Ok(())
    }

    fn step_history(&mut self, id: AutomationId, forward: bool) -> Result<()> {
        let tab = self.tab_by_id_mut(id)?;
        let target = if forward {
            (tab.position + 1 < tab.history.len()).then(|| tab.position + 1)
        } else {
            tab.position.checked_sub(1)
        };
        let Some(position) = target else {
            return Ok(());
        };
        tab.position = position;
        tab.selection.clear();
        let location = tab.location().to_string();
        if tab.navigate_events {
            self.emit(ShellEvent::NavigateComplete { id, location });
        }
        Ok(())
    }
}

pub struct SimulatedShell {
    state: Mutex<SimState>,
    call_threads: Mutex<HashSet<ThreadId>>,
}

impl Default for SimulatedShell {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedShell {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                next_handle: FIRST_HANDLE,
                available: true,
                bypass: false,
                windows: BTreeMap::new(),
                tabs: HashMap::new(),
                objects: HashMap::new(),
                foreground: None,
                sink: None,
                released: Vec::new(),
                default_handler: Vec::new(),
                hide_calls: Vec::new(),
            }),
            call_threads: Mutex::new(HashSet::new()),
        }
    }

    fn touch(&self) {
        self.call_threads.lock().insert(thread::current().id());
    }

    /// Потоки, из которых вызывались методы автоматизации
    pub fn call_threads(&self) -> HashSet<ThreadId> {
        self.call_threads.lock().clone()
    }

    // --- Действия пользователя ---

    /// Пользователь открыл окно; возвращает объект вкладки и хэндл окна
    pub fn user_open_window(&self, location: &str) -> (AutomationId, Hwnd) {
        self.state.lock().create_window(location)
    }

    /// Пользователь открыл вкладку в существующем окне
    pub fn user_open_tab(&self, window: Hwnd, location: &str) -> Result<AutomationId> {
        let mut state = self.state.lock();
        state.window(window)?;
        let id = state.create_tab(window, location);
        state.emit(ShellEvent::WindowRegistered);
        Ok(id)
    }

    pub fn user_close_tab(&self, id: AutomationId) -> Result<()> {
        self.state.lock().remove_tab(id)
    }

    pub fn user_navigate(&self, id: AutomationId, location: &str) -> Result<()> {
        self.state.lock().set_location(id, location)
    }

    pub fn user_select(&self, id: AutomationId, items: &[&str]) -> Result<()> {
        let mut state = self.state.lock();
        state.tab_by_id_mut(id)?.selection = items.iter().map(|item| item.to_string()).collect();
        Ok(())
    }

    pub fn set_foreground(&self, window: Option<Hwnd>) {
        self.state.lock().foreground = window;
    }

    pub fn set_bypass(&self, active: bool) {
        self.state.lock().bypass = active;
    }

    /// Процесс оболочки упал: все объекты и подписки потеряны
    pub fn crash(&self) {
        let mut state = self.state.lock();
        warn!("Симуляция: процесс оболочки завершился аварийно");
        state.available = false;
        state.sink = None;
        state.windows.clear();
        state.tabs.clear();
        state.objects.clear();
        state.foreground = None;
    }

    pub fn restart(&self) {
        self.state.lock().available = true;
    }

    // --- Наблюдение ---

    pub fn window_of(&self, id: AutomationId) -> Option<Hwnd> {
        let state = self.state.lock();
        state.objects.get(&id).and_then(|tab| state.tabs.get(tab)).map(|tab| tab.window)
    }

    /// Окно на переднем плане без записи вызывающего потока
    pub fn foreground(&self) -> Option<Hwnd> {
        self.state.lock().foreground
    }

    pub fn window_count(&self) -> usize {
        self.state.lock().windows.len()
    }

    pub fn top_level_windows(&self) -> Vec<Hwnd> {
        self.state.lock().windows.keys().copied().collect()
    }

    pub fn tab_ids(&self, window: Hwnd) -> Vec<AutomationId> {
        let state = self.state.lock();
        state
            .windows
            .get(&window)
            .map(|entry| entry.tabs.iter().filter_map(|tab| state.tabs.get(tab)).map(|tab| tab.id).collect())
            .unwrap_or_default()
    }

    pub fn tab_locations(&self, window: Hwnd) -> Vec<String> {
        let state = self.state.lock();
        state
            .windows
            .get(&window)
            .map(|entry| {
                entry
                    .tabs
                    .iter()
                    .filter_map(|tab| state.tabs.get(tab))
                    .map(|tab| tab.location().to_string())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn active_location(&self, window: Hwnd) -> Option<String> {
        let state = self.state.lock();
        let active = state.windows.get(&window)?.active?;
        state.tabs.get(&active).map(|tab| tab.location().to_string())
    }

    pub fn is_hidden(&self, window: Hwnd) -> bool {
        self.state
            .lock()
            .windows
            .get(&window)
            .is_some_and(|entry| entry.hidden.is_some())
    }

    /// Все вызовы hide_window по порядку
    pub fn hide_calls(&self) -> Vec<(Hwnd, HideMode)> {
        self.state.lock().hide_calls.clone()
    }

    pub fn selection_of(&self, id: AutomationId) -> Vec<String> {
        self.state
            .lock()
            .tab_by_id(id)
            .map(|tab| tab.selection.clone())
            .unwrap_or_default()
    }

    pub fn released(&self) -> Vec<AutomationId> {
        self.state.lock().released.clone()
    }

    pub fn default_handler_targets(&self) -> Vec<String> {
        self.state.lock().default_handler.clone()
    }
}

fn display_name(location: &str) -> String {
    location
        .trim_end_matches(['\\', '/'])
        .rsplit(['\\', '/'])
        .find(|segment| !segment.is_empty())
        .unwrap_or(location)
        .to_string()
}

impl ShellAutomation for SimulatedShell {
    fn is_available(&self) -> bool {
        self.touch();
        self.state.lock().available
    }

    fn subscribe_events(&self, sink: mpsc::UnboundedSender<ShellEvent>) -> Result<()> {
        self.touch();
        let mut state = self.state.lock();
        state.ensure_available()?;
        state.sink = Some(sink);
        Ok(())
    }

    fn windows(&self) -> Result<Vec<AutomationId>> {
        self.touch();
        let state = self.state.lock();
        state.ensure_available()?;
        let mut ids: Vec<AutomationId> = state.objects.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }

    fn tab_handle(&self, id: AutomationId) -> Result<Hwnd> {
        self.touch();
        let state = self.state.lock();
        state.tab_by_id(id)?;
        state.objects.get(&id).copied().ok_or(ShellTabsError::StaleReference(id))
    }

    fn top_level_of(&self, tab: Hwnd) -> Result<Hwnd> {
        self.touch();
        let state = self.state.lock();
        state.ensure_available()?;
        if state.windows.contains_key(&tab) {
            return Ok(tab);
        }
        state
            .tabs
            .get(&tab)
            .map(|entry| entry.window)
            .ok_or_else(|| tabs_error!(not_found, "вкладка {} не существует", tab))
    }

    fn location(&self, id: AutomationId) -> Result<String> {
        self.touch();
        Ok(self.state.lock().tab_by_id(id)?.location().to_string())
    }

    fn name(&self, id: AutomationId) -> Result<String> {
        self.touch();
        Ok(display_name(self.state.lock().tab_by_id(id)?.location()))
    }

    fn selected_items(&self, id: AutomationId) -> Result<Vec<String>> {
        self.touch();
        Ok(self.state.lock().tab_by_id(id)?.selection.clone())
    }

    fn select_items(&self, id: AutomationId, items: &[String]) -> Result<()> {
        self.touch();
        self.state.lock().tab_by_id_mut(id)?.selection = items.to_vec();
        Ok(())
    }

    fn navigate(&self, id: AutomationId, location: &str) -> Result<()> {
        self.touch();
        self.state.lock().set_location(id, location)
    }

    fn go_back(&self, id: AutomationId) -> Result<()> {
        self.touch();
        self.state.lock().step_history(id, false)
    }

    fn go_forward(&self, id: AutomationId) -> Result<()> {
        self.touch();
        self.state.lock().step_history(id, true)
    }

    fn subscribe_navigation(&self, id: AutomationId) -> Result<()> {
        self.touch();
        self.state.lock().tab_by_id_mut(id)?.navigate_events = true;
        Ok(())
    }

    fn quit(&self, id: AutomationId) -> Result<()> {
        self.touch();
        self.state.lock().remove_tab(id)
    }

    fn release(&self, id: AutomationId) {
        self.touch();
        self.state.lock().released.push(id);
    }

    fn tabs_of(&self, window: Hwnd) -> Result<TabList> {
        self.touch();
        Ok(self.state.lock().window(window)?.tabs.iter().copied().collect())
    }

    fn active_tab(&self, window: Hwnd) -> Result<Option<Hwnd>> {
        self.touch();
        Ok(self.state.lock().window(window)?.active)
    }

    fn request_new_tab(&self, window: Hwnd) -> Result<()> {
        self.touch();
        let mut state = self.state.lock();
        state.window(window)?;
        state.create_tab(window, NEW_TAB_LOCATION);
        state.emit(ShellEvent::WindowRegistered);
        Ok(())
    }

    fn select_tab(&self, tab: Hwnd) -> Result<()> {
        self.touch();
        let mut state = self.state.lock();
        state.ensure_available()?;
        let window = state
            .tabs
            .get(&tab)
            .map(|entry| entry.window)
            .ok_or_else(|| tabs_error!(not_found, "вкладка {} не существует", tab))?;
        state.window_mut(window)?.active = Some(tab);
        Ok(())
    }

    fn hide_window(&self, window: Hwnd, mode: HideMode) -> Result<()> {
        self.touch();
        let mut state = self.state.lock();
        state.window_mut(window)?.hidden = Some(mode);
        state.hide_calls.push((window, mode));
        Ok(())
    }

    fn show_window(&self, window: Hwnd) -> Result<()> {
        self.touch();
        self.state.lock().window_mut(window)?.hidden = None;
        Ok(())
    }

    fn bring_to_front(&self, window: Hwnd) -> Result<()> {
        self.touch();
        let mut state = self.state.lock();
        state.window(window)?;
        state.foreground = Some(window);
        Ok(())
    }

    fn foreground_window(&self) -> Option<Hwnd> {
        self.touch();
        self.state.lock().foreground
    }

    fn open_new_window(&self, location: &str) -> Result<()> {
        self.touch();
        let mut state = self.state.lock();
        state.ensure_available()?;
        state.create_window(location);
        Ok(())
    }

    fn open_with_default_handler(&self, target: &str) -> Result<()> {
        self.touch();
        let mut state = self.state.lock();
        state.ensure_available()?;
        state.default_handler.push(target.to_string());
        Ok(())
    }

    fn bypass_gesture_active(&self) -> bool {
        self.touch();
        self.state.lock().bypass
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_windows_and_tabs() {
        let shell = SimulatedShell::new();
        let (first, window) = shell.user_open_window("C:\\Work");
        let second = shell.user_open_tab(window, "D:\\Data").unwrap();

        assert_eq!(shell.windows().unwrap(), vec![first, second]);
        assert_eq!(shell.tabs_of(window).unwrap().len(), 2);
        assert_eq!(shell.name(second).unwrap(), "Data");
        assert_eq!(shell.foreground_window(), Some(window));

        let tab = shell.tab_handle(first).unwrap();
        assert_eq!(shell.top_level_of(tab).unwrap(), window);
        assert_eq!(shell.top_level_of(window).unwrap(), window);
    }

    #[test]
    fn test_quit_last_tab_closes_window_and_notifies() {
        let shell = SimulatedShell::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        shell.subscribe_events(tx).unwrap();

        let (id, window) = shell.user_open_window("C:\\Work");
        assert_eq!(rx.try_recv().unwrap(), ShellEvent::WindowRegistered);
        assert_eq!(rx.try_recv().unwrap(), ShellEvent::WindowShown { hwnd: window });

        shell.quit(id).unwrap();
        assert_eq!(rx.try_recv().unwrap(), ShellEvent::WindowQuit { id });
        assert_eq!(shell.window_count(), 0);
        assert!(shell.location(id).unwrap_err().is_stale());
    }

    #[test]
    fn test_navigation_history_and_events() {
        let shell = SimulatedShell::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        shell.subscribe_events(tx).unwrap();
        let (id, _) = shell.user_open_window("C:\\A");
        while rx.try_recv().is_ok() {}

        // Без подписки на навигацию событий нет
        shell.navigate(id, "C:\\B").unwrap();
        assert!(rx.try_recv().is_err());

        shell.subscribe_navigation(id).unwrap();
        shell.navigate(id, "C:\\C").unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            ShellEvent::NavigateComplete { id, location: "C:\\C".to_string() }
        );

        shell.go_back(id).unwrap();
        assert_eq!(shell.location(id).unwrap(), "C:\\B");
        shell.go_forward(id).unwrap();
        assert_eq!(shell.location(id).unwrap(), "C:\\C");
        // Дальше вперёд идти некуда
        shell.go_forward(id).unwrap();
        assert_eq!(shell.location(id).unwrap(), "C:\\C");
    }

    #[test]
    fn test_crash_drops_everything() {
        let shell = SimulatedShell::new();
        shell.user_open_window("C:\\A");
        shell.crash();

        assert!(!shell.is_available());
        assert!(matches!(shell.windows(), Err(ShellTabsError::ShellUnavailable(_))));

        shell.restart();
        assert_eq!(shell.windows().unwrap(), Vec::new());
    }

    #[test]
    fn test_records_calling_threads() {
        let shell = SimulatedShell::new();
        shell.is_available();
        assert_eq!(shell.call_threads(), HashSet::from([thread::current().id()]));
    }
}
