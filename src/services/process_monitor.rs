//! Отслеживание процесса-хозяина оболочки.
//!
//! Периодическое сканирование находит новые процессы с нужным именем и
//! перепроверяет уже известные. Для каждого нового процесса дополнительно
//! оформляется подписка на завершение: что придёт раньше, подписка или следующее
//! сканирование, то и сообщит о завершении, второй путь ничего не сделает.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::{ProcessConfig, SessionFilter};
use crate::events::ProcessEvent;

/// Интервал проверки в наблюдателе завершения системного источника
const EXIT_WATCH_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSnapshot {
    pub pid: u32,
    pub name: String,
    pub session_id: Option<u32>,
}

/// Источник сведений о процессах
pub trait ProcessSource: Send + Sync {
    /// Все живые процессы с указанным именем (без учёта регистра)
    fn processes_named(&self, name: &str) -> Vec<ProcessSnapshot>;
    fn is_alive(&self, pid: u32) -> bool;
    fn current_session(&self) -> Option<u32>;
    /// Подписка на завершение; `None`, если источник не умеет уведомлять
    fn subscribe_exit(&self, pid: u32) -> Option<oneshot::Receiver<()>>;
}

/// Источник на основе `sysinfo`
#[derive(Debug, Default)]
pub struct SystemProcessSource {
    system: Mutex<Option<System>>,
}

impl SystemProcessSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_process_running(pid: u32) -> bool {
        let mut system = System::new();
        let pid = Pid::from_u32(pid);
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        system.process(pid).is_some()
    }
}

impl ProcessSource for SystemProcessSource {
    fn processes_named(&self, name: &str) -> Vec<ProcessSnapshot> {
        let mut guard = self.system.lock();
        let system = guard.get_or_insert_with(System::new);
        system.refresh_processes(ProcessesToUpdate::All, true);

        system
            .processes()
            .values()
            .filter(|process| process.name().to_string_lossy().eq_ignore_ascii_case(name))
            .map(|process| ProcessSnapshot {
                pid: process.pid().as_u32(),
                name: process.name().to_string_lossy().to_string(),
                session_id: process.session_id().map(|sid| sid.as_u32()),
            })
            .collect()
    }

    fn is_alive(&self, pid: u32) -> bool {
        Self::is_process_running(pid)
    }

    fn current_session(&self) -> Option<u32> {
        let pid = sysinfo::get_current_pid().ok()?;
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        system
            .process(pid)
            .and_then(|process| process.session_id())
            .map(|sid| sid.as_u32())
    }

    fn subscribe_exit(&self, pid: u32) -> Option<oneshot::Receiver<()>> {
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let (tx, rx) = oneshot::channel();
        runtime.spawn(async move {
            let mut ticker = interval(EXIT_WATCH_INTERVAL);
            loop {
                ticker.tick().await;
                if tx.is_closed() {
                    return;
                }
                let alive = tokio::task::spawn_blocking(move || Self::is_process_running(pid))
                    .await
                    .unwrap_or(true);
                if !alive {
                    let _ = tx.send(());
                    return;
                }
            }
        });
        Some(rx)
    }
}

#[derive(Debug)]
struct SimulatedProcess {
    name: String,
    session_id: Option<u32>,
    exit_subscribers: Vec<oneshot::Sender<()>>,
}

/// Источник с управляемым набором процессов (сухой запуск и тесты)
#[derive(Debug)]
pub struct SimulatedProcessSource {
    processes: Mutex<HashMap<u32, SimulatedProcess>>,
    session: Option<u32>,
}

impl SimulatedProcessSource {
    pub fn new(session: Option<u32>) -> Self {
        Self {
            processes: Mutex::new(HashMap::new()),
            session,
        }
    }

    pub fn spawn(&self, pid: u32, name: &str, session_id: Option<u32>) {
        self.processes.lock().insert(
            pid,
            SimulatedProcess {
                name: name.to_string(),
                session_id,
                exit_subscribers: Vec::new(),
            },
        );
    }

    /// Завершить процесс; `notify = false` имитирует потерянное уведомление
    pub fn kill(&self, pid: u32, notify: bool) {
        if let Some(process) = self.processes.lock().remove(&pid) {
            if notify {
                for subscriber in process.exit_subscribers {
                    let _ = subscriber.send(());
                }
            }
        }
    }
}

impl ProcessSource for SimulatedProcessSource {
    fn processes_named(&self, name: &str) -> Vec<ProcessSnapshot> {
        self.processes
            .lock()
            .iter()
            .filter(|(_, process)| process.name.eq_ignore_ascii_case(name))
            .map(|(pid, process)| ProcessSnapshot {
                pid: *pid,
                name: process.name.clone(),
                session_id: process.session_id,
            })
            .collect()
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.processes.lock().contains_key(&pid)
    }

    fn current_session(&self) -> Option<u32> {
        self.session
    }

    fn subscribe_exit(&self, pid: u32) -> Option<oneshot::Receiver<()>> {
        let (tx, rx) = oneshot::channel();
        let mut processes = self.processes.lock();
        let process = processes.get_mut(&pid)?;
        process.exit_subscribers.push(tx);
        Some(rx)
    }
}

#[derive(Debug)]
struct TrackedProcess {
    name: String,
    session_id: Option<u32>,
    watcher: Option<JoinHandle<()>>,
}

pub struct ProcessLifecycleMonitor {
    source: Arc<dyn ProcessSource>,
    target_name: String,
    session: SessionFilter,
    scan_interval: Duration,
    tracked: DashMap<u32, TrackedProcess>,
    scan_lock: Mutex<()>,
    paused: AtomicBool,
    events: mpsc::UnboundedSender<ProcessEvent>,
}

impl ProcessLifecycleMonitor {
    pub fn new(
        config: &ProcessConfig,
        source: Arc<dyn ProcessSource>,
        events: mpsc::UnboundedSender<ProcessEvent>,
    ) -> Arc<Self> {
        let scan_interval = config.scan_interval();
        info!(
            "Инициализация ProcessLifecycleMonitor для '{}' (интервал {}мс, сессия {:?})",
            config.name,
            scan_interval.as_millis(),
            config.session
        );

        Arc::new(Self {
            source,
            target_name: config.name.clone(),
            session: config.session,
            scan_interval,
            tracked: DashMap::new(),
            scan_lock: Mutex::new(()),
            paused: AtomicBool::new(false),
            events,
        })
    }

    pub fn scan_interval(&self) -> Duration {
        self.scan_interval
    }

    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            info!("ProcessLifecycleMonitor приостановлен");
        }
    }

    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            info!("ProcessLifecycleMonitor возобновлён");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn tracked_count(&self) -> usize {
        self.tracked.len()
    }

    pub fn is_tracking(&self, pid: u32) -> bool {
        self.tracked.contains_key(&pid)
    }

    pub async fn run(self: Arc<Self>) {
        info!("ProcessLifecycleMonitor запущен");
        let mut ticker = interval(self.scan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if self.is_paused() {
                continue;
            }
            // Перечисление процессов блокирует поток
            let monitor = Arc::clone(&self);
            if let Err(e) = tokio::task::spawn_blocking(move || monitor.scan()).await {
                warn!("Сканирование процессов завершилось аварийно: {}", e);
            }
        }
    }

    /// Один проход сканирования; false, если параллельный проход ещё идёт
    pub fn scan(self: &Arc<Self>) -> bool {
        let Some(_guard) = self.scan_lock.try_lock() else {
            debug!("Сканирование процессов уже идёт, тик пропущен");
            return false;
        };

        // (a) Сверка уже известных процессов
        let dead: Vec<u32> = self
            .tracked
            .iter()
            .map(|entry| *entry.key())
            .filter(|pid| !self.source.is_alive(*pid))
            .collect();
        for pid in dead {
            debug!("Сканирование обнаружило завершение pid {}", pid);
            self.handle_exit(pid);
        }

        // (b) Поиск новых процессов
        let current_session = match self.session {
            SessionFilter::All => None,
            SessionFilter::Current => self.source.current_session(),
        };

        for process in self.source.processes_named(&self.target_name) {
            if self.tracked.contains_key(&process.pid) {
                continue;
            }
            if self.session == SessionFilter::Current
                && current_session.is_some()
                && process.session_id != current_session
            {
                continue;
            }

            let watcher = self.watch_exit(process.pid);
            self.tracked.insert(
                process.pid,
                TrackedProcess {
                    name: process.name.clone(),
                    session_id: process.session_id,
                    watcher,
                },
            );

            info!("Обнаружен процесс {} (pid {})", process.name, process.pid);
            self.emit(ProcessEvent::Created {
                pid: process.pid,
                name: process.name,
                session_id: process.session_id,
            });
        }

        true
    }

    fn watch_exit(self: &Arc<Self>, pid: u32) -> Option<JoinHandle<()>> {
        let receiver = self.source.subscribe_exit(pid)?;
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let monitor: Weak<Self> = Arc::downgrade(self);

        Some(runtime.spawn(async move {
            if receiver.await.is_ok() {
                if let Some(monitor) = monitor.upgrade() {
                    debug!("Уведомление о завершении pid {}", pid);
                    monitor.handle_exit(pid);
                }
            }
        }))
    }

    /// Общая точка удаления процесса: повторный вызов для того же pid ничего не делает
    pub fn handle_exit(&self, pid: u32) -> bool {
        let Some((_, process)) = self.tracked.remove(&pid) else {
            return false;
        };
        if let Some(watcher) = process.watcher {
            watcher.abort();
        }

        warn!("Процесс {} (pid {}) завершён", process.name, pid);
        self.emit(ProcessEvent::Terminated {
            pid,
            name: process.name,
            session_id: process.session_id,
        });
        true
    }

    fn emit(&self, event: ProcessEvent) {
        if self.events.send(event).is_err() {
            debug!("Получатель событий процессов закрыт");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::MIN_SCAN_INTERVAL_MS;

    fn config(session: SessionFilter) -> ProcessConfig {
        ProcessConfig {
            name: "explorer.exe".to_string(),
            scan_interval_ms: 1000,
            session,
        }
    }

    fn setup(session: SessionFilter) -> (
        Arc<SimulatedProcessSource>,
        Arc<ProcessLifecycleMonitor>,
        mpsc::UnboundedReceiver<ProcessEvent>,
    ) {
        let source = Arc::new(SimulatedProcessSource::new(Some(1)));
        let (tx, rx) = mpsc::unbounded_channel();
        let monitor = ProcessLifecycleMonitor::new(&config(session), source.clone(), tx);
        (source, monitor, rx)
    }

    #[tokio::test]
    async fn test_scan_reports_new_processes_in_current_session() {
        let (source, monitor, mut rx) = setup(SessionFilter::Current);
        source.spawn(100, "explorer.exe", Some(1));
        source.spawn(200, "Explorer.EXE", Some(2));
        source.spawn(300, "notepad.exe", Some(1));

        assert!(monitor.scan());
        assert_eq!(monitor.tracked_count(), 1);
        assert!(monitor.is_tracking(100));
        assert!(matches!(rx.try_recv(), Ok(ProcessEvent::Created { pid: 100, .. })));
        assert!(rx.try_recv().is_err());

        // Повторное сканирование не дублирует события
        monitor.scan();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_session_filter_all() {
        let (source, monitor, _rx) = setup(SessionFilter::All);
        source.spawn(100, "explorer.exe", Some(1));
        source.spawn(200, "explorer.exe", Some(2));

        monitor.scan();
        assert_eq!(monitor.tracked_count(), 2);
    }

    #[tokio::test]
    async fn test_exit_event_fast_path() {
        let (source, monitor, mut rx) = setup(SessionFilter::Current);
        source.spawn(100, "explorer.exe", Some(1));
        monitor.scan();
        let _ = rx.recv().await;

        source.kill(100, true);
        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert!(matches!(event, Some(ProcessEvent::Terminated { pid: 100, .. })));
        assert_eq!(monitor.tracked_count(), 0);

        // Сканирование после уведомления не повторяет событие
        monitor.scan();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_missed_exit_caught_by_scan() {
        let (source, monitor, mut rx) = setup(SessionFilter::Current);
        source.spawn(100, "explorer.exe", Some(1));
        monitor.scan();
        let _ = rx.recv().await;

        source.kill(100, false);
        tokio::task::yield_now().await;
        assert!(monitor.is_tracking(100));

        monitor.scan();
        assert!(matches!(rx.try_recv(), Ok(ProcessEvent::Terminated { pid: 100, .. })));
        assert!(!monitor.handle_exit(100));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_overlapping_scan_is_skipped() {
        let (source, monitor, _rx) = setup(SessionFilter::Current);
        source.spawn(100, "explorer.exe", Some(1));

        let guard = monitor.scan_lock.lock();
        assert!(!monitor.scan());
        drop(guard);
        assert!(monitor.scan());
        assert_eq!(monitor.tracked_count(), 1);
    }

    #[tokio::test]
    async fn test_pause_and_interval_floor() {
        let (_source, monitor, _rx) = setup(SessionFilter::Current);
        monitor.pause();
        assert!(monitor.is_paused());
        monitor.resume();
        assert!(!monitor.is_paused());

        assert_eq!(monitor.scan_interval(), Duration::from_millis(1000));

        let mut fast = config(SessionFilter::All);
        fast.scan_interval_ms = 1;
        let (tx, _rx) = mpsc::unbounded_channel();
        let monitor = ProcessLifecycleMonitor::new(&fast, Arc::new(SimulatedProcessSource::new(None)), tx);
        assert_eq!(monitor.scan_interval(), Duration::from_millis(MIN_SCAN_INTERVAL_MS));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_detects_restart() {
        let (source, monitor, mut rx) = setup(SessionFilter::Current);
        source.spawn(100, "explorer.exe", Some(1));
        let handle = tokio::spawn(monitor.clone().run());

        assert!(matches!(rx.recv().await, Some(ProcessEvent::Created { pid: 100, .. })));
        source.kill(100, false);
        source.spawn(101, "explorer.exe", Some(1));

        assert!(matches!(rx.recv().await, Some(ProcessEvent::Terminated { pid: 100, .. })));
        assert!(matches!(rx.recv().await, Some(ProcessEvent::Created { pid: 101, .. })));
        handle.abort();
    }

    /// Источник, запоминающий потоки, из которых его опрашивали
    #[derive(Default)]
    struct ThreadRecordingSource {
        threads: Mutex<Vec<std::thread::ThreadId>>,
    }

    impl ProcessSource for ThreadRecordingSource {
        fn processes_named(&self, _name: &str) -> Vec<ProcessSnapshot> {
            self.threads.lock().push(std::thread::current().id());
            Vec::new()
        }

        fn is_alive(&self, _pid: u32) -> bool {
            false
        }

        fn current_session(&self) -> Option<u32> {
            None
        }

        fn subscribe_exit(&self, _pid: u32) -> Option<oneshot::Receiver<()>> {
            None
        }
    }

    #[tokio::test]
    async fn test_run_loop_scans_off_the_runtime_thread() {
        let source = Arc::new(ThreadRecordingSource::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let monitor = ProcessLifecycleMonitor::new(&config(SessionFilter::All), source.clone(), tx);
        let handle = tokio::spawn(monitor.run());

        let deadline = std::time::Instant::now() + Duration::from_secs(3);
        while source.threads.lock().is_empty() {
            assert!(std::time::Instant::now() < deadline, "сканирование не запустилось");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.abort();

        let runtime_thread = std::thread::current().id();
        assert!(source.threads.lock().iter().all(|thread| *thread != runtime_thread));
    }
}
