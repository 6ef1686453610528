//! Однопоточный диспетчер вызовов объектов автоматизации.
//!
//! Объекты автоматизации оболочки привязаны к апартаменту создавшего их потока,
//! поэтому все вызовы в них идут через один выделенный поток с FIFO-очередью.
//! Задачи, поставленные из самого потока диспетчера, выполняются на месте,
//! иначе вложенное планирование заблокировало бы поток навсегда.

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::{self, JoinHandle, ThreadId};
use tokio::sync::oneshot;
use tracing::{debug, error, info};

use crate::error::DispatchError;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Хуки инициализации и очистки потока (инициализация апартамента в нативном бэкенде)
pub struct ThreadHooks {
    pub on_start: Box<dyn FnOnce() + Send + 'static>,
    pub on_stop: Box<dyn FnOnce() + Send + 'static>,
}

/// Хэндл завершения задачи; ошибки задачи наблюдаются только через него
#[derive(Debug)]
pub struct DispatchHandle<T> {
    receiver: oneshot::Receiver<Result<T, DispatchError>>,
}

impl<T> DispatchHandle<T> {
    pub async fn wait(self) -> Result<T, DispatchError> {
        self.receiver.await.unwrap_or(Err(DispatchError::Dropped))
    }

    /// Блокирующее ожидание; нельзя вызывать из асинхронного контекста
    pub fn wait_blocking(self) -> Result<T, DispatchError> {
        self.receiver.blocking_recv().unwrap_or(Err(DispatchError::Dropped))
    }
}

pub struct ComThreadDispatcher {
    sender: Mutex<Option<Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
    name: String,
}

impl ComThreadDispatcher {
    pub fn new(name: &str) -> std::io::Result<Self> {
        Self::with_hooks(name, None)
    }

    pub fn with_hooks(name: &str, hooks: Option<ThreadHooks>) -> std::io::Result<Self> {
        info!("Инициализация ComThreadDispatcher '{}'", name);

        let (sender, receiver) = unbounded::<Job>();
        let worker = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || Self::worker_loop(receiver, hooks))?;
        let thread_id = worker.thread().id();

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            thread_id,
            name: name.to_string(),
        })
    }

    fn worker_loop(receiver: Receiver<Job>, hooks: Option<ThreadHooks>) {
        let on_stop = hooks.map(|hooks| {
            (hooks.on_start)();
            hooks.on_stop
        });

        // recv() отдаёт оставшиеся задачи и после закрытия отправителя
        while let Ok(job) = receiver.recv() {
            job();
        }

        if let Some(on_stop) = on_stop {
            on_stop();
        }
        debug!("Поток диспетчера {:?} завершён", thread::current().name());
    }

    /// Выполняется ли текущий код в потоке диспетчера
    pub fn is_dispatcher_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    pub fn schedule<F>(&self, action: F) -> DispatchHandle<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(action)
    }

    /// Поставить функцию в очередь и получить её результат
    pub fn submit<T, F>(&self, func: F) -> DispatchHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let handle = DispatchHandle { receiver: rx };

        if self.is_dispatcher_thread() {
            let _ = tx.send(Self::run_guarded(func));
            return handle;
        }

        let job: Job = Box::new(move || {
            let _ = tx.send(Self::run_guarded(func));
        });

        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(sender) => {
                if let Err(rejected) = sender.send(job) {
                    // Поток уже ушёл: задача вернётся и сообщит Dropped при удалении
                    drop(rejected);
                }
            }
            None => {
                debug!("Диспетчер '{}' остановлен, задача отклонена", self.name);
                // tx внутри job будет удалён, хэндл вернёт Closed ниже
                drop(job);
                let (tx, rx) = oneshot::channel();
                let _ = tx.send(Err(DispatchError::Closed));
                return DispatchHandle { receiver: rx };
            }
        }
        handle
    }

    pub async fn schedule_and_get<T, F>(&self, func: F) -> Result<T, DispatchError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.submit(func).wait().await
    }

    fn run_guarded<T>(func: impl FnOnce() -> T) -> Result<T, DispatchError> {
        catch_unwind(AssertUnwindSafe(func)).map_err(|payload| {
            let message = panic_message(payload.as_ref());
            error!("Задача диспетчера завершилась паникой: {}", message);
            DispatchError::Panicked(message)
        })
    }

    /// Перестать принимать задачи, дождаться выполнения очереди и завершить поток
    pub fn shutdown(&self) {
        let sender = self.sender.lock().take();
        if sender.is_none() {
            return;
        }
        drop(sender);

        if self.is_dispatcher_thread() {
            // Поток завершится сам, когда опустеет очередь
            return;
        }

        if let Some(worker) = self.worker.lock().take() {
            info!("Остановка ComThreadDispatcher '{}', ожидание очереди", self.name);
            if worker.join().is_err() {
                error!("Поток диспетчера '{}' завершился аварийно", self.name);
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender.lock().is_none()
    }
}

impl Drop for ComThreadDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "неизвестная паника".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_concurrent_actions_run_on_one_thread_in_order() {
        let dispatcher = Arc::new(ComThreadDispatcher::new("test-dispatcher").unwrap());
        let log: Arc<Mutex<Vec<(usize, ThreadId)>>> = Arc::new(Mutex::new(Vec::new()));
        // Порядок постановки фиксируется под тем же замком, что и отправка
        let submit_order: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));

        let mut producers = Vec::new();
        for t in 0..4 {
            let dispatcher = Arc::clone(&dispatcher);
            let log = Arc::clone(&log);
            let submit_order = Arc::clone(&submit_order);
            producers.push(thread::spawn(move || {
                for i in 0..25 {
                    let id = t * 25 + i;
                    let log = Arc::clone(&log);
                    let mut order = submit_order.lock();
                    order.push(id);
                    dispatcher.schedule(move || {
                        log.lock().push((id, thread::current().id()));
                    });
                }
            }));
        }
        for producer in producers {
            producer.join().unwrap();
        }

        let dispatcher_thread = dispatcher.thread_id();
        dispatcher.shutdown();

        let log = log.lock();
        assert_eq!(log.len(), 100);
        assert!(log.iter().all(|(_, tid)| *tid == dispatcher_thread));
        let executed: Vec<usize> = log.iter().map(|(id, _)| *id).collect();
        assert_eq!(executed, *submit_order.lock());
    }

    #[test]
    fn test_shutdown_drains_pending_work() {
        let dispatcher = ComThreadDispatcher::new("drain").unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..50 {
            let counter = Arc::clone(&counter);
            dispatcher.schedule(move || {
                thread::sleep(std::time::Duration::from_millis(1));
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        dispatcher.shutdown();

        assert_eq!(counter.load(Ordering::SeqCst), 50);
        assert!(dispatcher.is_closed());
        assert_eq!(dispatcher.schedule(|| {}).wait_blocking(), Err(DispatchError::Closed));
    }

    #[test]
    fn test_nested_schedule_runs_inline() {
        let dispatcher = Arc::new(ComThreadDispatcher::new("nested").unwrap());
        let inner = Arc::clone(&dispatcher);

        let result = dispatcher
            .submit(move || inner.submit(|| 21 * 2).wait_blocking())
            .wait_blocking();

        assert_eq!(result, Ok(Ok(42)));
    }

    #[test]
    fn test_panic_is_reported_through_handle() {
        let dispatcher = ComThreadDispatcher::new("panics").unwrap();

        let failed = dispatcher.submit(|| -> u32 { panic!("boom") }).wait_blocking();
        assert_eq!(failed, Err(DispatchError::Panicked("boom".to_string())));

        // Поток пережил панику и продолжает работать
        assert_eq!(dispatcher.submit(|| 7).wait_blocking(), Ok(7));
    }

    #[tokio::test]
    async fn test_schedule_and_get_async() {
        let dispatcher = ComThreadDispatcher::new("async").unwrap();
        let caller = thread::current().id();

        let worker = dispatcher
            .schedule_and_get(|| thread::current().id())
            .await
            .unwrap();

        assert_ne!(worker, caller);
        assert_eq!(worker, dispatcher.thread_id());
    }

    #[test]
    fn test_thread_hooks_run_once() {
        let started = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicUsize::new(0));
        let (s, t) = (Arc::clone(&started), Arc::clone(&stopped));

        let dispatcher = ComThreadDispatcher::with_hooks(
            "hooks",
            Some(ThreadHooks {
                on_start: Box::new(move || {
                    s.fetch_add(1, Ordering::SeqCst);
                }),
                on_stop: Box::new(move || {
                    t.fetch_add(1, Ordering::SeqCst);
                }),
            }),
        )
        .unwrap();

        assert_eq!(dispatcher.submit(|| 1).wait_blocking(), Ok(1));
        drop(dispatcher);

        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
    }
}
