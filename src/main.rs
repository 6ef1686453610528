use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use shell_tabs::config::{Config, LoggingConfig};
use shell_tabs::services::process_monitor::{ProcessSource, SimulatedProcessSource};
use shell_tabs::services::{
    create_shell_driver, ComThreadDispatcher, HistoryStore, JsonHistoryStore,
    ProcessLifecycleMonitor, SystemProcessSource, WindowOrchestrator,
};

#[derive(Parser, Debug)]
#[command(name = "shell-tabs")]
#[command(about = "Собирает окна файлового менеджера во вкладки одного окна")]
struct Args {
    /// Путь к файлу конфигурации
    #[arg(short, long, default_value = "shell-tabs.toml")]
    config: String,

    /// Режим сухого запуска (симулированная оболочка вместо настоящей)
    #[arg(long)]
    dry_run: bool,

    /// Уровень логирования; перекрывает фильтр из конфигурации
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Загрузка конфигурации
    let config = Arc::new(Config::load(&args.config)?);

    // Инициализация системы логирования
    init_tracing(&config.logging, args.log_level.as_deref())?;

    info!("Запуск shell-tabs v{}", env!("CARGO_PKG_VERSION"));
    info!("Конфигурация загружена из: {}", args.config);

    if args.dry_run {
        warn!("Режим сухого запуска - вместо оболочки работает симуляция");
    }

    // Инициализация компонентов
    let (hotkey_tx, hotkey_rx) = mpsc::unbounded_channel();
    let (shell, shell_driver) = create_shell_driver(config.clone(), hotkey_tx, args.dry_run)?;
    let dispatcher = Arc::new(ComThreadDispatcher::new("shell-com")?);

    let store: Option<Arc<dyn HistoryStore>> = if config.behavior.persists_history() {
        let path = config.storage.resolved_history_path();
        info!("История окон хранится в {}", path.display());
        Some(Arc::new(JsonHistoryStore::new(path)))
    } else {
        None
    };

    let (orchestrator, shell_rx) =
        WindowOrchestrator::new(config.clone(), shell, dispatcher.clone(), store);

    let (process_tx, process_rx) = mpsc::unbounded_channel();
    let process_source: Arc<dyn ProcessSource> = if args.dry_run {
        Arc::new(SimulatedProcessSource::new(None))
    } else {
        Arc::new(SystemProcessSource::new())
    };
    let monitor = ProcessLifecycleMonitor::new(&config.process, process_source, process_tx);

    orchestrator.start().await?;

    info!("Все компоненты инициализированы");

    // Запуск всех сервисов параллельно
    let orchestrator_handle = tokio::spawn(orchestrator.clone().run(shell_rx, process_rx, hotkey_rx));
    let monitor_handle = tokio::spawn(monitor.clone().run());
    let driver_handle = tokio::spawn(async move {
        if let Err(e) = shell_driver.run().await {
            error!("Ошибка в драйвере оболочки: {}", e);
        }
    });

    info!("Все сервисы запущены");

    // Ожидание сигнала завершения
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Получен сигнал завершения (Ctrl+C)");
        }
        Err(err) => {
            error!("Ошибка при ожидании сигнала завершения: {}", err);
        }
    }

    info!("Завершение работы...");

    monitor.pause();
    driver_handle.abort();

    let shutdown_timeout = tokio::time::Duration::from_secs(5);

    // Показать спрятанные окна и сохранить историю
    match tokio::time::timeout(shutdown_timeout, orchestrator.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Ошибка при сохранении истории: {}", e),
        Err(_) => warn!("Таймаут при сохранении истории"),
    }

    orchestrator_handle.abort();
    monitor_handle.abort();

    // Ожидаем завершения задач и очереди диспетчера (с таймаутом)
    let shutdown_result = tokio::time::timeout(shutdown_timeout, async {
        let _ = orchestrator_handle.await;
        let _ = monitor_handle.await;
        let _ = driver_handle.await;
        let _ = tokio::task::spawn_blocking(move || dispatcher.shutdown()).await;
    })
    .await;

    match shutdown_result {
        Ok(_) => info!("Все сервисы завершили работу корректно"),
        Err(_) => warn!("Таймаут при завершении сервисов"),
    }

    info!("shell-tabs завершил работу");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig, level_override: Option<&str>) -> Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let directives = match level_override {
        Some(level) => level.to_string(),
        None if logging.filter.is_empty() => logging.level.clone(),
        None => logging.filter.clone(),
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&directives))?;

    let registry = tracing_subscriber::registry().with(filter);
    if logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer().compact()).init();
    }

    Ok(())
}
