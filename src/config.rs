use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::events::HotkeyProfile;
use crate::model::HideMode;

/// Нижняя граница интервала сканирования процессов
pub const MIN_SCAN_INTERVAL_MS: u64 = 250;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub logging: LoggingConfig,
    pub behavior: BehaviorConfig,
    pub timing: TimingConfig,
    pub process: ProcessConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub hotkeys: Vec<HotkeyProfile>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub filter: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BehaviorConfig {
    /// Переиспользовать уже открытую вкладку с тем же расположением
    pub reuse_tabs: bool,
    /// Перехватывать новые окна и превращать их во вкладки
    pub hook_windows: bool,
    pub restore_previous_windows: bool,
    pub save_closed_history: bool,
    /// Обновлять расположение записей по событиям навигации
    pub track_locations: bool,
    /// Прятать окна прозрачностью вместо переноса за экран
    pub theme_compat_hide: bool,
    pub new_tab_location: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimingConfig {
    pub reattach_window_ms: u64,
    pub processed_handle_ttl_ms: u64,
    pub navigate_timeout_ms: u64,
    pub new_tab_timeout_ms: u64,
    pub object_timeout_ms: u64,
    pub recent_window_exclusion_ms: u64,
    pub poll_interval_ms: u64,
    pub registration_retries: u32,
    pub host_restart_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProcessConfig {
    pub name: String,
    pub scan_interval_ms: u64,
    pub session: SessionFilter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionFilter {
    All,
    Current,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Файл истории закрытых окон; по умолчанию в каталоге конфигурации пользователя
    #[serde(default)]
    pub history_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
                filter: "shell_tabs=info".to_string(),
            },
            behavior: BehaviorConfig {
                reuse_tabs: true,
                hook_windows: true,
                restore_previous_windows: false,
                save_closed_history: true,
                track_locations: true,
                theme_compat_hide: false,
                new_tab_location: "shell:MyComputerFolder".to_string(),
            },
            timing: TimingConfig::default(),
            process: ProcessConfig {
                name: "explorer.exe".to_string(),
                scan_interval_ms: 1000,
                session: SessionFilter::Current,
            },
            storage: StorageConfig::default(),
            hotkeys: Vec::new(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            reattach_window_ms: 2000,
            processed_handle_ttl_ms: 3000,
            navigate_timeout_ms: 5000,
            new_tab_timeout_ms: 2000,
            object_timeout_ms: 2000,
            recent_window_exclusion_ms: 2000,
            poll_interval_ms: 20,
            registration_retries: 25,
            host_restart_timeout_ms: 60_000,
        }
    }
}

impl TimingConfig {
    pub fn reattach_window(&self) -> Duration {
        Duration::from_millis(self.reattach_window_ms)
    }

    pub fn processed_handle_ttl(&self) -> Duration {
        Duration::from_millis(self.processed_handle_ttl_ms)
    }

    pub fn navigate_timeout(&self) -> Duration {
        Duration::from_millis(self.navigate_timeout_ms)
    }

    pub fn new_tab_timeout(&self) -> Duration {
        Duration::from_millis(self.new_tab_timeout_ms)
    }

    pub fn object_timeout(&self) -> Duration {
        Duration::from_millis(self.object_timeout_ms)
    }

    pub fn recent_window_exclusion(&self) -> Duration {
        Duration::from_millis(self.recent_window_exclusion_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn host_restart_timeout(&self) -> Duration {
        Duration::from_millis(self.host_restart_timeout_ms)
    }
}

impl BehaviorConfig {
    pub fn hide_mode(&self) -> HideMode {
        if self.theme_compat_hide {
            HideMode::Transparent
        } else {
            HideMode::OffScreen
        }
    }

    /// История нужна на диске, если её сохраняют или восстанавливают окна
    pub fn persists_history(&self) -> bool {
        self.save_closed_history || self.restore_previous_windows
    }
}

impl ProcessConfig {
    /// Интервал сканирования с учётом нижней границы
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms.max(MIN_SCAN_INTERVAL_MS))
    }
}

impl StorageConfig {
    pub fn resolved_history_path(&self) -> PathBuf {
        if let Some(path) = &self.history_path {
            return path.clone();
        }
        dirs::config_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("shell-tabs")
            .join("closed_windows.json")
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let config_path = config_path.as_ref();

        let figment = Figment::from(figment::providers::Serialized::defaults(Config::default()))
            .merge(Toml::file(config_path))
            .merge(Env::prefixed("SHELL_TABS_").split("__"));

        let config: Config = figment
            .extract()
            .with_context(|| format!("Не удалось загрузить конфигурацию из {:?}", config_path))?;

        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        // Валидация настроек логирования
        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!("Неверный уровень логирования: {}", self.logging.level),
        }

        match self.logging.format.as_str() {
            "pretty" | "json" => {}
            _ => anyhow::bail!("Неверный формат логирования: {}", self.logging.format),
        }

        // Валидация таймингов
        let timing = &self.timing;
        if timing.poll_interval_ms == 0 {
            anyhow::bail!("poll_interval_ms должно быть больше 0");
        }
        if timing.navigate_timeout_ms == 0 || timing.new_tab_timeout_ms == 0 || timing.object_timeout_ms == 0 {
            anyhow::bail!("Таймауты ожидания должны быть больше 0");
        }
        if timing.registration_retries == 0 {
            anyhow::bail!("registration_retries должно быть минимум 1");
        }

        // Валидация мониторинга процессов
        if self.process.name.trim().is_empty() {
            anyhow::bail!("Пустое имя процесса оболочки");
        }
        if self.process.scan_interval_ms < MIN_SCAN_INTERVAL_MS {
            anyhow::bail!("scan_interval_ms должно быть минимум {}", MIN_SCAN_INTERVAL_MS);
        }

        // Валидация горячих клавиш
        for (i, profile) in self.hotkeys.iter().enumerate() {
            if let Some(path) = &profile.path {
                if path.trim().is_empty() {
                    anyhow::bail!("Пустой путь в горячей клавише #{}", i + 1);
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{HotkeyAction, HotkeyScope};
    use std::io::Write;

    #[test]
    fn test_default_config_validation() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_scan_interval_floor() {
        let mut config = Config::default();
        config.process.scan_interval_ms = 10;
        assert!(config.validate().is_err());
        assert_eq!(config.process.scan_interval(), Duration::from_millis(MIN_SCAN_INTERVAL_MS));
    }

    #[test]
    fn test_hide_mode_follows_theme_flag() {
        let mut config = Config::default();
        assert_eq!(config.behavior.hide_mode(), HideMode::OffScreen);
        config.behavior.theme_compat_hide = true;
        assert_eq!(config.behavior.hide_mode(), HideMode::Transparent);
    }

    #[test]
    fn test_load_partial_toml_over_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[behavior]
reuse_tabs = false
hook_windows = true
restore_previous_windows = true
save_closed_history = false
track_locations = true
theme_compat_hide = false
new_tab_location = "C:\\"

[process]
name = "explorer.exe"
scan_interval_ms = 500
session = "all"

[[hotkeys]]
action = "open"
path = "D:\\Projects"
as_tab = true
scope = "file_manager"
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert!(!config.behavior.reuse_tabs);
        assert!(config.behavior.persists_history());
        assert_eq!(config.process.session, SessionFilter::All);
        assert_eq!(config.timing.reattach_window_ms, 2000);
        assert_eq!(config.hotkeys.len(), 1);
        assert_eq!(config.hotkeys[0].action, HotkeyAction::Open);
        assert_eq!(config.hotkeys[0].scope, HotkeyScope::FileManager);
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let mut config = Config::default();
        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());
    }
}
