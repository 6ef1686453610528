use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};
use tracing::{debug, info};

use super::r#trait::ShellDriverTrait;
use super::simulated::SimulatedShell;
use crate::config::Config;
use crate::error::Result;
use crate::events::HotkeyProfile;
use crate::model::AutomationId;

/// Сколько окон эмуляция держит открытыми одновременно
const MAX_OPEN: usize = 4;
/// Каждый какой такт эмулируется нажатие горячей клавиши
const HOTKEY_EVERY: usize = 3;

pub struct DryRunShellDriver {
    config: Arc<Config>,
    shell: Arc<SimulatedShell>,
    hotkeys: mpsc::UnboundedSender<HotkeyProfile>,
}

impl DryRunShellDriver {
    pub fn new(
        config: Arc<Config>,
        shell: Arc<SimulatedShell>,
        hotkeys: mpsc::UnboundedSender<HotkeyProfile>,
    ) -> Self {
        info!("Инициализация DryRunShellDriver");
        Self {
            config,
            shell,
            hotkeys,
        }
    }

    async fn run_impl(self) -> Result<()> {
        info!("Dry-run режим - оболочка работает в режиме эмуляции");
        info!(
            "Настроено {} горячих клавиш (dry-run)",
            self.config.hotkeys.len()
        );

        let fake_locations = [
            "C:\\Users\\Public\\Documents",
            "C:\\Program Files",
            "D:\\Projects\\dry_run",
            "This PC",
            "::{645FF040-5081-101B-9F08-00AA002F954E}",
        ];

        let mut opened: Vec<AutomationId> = Vec::new();
        let mut index = 0;
        let mut tick = 0usize;
        let mut interval = interval(Duration::from_secs(10));

        loop {
            interval.tick().await;
            tick += 1;

            if tick % HOTKEY_EVERY == 0 && !self.config.hotkeys.is_empty() {
                let profile = self.config.hotkeys[(tick / HOTKEY_EVERY) % self.config.hotkeys.len()].clone();
                info!("Dry-run: эмулируем горячую клавишу {}", profile);
                if self.hotkeys.send(profile).is_err() {
                    debug!("Dry-run: оркестратор больше не принимает горячие клавиши");
                }
                continue;
            }

            if opened.len() >= MAX_OPEN {
                let id = opened.remove(0);
                info!("Dry-run: эмулируем закрытие окна {}", id);
                if let Err(e) = self.shell.user_close_tab(id) {
                    debug!("Dry-run: окно {} уже закрыто: {}", id, e);
                }
                continue;
            }

            let location = fake_locations[index];
            info!("Dry-run: эмулируем открытие окна: {}", location);
            let (id, _) = self.shell.user_open_window(location);
            opened.push(id);

            // Закрытые оркестратором окна (слитые во вкладки) больше не отслеживаем
            opened.retain(|id| self.shell.window_of(*id).is_some());

            index = (index + 1) % fake_locations.len();
        }
    }
}

#[async_trait::async_trait]
impl ShellDriverTrait for DryRunShellDriver {
    async fn run(self: Box<Self>) -> Result<()> {
        (*self).run_impl().await
    }
}
