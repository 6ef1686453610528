/// Сколько других окон должно отслеживаться, чтобы новое окно стало вкладкой
pub const MIN_OTHER_WINDOWS_FOR_MERGE: usize = 2;

/// Всё, что нужно для решения о слиянии нового окна
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeContext {
    pub hooks_active: bool,
    pub reuse_enabled: bool,
    /// Отслеживаемые окна, не считая кандидата
    pub tracked_windows: usize,
    pub is_main_window: bool,
    pub tab_count: usize,
    /// Жест обхода зажат при открытии окна
    pub bypass: bool,
}

/// Новое окно сливается вкладкой в главное окно только если оно одиночное,
/// не является главным, рядом есть минимум два других окна и включён
/// перехват окон или переиспользование вкладок.
pub fn is_merge_eligible(ctx: &MergeContext) -> bool {
    if ctx.bypass {
        return false;
    }
    (ctx.hooks_active || ctx.reuse_enabled)
        && ctx.tracked_windows >= MIN_OTHER_WINDOWS_FOR_MERGE
        && !ctx.is_main_window
        && ctx.tab_count == 1
}
