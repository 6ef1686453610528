//! Реестр окон оболочки с двумя ключами.
//!
//! Основной ключ это объект автоматизации, дополнительный это нативный хэндл,
//! который появляется позже и может перейти к другому окну. Значение хранится
//! один раз в арене `slotmap`, а обе хэш-таблицы указывают на ключ арены.

use parking_lot::Mutex;
use slotmap::{new_key_type, SlotMap};
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use tracing::debug;

use crate::error::Result;
use crate::model::{AutomationId, Hwnd, WindowEntry};
use crate::tabs_error;

new_key_type! {
    struct SlotKey;
}

/// Что делать, если дополнительный ключ уже принадлежит другой записи
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// Отобрать ключ у старой записи (она остаётся, но без дополнительного ключа)
    #[default]
    Evict,
    /// Вернуть ошибку и ничего не менять
    Strict,
}

#[derive(Debug)]
struct Slot<P, O, V> {
    primary: P,
    optional: Option<O>,
    value: V,
}

/// Таблица с обязательным уникальным основным ключом и необязательным
/// уникальным дополнительным ключом. Поиск по обоим ключам за O(1).
#[derive(Debug)]
pub struct DualKeyMap<P, O, V> {
    slots: SlotMap<SlotKey, Slot<P, O, V>>,
    by_primary: HashMap<P, SlotKey>,
    by_optional: HashMap<O, SlotKey>,
}

impl<P, O, V> Default for DualKeyMap<P, O, V>
where
    P: Copy + Eq + Hash + Debug,
    O: Copy + Eq + Hash + Debug,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<P, O, V> DualKeyMap<P, O, V>
where
    P: Copy + Eq + Hash + Debug,
    O: Copy + Eq + Hash + Debug,
{
    pub fn new() -> Self {
        Self {
            slots: SlotMap::with_key(),
            by_primary: HashMap::new(),
            by_optional: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn add(&mut self, primary: P, value: V, optional: Option<O>, policy: ConflictPolicy) -> Result<()> {
        if self.by_primary.contains_key(&primary) {
            return Err(tabs_error!(duplicate_key, "{:?}", primary));
        }
        if let Some(optional) = optional {
            self.check_optional_conflict(optional, None, policy)?;
        }

        let key = self.slots.insert(Slot { primary, optional: None, value });
        self.by_primary.insert(primary, key);
        if let Some(optional) = optional {
            self.bind_optional(key, optional);
        }
        Ok(())
    }

    /// `add` без ошибок: false, если основной ключ занят или строгий конфликт
    pub fn try_add(&mut self, primary: P, value: V, optional: Option<O>, policy: ConflictPolicy) -> bool {
        self.add(primary, value, optional, policy).is_ok()
    }

    pub fn get(&self, primary: &P) -> Option<&V> {
        self.by_primary
            .get(primary)
            .and_then(|key| self.slots.get(*key))
            .map(|slot| &slot.value)
    }

    pub fn get_mut(&mut self, primary: &P) -> Option<&mut V> {
        let key = *self.by_primary.get(primary)?;
        self.slots.get_mut(key).map(|slot| &mut slot.value)
    }

    pub fn get_by_optional(&self, optional: &O) -> Option<(P, &V)> {
        self.by_optional
            .get(optional)
            .and_then(|key| self.slots.get(*key))
            .map(|slot| (slot.primary, &slot.value))
    }

    pub fn optional_of(&self, primary: &P) -> Option<O> {
        self.by_primary
            .get(primary)
            .and_then(|key| self.slots.get(*key))
            .and_then(|slot| slot.optional)
    }

    pub fn contains(&self, primary: &P) -> bool {
        self.by_primary.contains_key(primary)
    }

    /// Назначить (или снять, если `None`) дополнительный ключ записи
    pub fn update_optional_key(&mut self, primary: &P, optional: Option<O>, policy: ConflictPolicy) -> Result<()> {
        let key = *self
            .by_primary
            .get(primary)
            .ok_or_else(|| tabs_error!(not_found, "{:?}", primary))?;

        if let Some(optional) = optional {
            self.check_optional_conflict(optional, Some(key), policy)?;
        }

        if let Some(old) = self.slots[key].optional.take() {
            self.by_optional.remove(&old);
        }
        if let Some(optional) = optional {
            self.bind_optional(key, optional);
        }
        Ok(())
    }

    pub fn remove(&mut self, primary: &P) -> Option<(Option<O>, V)> {
        let key = self.by_primary.remove(primary)?;
        let slot = self.slots.remove(key)?;
        if let Some(optional) = slot.optional {
            self.by_optional.remove(&optional);
        }
        Some((slot.optional, slot.value))
    }

    pub fn remove_by_optional(&mut self, optional: &O) -> Option<(P, V)> {
        let primary = self.slots.get(*self.by_optional.get(optional)?)?.primary;
        self.remove(&primary).map(|(_, value)| (primary, value))
    }

    pub fn iter(&self) -> impl Iterator<Item = (P, Option<O>, &V)> {
        self.slots
            .values()
            .map(|slot| (slot.primary, slot.optional, &slot.value))
    }

    /// Забрать все записи, оставив таблицу пустой
    pub fn drain(&mut self) -> Vec<(P, Option<O>, V)> {
        self.by_primary.clear();
        self.by_optional.clear();
        self.slots
            .drain()
            .map(|(_, slot)| (slot.primary, slot.optional, slot.value))
            .collect()
    }

    fn check_optional_conflict(&self, optional: O, owner: Option<SlotKey>, policy: ConflictPolicy) -> Result<()> {
        match self.by_optional.get(&optional) {
            Some(current) if Some(*current) != owner && policy == ConflictPolicy::Strict => {
                Err(tabs_error!(key_conflict, "{:?} уже привязан к другой записи", optional))
            }
            _ => Ok(()),
        }
    }

    fn bind_optional(&mut self, key: SlotKey, optional: O) {
        if let Some(previous) = self.by_optional.insert(optional, key) {
            if previous != key {
                if let Some(slot) = self.slots.get_mut(previous) {
                    debug!("Ключ {:?} отобран у записи {:?}", optional, slot.primary);
                    slot.optional = None;
                }
            }
        }
        self.slots[key].optional = Some(optional);
    }
}

/// Снимок записи реестра
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrySnapshot {
    pub id: AutomationId,
    pub hwnd: Option<Hwnd>,
    pub entry: WindowEntry,
}

/// Реестр окон оболочки: таблица с двумя ключами под одним грубым замком
#[derive(Debug, Default)]
pub struct ShellWindowRegistry {
    inner: Mutex<DualKeyMap<AutomationId, Hwnd, WindowEntry>>,
}

impl ShellWindowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn add(&self, id: AutomationId, entry: WindowEntry, hwnd: Option<Hwnd>) -> Result<()> {
        self.inner.lock().add(id, entry, hwnd, ConflictPolicy::Evict)
    }

    pub fn try_add(&self, id: AutomationId, entry: WindowEntry, hwnd: Option<Hwnd>) -> bool {
        self.inner.lock().try_add(id, entry, hwnd, ConflictPolicy::Evict)
    }

    pub fn contains(&self, id: AutomationId) -> bool {
        self.inner.lock().contains(&id)
    }

    pub fn get(&self, id: AutomationId) -> Option<WindowEntry> {
        self.inner.lock().get(&id).cloned()
    }

    pub fn get_by_hwnd(&self, hwnd: Hwnd) -> Option<(AutomationId, WindowEntry)> {
        self.inner
            .lock()
            .get_by_optional(&hwnd)
            .map(|(id, entry)| (id, entry.clone()))
    }

    pub fn hwnd_of(&self, id: AutomationId) -> Option<Hwnd> {
        self.inner.lock().optional_of(&id)
    }

    pub fn update_hwnd(&self, id: AutomationId, hwnd: Option<Hwnd>, policy: ConflictPolicy) -> Result<()> {
        self.inner.lock().update_optional_key(&id, hwnd, policy)
    }

    /// Изменить запись на месте; false, если записи уже нет
    pub fn update<F>(&self, id: AutomationId, f: F) -> bool
    where
        F: FnOnce(&mut WindowEntry),
    {
        match self.inner.lock().get_mut(&id) {
            Some(entry) => {
                f(entry);
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, id: AutomationId) -> Option<(Option<Hwnd>, WindowEntry)> {
        self.inner.lock().remove(&id)
    }

    pub fn remove_by_hwnd(&self, hwnd: Hwnd) -> Option<(AutomationId, WindowEntry)> {
        self.inner.lock().remove_by_optional(&hwnd)
    }

    /// Согласованный снимок всех записей
    pub fn snapshot(&self) -> Vec<RegistrySnapshot> {
        let inner = self.inner.lock();
        let mut entries: Vec<RegistrySnapshot> = inner
            .iter()
            .map(|(id, hwnd, entry)| RegistrySnapshot { id, hwnd, entry: entry.clone() })
            .collect();
        entries.sort_by_key(|s| s.entry.created_at);
        entries
    }

    pub fn drain(&self) -> Vec<RegistrySnapshot> {
        let mut entries: Vec<RegistrySnapshot> = self
            .inner
            .lock()
            .drain()
            .into_iter()
            .map(|(id, hwnd, entry)| RegistrySnapshot { id, hwnd, entry })
            .collect();
        entries.sort_by_key(|s| s.entry.created_at);
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ShellTabsError;
    use std::collections::HashSet;

    type Map = DualKeyMap<u32, u32, &'static str>;

    fn assert_unique_keys(map: &Map) {
        let mut primaries = HashSet::new();
        let mut optionals = HashSet::new();
        for (primary, optional, _) in map.iter() {
            assert!(primaries.insert(primary), "повтор основного ключа {}", primary);
            if let Some(optional) = optional {
                assert!(optionals.insert(optional), "повтор дополнительного ключа {}", optional);
                assert_eq!(map.get_by_optional(&optional).map(|(p, _)| p), Some(primary));
            }
        }
    }

    #[test]
    fn test_duplicate_primary_rejected() {
        let mut map = Map::new();
        map.add(1, "a", None, ConflictPolicy::Evict).unwrap();

        assert!(matches!(
            map.add(1, "b", None, ConflictPolicy::Evict),
            Err(ShellTabsError::DuplicateKey(_))
        ));
        assert!(!map.try_add(1, "b", Some(10), ConflictPolicy::Evict));
        assert_eq!(map.get(&1), Some(&"a"));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_optional_conflict_evicts_old_binding() {
        let mut map = Map::new();
        map.add(1, "a", Some(10), ConflictPolicy::Evict).unwrap();
        map.add(2, "b", Some(10), ConflictPolicy::Evict).unwrap();

        assert_eq!(map.get_by_optional(&10), Some((2, &"b")));
        assert_eq!(map.optional_of(&1), None);
        assert_eq!(map.get(&1), Some(&"a"));
        assert_unique_keys(&map);
    }

    #[test]
    fn test_strict_conflict_fails_without_changes() {
        let mut map = Map::new();
        map.add(1, "a", Some(10), ConflictPolicy::Evict).unwrap();
        map.add(2, "b", Some(20), ConflictPolicy::Evict).unwrap();

        let result = map.update_optional_key(&2, Some(10), ConflictPolicy::Strict);
        assert!(matches!(result, Err(ShellTabsError::KeyConflict(_))));
        assert_eq!(map.optional_of(&1), Some(10));
        assert_eq!(map.optional_of(&2), Some(20));

        assert!(!map.try_add(3, "c", Some(20), ConflictPolicy::Strict));
        assert!(!map.contains(&3));
    }

    #[test]
    fn test_update_optional_key_rebinds() {
        let mut map = Map::new();
        map.add(1, "a", None, ConflictPolicy::Evict).unwrap();
        map.update_optional_key(&1, Some(10), ConflictPolicy::Strict).unwrap();
        map.update_optional_key(&1, Some(11), ConflictPolicy::Strict).unwrap();

        assert_eq!(map.get_by_optional(&10), None);
        assert_eq!(map.get_by_optional(&11), Some((1, &"a")));

        // Повторное назначение своего же ключа не конфликт
        map.update_optional_key(&1, Some(11), ConflictPolicy::Strict).unwrap();
        map.update_optional_key(&1, None, ConflictPolicy::Strict).unwrap();
        assert_eq!(map.get_by_optional(&11), None);
        assert!(map.update_optional_key(&9, Some(1), ConflictPolicy::Evict).is_err());
    }

    #[test]
    fn test_remove_by_either_key() {
        let mut map = Map::new();
        map.add(1, "a", Some(10), ConflictPolicy::Evict).unwrap();
        map.add(2, "b", Some(20), ConflictPolicy::Evict).unwrap();

        assert_eq!(map.remove_by_optional(&10), Some((1, "a")));
        assert_eq!(map.remove(&2), Some((Some(20), "b")));
        assert_eq!(map.remove(&2), None);
        assert!(map.is_empty());
        assert_eq!(map.get_by_optional(&20), None);
    }

    #[test]
    fn test_random_operation_sequence_keeps_keys_unique() {
        let mut map = Map::new();
        // Детерминированный LCG вместо внешнего генератора
        let mut state: u64 = 0x2545F4914F6CDD1D;
        let mut next = |bound: u64| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (state >> 33) % bound
        };

        for _ in 0..2000 {
            let primary = next(16) as u32;
            let optional = if next(3) == 0 { None } else { Some(next(8) as u32) };
            let policy = if next(4) == 0 { ConflictPolicy::Strict } else { ConflictPolicy::Evict };
            match next(4) {
                0 => {
                    let _ = map.try_add(primary, "v", optional, policy);
                }
                1 => {
                    let _ = map.update_optional_key(&primary, optional, policy);
                }
                2 => {
                    map.remove(&primary);
                }
                _ => {
                    if let Some(optional) = optional {
                        map.remove_by_optional(&optional);
                    }
                }
            }
            assert_unique_keys(&map);
        }
    }

    #[test]
    fn test_shell_registry_snapshot_and_drain() {
        let registry = ShellWindowRegistry::new();
        let now = std::time::Instant::now();
        registry
            .add(AutomationId(1), WindowEntry::new("C:\\A", "A").with_created_at(now), Some(Hwnd::new(100).unwrap()))
            .unwrap();
        registry
            .add(
                AutomationId(2),
                WindowEntry::new("C:\\B", "B").with_created_at(now + std::time::Duration::from_millis(1)),
                None,
            )
            .unwrap();

        assert!(registry.update(AutomationId(2), |entry| entry.location = "C:\\C".to_string()));
        assert!(!registry.update(AutomationId(3), |_| {}));
        assert_eq!(registry.get_by_hwnd(Hwnd::new(100).unwrap()).map(|(id, _)| id), Some(AutomationId(1)));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[1].entry.location, "C:\\C");

        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert!(registry.is_empty());
    }
}
