use serde::{Deserialize, Serialize};
use std::ops::{Index, IndexMut};
use strum_macros::{Display, EnumString};

use crate::host::DeviceId;

/// Operating context selecting which binding set is active.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Default,
    EnumString,
    Display,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Always enabled on every device.
    #[default]
    Flight,
    AltFlight,
    /// Only reachable while the controlled subject is on the ground.
    Ground,
}

impl Mode {
    pub const COUNT: usize = 3;
    pub const ALL: [Mode; Mode::COUNT] = [Mode::Flight, Mode::AltFlight, Mode::Ground];

    pub fn index(&self) -> usize {
        *self as usize
    }
}

/// One value per mode, indexed by `Mode`.
#[derive(Debug, Clone, PartialEq)]
pub struct ModeTable<T>([T; Mode::COUNT]);

impl<T> ModeTable<T> {
    pub fn from_fn(f: impl FnMut(Mode) -> T) -> Self {
        Self(Mode::ALL.map(f))
    }

    pub fn iter(&self) -> impl Iterator<Item = (Mode, &T)> {
        Mode::ALL.into_iter().zip(self.0.iter())
    }
}

impl<T: Clone> ModeTable<T> {
    pub fn filled(value: T) -> Self {
        Self::from_fn(|_| value.clone())
    }
}

impl<T> Index<Mode> for ModeTable<T> {
    type Output = T;

    fn index(&self, mode: Mode) -> &T {
        &self.0[mode.index()]
    }
}

impl<T> IndexMut<Mode> for ModeTable<T> {
    fn index_mut(&mut self, mode: Mode) -> &mut T {
        &mut self.0[mode.index()]
    }
}

/// Scans forward from `current`, wrapping around, for the next mode the
/// device enables. Ground is skipped unless the subject is grounded.
/// Returns `None` when no other mode qualifies.
pub(crate) fn next_mode(current: Mode, enabled: &ModeTable<bool>, grounded: bool) -> Option<Mode> {
    (1..Mode::COUNT)
        .map(|step| Mode::ALL[(current.index() + step) % Mode::COUNT])
        .find(|candidate| enabled[*candidate] && (*candidate != Mode::Ground || grounded))
}

/// Engine-wide mode state: the current mode, shared by every device, and
/// the device that last produced input.
#[derive(Debug, Default)]
pub(crate) struct ModeContext {
    current: Mode,
    active_device: Option<DeviceId>,
}

impl ModeContext {
    pub(crate) fn current(&self) -> Mode {
        self.current
    }

    pub(crate) fn set_current(&mut self, mode: Mode) {
        self.current = mode;
    }

    pub(crate) fn active_device(&self) -> Option<&DeviceId> {
        self.active_device.as_ref()
    }

    pub(crate) fn set_active_device(&mut self, id: &DeviceId) {
        if self.active_device.as_ref() != Some(id) {
            self.active_device = Some(id.clone());
        }
    }

    pub(crate) fn forget_device(&mut self, id: &DeviceId) {
        if self.active_device.as_ref() == Some(id) {
            self.active_device = None;
        }
    }

    pub(crate) fn reset(&mut self) {
        self.current = Mode::Flight;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn all_enabled() -> ModeTable<bool> {
        ModeTable::filled(true)
    }

    #[test]
    fn test_cycles_through_enabled_modes() {
        let enabled = all_enabled();
        assert_eq!(next_mode(Mode::Flight, &enabled, true), Some(Mode::AltFlight));
        assert_eq!(next_mode(Mode::AltFlight, &enabled, true), Some(Mode::Ground));
        assert_eq!(next_mode(Mode::Ground, &enabled, true), Some(Mode::Flight));
    }

    #[test]
    fn test_skips_ground_when_airborne() {
        let enabled = all_enabled();
        assert_eq!(next_mode(Mode::AltFlight, &enabled, false), Some(Mode::Flight));
    }

    #[test]
    fn test_skips_disabled_modes() {
        let mut enabled = all_enabled();
        enabled[Mode::AltFlight] = false;
        assert_eq!(next_mode(Mode::Flight, &enabled, true), Some(Mode::Ground));
        assert_eq!(next_mode(Mode::Flight, &enabled, false), None);
    }

    #[test]
    fn test_mode_names() {
        assert_eq!(Mode::AltFlight.to_string(), "alt_flight");
        assert_eq!("ground".parse::<Mode>().unwrap(), Mode::Ground);
        let parsed: Mode = serde_yaml::from_str("alt_flight").unwrap();
        assert_eq!(parsed, Mode::AltFlight);
    }

    #[test]
    fn test_mode_table_indexing() {
        let mut table = ModeTable::from_fn(|mode| mode.index() * 10);
        table[Mode::Ground] += 1;
        assert_eq!(table[Mode::Flight], 0);
        assert_eq!(table[Mode::AltFlight], 10);
        assert_eq!(table[Mode::Ground], 21);
        assert_eq!(table.iter().count(), Mode::COUNT);
    }

    #[test]
    fn test_context_forgets_removed_device() {
        let mut context = ModeContext::default();
        let id = DeviceId::from("stick");
        context.set_active_device(&id);
        context.set_current(Mode::Ground);
        context.forget_device(&id);
        assert!(context.active_device().is_none());
        context.reset();
        assert_eq!(context.current(), Mode::Flight);
    }
}
