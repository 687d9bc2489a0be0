use doc_for::*;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_valid::Validate;
use std::collections::{BTreeMap, HashMap};
use strum_macros::{Display, EnumString};

use crate::action::{Mapping, MappingType};
use crate::common::AxisId;
use crate::host::DeviceClass;
use crate::mode::{Mode, ModeTable};

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
#[doc_impl]
pub(crate) struct GlobalSettings {
    /// The standalone driver ticks the engine with this rate in Hz.
    #[serde(default = "default_tick_rate")]
    #[validate(minimum = 1)]
    pub(crate) tick_rate: u32,
    /// Dead-zone of every input unless overridden, as a fraction of half travel.
    #[serde(default)]
    #[validate(minimum = 0.0)]
    #[validate(maximum = 1.0)]
    pub(crate) dead_zone: f32,
    /// Output scale of every axis unless overridden.
    #[serde(default = "default_factor")]
    #[validate(exclusive_minimum = 0.0)]
    pub(crate) factor: f32,
    /// Attitude input above this magnitude suspends the host's stabilization
    /// (used by the standalone driver's host).
    #[serde(default = "default_stabilization_threshold")]
    #[validate(minimum = 0.0)]
    #[validate(maximum = 1.0)]
    pub(crate) stabilization_threshold: f32,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            tick_rate: default_tick_rate(),
            dead_zone: 0.0,
            factor: default_factor(),
            stabilization_threshold: default_stabilization_threshold(),
        }
    }
}

fn default_tick_rate() -> u32 {
    50
}

fn default_factor() -> f32 {
    1.0
}

fn default_stabilization_threshold() -> f32 {
    0.05
}

fn default_true() -> bool {
    true
}

fn default_class() -> String {
    DeviceClass::GameControl.to_string()
}

// ----------------
// Shorthand or full entries
// ----------------
/// Wrapper for entries that accept both:
/// - Shorthand: `Button1: "activateNextStage"`
/// - Full: `Button1: { mapping: ..., continuous: true }`
#[derive(Debug, Clone)]
pub(crate) enum ControlEntry<T> {
    Shorthand(String),
    Full(T),
}

impl<T: Serialize> Serialize for ControlEntry<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            ControlEntry::Shorthand(s) => serializer.serialize_str(s),
            ControlEntry::Full(t) => t.serialize(serializer),
        }
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for ControlEntry<T> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::{self, MapAccess, Visitor};
        use std::fmt;
        use std::marker::PhantomData;

        struct ControlEntryVisitor<T>(PhantomData<T>);

        impl<'de, T: Deserialize<'de>> Visitor<'de> for ControlEntryVisitor<T> {
            type Value = ControlEntry<T>;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a mapping string or an object")
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(ControlEntry::Shorthand(value.to_string()))
            }

            fn visit_string<E>(self, value: String) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(ControlEntry::Shorthand(value))
            }

            fn visit_map<M>(self, map: M) -> Result<Self::Value, M::Error>
            where
                M: MapAccess<'de>,
            {
                let t = T::deserialize(de::value::MapAccessDeserializer::new(map))?;
                Ok(ControlEntry::Full(t))
            }
        }

        deserializer.deserialize_any(ControlEntryVisitor(PhantomData))
    }
}

// ----------------
// Mapping literals
// ----------------
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct MappingDef {
    pub(crate) action: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub(crate) kind: Option<MappingType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) value: Option<f32>,
}

/// `"[type ]action[ value]"` or `{ action, type, value }`.
pub(crate) type MappingEntry = ControlEntry<MappingDef>;

// ----------------
// Input slots
// ----------------
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub(crate) struct InputSlot {
    #[serde(default = "default_true")]
    pub(crate) enabled: bool,
    /// Only `game_control` devices are bound.
    #[serde(default = "default_class")]
    pub(crate) class: String,
    /// Devices whose name matches are bound to this slot; all devices of the
    /// class when absent.
    #[serde(default, with = "serde_regex")]
    pub(crate) match_name_regex: Option<Regex>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(minimum = 0.0)]
    #[validate(maximum = 1.0)]
    pub(crate) dead_zone: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(exclusive_minimum = 0.0)]
    pub(crate) factor: Option<f32>,
    /// Modes besides flight this device takes part in; all when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) modes: Option<Vec<Mode>>,
    #[serde(default)]
    pub(crate) axes: BTreeMap<AxisId, ControlEntry<AxisEntry>>,
    #[serde(default)]
    pub(crate) buttons: BTreeMap<String, ControlEntry<ButtonEntry>>,
    #[serde(default)]
    pub(crate) povs: BTreeMap<String, PovEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub(crate) struct AxisSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) control: Option<ControlType>,
    /// Sole binding of an `axis` control, negative side otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) mapping: Option<MappingEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) negative: Option<MappingEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) positive: Option<MappingEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) inverted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(minimum = 0.0)]
    #[validate(maximum = 1.0)]
    pub(crate) dead_zone: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(exclusive_minimum = 0.0)]
    pub(crate) factor: Option<f32>,
}

impl AxisSettings {
    /// Fields set in `over` win.
    pub(crate) fn overridden_by(&self, over: &AxisSettings) -> AxisSettings {
        AxisSettings {
            control: over.control.or(self.control),
            mapping: over.mapping.clone().or_else(|| self.mapping.clone()),
            negative: over.negative.clone().or_else(|| self.negative.clone()),
            positive: over.positive.clone().or_else(|| self.positive.clone()),
            inverted: over.inverted.or(self.inverted),
            dead_zone: over.dead_zone.or(self.dead_zone),
            factor: over.factor.or(self.factor),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct AxisEntry {
    #[serde(flatten)]
    pub(crate) settings: AxisSettings,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub(crate) modes: HashMap<Mode, AxisSettings>,
}

impl AxisEntry {
    pub(crate) fn from_entry(entry: &ControlEntry<AxisEntry>) -> AxisEntry {
        match entry {
            ControlEntry::Shorthand(literal) => AxisEntry {
                settings: AxisSettings {
                    mapping: Some(ControlEntry::Shorthand(literal.clone())),
                    ..Default::default()
                },
                modes: HashMap::new(),
            },
            ControlEntry::Full(axis) => axis.clone(),
        }
    }

    pub(crate) fn settings_for(&self, mode: Mode) -> AxisSettings {
        match self.modes.get(&mode) {
            Some(over) => self.settings.overridden_by(over),
            None => self.settings.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct ButtonSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) mapping: Option<MappingEntry>,
    /// Re-assert the binding every tick while held.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) continuous: Option<bool>,
}

impl ButtonSettings {
    pub(crate) fn from_entry(entry: &ControlEntry<ButtonSettings>) -> ButtonSettings {
        match entry {
            ControlEntry::Shorthand(literal) => ButtonSettings {
                mapping: Some(ControlEntry::Shorthand(literal.clone())),
                continuous: None,
            },
            ControlEntry::Full(settings) => settings.clone(),
        }
    }

    pub(crate) fn overridden_by(&self, over: &ButtonSettings) -> ButtonSettings {
        ButtonSettings {
            mapping: over.mapping.clone().or_else(|| self.mapping.clone()),
            continuous: over.continuous.or(self.continuous),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct ButtonEntry {
    #[serde(flatten)]
    pub(crate) settings: ButtonSettings,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub(crate) modes: HashMap<Mode, ControlEntry<ButtonSettings>>,
}

impl ButtonEntry {
    pub(crate) fn from_entry(entry: &ControlEntry<ButtonEntry>) -> ButtonEntry {
        match entry {
            ControlEntry::Shorthand(literal) => ButtonEntry {
                settings: ButtonSettings {
                    mapping: Some(ControlEntry::Shorthand(literal.clone())),
                    continuous: None,
                },
                modes: HashMap::new(),
            },
            ControlEntry::Full(button) => button.clone(),
        }
    }

    pub(crate) fn settings_for(&self, mode: Mode) -> ButtonSettings {
        match self.modes.get(&mode) {
            Some(over) => self.settings.overridden_by(&ButtonSettings::from_entry(over)),
            None => self.settings.clone(),
        }
    }
}

/// Hat switch directions, each configured like a button.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct PovEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) up: Option<ControlEntry<ButtonEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) right: Option<ControlEntry<ButtonEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) down: Option<ControlEntry<ButtonEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) left: Option<ControlEntry<ButtonEntry>>,
}

impl PovEntry {
    /// Entries in Up, Right, Down, Left order.
    pub(crate) fn directions(&self) -> [Option<&ControlEntry<ButtonEntry>>; 4] {
        [
            self.up.as_ref(),
            self.right.as_ref(),
            self.down.as_ref(),
            self.left.as_ref(),
        ]
    }
}

// ----------------
// Resolved bindings
// ----------------
/// How an axis value is turned into action output.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, Display, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ControlType {
    /// Proportional output on the primary mapping.
    #[default]
    Axis,
    /// Press/release events on dead-zone threshold crossings.
    OneShot,
    /// Magnitude routed to the negative or positive mapping, re-asserted
    /// every tick while deflected.
    Continuous,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Control {
    pub kind: ControlType,
    pub inverted: bool,
    pub dead_zone: f32,
    pub factor: f32,
}

impl Control {
    pub fn new(kind: ControlType, inverted: bool, dead_zone: f32, factor: f32) -> Self {
        Self {
            kind,
            inverted,
            dead_zone,
            factor,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisBinding {
    pub control: Control,
    /// Sole binding of an `Axis` control, negative side otherwise.
    pub mapping1: Mapping,
    /// Positive side of `OneShot` and `Continuous` controls.
    pub mapping2: Mapping,
}

impl AxisBinding {
    pub fn unbound(dead_zone: f32, factor: f32) -> Self {
        Self {
            control: Control::new(ControlType::Axis, false, dead_zone, factor),
            mapping1: Mapping::unbound(),
            mapping2: Mapping::unbound(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ButtonBinding {
    pub mapping: Mapping,
    pub continuous: bool,
}

/// An input slot with every name resolved and every per-mode table filled.
#[derive(Debug, Clone)]
pub struct ResolvedInputSlot {
    pub(crate) key: String,
    pub(crate) class: DeviceClass,
    pub(crate) match_name_regex: Option<Regex>,
    pub(crate) dead_zone: f32,
    pub(crate) factor: f32,
    pub(crate) enabled_modes: ModeTable<bool>,
    pub(crate) axes: BTreeMap<AxisId, ModeTable<AxisBinding>>,
    pub(crate) buttons: BTreeMap<u32, ModeTable<ButtonBinding>>,
    pub(crate) povs: BTreeMap<u32, [ModeTable<ButtonBinding>; 4]>,
}

impl ResolvedInputSlot {
    pub(crate) fn matches_name(&self, name: &str) -> bool {
        self.match_name_regex
            .as_ref()
            .map_or(true, |pattern| pattern.is_match(name))
    }

    pub(crate) fn axis_bindings(&self, axis: AxisId) -> ModeTable<AxisBinding> {
        self.axes
            .get(&axis)
            .cloned()
            .unwrap_or_else(|| ModeTable::filled(AxisBinding::unbound(self.dead_zone, self.factor)))
    }

    pub(crate) fn button_bindings(&self, index: u32) -> ModeTable<ButtonBinding> {
        self.buttons.get(&index).cloned().unwrap_or_else(|| ModeTable::filled(ButtonBinding::default()))
    }

    pub(crate) fn pov_bindings(&self, index: u32) -> [ModeTable<ButtonBinding>; 4] {
        self.povs
            .get(&index)
            .cloned()
            .unwrap_or_else(|| std::array::from_fn(|_| ModeTable::filled(ButtonBinding::default())))
    }
}
