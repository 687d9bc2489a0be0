use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_valid::Validate;
use serde_yaml::Value as YamlValue;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use yaml_merge_keys::merge_keys_serde;

use crate::action::{Action, Mapping, MappingType};
use crate::common::SampleOffset;
use crate::host::DeviceClass;
use crate::mode::{Mode, ModeTable};
use crate::schemas::*;

pub const APP_VERSION_STR: &str = "1.3";
pub const CONFIG_VERSION_STR: &str = APP_VERSION_STR;
pub const APP_DEFAULT_CONFIG_FILE: &str = "conf/skyjoy_cfg.yaml";
pub const APP_AUTHORS: &str = "SkyJoy contributors";
pub const APP_NAME: &str = "SkyJoy";
pub const APP_COMMAND_NAME: &str = "skyjoy";
pub const APP_LONG_NAME: &str = "SkyJoy Joystick to Flight Controls Mapper";
pub const APP_ABOUT: &str = APP_LONG_NAME;
pub const APP_LONG_ABOUT: &str = "Maps game controller axes, buttons and hats onto flight \
    control channels and host commands, with per-mode bindings.";
pub const APP_DEFAULT_NO_HOT_RELOAD: &str = "false";
pub const APP_DEFAULT_MAX_LOG_LEVEL: &str = "info";
const VERSION_YAML_KEY: &str = "version";

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct Config {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) version: Option<String>,
    #[serde(default)]
    pub(crate) global: GlobalSettings,
    #[serde(default)]
    pub(crate) inputs: BTreeMap<String, InputSlot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) created_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) created_date: Option<DateTime<Utc>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: Some(CONFIG_VERSION_STR.to_string()),
            global: GlobalSettings::default(),
            inputs: BTreeMap::new(),
            created_by: Some(APP_LONG_NAME.to_string()),
            created_date: Some(Utc::now()),
        }
    }
}

//------------------------------------------------------
#[derive(Debug)]
pub struct ConfigManager {
    cfg_file_path_canon: PathBuf,
    config: Config,
    found_version: Option<String>,
    input_slots: Vec<ResolvedInputSlot>,
    issues: Vec<String>,
    debug: bool,
}

impl ConfigManager {
    pub fn new(cfg_file_path: &Path, debug: bool) -> Result<Self> {
        let cfg_file_path_canon =
            fs::canonicalize(cfg_file_path).context("Failed to canonicalize config file path")?;

        Ok(Self {
            cfg_file_path_canon,
            config: Config::default(),
            found_version: Some(CONFIG_VERSION_STR.to_string()),
            input_slots: Vec::new(),
            issues: Vec::new(),
            debug,
        })
    }

    /// Manager loaded from in-memory YAML, for replays and tests.
    pub fn from_yaml_str(content: &str, debug: bool) -> Result<Self> {
        let mut manager = Self {
            cfg_file_path_canon: PathBuf::from("<memory>"),
            config: Config::default(),
            found_version: Some(CONFIG_VERSION_STR.to_string()),
            input_slots: Vec::new(),
            issues: Vec::new(),
            debug,
        };
        manager.load_from_str(content)?;
        Ok(manager)
    }

    pub fn load(&mut self) -> Result<()> {
        log::info!(
            "Loading user config from {}",
            self.cfg_file_path_canon.display()
        );

        if !self.cfg_file_path_canon.exists() {
            log::error!("Config file is not found at {:?}", self.cfg_file_path_canon);
            bail!("Config file not found.");
        }

        let content =
            fs::read_to_string(&self.cfg_file_path_canon).context("Failed to read config file")?;
        self.load_from_str(&content)
    }

    fn load_from_str(&mut self, content: &str) -> Result<()> {
        let raw_yaml: YamlValue =
            serde_yaml::from_str(content).context("Initial YAML parse failed")?;

        let mut yaml_keys_merged =
            merge_keys_serde(raw_yaml).map_err(|e| anyhow!("Failed merge YAML keys: {e}"))?;

        self.input_slots.clear();
        self.issues.clear();

        // Files of another version may follow another schema, so the version is
        // checked before the document is deserialized.
        self.found_version = Self::read_version(&yaml_keys_merged);
        if self.found_version.as_deref() != Some(CONFIG_VERSION_STR) {
            self.config = Config {
                version: self.found_version.clone(),
                ..Config::default()
            };
            let message = self.version_mismatch_message();
            warn!("{message}");
            self.issues.push(message);
            return Ok(());
        }

        // Accepts both `version: 1.3` and `version: "1.3"`.
        if let YamlValue::Mapping(map) = &mut yaml_keys_merged {
            map.remove(VERSION_YAML_KEY);
        }

        let final_yaml_str = serde_yaml::to_string(&yaml_keys_merged)?;
        match serde_yaml::from_str::<Config>(&final_yaml_str) {
            Ok(config) => {
                self.config = Config {
                    version: self.found_version.clone(),
                    ..config
                }
            }
            Err(e) => {
                log::error!("{e:?}");
                if let Some(location) = e.location() {
                    self.print_config_read_error_context(
                        &final_yaml_str,
                        location.line().saturating_sub(5),
                        7,
                    );
                }
                bail!(e);
            }
        }

        self.check_numeric_constraints()?;
        self.resolve_input_slots();
        Ok(())
    }

    fn read_version(yaml: &YamlValue) -> Option<String> {
        match yaml.get(VERSION_YAML_KEY)? {
            YamlValue::String(s) => Some(s.trim().to_string()),
            YamlValue::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    fn print_config_read_error_context(&self, src: &str, line0: usize, after: usize) {
        let start = line0;
        let end = line0.saturating_add(after);
        log::error!(" ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~ ");
        log::error!("... Context around erroneous config snippet: \n");
        for (i, line) in src.lines().enumerate() {
            if i < start {
                continue;
            } else if i > end {
                break;
            }
            log::error!("{:>6} | {}", i + 1, line);
        }
        log::error!(" ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~ ");
    }

    fn check_numeric_constraints(&self) -> Result<()> {
        self.config
            .global
            .validate()
            .map_err(|e| anyhow!("Invalid global settings: {e}"))?;

        for (key, slot) in &self.config.inputs {
            slot.validate()
                .map_err(|e| anyhow!("Invalid settings of input '{key}': {e}"))?;
            for (axis, entry) in &slot.axes {
                let entry = AxisEntry::from_entry(entry);
                entry
                    .settings
                    .validate()
                    .map_err(|e| anyhow!("Invalid settings of '{key}/{axis}': {e}"))?;
                for (mode, settings) in &entry.modes {
                    settings
                        .validate()
                        .map_err(|e| anyhow!("Invalid '{mode}' settings of '{key}/{axis}': {e}"))?;
                }
            }
        }
        Ok(())
    }

    fn resolve_input_slots(&mut self) {
        let mut issues = BTreeSet::new();
        let mut resolved = Vec::new();

        for (key, slot) in &self.config.inputs {
            if !slot.enabled {
                if self.debug {
                    debug!("Input '{key}' is disabled, skipping.");
                }
                continue;
            }
            match self.resolve_input_slot(key, slot, &mut issues) {
                Some(slot) => resolved.push(slot),
                None => continue,
            }
        }

        for issue in &issues {
            warn!("{issue}");
        }
        self.input_slots = resolved;
        self.issues = issues.into_iter().collect();
    }

    fn resolve_input_slot(
        &self,
        key: &str,
        slot: &InputSlot,
        issues: &mut BTreeSet<String>,
    ) -> Option<ResolvedInputSlot> {
        let class = match DeviceClass::from_str(&slot.class) {
            Ok(DeviceClass::GameControl) => DeviceClass::GameControl,
            Ok(other) => {
                issues.insert(format!("Input '{key}': device class '{other}' is not supported"));
                return None;
            }
            Err(_) => {
                issues.insert(format!("Input '{key}': unknown device class '{}'", slot.class));
                return None;
            }
        };

        let dead_zone = slot.dead_zone.unwrap_or(self.config.global.dead_zone);
        let factor = slot.factor.unwrap_or(self.config.global.factor);
        let enabled_modes = ModeTable::from_fn(|mode| {
            mode == Mode::Flight
                || slot
                    .modes
                    .as_ref()
                    .map_or(true, |modes| modes.contains(&mode))
        });

        let mut axes = BTreeMap::new();
        for (axis, entry) in &slot.axes {
            let entry = AxisEntry::from_entry(entry);
            let context = format!("{key}/{axis}");
            let table = per_mode(&enabled_modes, |mode| {
                resolve_axis(&entry.settings_for(mode), dead_zone, factor, &context, issues)
            });
            axes.insert(*axis, table);
        }

        let mut buttons = BTreeMap::new();
        for (name, entry) in &slot.buttons {
            let index = match SampleOffset::from_str(name) {
                Ok(SampleOffset::Button(index)) => index,
                _ => {
                    issues.insert(format!("Input '{key}': '{name}' is not a button name"));
                    continue;
                }
            };
            let button = ButtonEntry::from_entry(entry);
            let context = format!("{key}/{name}");
            let table = per_mode(&enabled_modes, |mode| {
                resolve_button(&button.settings_for(mode), &context, issues)
            });
            buttons.insert(index, table);
        }

        let mut povs = BTreeMap::new();
        for (name, entry) in &slot.povs {
            let index = match SampleOffset::from_str(name) {
                Ok(SampleOffset::Pov(index)) => index,
                _ => {
                    issues.insert(format!("Input '{key}': '{name}' is not a POV name"));
                    continue;
                }
            };
            let directions = entry.directions().map(|direction| {
                let button = direction.map(ButtonEntry::from_entry).unwrap_or_default();
                let context = format!("{key}/{name}");
                per_mode(&enabled_modes, |mode| {
                    resolve_button(&button.settings_for(mode), &context, issues)
                })
            });
            povs.insert(index, directions);
        }

        if self.debug {
            debug!(
                "Input '{key}': {} axes, {} buttons, {} POVs bound",
                axes.len(),
                buttons.len(),
                povs.len()
            );
        }

        Some(ResolvedInputSlot {
            key: key.to_string(),
            class,
            match_name_regex: slot.match_name_regex.clone(),
            dead_zone,
            factor,
            enabled_modes,
            axes,
            buttons,
            povs,
        })
    }

    /// The version found in the loaded file when it differs from the one
    /// this build understands.
    pub fn version_mismatch(&self) -> Option<String> {
        if self.found_version.as_deref() == Some(CONFIG_VERSION_STR) {
            None
        } else {
            Some(
                self.found_version
                    .clone()
                    .unwrap_or_else(|| "<none>".to_string()),
            )
        }
    }

    pub fn version_mismatch_message(&self) -> String {
        format!(
            "Config file ignored due to version mismatch (got v{}, required v{CONFIG_VERSION_STR})",
            self.found_version.as_deref().unwrap_or("<none>")
        )
    }

    /// Every issue found while loading. Bindings with issues stay unbound.
    pub fn validate(&self) -> Result<Vec<String>> {
        let mut errors = self.issues.clone();
        if self.version_mismatch().is_none() && self.input_slots.is_empty() {
            errors.push("No enabled game controller inputs are configured".to_string());
        }
        Ok(errors)
    }

    pub(crate) fn get_config(&self) -> &Config {
        &self.config
    }

    pub fn get_input_slots(&self) -> &[ResolvedInputSlot] {
        &self.input_slots
    }

    pub fn tick_rate(&self) -> u32 {
        self.config.global.tick_rate
    }

    pub fn stabilization_threshold(&self) -> f32 {
        self.config.global.stabilization_threshold
    }

    pub fn log_summary(&self) {
        info!(
            "Config v{}: {} input slot(s), tick rate {} Hz{}",
            self.found_version.as_deref().unwrap_or("<none>"),
            self.input_slots.len(),
            self.config.global.tick_rate,
            self.config
                .created_by
                .as_ref()
                .map(|by| format!(", created by {by}"))
                .unwrap_or_default()
        );
    }
}

/// Flight is always resolved. Modes the device does not enable reuse the
/// Flight result.
fn per_mode<T: Clone>(
    enabled_modes: &ModeTable<bool>,
    mut resolve: impl FnMut(Mode) -> T,
) -> ModeTable<T> {
    let flight = resolve(Mode::Flight);
    ModeTable::from_fn(|mode| {
        if mode == Mode::Flight || !enabled_modes[mode] {
            flight.clone()
        } else {
            resolve(mode)
        }
    })
}

fn resolve_mapping(
    entry: Option<&MappingEntry>,
    default_kind: MappingType,
    context: &str,
    issues: &mut BTreeSet<String>,
) -> Mapping {
    let resolved = match entry {
        None => return Mapping::unbound(),
        Some(ControlEntry::Shorthand(literal)) => Mapping::parse_literal(literal, default_kind),
        Some(ControlEntry::Full(def)) => Action::from_str(&def.action).map(|action| {
            Mapping::new(
                def.kind.unwrap_or(default_kind),
                action,
                def.value.unwrap_or(Mapping::DEFAULT_VALUE),
            )
        }),
    };
    resolved.unwrap_or_else(|e| {
        issues.insert(format!("{context}: {e:#}, binding left unbound"));
        Mapping::unbound()
    })
}

fn resolve_axis(
    settings: &AxisSettings,
    dead_zone: f32,
    factor: f32,
    context: &str,
    issues: &mut BTreeSet<String>,
) -> AxisBinding {
    let kind = settings.control.unwrap_or_default();
    let control = Control::new(
        kind,
        settings.inverted.unwrap_or(false),
        settings.dead_zone.unwrap_or(dead_zone),
        settings.factor.unwrap_or(factor),
    );
    let primary = match kind {
        ControlType::Axis => settings.mapping.as_ref(),
        ControlType::OneShot | ControlType::Continuous => {
            settings.negative.as_ref().or(settings.mapping.as_ref())
        }
    };
    if kind == ControlType::Axis && settings.positive.is_some() {
        issues.insert(format!(
            "{context}: 'positive' is only used by one_shot and continuous controls"
        ));
    }
    AxisBinding {
        control,
        mapping1: resolve_mapping(primary, MappingType::Range, context, issues),
        mapping2: match kind {
            ControlType::Axis => Mapping::unbound(),
            _ => resolve_mapping(settings.positive.as_ref(), MappingType::Range, context, issues),
        },
    }
}

fn resolve_button(
    settings: &ButtonSettings,
    context: &str,
    issues: &mut BTreeSet<String>,
) -> ButtonBinding {
    ButtonBinding {
        mapping: resolve_mapping(
            settings.mapping.as_ref(),
            MappingType::Absolute,
            context,
            issues,
        ),
        continuous: settings.continuous.unwrap_or(false),
    }
}
