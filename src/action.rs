use anyhow::{anyhow, bail, Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use strum_macros::{Display, EnumString};

use crate::control_state::{Channel, ControlState};
use crate::host::Host;
use crate::mode::Mode;

/// Host action groups reachable through `toggle<Group>` / `set<Group>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display)]
pub enum ActionGroup {
    Stage,
    Gear,
    Light,
    #[strum(serialize = "RCS")]
    Rcs,
    #[strum(serialize = "SAS")]
    Sas,
    Brakes,
    Abort,
}

pub const CUSTOM_GROUP_COUNT: u8 = 10;

/// Discrete commands executed by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostCommand {
    ActivateNextStage,
    ToggleGroup(ActionGroup),
    SetGroup(ActionGroup, bool),
    /// 1-based custom group number.
    ToggleCustomGroup(u8),
    SwitchCameraView,
    ToggleMapView,
    /// +1 to speed time up one step, -1 to slow it down.
    ChangeTimeAcceleration(i8),
}

/// Every command name a binding may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    ActivateNextStage,
    ToggleGroup(ActionGroup),
    SetGroup(ActionGroup),
    ToggleCustomGroup(u8),
    SwitchView,
    ToggleMapView,
    SwitchMode,
    IncreaseWarp,
    DecreaseWarp,
    KillThrottle,
    FullThrottle,
}

impl Command {
    /// Commands still honoured while the host runs time accelerated.
    pub fn allowed_during_time_acceleration(&self) -> bool {
        matches!(
            self,
            Command::SwitchView
                | Command::ToggleMapView
                | Command::SwitchMode
                | Command::IncreaseWarp
                | Command::DecreaseWarp
        )
    }

    fn host_command(&self, active: bool) -> Option<HostCommand> {
        match self {
            Command::ActivateNextStage => Some(HostCommand::ActivateNextStage),
            Command::ToggleGroup(group) => Some(HostCommand::ToggleGroup(*group)),
            Command::SetGroup(group) => Some(HostCommand::SetGroup(*group, active)),
            Command::ToggleCustomGroup(n) => Some(HostCommand::ToggleCustomGroup(*n)),
            Command::SwitchView => Some(HostCommand::SwitchCameraView),
            Command::ToggleMapView => Some(HostCommand::ToggleMapView),
            Command::IncreaseWarp => Some(HostCommand::ChangeTimeAcceleration(1)),
            Command::DecreaseWarp => Some(HostCommand::ChangeTimeAcceleration(-1)),
            Command::SwitchMode | Command::KillThrottle | Command::FullThrottle => None,
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::ActivateNextStage => write!(f, "activateNextStage"),
            Command::ToggleGroup(group) => write!(f, "toggle{group}"),
            Command::SetGroup(group) => write!(f, "set{group}"),
            Command::ToggleCustomGroup(n) => write!(f, "toggleCustom{n:02}"),
            Command::SwitchView => write!(f, "switchView"),
            Command::ToggleMapView => write!(f, "toggleMapView"),
            Command::SwitchMode => write!(f, "switchMode"),
            Command::IncreaseWarp => write!(f, "increaseWarp"),
            Command::DecreaseWarp => write!(f, "decreaseWarp"),
            Command::KillThrottle => write!(f, "killThrottle"),
            Command::FullThrottle => write!(f, "fullThrottle"),
        }
    }
}

impl FromStr for Command {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let command = match s {
            "activateNextStage" => Command::ActivateNextStage,
            "switchView" => Command::SwitchView,
            "toggleMapView" => Command::ToggleMapView,
            "switchMode" => Command::SwitchMode,
            "increaseWarp" => Command::IncreaseWarp,
            "decreaseWarp" => Command::DecreaseWarp,
            "killThrottle" => Command::KillThrottle,
            "fullThrottle" => Command::FullThrottle,
            _ => {
                if let Some(digits) = s.strip_prefix("toggleCustom") {
                    let n: u8 = digits
                        .parse()
                        .with_context(|| format!("Invalid custom group in '{s}'"))?;
                    if n == 0 || n > CUSTOM_GROUP_COUNT {
                        bail!("Custom group in '{s}' must be within 1..={CUSTOM_GROUP_COUNT}");
                    }
                    Command::ToggleCustomGroup(n)
                } else if let Some(group) = s.strip_prefix("toggle") {
                    Command::ToggleGroup(ActionGroup::from_str(group)?)
                } else if let Some(group) = s.strip_prefix("set") {
                    Command::SetGroup(ActionGroup::from_str(group)?)
                } else {
                    bail!("Unknown command '{s}'");
                }
            }
        };
        Ok(command)
    }
}

/// What a binding drives, resolved once when the configuration is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Action {
    #[default]
    Unbound,
    Channel(Channel),
    Command(Command),
}

impl Action {
    pub fn channel(&self) -> Option<Channel> {
        match self {
            Action::Channel(channel) => Some(*channel),
            _ => None,
        }
    }

    pub fn is_unbound(&self) -> bool {
        *self == Action::Unbound
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Unbound => write!(f, "<unbound>"),
            Action::Channel(channel) => write!(f, "{channel}"),
            Action::Command(command) => write!(f, "{command}"),
        }
    }
}

impl FromStr for Action {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Action::Unbound);
        }
        if let Ok(channel) = Channel::from_str(s) {
            return Ok(Action::Channel(channel));
        }
        Command::from_str(s)
            .map(Action::Command)
            .map_err(|_| anyhow!("Unknown action '{s}'"))
    }
}

//-------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
#[serde(rename_all = "snake_case")]
pub enum MappingType {
    /// The incoming value is the output.
    #[default]
    Range,
    /// Fixed `value` while active, 0 otherwise.
    Absolute,
    /// `value` added to the current output while active.
    Delta,
}

/// A binding from a physical control to an action.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mapping {
    pub kind: MappingType,
    pub action: Action,
    pub value: f32,
}

impl Default for Mapping {
    fn default() -> Self {
        Self::unbound()
    }
}

impl Mapping {
    pub const DEFAULT_VALUE: f32 = 1.0;

    pub fn new(kind: MappingType, action: Action, value: f32) -> Self {
        Self {
            kind,
            action,
            value,
        }
    }

    pub fn unbound() -> Self {
        Self::new(MappingType::Range, Action::Unbound, Self::DEFAULT_VALUE)
    }

    /// Parses `"[type ]action[ value]"`, e.g. `"yaw"`, `"pitch -0.5"` or
    /// `"delta mainThrottle 0.1"`.
    pub fn parse_literal(literal: &str, default_kind: MappingType) -> Result<Self> {
        let mut tokens = literal.split_whitespace().peekable();
        let kind = match tokens.peek().map(|t| MappingType::from_str(t)) {
            Some(Ok(kind)) => {
                tokens.next();
                kind
            }
            _ => default_kind,
        };
        let action = match tokens.next() {
            Some(name) => Action::from_str(name)?,
            None => Action::Unbound,
        };
        let value = match tokens.next() {
            Some(token) => token
                .parse::<f32>()
                .with_context(|| format!("Malformed value '{token}' in mapping '{literal}'"))?,
            None => Self::DEFAULT_VALUE,
        };
        if let Some(extra) = tokens.next() {
            bail!("Unexpected '{extra}' in mapping '{literal}'");
        }
        Ok(Self::new(kind, action, value))
    }

    /// New output of the bound channel given its current value and the
    /// incoming value; `None` leaves the channel untouched.
    pub fn output(&self, current: f32, input: f32) -> Option<f32> {
        match self.kind {
            MappingType::Range => Some(input),
            MappingType::Absolute => Some(if input != 0.0 { self.value } else { 0.0 }),
            MappingType::Delta => (input != 0.0).then_some(current + self.value),
        }
    }
}

impl std::fmt::Display for Mapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", self.kind, self.action, self.value)
    }
}

//-------------------------------------------------------------
/// Side effects a batch of dispatches asks the engine to carry out.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub(crate) struct DispatchOutcome {
    pub(crate) mode_switch_requested: bool,
    pub(crate) throttle_override: Option<f32>,
}

/// Per-device, per-tick view through which bindings reach the outside:
/// the device's layer of the accumulated state and the host.
pub(crate) struct DispatchContext<'a> {
    mode: Mode,
    accelerated: bool,
    layer: Option<&'a mut ControlState>,
    host: &'a mut dyn Host,
    outcome: DispatchOutcome,
    debug: bool,
}

impl<'a> DispatchContext<'a> {
    pub(crate) fn new(
        mode: Mode,
        accelerated: bool,
        layer: Option<&'a mut ControlState>,
        host: &'a mut dyn Host,
        debug: bool,
    ) -> Self {
        Self {
            mode,
            accelerated,
            layer,
            host,
            outcome: DispatchOutcome::default(),
            debug,
        }
    }

    pub(crate) fn mode(&self) -> Mode {
        self.mode
    }

    pub(crate) fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    pub(crate) fn dispatch(&mut self, mapping: &Mapping, input: f32) {
        match mapping.action {
            Action::Unbound => {}
            Action::Channel(channel) => {
                if self.accelerated {
                    return;
                }
                let Some(layer) = self.layer.as_deref_mut() else {
                    return;
                };
                if let Some(value) = mapping.output(layer.get(channel), input) {
                    layer.set(channel, value);
                    if self.debug {
                        debug!("{channel} <- {:.3} ({mapping})", layer.get(channel));
                    }
                }
            }
            Action::Command(command) => self.run_command(command, input != 0.0),
        }
    }

    fn run_command(&mut self, command: Command, active: bool) {
        if self.accelerated && !command.allowed_during_time_acceleration() {
            if self.debug && active {
                debug!("'{command}' suppressed during time acceleration");
            }
            return;
        }
        if !active && !matches!(command, Command::SetGroup(_)) {
            return;
        }
        match command {
            Command::SwitchMode => self.outcome.mode_switch_requested = true,
            Command::KillThrottle => self.outcome.throttle_override = Some(0.0),
            Command::FullThrottle => self.outcome.throttle_override = Some(1.0),
            other => {
                if let Some(host_command) = other.host_command(active) {
                    if self.debug {
                        debug!("Executing {host_command:?}");
                    }
                    self.host.execute(host_command);
                }
            }
        }
    }

    /// Writes a channel directly, bypassing mapping semantics.
    pub(crate) fn force_channel(&mut self, channel: Channel, value: f32) {
        if let Some(layer) = self.layer.as_deref_mut() {
            layer.set(channel, value);
        }
    }

    pub(crate) fn take_outcome(&mut self) -> DispatchOutcome {
        std::mem::take(&mut self.outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedHost;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_action_names_resolve() {
        assert_eq!(
            "mainThrottle".parse::<Action>().unwrap(),
            Action::Channel(Channel::MainThrottle)
        );
        assert_eq!(
            "toggleSAS".parse::<Action>().unwrap(),
            Action::Command(Command::ToggleGroup(ActionGroup::Sas))
        );
        assert_eq!(
            "setBrakes".parse::<Action>().unwrap(),
            Action::Command(Command::SetGroup(ActionGroup::Brakes))
        );
        assert_eq!(
            "toggleCustom07".parse::<Action>().unwrap(),
            Action::Command(Command::ToggleCustomGroup(7))
        );
        assert_eq!("".parse::<Action>().unwrap(), Action::Unbound);
        assert!("toggleCustom11".parse::<Action>().is_err());
        assert!("doABarrelRoll".parse::<Action>().is_err());
        assert!("Pitch".parse::<Action>().is_err());
    }

    #[test]
    fn test_command_names_round_trip() {
        for name in [
            "activateNextStage",
            "toggleGear",
            "toggleRCS",
            "setLight",
            "toggleCustom10",
            "switchView",
            "toggleMapView",
            "switchMode",
            "increaseWarp",
            "decreaseWarp",
            "killThrottle",
            "fullThrottle",
        ] {
            let command: Command = name.parse().unwrap();
            assert_eq!(command.to_string(), name);
        }
    }

    #[test]
    fn test_mapping_literals() {
        let m = Mapping::parse_literal("yaw", MappingType::Range).unwrap();
        assert_eq!(m, Mapping::new(MappingType::Range, Action::Channel(Channel::Yaw), 1.0));

        let m = Mapping::parse_literal("pitch -0.5", MappingType::Absolute).unwrap();
        assert_eq!(m.kind, MappingType::Absolute);
        assert_eq!(m.value, -0.5);

        let m = Mapping::parse_literal("Delta mainThrottle 0.1", MappingType::Absolute).unwrap();
        assert_eq!(m.kind, MappingType::Delta);
        assert_eq!(m.action, Action::Channel(Channel::MainThrottle));

        assert!(Mapping::parse_literal("pitch abc", MappingType::Range).is_err());
        assert!(Mapping::parse_literal("pitch 1 2", MappingType::Range).is_err());
        assert!(Mapping::parse_literal("wobble", MappingType::Range).is_err());
    }

    #[test]
    fn test_mapping_output() {
        let range = Mapping::new(MappingType::Range, Action::Channel(Channel::Yaw), 1.0);
        assert_eq!(range.output(0.3, -0.2), Some(-0.2));

        let absolute = Mapping::new(MappingType::Absolute, Action::Channel(Channel::Yaw), 0.4);
        assert_eq!(absolute.output(0.0, 1.0), Some(0.4));
        assert_eq!(absolute.output(0.4, 0.0), Some(0.0));

        let delta = Mapping::new(MappingType::Delta, Action::Channel(Channel::MainThrottle), 0.1);
        assert_eq!(delta.output(0.5, 1.0), Some(0.6));
        assert_eq!(delta.output(0.5, 0.0), None);
    }

    #[test]
    fn test_delta_clamps_to_channel_range() {
        let mut host = SimulatedHost::default();
        let mut layer = ControlState {
            main_throttle: 0.95,
            ..Default::default()
        };
        let mapping = Mapping::new(MappingType::Delta, Action::Channel(Channel::MainThrottle), 0.1);
        let mut ctx = DispatchContext::new(Mode::Flight, false, Some(&mut layer), &mut host, false);
        ctx.dispatch(&mapping, 0.1);
        drop(ctx);
        assert_eq!(layer.main_throttle, 1.0);
    }

    #[test]
    fn test_commands_fire_on_activation_only() {
        let mut host = SimulatedHost::default();
        let stage = Mapping::parse_literal("activateNextStage", MappingType::Absolute).unwrap();
        let brakes = Mapping::parse_literal("setBrakes", MappingType::Absolute).unwrap();
        let mut ctx = DispatchContext::new(Mode::Flight, false, None, &mut host, false);
        ctx.dispatch(&stage, 1.0);
        ctx.dispatch(&stage, 0.0);
        ctx.dispatch(&brakes, 1.0);
        ctx.dispatch(&brakes, 0.0);
        drop(ctx);
        assert_eq!(
            host.commands,
            vec![
                HostCommand::ActivateNextStage,
                HostCommand::SetGroup(ActionGroup::Brakes, true),
                HostCommand::SetGroup(ActionGroup::Brakes, false),
            ]
        );
    }

    #[test]
    fn test_time_acceleration_allow_list() {
        let mut host = SimulatedHost::default();
        let mut layer = ControlState::default();
        let stage = Mapping::parse_literal("activateNextStage", MappingType::Absolute).unwrap();
        let warp = Mapping::parse_literal("increaseWarp", MappingType::Absolute).unwrap();
        let pitch = Mapping::parse_literal("pitch", MappingType::Range).unwrap();
        let mode = Mapping::parse_literal("switchMode", MappingType::Absolute).unwrap();
        let mut ctx = DispatchContext::new(Mode::Flight, true, Some(&mut layer), &mut host, false);
        ctx.dispatch(&stage, 1.0);
        ctx.dispatch(&warp, 1.0);
        ctx.dispatch(&pitch, 0.7);
        ctx.dispatch(&mode, 1.0);
        let outcome = ctx.take_outcome();
        drop(ctx);
        assert!(outcome.mode_switch_requested);
        assert_eq!(host.commands, vec![HostCommand::ChangeTimeAcceleration(1)]);
        assert_eq!(layer.pitch, 0.0);
    }

    #[test]
    fn test_throttle_commands_become_overrides() {
        let mut host = SimulatedHost::default();
        let kill = Mapping::parse_literal("killThrottle", MappingType::Absolute).unwrap();
        let mut ctx = DispatchContext::new(Mode::Flight, false, None, &mut host, false);
        ctx.dispatch(&kill, 1.0);
        assert_eq!(ctx.take_outcome().throttle_override, Some(0.0));
        assert_eq!(ctx.take_outcome(), DispatchOutcome::default());
    }
}
