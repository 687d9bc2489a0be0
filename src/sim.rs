//! In-memory backend and host, used by the `replay` task and by tests.

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fs;
use std::path::Path;

use crate::action::HostCommand;
use crate::common::{AxisId, NumInterval, RawSample};
use crate::config::ConfigManager;
use crate::control_state::ControlState;
use crate::host::{
    AxisProbe, DeviceCapabilities, DeviceClass, DeviceHandle, DeviceId, DeviceInfo, Host,
    InputBackend,
};
use crate::mapping::MappingEngine;
use crate::mode::Mode;

/// Time acceleration rates stepped through by warp commands.
const TIME_ACCELERATION_STEPS: [f32; 8] = [1.0, 5.0, 10.0, 50.0, 100.0, 1000.0, 10000.0, 100000.0];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScriptedDevice {
    pub id: String,
    pub name: String,
    /// Raw `[min, max]` per present axis.
    #[serde(default)]
    pub axes: BTreeMap<AxisId, [i32; 2]>,
    /// Axes whose range query fails.
    #[serde(default)]
    pub failing_axes: Vec<AxisId>,
    #[serde(default)]
    pub buttons: u32,
    #[serde(default)]
    pub povs: u32,
}

impl ScriptedDevice {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_axis(mut self, axis: AxisId, min: i32, max: i32) -> Self {
        self.axes.insert(axis, [min, max]);
        self
    }

    pub fn with_failing_axis(mut self, axis: AxisId) -> Self {
        self.failing_axes.push(axis);
        self
    }

    pub fn with_buttons(mut self, buttons: u32) -> Self {
        self.buttons = buttons;
        self
    }

    pub fn with_povs(mut self, povs: u32) -> Self {
        self.povs = povs;
        self
    }

    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            id: DeviceId(self.id.clone()),
            name: self.name.clone(),
        }
    }
}

/// `InputBackend` over declared devices and queued sample batches. Every
/// poll hands out the next queued batch of that device.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    devices: Vec<ScriptedDevice>,
    handles: BTreeMap<usize, DeviceId>,
    next_handle: usize,
    queued: HashMap<DeviceId, VecDeque<Vec<RawSample>>>,
    failing_polls: HashSet<DeviceId>,
    open_calls: usize,
    close_calls: usize,
}

impl ScriptedBackend {
    pub fn add_device(&mut self, device: ScriptedDevice) {
        self.devices.push(device);
    }

    pub fn device_info(&self, id: &str) -> Option<DeviceInfo> {
        self.devices
            .iter()
            .find(|device| device.id == id)
            .map(ScriptedDevice::info)
    }

    pub fn queue_samples(&mut self, id: &str, samples: Vec<RawSample>) {
        self.queued
            .entry(DeviceId::from(id))
            .or_default()
            .push_back(samples);
    }

    pub fn fail_polls(&mut self, id: &str, failing: bool) {
        if failing {
            self.failing_polls.insert(DeviceId::from(id));
        } else {
            self.failing_polls.remove(&DeviceId::from(id));
        }
    }

    pub fn is_open(&self, id: &str) -> bool {
        self.handles.values().any(|open| open.0 == id)
    }

    pub fn open_handle_count(&self) -> usize {
        self.handles.len()
    }

    /// Calls to `open` and `close` so far, successful or not.
    pub fn call_counts(&self) -> (usize, usize) {
        (self.open_calls, self.close_calls)
    }

    fn device_for(&self, handle: DeviceHandle) -> Result<&ScriptedDevice> {
        let Some(id) = self.handles.get(&handle.0) else {
            bail!("Handle {} is not open", handle.0);
        };
        self.devices
            .iter()
            .find(|device| device.id == id.0)
            .with_context(|| format!("Device '{id}' disappeared"))
    }
}

impl InputBackend for ScriptedBackend {
    fn enumerate_devices(&mut self, class: DeviceClass) -> Result<Vec<DeviceInfo>> {
        if class != DeviceClass::GameControl {
            return Ok(Vec::new());
        }
        Ok(self.devices.iter().map(ScriptedDevice::info).collect())
    }

    fn open(&mut self, id: &DeviceId) -> Result<DeviceHandle> {
        self.open_calls += 1;
        if !self.devices.iter().any(|device| device.id == id.0) {
            bail!("No device '{id}'");
        }
        self.handles.retain(|_, open| open != id);
        self.next_handle += 1;
        self.handles.insert(self.next_handle, id.clone());
        Ok(DeviceHandle(self.next_handle))
    }

    fn close(&mut self, handle: DeviceHandle) -> Result<()> {
        self.close_calls += 1;
        self.handles.remove(&handle.0);
        Ok(())
    }

    fn capabilities(&self, handle: DeviceHandle) -> Result<DeviceCapabilities> {
        let device = self.device_for(handle)?;
        Ok(DeviceCapabilities {
            buttons: device.buttons,
            povs: device.povs,
        })
    }

    fn query_axis_range(&self, handle: DeviceHandle, axis: AxisId) -> Result<AxisProbe> {
        let device = self.device_for(handle)?;
        if device.failing_axes.contains(&axis) {
            bail!("I/O error reading {axis} of '{}'", device.name);
        }
        Ok(device
            .axes
            .get(&axis)
            .map_or(AxisProbe::NotPresent, |[min, max]| {
                AxisProbe::Available(NumInterval::new(*min, *max))
            }))
    }

    fn poll(&mut self, handle: DeviceHandle) -> Result<Vec<RawSample>> {
        let id = self.device_for(handle)?.id.clone();
        let id = DeviceId(id);
        if self.failing_polls.contains(&id) {
            bail!("Device '{id}' stopped responding");
        }
        Ok(self
            .queued
            .get_mut(&id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_default())
    }
}

//-------------------------------------------------------------
/// `Host` that records what the engine asks of it.
#[derive(Debug)]
pub struct SimulatedHost {
    pub subject_present: bool,
    pub grounded: bool,
    pub time_acceleration_rate: f32,
    pub stabilization_threshold: f32,
    /// Last decision, `None` until the first merged tick.
    pub stabilization_override: Option<bool>,
    pub commands: Vec<HostCommand>,
    pub messages: Vec<String>,
}

impl Default for SimulatedHost {
    fn default() -> Self {
        Self {
            subject_present: true,
            grounded: false,
            time_acceleration_rate: 1.0,
            stabilization_threshold: 0.05,
            stabilization_override: None,
            commands: Vec::new(),
            messages: Vec::new(),
        }
    }
}

impl SimulatedHost {
    pub fn new(stabilization_threshold: f32) -> Self {
        Self {
            stabilization_threshold,
            ..Default::default()
        }
    }

    fn step_time_acceleration(&mut self, step: i8) {
        let current = self.time_acceleration_rate;
        let next = if step > 0 {
            TIME_ACCELERATION_STEPS
                .iter()
                .copied()
                .find(|rate| *rate > current)
                .unwrap_or(current)
        } else {
            TIME_ACCELERATION_STEPS
                .iter()
                .rev()
                .copied()
                .find(|rate| *rate < current)
                .unwrap_or(1.0)
        };
        self.time_acceleration_rate = next;
        info!("Time acceleration {current}x -> {next}x");
    }
}

impl Host for SimulatedHost {
    fn is_subject_present(&self) -> bool {
        self.subject_present
    }

    fn is_subject_grounded(&self) -> bool {
        self.grounded
    }

    fn time_acceleration_rate(&self) -> f32 {
        self.time_acceleration_rate
    }

    fn stabilization_detection_threshold(&self) -> f32 {
        self.stabilization_threshold
    }

    fn set_stabilization_override(&mut self, active: bool) {
        if self.stabilization_override != Some(active) {
            debug!("Stabilization override {}", if active { "on" } else { "off" });
        }
        self.stabilization_override = Some(active);
    }

    fn execute(&mut self, command: HostCommand) {
        info!("Host command: {command:?}");
        if let HostCommand::ChangeTimeAcceleration(step) = command {
            self.step_time_acceleration(step);
        }
        self.commands.push(command);
    }

    fn post_message(&mut self, message: &str) {
        warn!("{message}");
        self.messages.push(message.to_string());
    }
}

//-------------------------------------------------------------
/// Declared devices and per-tick samples and host conditions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplayScript {
    pub devices: Vec<ScriptedDevice>,
    #[serde(default)]
    pub ticks: Vec<ReplayTick>,
}

/// Host conditions hold from the tick that sets them on.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplayTick {
    /// Device id to `Offset=value` samples.
    #[serde(default)]
    pub samples: BTreeMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grounded: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_acceleration: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_present: Option<bool>,
    /// Host-side mode switch request before the tick.
    #[serde(default)]
    pub switch_mode: bool,
}

/// Outcome of one replayed tick.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayFrame {
    pub state: ControlState,
    pub mode: Mode,
    pub commands: Vec<HostCommand>,
    pub stabilization_override: Option<bool>,
}

impl ReplayScript {
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse replay script")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read replay script {}", path.display()))?;
        Self::from_yaml_str(&content)
    }

    /// Runs the script against `config`. Ticks under time acceleration go
    /// through the accelerated callback.
    pub fn run(&self, config: &ConfigManager, debug: bool) -> Result<Vec<ReplayFrame>> {
        let mut backend = ScriptedBackend::default();
        for device in &self.devices {
            backend.add_device(device.clone());
        }
        let mut host = SimulatedHost::new(config.stabilization_threshold());
        let mut engine = MappingEngine::new(debug);
        let status = engine.activate(config, &mut backend, &mut host)?;
        info!("Replay engine status: {status:?}");

        let mut frames = Vec::with_capacity(self.ticks.len());
        for (number, tick) in self.ticks.iter().enumerate() {
            if let Some(grounded) = tick.grounded {
                host.grounded = grounded;
            }
            if let Some(rate) = tick.time_acceleration {
                host.time_acceleration_rate = rate;
            }
            if let Some(present) = tick.subject_present {
                host.subject_present = present;
            }
            for (device, samples) in &tick.samples {
                let samples = samples
                    .iter()
                    .map(|sample| sample.parse::<RawSample>())
                    .collect::<Result<Vec<_>>>()
                    .with_context(|| format!("Tick {number}, device '{device}'"))?;
                backend.queue_samples(device, samples);
            }

            let issued_before = host.commands.len();
            if tick.switch_mode {
                engine.on_mode_switch_requested(&mut host);
            }
            let mut state = ControlState::default();
            if host.is_time_accelerated() {
                engine.on_accelerated_tick(&mut backend, &mut host);
            } else {
                engine.on_tick(&mut backend, &mut host, &mut state);
            }

            let frame = ReplayFrame {
                state,
                mode: engine.current_mode(),
                commands: host.commands[issued_before..].to_vec(),
                stabilization_override: host.stabilization_override,
            };
            info!("#{number:<4} [{}] {}", frame.mode, frame.state);
            frames.push(frame);
        }

        engine.shutdown(&mut backend);
        if debug {
            let (opened, closed) = backend.call_counts();
            debug!("Replay done: {opened} open and {closed} close call(s)");
        }
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const CONFIG: &str = r#"
version: "1.3"
inputs:
  stick:
    axes:
      AxisX: roll
    buttons:
      Button1: increaseWarp
      Button2: switchMode
"#;

    const SCRIPT: &str = r#"
devices:
  - id: js0
    name: Test Stick
    axes:
      AxisX: [0, 1000]
    buttons: 2
ticks:
  - samples:
      js0: ["AxisX=750"]
  - {}
  - samples:
      js0: ["Button2=128"]
  - samples:
      js0: ["Button1=128"]
  - samples:
      js0: ["AxisX=1000"]
  - subject_present: false
"#;

    #[test]
    fn test_replay_script_runs() {
        let config = ConfigManager::from_yaml_str(CONFIG, false).unwrap();
        let script = ReplayScript::from_yaml_str(SCRIPT).unwrap();
        let frames = script.run(&config, false).unwrap();
        assert_eq!(frames.len(), 6);

        assert!((frames[0].state.roll - 0.5).abs() < 0.001);
        assert!((frames[1].state.roll - 0.5).abs() < 0.001);
        assert_eq!(frames[0].stabilization_override, Some(true));

        assert_eq!(frames[2].mode, Mode::AltFlight);
        assert_eq!(frames[2].state.roll, 0.0);

        assert_eq!(frames[3].commands, vec![HostCommand::ChangeTimeAcceleration(1)]);
        // Warp is now on: the axis sample goes through the accelerated tick.
        assert_eq!(frames[4].state, ControlState::default());
        assert_eq!(frames[5].state, ControlState::default());
    }

    #[test]
    fn test_shipped_demo_replays() {
        let config =
            ConfigManager::from_yaml_str(include_str!("../conf/skyjoy_cfg.yaml"), false).unwrap();
        assert!(config.validate().unwrap().is_empty());
        let script =
            ReplayScript::from_yaml_str(include_str!("../demos/replay_demo.yaml")).unwrap();
        let frames = script.run(&config, false).unwrap();
        assert_eq!(frames.len(), 8);

        assert_eq!(
            frames[0].commands,
            vec![HostCommand::ToggleGroup(crate::action::ActionGroup::Sas)]
        );
        assert!((frames[0].state.main_throttle - 1.0).abs() < 0.001);
        assert!((frames[0].state.roll - 0.5).abs() < 0.001);
        assert!((frames[2].state.pitch_trim - 0.01).abs() < 0.0001);
        assert!((frames[3].state.yaw - 0.5).abs() < 0.01);
        assert_eq!(frames[3].state.roll, 0.0);
        assert_eq!(frames[4].state.main_throttle, 0.0);
        assert_eq!(frames[5].mode, Mode::AltFlight);
        assert_eq!(frames[6].mode, Mode::Ground);
        assert!((frames[7].state.wheel_steer + 1.0).abs() < 0.001);
    }

    #[test]
    fn test_bad_sample_fails_replay() {
        let config = ConfigManager::from_yaml_str(CONFIG, false).unwrap();
        let script = ReplayScript::from_yaml_str(
            "devices: [{id: js0, name: Stick}]\nticks:\n  - samples: {js0: [\"Wheel=3\"]}\n",
        )
        .unwrap();
        assert!(script.run(&config, false).is_err());
    }

    #[test]
    fn test_backend_reopen_releases_old_handle() {
        let mut backend = ScriptedBackend::default();
        backend.add_device(ScriptedDevice::new("a", "A").with_axis(AxisId::AxisX, 0, 10));
        let id = DeviceId::from("a");
        let first = backend.open(&id).unwrap();
        let second = backend.open(&id).unwrap();
        assert_ne!(first, second);
        assert_eq!(backend.open_handle_count(), 1);
        assert!(backend.capabilities(first).is_err());
        assert_eq!(
            backend.query_axis_range(second, AxisId::AxisX).unwrap(),
            AxisProbe::Available(NumInterval::new(0, 10))
        );
        assert_eq!(
            backend.query_axis_range(second, AxisId::AxisY).unwrap(),
            AxisProbe::NotPresent
        );
        assert!(backend.open(&DeviceId::from("b")).is_err());
        backend.close(second).unwrap();
        backend.close(second).unwrap();
        assert_eq!(backend.open_handle_count(), 0);
        assert_eq!(backend.call_counts(), (3, 2));
    }

    #[test]
    fn test_warp_steps() {
        let mut host = SimulatedHost::default();
        host.execute(HostCommand::ChangeTimeAcceleration(1));
        host.execute(HostCommand::ChangeTimeAcceleration(1));
        assert_eq!(host.time_acceleration_rate, 10.0);
        host.execute(HostCommand::ChangeTimeAcceleration(-1));
        assert_eq!(host.time_acceleration_rate, 5.0);
        assert_eq!(host.commands.len(), 3);
    }
}
