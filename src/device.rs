use anyhow::{Context, Result};
use log::{debug, warn};
use std::collections::BTreeMap;

use crate::action::{DispatchContext, Mapping};
use crate::common::{
    is_pov_rest, AxisId, NumInterval, PovDirection, RawSample, SampleOffset, BUTTON_PRESSED_MASK,
    POV_REST,
};
use crate::conditioning::{
    apply_dead_zone, axis_output, continuous_side, orient, Edge, OneShotLatch, Side,
};
use crate::host::{AxisProbe, DeviceHandle, DeviceId, DeviceInfo, InputBackend};
use crate::mode::ModeTable;
use crate::schemas::{AxisBinding, ButtonBinding, ControlType, ResolvedInputSlot};

/// One physical axis. `range` is `None` when the axis is missing or its
/// range is degenerate; such an axis ignores every sample.
#[derive(Debug)]
pub(crate) struct Axis {
    id: AxisId,
    range: Option<NumInterval<i32>>,
    bindings: ModeTable<AxisBinding>,
    last_value: f32,
    latch: OneShotLatch,
    active_side: Option<Side>,
    fresh: bool,
}

impl Axis {
    fn new(id: AxisId, range: Option<NumInterval<i32>>, bindings: ModeTable<AxisBinding>) -> Self {
        Self {
            id,
            range,
            bindings,
            last_value: 0.0,
            latch: OneShotLatch::default(),
            active_side: None,
            fresh: false,
        }
    }

    pub(crate) fn is_available(&self) -> bool {
        self.range.is_some()
    }

    #[cfg(test)]
    pub(crate) fn last_value(&self) -> f32 {
        self.last_value
    }

    fn mapping_for(binding: &AxisBinding, side: Side) -> &Mapping {
        match side {
            Side::Negative => &binding.mapping1,
            Side::Positive => &binding.mapping2,
        }
    }

    fn process(&mut self, raw: i32, ctx: &mut DispatchContext) {
        let Some(range) = self.range else {
            return;
        };
        let binding = self.bindings[ctx.mode()];
        let oriented = orient(raw, &range, &binding.control);
        let value = apply_dead_zone(oriented, binding.control.dead_zone, self.id.is_slider());
        self.last_value = value;
        self.fresh = true;

        match binding.control.kind {
            ControlType::Axis => {
                let output = axis_output(
                    value,
                    binding.control.factor,
                    binding.mapping1.action.channel(),
                );
                ctx.dispatch(&binding.mapping1, output);
            }
            ControlType::OneShot => {
                // The latch thresholds stand in for the center dead-zone.
                for edge in self.latch.update(oriented, binding.control.dead_zone) {
                    match edge {
                        Edge::Press(side) => {
                            let mapping = Self::mapping_for(&binding, side);
                            ctx.dispatch(mapping, mapping.value);
                        }
                        Edge::Release(side) => ctx.dispatch(Self::mapping_for(&binding, side), 0.0),
                    }
                }
            }
            ControlType::Continuous => {
                let next = continuous_side(value);
                if let Some(previous) = self.active_side {
                    if next.map(|(side, _)| side) != Some(previous) {
                        ctx.dispatch(Self::mapping_for(&binding, previous), 0.0);
                    }
                }
                self.active_side = next.map(|(side, _)| side);
                if let Some((side, magnitude)) = next {
                    ctx.dispatch(Self::mapping_for(&binding, side), magnitude);
                }
            }
        }
    }

    /// Sides whose binding is currently asserted.
    fn held_sides(&self, binding: &AxisBinding) -> Vec<Side> {
        match binding.control.kind {
            ControlType::Axis => Vec::new(),
            ControlType::OneShot => [Side::Negative, Side::Positive]
                .into_iter()
                .filter(|side| self.latch.is_pressed(*side))
                .collect(),
            ControlType::Continuous => self.active_side.into_iter().collect(),
        }
    }

    fn reassert(&mut self, ctx: &mut DispatchContext) {
        if self.fresh || !self.is_available() || self.last_value == 0.0 {
            return;
        }
        let binding = self.bindings[ctx.mode()];
        if binding.control.kind != ControlType::Continuous {
            return;
        }
        if let Some((side, magnitude)) = continuous_side(self.last_value) {
            ctx.dispatch(Self::mapping_for(&binding, side), magnitude);
        }
    }

    fn reset(&mut self, ctx: &mut DispatchContext) {
        if !self.is_available() {
            return;
        }
        let binding = self.bindings[ctx.mode()];
        if let Some(channel) = binding.mapping1.action.channel() {
            if channel.is_throttle() {
                return;
            }
            ctx.force_channel(channel, 0.0);
        }
        for side in self.held_sides(&binding) {
            let mapping = Self::mapping_for(&binding, side);
            if mapping.action.channel().is_some_and(|channel| channel.is_throttle()) {
                continue;
            }
            ctx.dispatch(mapping, 0.0);
        }
        self.last_value = 0.0;
        self.latch.clear();
        self.active_side = None;
    }
}

/// A push button, or one direction of a hat switch.
#[derive(Debug)]
pub(crate) struct Button {
    bindings: ModeTable<ButtonBinding>,
    pressed: bool,
    fresh: bool,
}

impl Button {
    fn new(bindings: ModeTable<ButtonBinding>) -> Self {
        Self {
            bindings,
            pressed: false,
            fresh: false,
        }
    }

    #[cfg(test)]
    pub(crate) fn is_pressed(&self) -> bool {
        self.pressed
    }

    /// Dispatches state changes only; repeated reports of the same state
    /// are dropped.
    fn set_pressed(&mut self, pressed: bool, ctx: &mut DispatchContext) {
        if pressed == self.pressed {
            return;
        }
        self.pressed = pressed;
        self.fresh = true;
        let mapping = self.bindings[ctx.mode()].mapping;
        ctx.dispatch(&mapping, if pressed { mapping.value } else { 0.0 });
    }

    fn reassert(&mut self, ctx: &mut DispatchContext) {
        if self.fresh || !self.pressed {
            return;
        }
        let binding = self.bindings[ctx.mode()];
        if binding.continuous {
            ctx.dispatch(&binding.mapping, binding.mapping.value);
        }
    }

    fn release(&mut self, ctx: &mut DispatchContext) {
        self.set_pressed(false, ctx);
    }
}

#[derive(Debug)]
pub(crate) struct Pov {
    /// Up, Right, Down, Left.
    directions: [Button; 4],
    last_angle: i32,
}

impl Pov {
    fn new(bindings: [ModeTable<ButtonBinding>; 4]) -> Self {
        Self {
            directions: bindings.map(Button::new),
            last_angle: POV_REST,
        }
    }

    #[cfg(test)]
    pub(crate) fn pressed_directions(&self) -> Vec<PovDirection> {
        PovDirection::ALL
            .into_iter()
            .filter(|direction| self.directions[direction.index()].is_pressed())
            .collect()
    }

    fn process(&mut self, angle: i32, ctx: &mut DispatchContext) {
        let angle = if is_pov_rest(angle) { POV_REST } else { angle };
        if angle == self.last_angle {
            return;
        }
        self.last_angle = angle;
        for direction in &mut self.directions {
            direction.release(ctx);
        }
        for direction in PovDirection::active_for_angle(angle) {
            self.directions[direction.index()].set_pressed(true, ctx);
        }
    }

    fn reassert(&mut self, ctx: &mut DispatchContext) {
        for direction in &mut self.directions {
            direction.reassert(ctx);
        }
    }

    fn reset(&mut self, ctx: &mut DispatchContext) {
        for direction in &mut self.directions {
            direction.release(ctx);
        }
        self.last_angle = POV_REST;
    }

    fn begin_tick(&mut self) {
        for direction in &mut self.directions {
            direction.fresh = false;
        }
    }
}

//-------------------------------------------------------------
/// A bound game controller with the state of all of its inputs.
#[derive(Debug)]
pub(crate) struct Device {
    info: DeviceInfo,
    handle: DeviceHandle,
    slot_key: String,
    enabled_modes: ModeTable<bool>,
    axes: BTreeMap<AxisId, Axis>,
    buttons: Vec<Button>,
    povs: Vec<Pov>,
    debug: bool,
}

impl Device {
    /// Probes the opened device and builds its input models. Missing axes
    /// are ordinary; any other probe failure aborts the setup.
    pub(crate) fn new(
        info: DeviceInfo,
        handle: DeviceHandle,
        slot: &ResolvedInputSlot,
        backend: &dyn InputBackend,
        debug: bool,
    ) -> Result<Self> {
        let capabilities = backend
            .capabilities(handle)
            .with_context(|| format!("Failed to query capabilities of '{}'", info.name))?;

        let mut axes = BTreeMap::new();
        for axis in AxisId::ALL {
            let probe = backend
                .query_axis_range(handle, axis)
                .with_context(|| format!("Failed to query {axis} of '{}'", info.name))?;
            let range = match probe {
                AxisProbe::Available(range) if range.is_degenerate() => {
                    warn!(
                        "{axis} of '{}' reports an empty range {range:?}, ignoring it",
                        info.name
                    );
                    None
                }
                AxisProbe::Available(range) => Some(range),
                AxisProbe::NotPresent => {
                    if slot.axes.contains_key(&axis) {
                        warn!(
                            "Input '{}' binds {axis}, which '{}' does not have",
                            slot.key, info.name
                        );
                    }
                    None
                }
            };
            axes.insert(axis, Axis::new(axis, range, slot.axis_bindings(axis)));
        }

        for index in slot.buttons.keys().filter(|index| **index >= capabilities.buttons) {
            warn!(
                "Input '{}' binds {}, '{}' has {} buttons",
                slot.key,
                SampleOffset::Button(*index),
                info.name,
                capabilities.buttons
            );
        }
        let buttons = (0..capabilities.buttons)
            .map(|index| Button::new(slot.button_bindings(index)))
            .collect();
        let povs = (0..capabilities.povs)
            .map(|index| Pov::new(slot.pov_bindings(index)))
            .collect();

        if debug {
            let available: Vec<String> = axes
                .values()
                .filter(|axis| axis.is_available())
                .map(|axis| axis.id.to_string())
                .collect();
            debug!(
                "Device '{}' ({}, {}): axes [{}], {} buttons, {} POVs",
                info.name,
                info.id,
                slot.class,
                available.join(", "),
                capabilities.buttons,
                capabilities.povs
            );
        }

        Ok(Self {
            info,
            handle,
            slot_key: slot.key.clone(),
            enabled_modes: slot.enabled_modes.clone(),
            axes,
            buttons,
            povs,
            debug,
        })
    }

    pub(crate) fn id(&self) -> &DeviceId {
        &self.info.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.info.name
    }

    pub(crate) fn slot_key(&self) -> &str {
        &self.slot_key
    }

    pub(crate) fn handle(&self) -> DeviceHandle {
        self.handle
    }

    pub(crate) fn set_handle(&mut self, handle: DeviceHandle) {
        self.handle = handle;
    }

    pub(crate) fn enabled_modes(&self) -> &ModeTable<bool> {
        &self.enabled_modes
    }

    #[cfg(test)]
    pub(crate) fn axis(&self, id: AxisId) -> Option<&Axis> {
        self.axes.get(&id)
    }

    #[cfg(test)]
    pub(crate) fn button(&self, index: u32) -> Option<&Button> {
        self.buttons.get(index as usize)
    }

    #[cfg(test)]
    pub(crate) fn pov(&self, index: u32) -> Option<&Pov> {
        self.povs.get(index as usize)
    }

    pub(crate) fn begin_tick(&mut self) {
        for axis in self.axes.values_mut() {
            axis.fresh = false;
        }
        for button in &mut self.buttons {
            button.fresh = false;
        }
        for pov in &mut self.povs {
            pov.begin_tick();
        }
    }

    pub(crate) fn process_sample(&mut self, sample: &RawSample, ctx: &mut DispatchContext) {
        if self.debug {
            debug!("[{}] {sample}", self.info.name);
        }
        match sample.offset {
            SampleOffset::Axis(id) => {
                if let Some(axis) = self.axes.get_mut(&id) {
                    axis.process(sample.value, ctx);
                }
            }
            SampleOffset::Button(index) => match self.buttons.get_mut(index as usize) {
                Some(button) => button.set_pressed(sample.value & BUTTON_PRESSED_MASK != 0, ctx),
                None => self.ignore_sample(sample),
            },
            SampleOffset::Pov(index) => match self.povs.get_mut(index as usize) {
                Some(pov) => pov.process(sample.value, ctx),
                None => self.ignore_sample(sample),
            },
        }
    }

    fn ignore_sample(&self, sample: &RawSample) {
        if self.debug {
            debug!("[{}] {} is not a known input, ignored", self.info.name, sample.offset);
        }
    }

    /// Continuous bindings that saw no fresh sample this tick assert their
    /// last state again.
    pub(crate) fn reassert_continuous(&mut self, ctx: &mut DispatchContext) {
        for axis in self.axes.values_mut() {
            axis.reassert(ctx);
        }
        for button in &mut self.buttons {
            button.reassert(ctx);
        }
        for pov in &mut self.povs {
            pov.reassert(ctx);
        }
    }

    /// Neutralizes the device under the mode in `ctx`, before leaving it.
    /// Throttle axes keep their position.
    pub(crate) fn reset(&mut self, ctx: &mut DispatchContext) {
        for axis in self.axes.values_mut() {
            axis.reset(ctx);
        }
        for button in &mut self.buttons {
            button.release(ctx);
        }
        for pov in &mut self.povs {
            pov.reset(ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionGroup, HostCommand};
    use crate::config::ConfigManager;
    use crate::control_state::ControlState;
    use crate::mode::Mode;
    use crate::sim::{ScriptedBackend, ScriptedDevice, SimulatedHost};
    use pretty_assertions::assert_eq;

    const CONFIG: &str = r#"
version: "1.3"
inputs:
  stick:
    axes:
      AxisX:
        mapping: roll
        dead_zone: 0.1
      RotationX:
        control: one_shot
        negative: decreaseWarp
        positive: increaseWarp
        dead_zone: 0.5
      RotationY:
        control: continuous
        negative: "delta pitchTrim -0.1"
        positive: "delta pitchTrim 0.1"
      RotationZ:
        control: continuous
        negative: yaw
        positive: pitch
      AxisY:
        control: one_shot
        positive: wheelSteer
        dead_zone: 0.3
      Slider1: mainThrottle
    buttons:
      Button1: activateNextStage
      Button2:
        mapping: "delta mainThrottle 0.1"
        continuous: true
    povs:
      Pov1:
        up: toggleGear
        right: toggleLight
        down: "yaw -1"
        left: "yaw 1"
"#;

    struct Rig {
        device: Device,
        host: SimulatedHost,
        layer: ControlState,
    }

    impl Rig {
        fn new() -> Self {
            let manager = ConfigManager::from_yaml_str(CONFIG, false).unwrap();
            let slot = manager.get_input_slots()[0].clone();
            let mut backend = ScriptedBackend::default();
            backend.add_device(
                ScriptedDevice::new("js0", "Stick")
                    .with_axis(AxisId::AxisX, -1000, 1000)
                    .with_axis(AxisId::AxisY, -1000, 1000)
                    .with_axis(AxisId::RotationX, -1000, 1000)
                    .with_axis(AxisId::RotationY, -1000, 1000)
                    .with_axis(AxisId::RotationZ, -1000, 1000)
                    .with_axis(AxisId::Slider1, 0, 1000)
                    .with_buttons(4)
                    .with_povs(1),
            );
            let info = backend.device_info("js0").unwrap();
            let handle = backend.open(&info.id).unwrap();
            let device = Device::new(info, handle, &slot, &backend, false).unwrap();
            Self {
                device,
                host: SimulatedHost::default(),
                layer: ControlState::default(),
            }
        }

        fn tick(&mut self, samples: &[&str]) {
            self.device.begin_tick();
            let mut ctx = DispatchContext::new(
                Mode::Flight,
                false,
                Some(&mut self.layer),
                &mut self.host,
                false,
            );
            for sample in samples {
                self.device.process_sample(&sample.parse().unwrap(), &mut ctx);
            }
            self.device.reassert_continuous(&mut ctx);
        }

        fn reset(&mut self) {
            let mut ctx = DispatchContext::new(
                Mode::Flight,
                false,
                Some(&mut self.layer),
                &mut self.host,
                false,
            );
            self.device.reset(&mut ctx);
        }
    }

    #[test]
    fn test_axis_writes_channel() {
        let mut rig = Rig::new();
        rig.tick(&["AxisX=500"]);
        assert_eq!(rig.layer.roll, 0.5);
        rig.tick(&["AxisX=50"]);
        assert_eq!(rig.layer.roll, 0.0);
        assert_eq!(rig.device.axis(AxisId::AxisX).unwrap().last_value(), 0.0);
    }

    #[test]
    fn test_throttle_axis_maps_to_unit_range() {
        let mut rig = Rig::new();
        rig.tick(&["Slider1=500"]);
        assert!((rig.layer.main_throttle - 0.5).abs() < 0.001);
        rig.tick(&["Slider1=0"]);
        assert_eq!(rig.layer.main_throttle, 0.0);
    }

    #[test]
    fn test_one_shot_axis_fires_one_command_per_excursion() {
        let mut rig = Rig::new();
        for sample in ["RotationX=0", "RotationX=600", "RotationX=600", "RotationX=600", "RotationX=0"] {
            rig.tick(&[sample]);
        }
        rig.tick(&[]);
        assert_eq!(rig.host.commands, vec![HostCommand::ChangeTimeAcceleration(1)]);

        rig.tick(&["RotationX=-900"]);
        assert_eq!(
            rig.host.commands.last(),
            Some(&HostCommand::ChangeTimeAcceleration(-1))
        );
    }

    #[test]
    fn test_one_shot_axis_holds_through_threshold_jitter() {
        let mut rig = Rig::new();
        for sample in ["RotationX=510", "RotationX=495", "RotationX=505", "RotationX=490", "RotationX=520"] {
            rig.tick(&[sample]);
        }
        assert_eq!(rig.host.commands, vec![HostCommand::ChangeTimeAcceleration(1)]);

        rig.tick(&["RotationX=470"]);
        rig.tick(&["RotationX=510"]);
        assert_eq!(
            rig.host.commands,
            vec![
                HostCommand::ChangeTimeAcceleration(1),
                HostCommand::ChangeTimeAcceleration(1),
            ]
        );
    }

    #[test]
    fn test_continuous_axis_routes_sides() {
        let mut rig = Rig::new();
        rig.tick(&["RotationZ=-400"]);
        assert!((rig.layer.yaw - 0.4).abs() < 0.001, "{}", rig.layer.yaw);
        assert_eq!(rig.layer.pitch, 0.0);

        rig.tick(&["RotationZ=700"]);
        assert_eq!(rig.layer.yaw, 0.0);
        assert!((rig.layer.pitch - 0.7).abs() < 0.001, "{}", rig.layer.pitch);
    }

    #[test]
    fn test_reset_releases_held_positive_side() {
        let mut rig = Rig::new();
        rig.tick(&["RotationZ=800"]);
        assert!((rig.layer.pitch - 0.8).abs() < 0.001);

        rig.reset();
        assert_eq!(rig.layer.pitch, 0.0);
        rig.tick(&[]);
        rig.tick(&["RotationZ=0"]);
        assert_eq!(rig.layer.pitch, 0.0);
        assert_eq!(rig.layer.yaw, 0.0);
    }

    #[test]
    fn test_reset_releases_pressed_one_shot() {
        let mut rig = Rig::new();
        rig.tick(&["AxisY=800"]);
        assert_eq!(rig.layer.wheel_steer, 1.0);

        rig.reset();
        assert_eq!(rig.layer.wheel_steer, 0.0);
        rig.tick(&["AxisY=0"]);
        assert_eq!(rig.layer.wheel_steer, 0.0);
    }

    #[test]
    fn test_continuous_axis_reasserts_without_samples() {
        let mut rig = Rig::new();
        rig.tick(&["RotationY=500"]);
        rig.tick(&[]);
        rig.tick(&[]);
        assert!((rig.layer.pitch_trim - 0.3).abs() < 0.001, "{}", rig.layer.pitch_trim);

        rig.tick(&["RotationY=0"]);
        rig.tick(&[]);
        assert!((rig.layer.pitch_trim - 0.3).abs() < 0.001);
    }

    #[test]
    fn test_buttons_fire_on_change_only() {
        let mut rig = Rig::new();
        rig.tick(&["Button1=128", "Button1=128"]);
        rig.tick(&[]);
        rig.tick(&["Button1=0"]);
        assert_eq!(rig.host.commands, vec![HostCommand::ActivateNextStage]);
        assert!(!rig.device.button(0).unwrap().is_pressed());
    }

    #[test]
    fn test_continuous_button_held_for_five_ticks() {
        let mut rig = Rig::new();
        rig.tick(&["Button2=128"]);
        for _ in 0..4 {
            rig.tick(&[]);
        }
        assert!((rig.layer.main_throttle - 0.5).abs() < 0.001, "{}", rig.layer.main_throttle);
        rig.tick(&["Button2=0"]);
        rig.tick(&[]);
        assert!((rig.layer.main_throttle - 0.5).abs() < 0.001);
    }

    #[test]
    fn test_pov_buckets_and_release() {
        let mut rig = Rig::new();
        rig.tick(&["Pov1=0"]);
        assert_eq!(rig.device.pov(0).unwrap().pressed_directions(), vec![PovDirection::Up]);
        rig.tick(&["Pov1=4500"]);
        assert_eq!(
            rig.device.pov(0).unwrap().pressed_directions(),
            vec![PovDirection::Up, PovDirection::Right]
        );
        rig.tick(&["Pov1=-1"]);
        assert!(rig.device.pov(0).unwrap().pressed_directions().is_empty());
        assert_eq!(
            rig.host.commands,
            vec![
                HostCommand::ToggleGroup(ActionGroup::Gear),
                HostCommand::ToggleGroup(ActionGroup::Gear),
                HostCommand::ToggleGroup(ActionGroup::Light),
            ]
        );
    }

    #[test]
    fn test_pov_channel_directions() {
        let mut rig = Rig::new();
        rig.tick(&["Pov1=27000"]);
        assert_eq!(rig.layer.yaw, 1.0);
        rig.tick(&["Pov1=65535"]);
        assert_eq!(rig.layer.yaw, 0.0);
    }

    #[test]
    fn test_unknown_inputs_are_ignored() {
        let mut rig = Rig::new();
        rig.tick(&["Button9=128", "Pov3=0", "AxisZ=100"]);
        assert!(rig.host.commands.is_empty());
        assert_eq!(rig.layer, ControlState::default());
    }

    #[test]
    fn test_reset_zeroes_axes_but_not_throttle() {
        let mut rig = Rig::new();
        rig.tick(&["AxisX=800", "Slider1=800", "Button2=128"]);
        rig.reset();
        assert_eq!(rig.layer.roll, 0.0);
        assert!(rig.layer.main_throttle > 0.8);
        assert!(!rig.device.button(1).unwrap().is_pressed());
        assert_eq!(rig.device.axis(AxisId::AxisX).unwrap().last_value(), 0.0);
        assert!(rig.device.axis(AxisId::Slider1).unwrap().last_value() > 0.5);
    }

    #[test]
    fn test_missing_and_degenerate_axes_are_unavailable() {
        let rig = Rig::new();
        assert!(!rig.device.axis(AxisId::AxisZ).unwrap().is_available());

        let manager = ConfigManager::from_yaml_str(CONFIG, false).unwrap();
        let slot = &manager.get_input_slots()[0];
        let mut backend = ScriptedBackend::default();
        backend.add_device(ScriptedDevice::new("js1", "Flat").with_axis(AxisId::AxisX, 7, 7));
        let info = backend.device_info("js1").unwrap();
        let handle = backend.open(&info.id).unwrap();
        let device = Device::new(info, handle, slot, &backend, false).unwrap();
        assert!(!device.axis(AxisId::AxisX).unwrap().is_available());
    }

    #[test]
    fn test_axis_probe_failure_aborts_setup() {
        let manager = ConfigManager::from_yaml_str(CONFIG, false).unwrap();
        let slot = &manager.get_input_slots()[0];
        let mut backend = ScriptedBackend::default();
        backend.add_device(
            ScriptedDevice::new("js2", "Broken")
                .with_axis(AxisId::AxisX, -10, 10)
                .with_failing_axis(AxisId::AxisY),
        );
        let info = backend.device_info("js2").unwrap();
        let handle = backend.open(&info.id).unwrap();
        assert!(Device::new(info, handle, slot, &backend, false).is_err());
    }
}
