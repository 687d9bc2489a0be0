use anyhow::{bail, Result};
use log::{debug, error, info, warn};

use crate::action::{DispatchContext, DispatchOutcome};
use crate::config::{ConfigManager, CONFIG_VERSION_STR};
use crate::control_state::{stabilization_override_required, Channel, ControlState, StateMirror};
use crate::device::Device;
use crate::host::{DeviceClass, DeviceId, DeviceInfo, Host, InputBackend};
use crate::mode::{next_mode, Mode, ModeContext};
use crate::schemas::ResolvedInputSlot;

/// What `activate` ended up binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivationStatus {
    /// No configuration bound yet.
    Inactive,
    Active { devices: usize },
    /// The configuration was refused; every tick is a no-op.
    VersionMismatch { found: String, expected: String },
}

/// Turns buffered controller samples into control-state updates and host
/// commands, one host tick at a time.
pub struct MappingEngine {
    slots: Vec<ResolvedInputSlot>,
    devices: Vec<Device>,
    status: ActivationStatus,
    acquired: bool,
    mirror: Option<StateMirror>,
    mode: ModeContext,
    debug: bool,
}

impl MappingEngine {
    pub fn new(debug: bool) -> Self {
        Self {
            slots: Vec::new(),
            devices: Vec::new(),
            status: ActivationStatus::Inactive,
            acquired: false,
            mirror: None,
            mode: ModeContext::default(),
            debug,
        }
    }

    pub fn status(&self) -> &ActivationStatus {
        &self.status
    }

    pub fn current_mode(&self) -> Mode {
        self.mode.current()
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.devices.iter().map(|device| device.id().clone()).collect()
    }

    pub fn has_mirror(&self) -> bool {
        self.mirror.is_some()
    }

    /// Binds `config`: every game controller the backend lists is matched
    /// against the input slots and set up. A device failing its setup is
    /// reported and skipped. Devices bound before are released first.
    pub fn activate(
        &mut self,
        config: &ConfigManager,
        backend: &mut dyn InputBackend,
        host: &mut dyn Host,
    ) -> Result<ActivationStatus> {
        self.shutdown(backend);
        self.devices.clear();
        self.mirror = None;
        self.mode = ModeContext::default();

        if let Some(found) = config.version_mismatch() {
            host.post_message(&config.version_mismatch_message());
            self.slots.clear();
            self.status = ActivationStatus::VersionMismatch {
                found,
                expected: CONFIG_VERSION_STR.to_string(),
            };
            return Ok(self.status.clone());
        }

        self.slots = config.get_input_slots().to_vec();
        self.status = ActivationStatus::Active { devices: 0 };
        self.acquired = true;

        for info in backend.enumerate_devices(DeviceClass::GameControl)? {
            let name = info.name.clone();
            if let Err(e) = self.add_device(info, backend) {
                error!("Device '{name}' could not be set up: {e:#}");
            }
        }

        if self.devices.is_empty() {
            warn!("No connected game controller matches the configured inputs.");
        }
        self.status = ActivationStatus::Active {
            devices: self.devices.len(),
        };
        Ok(self.status.clone())
    }

    /// Binds one device to the first input slot matching its name. Returns
    /// `false` without touching the backend when the device is already
    /// bound, no slot matches, or no configuration is active.
    pub fn add_device(&mut self, info: DeviceInfo, backend: &mut dyn InputBackend) -> Result<bool> {
        if !matches!(self.status, ActivationStatus::Active { .. }) {
            return Ok(false);
        }
        if self.devices.iter().any(|device| device.id() == &info.id) {
            return Ok(false);
        }
        let Some(slot) = self.slots.iter().find(|slot| slot.matches_name(&info.name)) else {
            if self.debug {
                debug!("No input slot matches '{}', not binding it.", info.name);
            }
            return Ok(false);
        };

        let handle = backend.open(&info.id)?;
        let device = match Device::new(info, handle, slot, backend, self.debug) {
            Ok(device) => device,
            Err(e) => {
                if let Err(close_error) = backend.close(handle) {
                    warn!("Failed to release a device after its setup failed: {close_error:#}");
                }
                return Err(e);
            }
        };
        info!(
            "Bound '{}' ({}) to input '{}'",
            device.name(),
            device.id(),
            device.slot_key()
        );
        self.devices.push(device);
        self.status = ActivationStatus::Active {
            devices: self.devices.len(),
        };
        Ok(true)
    }

    /// Unbinds a device. Returns `false` when it was not bound.
    pub fn remove_device(&mut self, id: &DeviceId, backend: &mut dyn InputBackend) -> Result<bool> {
        let Some(index) = self.devices.iter().position(|device| device.id() == id) else {
            return Ok(false);
        };
        let device = self.devices.remove(index);
        if let Some(mirror) = self.mirror.as_mut() {
            mirror.remove_layer(id);
        }
        self.mode.forget_device(id);
        if let ActivationStatus::Active { .. } = self.status {
            self.status = ActivationStatus::Active {
                devices: self.devices.len(),
            };
        }
        info!("Unbound '{}' ({id})", device.name());
        if self.acquired {
            backend.close(device.handle())?;
        }
        Ok(true)
    }

    /// Re-acquires every bound device, releasing handles still held.
    pub fn start(&mut self, backend: &mut dyn InputBackend) -> Result<()> {
        let mut failed = Vec::new();
        for device in &mut self.devices {
            match backend.open(device.id()) {
                Ok(handle) => device.set_handle(handle),
                Err(e) => {
                    error!("Failed to acquire '{}': {e:#}", device.name());
                    failed.push(device.id().clone());
                }
            }
        }
        self.acquired = true;
        for id in &failed {
            self.devices.retain(|device| device.id() != id);
            self.mode.forget_device(id);
        }
        if !failed.is_empty() {
            bail!("{} device(s) could not be acquired", failed.len());
        }
        Ok(())
    }

    /// Releases every bound device. Bindings stay for a later `start`.
    pub fn shutdown(&mut self, backend: &mut dyn InputBackend) {
        if !self.acquired {
            return;
        }
        for device in &self.devices {
            if let Err(e) = backend.close(device.handle()) {
                warn!("Failed to release '{}': {e:#}", device.name());
            }
        }
        self.acquired = false;
    }

    /// Per physics tick: processes every device's samples, merges the
    /// accumulated state into `state` and tells the host whether its
    /// stabilization has to yield.
    pub fn on_tick(
        &mut self,
        backend: &mut dyn InputBackend,
        host: &mut dyn Host,
        state: &mut ControlState,
    ) {
        if !self.is_ticking() {
            return;
        }
        if !host.is_subject_present() {
            if self.mirror.take().is_some() && self.debug {
                debug!("No controllable subject, accumulated state dropped.");
            }
            return;
        }
        if self.mirror.is_none() {
            self.mirror = Some(StateMirror::new(state));
            self.mode.reset();
        }

        let accelerated = host.is_time_accelerated();
        let throttle_override = self.process_devices(backend, host, accelerated);

        if let Some(mirror) = &self.mirror {
            mirror.merge_into(state);
        }
        if let Some(throttle) = throttle_override {
            state.set(Channel::MainThrottle, throttle);
        }

        let threshold = host.stabilization_detection_threshold();
        host.set_stabilization_override(stabilization_override_required(state, threshold));
    }

    /// Secondary tick while the host runs time accelerated: only commands
    /// allowed during acceleration get through.
    pub fn on_accelerated_tick(&mut self, backend: &mut dyn InputBackend, host: &mut dyn Host) {
        if !self.is_ticking() || !host.is_time_accelerated() || !host.is_subject_present() {
            return;
        }
        self.process_devices(backend, host, true);
    }

    /// Mode switch asked for outside of the bindings (e.g. by a host UI).
    /// Applies to the device that last produced input, or the first one.
    pub fn on_mode_switch_requested(&mut self, host: &mut dyn Host) -> Option<Mode> {
        if !self.is_ticking() {
            return None;
        }
        let index = self
            .mode
            .active_device()
            .and_then(|id| self.devices.iter().position(|device| device.id() == id))
            .or(if self.devices.is_empty() { None } else { Some(0) })?;

        let grounded = host.is_subject_grounded();
        let device = &mut self.devices[index];
        let layer = self.mirror.as_mut().map(|mirror| mirror.layer_mut(device.id()));
        let mut ctx = DispatchContext::new(self.mode.current(), false, layer, &mut *host, self.debug);
        let next = Self::switch_mode(&mut self.mode, device, &mut ctx, grounded);
        let outcome = ctx.take_outcome();
        drop(ctx);
        if let (Some(throttle), Some(mirror)) = (outcome.throttle_override, self.mirror.as_mut()) {
            mirror.force_channel(Channel::MainThrottle, throttle);
        }
        next
    }

    fn is_ticking(&self) -> bool {
        self.acquired && matches!(self.status, ActivationStatus::Active { .. })
    }

    /// Returns the main throttle value forced by kill/full throttle
    /// commands, if any fired.
    fn process_devices(
        &mut self,
        backend: &mut dyn InputBackend,
        host: &mut dyn Host,
        accelerated: bool,
    ) -> Option<f32> {
        let grounded = host.is_subject_grounded();
        let mut throttle_override = None;

        for device in &mut self.devices {
            let samples = match backend.poll(device.handle()) {
                Ok(samples) => samples,
                Err(e) => {
                    warn!("Skipping '{}' this tick: {e:#}", device.name());
                    continue;
                }
            };
            device.begin_tick();
            if !samples.is_empty() {
                self.mode.set_active_device(device.id());
            }

            let layer = self.mirror.as_mut().map(|mirror| mirror.layer_mut(device.id()));
            let mut ctx =
                DispatchContext::new(self.mode.current(), accelerated, layer, &mut *host, self.debug);

            for sample in &samples {
                device.process_sample(sample, &mut ctx);
                let outcome = ctx.take_outcome();
                Self::note_throttle(&outcome, &mut throttle_override);
                if outcome.mode_switch_requested {
                    Self::switch_mode(&mut self.mode, device, &mut ctx, grounded);
                }
            }
            device.reassert_continuous(&mut ctx);
            Self::note_throttle(&ctx.take_outcome(), &mut throttle_override);
        }

        if let (Some(throttle), Some(mirror)) = (throttle_override, self.mirror.as_mut()) {
            mirror.force_channel(Channel::MainThrottle, throttle);
        }
        throttle_override
    }

    fn note_throttle(outcome: &DispatchOutcome, throttle_override: &mut Option<f32>) {
        if let Some(throttle) = outcome.throttle_override {
            *throttle_override = Some(throttle);
        }
    }

    /// Moves to the next mode `device` enables, resetting the device under
    /// the mode it leaves. Nothing happens when no other mode qualifies.
    fn switch_mode(
        mode: &mut ModeContext,
        device: &mut Device,
        ctx: &mut DispatchContext,
        grounded: bool,
    ) -> Option<Mode> {
        let current = ctx.mode();
        let Some(next) = next_mode(current, device.enabled_modes(), grounded) else {
            info!(
                "'{}' has no other mode available from {current}, staying.",
                device.name()
            );
            return None;
        };
        device.reset(ctx);
        ctx.set_mode(next);
        mode.set_current(next);
        info!("Mode {current} -> {next} ('{}')", device.name());
        Some(next)
    }
}
