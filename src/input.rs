//! Linux evdev implementation of `InputBackend`.

use anyhow::{bail, Context, Result};
use evdev::{AbsoluteAxisCode, Device, EventStream, EventType, InputEvent};
use log::{debug, info, warn};
use regex::Regex;
use std::collections::{BTreeMap, HashMap};

use crate::common::{AxisId, NumInterval, RawSample, SampleOffset, BUTTON_PRESSED_MASK, POV_REST};
use crate::host::{
    AxisProbe, DeviceCapabilities, DeviceClass, DeviceHandle, DeviceId, DeviceInfo, InputBackend,
};

const AXIS_CODES: [(AbsoluteAxisCode, AxisId); 8] = [
    (AbsoluteAxisCode::ABS_X, AxisId::AxisX),
    (AbsoluteAxisCode::ABS_Y, AxisId::AxisY),
    (AbsoluteAxisCode::ABS_Z, AxisId::AxisZ),
    (AbsoluteAxisCode::ABS_RX, AxisId::RotationX),
    (AbsoluteAxisCode::ABS_RY, AxisId::RotationY),
    (AbsoluteAxisCode::ABS_RZ, AxisId::RotationZ),
    (AbsoluteAxisCode::ABS_THROTTLE, AxisId::Slider1),
    (AbsoluteAxisCode::ABS_RUDDER, AxisId::Slider2),
];

const HAT_PAIRS: [(AbsoluteAxisCode, AbsoluteAxisCode); 4] = [
    (AbsoluteAxisCode::ABS_HAT0X, AbsoluteAxisCode::ABS_HAT0Y),
    (AbsoluteAxisCode::ABS_HAT1X, AbsoluteAxisCode::ABS_HAT1Y),
    (AbsoluteAxisCode::ABS_HAT2X, AbsoluteAxisCode::ABS_HAT2Y),
    (AbsoluteAxisCode::ABS_HAT3X, AbsoluteAxisCode::ABS_HAT3Y),
];

/// BTN_JOYSTICK..BTN_THUMBR and BTN_TRIGGER_HAPPY1..40.
fn is_controller_button(code: u16) -> bool {
    (0x120..=0x13f).contains(&code) || (0x2c0..=0x2e7).contains(&code)
}

fn is_game_controller(device: &Device) -> bool {
    let has_stick = device
        .supported_absolute_axes()
        .is_some_and(|axes| axes.contains(AbsoluteAxisCode::ABS_X));
    let has_buttons = device
        .supported_keys()
        .is_some_and(|keys| keys.iter().any(|key| is_controller_button(key.code())));
    has_stick || has_buttons
}

/// Folds a hat switch position into a POV angle in hundredths of a degree,
/// clockwise from up. Centered is `POV_REST`.
pub(crate) fn hat_to_pov_angle(x: i32, y: i32) -> i32 {
    match (x.signum(), y.signum()) {
        (0, 0) => POV_REST,
        (0, -1) => 0,
        (1, -1) => 4500,
        (1, 0) => 9000,
        (1, 1) => 13500,
        (0, 1) => 18000,
        (-1, 1) => 22500,
        (-1, 0) => 27000,
        _ => 31500,
    }
}

/// An acquired device with its evdev code tables.
struct OpenDevice {
    id: DeviceId,
    stream: EventStream,
    axes: HashMap<u16, AxisId>,
    buttons: HashMap<u16, u32>,
    /// Hat axis code to (pov index, is x).
    hat_codes: HashMap<u16, (u32, bool)>,
    hats: Vec<(i32, i32)>,
}

impl OpenDevice {
    fn open(id: &DeviceId) -> Result<Self> {
        let device =
            Device::open(&id.0).with_context(|| format!("Failed to open device: {id}"))?;

        let mut axes = HashMap::new();
        let mut hat_codes = HashMap::new();
        let mut hats = Vec::new();
        if let Some(supported) = device.supported_absolute_axes() {
            for (code, axis) in AXIS_CODES {
                if supported.contains(code) {
                    axes.insert(code.0, axis);
                }
            }
            for (x, y) in HAT_PAIRS {
                if supported.contains(x) && supported.contains(y) {
                    let index = hats.len() as u32;
                    hat_codes.insert(x.0, (index, true));
                    hat_codes.insert(y.0, (index, false));
                    hats.push((0, 0));
                }
            }
        }

        let buttons = device
            .supported_keys()
            .map(|keys| {
                keys.iter()
                    .map(|key| key.code())
                    .filter(|code| is_controller_button(*code))
                    .enumerate()
                    .map(|(index, code)| (code, index as u32))
                    .collect()
            })
            .unwrap_or_default();

        // Switches the fd to non-blocking mode.
        let stream = device
            .into_event_stream()
            .with_context(|| format!("Failed to stream events of {id}"))?;

        Ok(Self {
            id: id.clone(),
            stream,
            axes,
            buttons,
            hat_codes,
            hats,
        })
    }

    fn translate(&mut self, event: InputEvent) -> Option<RawSample> {
        let code = event.code();
        match event.event_type() {
            EventType::KEY => {
                let index = *self.buttons.get(&code)?;
                let value = match event.value() {
                    0 => 0,
                    1 => BUTTON_PRESSED_MASK,
                    // Auto-repeat.
                    _ => return None,
                };
                Some(RawSample::new(SampleOffset::Button(index), value))
            }
            EventType::ABSOLUTE => {
                if let Some(axis) = self.axes.get(&code) {
                    return Some(RawSample::new(SampleOffset::Axis(*axis), event.value()));
                }
                let (index, is_x) = *self.hat_codes.get(&code)?;
                let hat = self.hats.get_mut(index as usize)?;
                if is_x {
                    hat.0 = event.value();
                } else {
                    hat.1 = event.value();
                }
                Some(RawSample::new(
                    SampleOffset::Pov(index),
                    hat_to_pov_angle(hat.0, hat.1),
                ))
            }
            _ => None,
        }
    }
}

/// `InputBackend` on `/dev/input/event*` nodes. Device ids are node paths.
/// Opening needs a tokio runtime context.
pub struct EvdevBackend {
    open: BTreeMap<usize, OpenDevice>,
    next_handle: usize,
    debug: bool,
}

impl EvdevBackend {
    pub fn new(debug: bool) -> Self {
        Self {
            open: BTreeMap::new(),
            next_handle: 0,
            debug,
        }
    }

    fn device(&self, handle: DeviceHandle) -> Result<&OpenDevice> {
        match self.open.get(&handle.0) {
            Some(device) => Ok(device),
            None => bail!("Device handle {} is not open", handle.0),
        }
    }
}

impl InputBackend for EvdevBackend {
    fn enumerate_devices(&mut self, class: DeviceClass) -> Result<Vec<DeviceInfo>> {
        if class != DeviceClass::GameControl {
            return Ok(Vec::new());
        }
        let mut devices: Vec<DeviceInfo> = evdev::enumerate()
            .filter(|(_, device)| is_game_controller(device))
            .map(|(path, device)| DeviceInfo {
                id: DeviceId(path.display().to_string()),
                name: device.name().unwrap_or("Unknown").to_string(),
            })
            .collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(devices)
    }

    fn open(&mut self, id: &DeviceId) -> Result<DeviceHandle> {
        let held: Vec<usize> = self
            .open
            .iter()
            .filter(|(_, device)| &device.id == id)
            .map(|(handle, _)| *handle)
            .collect();
        for handle in held {
            if self.debug {
                debug!("Releasing stale handle {handle} of {id}");
            }
            self.open.remove(&handle);
        }

        let device = OpenDevice::open(id)?;
        self.next_handle += 1;
        self.open.insert(self.next_handle, device);
        Ok(DeviceHandle(self.next_handle))
    }

    fn close(&mut self, handle: DeviceHandle) -> Result<()> {
        self.open.remove(&handle.0);
        Ok(())
    }

    fn capabilities(&self, handle: DeviceHandle) -> Result<DeviceCapabilities> {
        let device = self.device(handle)?;
        Ok(DeviceCapabilities {
            buttons: device.buttons.len() as u32,
            povs: device.hats.len() as u32,
        })
    }

    fn query_axis_range(&self, handle: DeviceHandle, axis: AxisId) -> Result<AxisProbe> {
        let device = self.device(handle)?;
        let Some(code) = device
            .axes
            .iter()
            .find(|(_, id)| **id == axis)
            .map(|(code, _)| *code)
        else {
            return Ok(AxisProbe::NotPresent);
        };
        let absinfo = device
            .stream
            .device()
            .get_absinfo()
            .with_context(|| format!("Failed to read axis info of {}", device.id))?;
        for (abs_code, info) in absinfo {
            if abs_code.0 == code {
                return Ok(AxisProbe::Available(NumInterval::new(
                    info.minimum(),
                    info.maximum(),
                )));
            }
        }
        Ok(AxisProbe::NotPresent)
    }

    fn poll(&mut self, handle: DeviceHandle) -> Result<Vec<RawSample>> {
        let Some(device) = self.open.get_mut(&handle.0) else {
            bail!("Device handle {} is not open", handle.0);
        };
        // Non-blocking mode, so an empty buffer reads as WouldBlock.
        let events: Vec<InputEvent> = match device.stream.device_mut().fetch_events() {
            Ok(events) => events.collect(),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("Failed to read {}", device.id)),
        };
        Ok(events
            .into_iter()
            .filter_map(|event| device.translate(event))
            .collect())
    }
}

/// Prints the samples of every game controller whose name matches
/// `name_regex` until Ctrl+C.
pub async fn monitor_devices(name_regex: &Regex, debug: bool) -> Result<()> {
    let mut backend = EvdevBackend::new(debug);
    let matched: Vec<DeviceInfo> = backend
        .enumerate_devices(DeviceClass::GameControl)?
        .into_iter()
        .filter(|info| name_regex.is_match(&info.name))
        .collect();
    if matched.is_empty() {
        bail!("No game controllers found matching '{name_regex}'");
    }

    println!("Monitoring game controllers:");
    let mut handles = Vec::new();
    for info in &matched {
        let handle = backend.open(&info.id)?;
        let capabilities = backend.capabilities(handle)?;
        println!(
            "  - {} @ {} ({} buttons, {} POVs)",
            info.name, info.id, capabilities.buttons, capabilities.povs
        );
        for axis in AxisId::ALL {
            if let AxisProbe::Available(range) = backend.query_axis_range(handle, axis)? {
                println!("      {axis}: [{}, {}]", range.from, range.to);
            }
        }
        handles.push((info.name.clone(), handle));
    }
    println!("Press Ctrl+C to stop monitoring...");

    let mut interval = tokio::time::interval(std::time::Duration::from_millis(10));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                for (name, handle) in &handles {
                    match backend.poll(*handle) {
                        Ok(samples) => {
                            for sample in samples {
                                info!("[{name}] {sample}");
                            }
                        }
                        Err(e) => warn!("[{name}] {e:#}"),
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Stopping monitor.");
                break;
            }
        }
    }
    for (_, handle) in handles {
        backend.close(handle)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use evdev::KeyCode;

    #[test]
    fn test_hat_angles_clockwise_from_up() {
        assert_eq!(hat_to_pov_angle(0, 0), POV_REST);
        assert_eq!(hat_to_pov_angle(0, -1), 0);
        assert_eq!(hat_to_pov_angle(1, -1), 4500);
        assert_eq!(hat_to_pov_angle(1, 0), 9000);
        assert_eq!(hat_to_pov_angle(0, 1), 18000);
        assert_eq!(hat_to_pov_angle(-1, 0), 27000);
        assert_eq!(hat_to_pov_angle(-1, -1), 31500);
        // Analog hats report larger magnitudes.
        assert_eq!(hat_to_pov_angle(127, 0), 9000);
    }

    #[test]
    fn test_controller_button_codes() {
        assert!(is_controller_button(KeyCode::BTN_TRIGGER.code()));
        assert!(is_controller_button(KeyCode::BTN_SOUTH.code()));
        assert!(is_controller_button(KeyCode::BTN_TRIGGER_HAPPY1.code()));
        assert!(!is_controller_button(KeyCode::KEY_A.code()));
        assert!(!is_controller_button(KeyCode::BTN_LEFT.code()));
    }
}
