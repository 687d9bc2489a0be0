//! Seams between the mapping engine and the outside world: the input
//! backend delivering raw hardware samples, and the host simulation
//! consuming control state and discrete commands.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::action::HostCommand;
use crate::common::{AxisId, NumInterval, RawSample};

/// Stable identity of a physical device instance (a device node path, a
/// driver instance guid...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        DeviceId(value.to_string())
    }
}

/// Backend-issued token for an opened device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub usize);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display)]
#[strum(serialize_all = "snake_case")]
pub enum DeviceClass {
    GameControl,
    Keyboard,
    Pointer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceCapabilities {
    pub buttons: u32,
    pub povs: u32,
}

/// Outcome of asking a device for one axis. A missing axis is an ordinary
/// answer; real failures travel as `Err`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AxisProbe {
    Available(NumInterval<i32>),
    NotPresent,
}

pub trait InputBackend {
    fn enumerate_devices(&mut self, class: DeviceClass) -> Result<Vec<DeviceInfo>>;

    /// Acquires the device. A handle already held for the same id is
    /// released first.
    fn open(&mut self, id: &DeviceId) -> Result<DeviceHandle>;

    fn close(&mut self, handle: DeviceHandle) -> Result<()>;

    fn capabilities(&self, handle: DeviceHandle) -> Result<DeviceCapabilities>;

    fn query_axis_range(&self, handle: DeviceHandle, axis: AxisId) -> Result<AxisProbe>;

    /// Returns the samples buffered since the previous call. Never blocks.
    fn poll(&mut self, handle: DeviceHandle) -> Result<Vec<RawSample>>;
}

pub trait Host {
    /// False when there is nothing to control (e.g. no active vessel).
    fn is_subject_present(&self) -> bool;

    fn is_subject_grounded(&self) -> bool;

    /// 1.0 means real time.
    fn time_acceleration_rate(&self) -> f32;

    fn stabilization_detection_threshold(&self) -> f32;

    /// `true` suspends the host's own stabilization for this tick because the
    /// pilot is actively steering.
    fn set_stabilization_override(&mut self, active: bool);

    fn execute(&mut self, command: HostCommand);

    /// Operator-facing message, e.g. an on-screen notice.
    fn post_message(&mut self, message: &str) {
        log::info!("{message}");
    }

    fn is_time_accelerated(&self) -> bool {
        self.time_acceleration_rate() != 1.0
    }
}
