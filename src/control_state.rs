use std::collections::BTreeMap;
use strum_macros::{Display, EnumString};

use crate::host::DeviceId;

define_channels! {
    attitude {
        Yaw => yaw, "yaw";
        Pitch => pitch, "pitch";
        Roll => roll, "roll";
    }
    symmetric {
        YawTrim => yaw_trim, "yawTrim";
        PitchTrim => pitch_trim, "pitchTrim";
        RollTrim => roll_trim, "rollTrim";
        X => x, "X", "Translation, starboard positive";
        Y => y, "Y", "Translation, up positive";
        Z => z, "Z", "Translation, forward positive";
        WheelSteer => wheel_steer, "wheelSteer";
        WheelSteerTrim => wheel_steer_trim, "wheelSteerTrim";
    }
    throttle {
        MainThrottle => main_throttle, "mainThrottle";
        WheelThrottle => wheel_throttle, "wheelThrottle";
    }
}

/// Persistent per-device copies of the control state. Bindings write into
/// their device's layer; every tick the layers are merged into the host's
/// snapshot, so values asserted on earlier ticks survive ticks without new
/// hardware events.
#[derive(Debug, Clone)]
pub(crate) struct StateMirror {
    seed: ControlState,
    layers: BTreeMap<DeviceId, ControlState>,
}

impl StateMirror {
    /// New layers start as a copy of `seed`, the host state at creation.
    pub(crate) fn new(seed: &ControlState) -> Self {
        Self {
            seed: *seed,
            layers: BTreeMap::new(),
        }
    }

    pub(crate) fn layer_mut(&mut self, device: &DeviceId) -> &mut ControlState {
        let seed = self.seed;
        self.layers.entry(device.clone()).or_insert(seed)
    }

    #[cfg(test)]
    pub(crate) fn layer(&self, device: &DeviceId) -> Option<&ControlState> {
        self.layers.get(device)
    }

    pub(crate) fn remove_layer(&mut self, device: &DeviceId) {
        self.layers.remove(device);
    }

    /// Sets `channel` in every layer, including ones created later.
    pub(crate) fn force_channel(&mut self, channel: Channel, value: f32) {
        self.seed.set(channel, value);
        for layer in self.layers.values_mut() {
            layer.set(channel, value);
        }
    }

    /// Per channel, the value of greatest magnitude among the host and all
    /// layers wins. The host keeps its value on ties.
    pub(crate) fn merge_into(&self, host: &mut ControlState) {
        for channel in Channel::ALL {
            let mut best = host.get(*channel);
            for layer in self.layers.values() {
                let candidate = layer.get(*channel);
                if candidate.abs() > best.abs() {
                    best = candidate;
                }
            }
            *host.get_mut(*channel) = best;
        }
    }
}

/// True when any attitude channel exceeds `threshold` in magnitude.
pub(crate) fn stabilization_override_required(state: &ControlState, threshold: f32) -> bool {
    Channel::ALL
        .iter()
        .filter(|channel| channel.is_attitude())
        .any(|channel| state.get(*channel).abs() > threshold)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_channel_names() {
        assert_eq!("mainThrottle".parse::<Channel>().unwrap(), Channel::MainThrottle);
        assert_eq!(Channel::WheelSteerTrim.to_string(), "wheelSteerTrim");
        assert_eq!(Channel::X.to_string(), "X");
        assert!("throttle".parse::<Channel>().is_err());
    }

    #[test]
    fn test_throttle_group_matches_names() {
        for channel in Channel::ALL {
            assert_eq!(
                channel.is_throttle(),
                channel.to_string().to_ascii_lowercase().ends_with("throttle"),
                "{channel}"
            );
        }
    }

    #[test]
    fn test_set_clamps_to_range() {
        let mut state = ControlState::default();
        state.set(Channel::MainThrottle, -0.5);
        state.set(Channel::Pitch, 1.7);
        assert_eq!(state.main_throttle, 0.0);
        assert_eq!(state.pitch, 1.0);
    }

    #[test]
    fn test_greatest_magnitude_wins_in_any_order() {
        let first = DeviceId::from("a");
        let second = DeviceId::from("b");
        for (p1, p2) in [(0.3, -0.7), (-0.7, 0.3)] {
            let mut mirror = StateMirror::new(&ControlState::default());
            mirror.layer_mut(&first).pitch = p1;
            mirror.layer_mut(&second).pitch = p2;
            let mut host = ControlState::default();
            mirror.merge_into(&mut host);
            assert_eq!(host.pitch, -0.7);
        }
    }

    #[test]
    fn test_host_keeps_larger_value() {
        let mut mirror = StateMirror::new(&ControlState::default());
        mirror.layer_mut(&DeviceId::from("a")).yaw = 0.2;
        let mut host = ControlState {
            yaw: -0.5,
            ..Default::default()
        };
        mirror.merge_into(&mut host);
        assert_eq!(host.yaw, -0.5);
    }

    #[test]
    fn test_layers_start_from_seed() {
        let seed = ControlState {
            pitch_trim: 0.1,
            ..Default::default()
        };
        let mut mirror = StateMirror::new(&seed);
        assert_eq!(mirror.layer_mut(&DeviceId::from("a")).pitch_trim, 0.1);
        mirror.force_channel(Channel::MainThrottle, 1.0);
        assert_eq!(mirror.layer_mut(&DeviceId::from("b")).main_throttle, 1.0);
        assert_eq!(mirror.layer(&DeviceId::from("a")).unwrap().main_throttle, 1.0);
    }

    #[test]
    fn test_stabilization_override_threshold() {
        let mut state = ControlState::default();
        assert!(!stabilization_override_required(&state, 0.05));
        state.yaw_trim = 0.9;
        assert!(!stabilization_override_required(&state, 0.05));
        state.roll = -0.06;
        assert!(stabilization_override_required(&state, 0.05));
    }
}
