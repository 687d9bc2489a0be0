use crate::common::{NumInterval, SYMM_UNIT_INTERVAL, UNIT_INTERVAL};
use crate::control_state::Channel;
use crate::schemas::Control;

/// Widest release band below the one-shot threshold.
pub(crate) const ONE_SHOT_HYSTERESIS: f32 = 0.02;

/// Raw hardware value to [-1, 1]. Out of range samples are clamped.
pub(crate) fn normalize(raw: i32, range: &NumInterval<i32>) -> f32 {
    SYMM_UNIT_INTERVAL.clamp(SYMM_UNIT_INTERVAL.map_from(raw, range))
}

/// Ordinary axes drop the band around the center. Sliders rest at an end of
/// their travel, so the bands at both ends snap to full deflection instead.
pub(crate) fn apply_dead_zone(value: f32, dead_zone: f32, slider: bool) -> f32 {
    if slider {
        let edge = 1.0 - dead_zone;
        if value >= edge {
            1.0
        } else if value <= -edge {
            -1.0
        } else {
            value
        }
    } else if value.abs() <= dead_zone {
        0.0
    } else {
        value
    }
}

/// Normalize, invert.
pub(crate) fn orient(raw: i32, range: &NumInterval<i32>, control: &Control) -> f32 {
    let value = normalize(raw, range);
    if control.inverted {
        -value
    } else {
        value
    }
}

/// Output of an `Axis` control for `channel`: scaled, then remapped onto
/// [0, 1] for throttles.
pub(crate) fn axis_output(value: f32, factor: f32, channel: Option<Channel>) -> f32 {
    let scaled = value * factor;
    match channel {
        Some(channel) if channel.is_throttle() => {
            UNIT_INTERVAL.map_from(SYMM_UNIT_INTERVAL.clamp(scaled), &SYMM_UNIT_INTERVAL)
        }
        _ => scaled,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    /// Routed to the first mapping.
    Negative,
    /// Routed to the second mapping.
    Positive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Edge {
    Press(Side),
    Release(Side),
}

/// Which side of a continuous axis is active, with its magnitude.
pub(crate) fn continuous_side(value: f32) -> Option<(Side, f32)> {
    if value < 0.0 {
        Some((Side::Negative, -value))
    } else if value > 0.0 {
        Some((Side::Positive, value))
    } else {
        None
    }
}

/// Press/release detection for a one-shot axis. A side is pressed when the
/// value passes the dead-zone threshold and released once it comes back
/// below the threshold minus a small band, so jitter around the threshold
/// fires nothing. Takes the oriented value, not the dead-zoned one.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) struct OneShotLatch {
    negative: bool,
    positive: bool,
}

impl OneShotLatch {
    pub(crate) fn update(&mut self, value: f32, dead_zone: f32) -> Vec<Edge> {
        let release_at = dead_zone - ONE_SHOT_HYSTERESIS.min(dead_zone * 0.5);
        let mut edges = Vec::new();

        if self.positive && value <= release_at {
            self.positive = false;
            edges.push(Edge::Release(Side::Positive));
        }
        if self.negative && value >= -release_at {
            self.negative = false;
            edges.push(Edge::Release(Side::Negative));
        }
        if !self.positive && value > dead_zone {
            self.positive = true;
            edges.push(Edge::Press(Side::Positive));
        }
        if !self.negative && value < -dead_zone {
            self.negative = true;
            edges.push(Edge::Press(Side::Negative));
        }
        edges
    }

    pub(crate) fn is_pressed(&self, side: Side) -> bool {
        match side {
            Side::Negative => self.negative,
            Side::Positive => self.positive,
        }
    }

    pub(crate) fn clear(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schemas::ControlType;
    use pretty_assertions::assert_eq;

    const EPSILON: f32 = 0.001;
    fn f32_approx_eq(a: f32, b: f32) -> bool {
        (a - b).abs() < EPSILON
    }

    #[test]
    fn test_normalization_endpoints() {
        let range = NumInterval::new(0, 65535);
        assert_eq!(normalize(0, &range), -1.0);
        assert_eq!(normalize(65535, &range), 1.0);
        assert!(f32_approx_eq(normalize(32767, &range), 0.0));
        assert_eq!(normalize(70000, &range), 1.0);

        let signed = NumInterval::new(-512, 511);
        assert_eq!(normalize(-512, &signed), -1.0);
        assert_eq!(normalize(511, &signed), 1.0);
    }

    #[test]
    fn test_center_dead_zone() {
        assert_eq!(apply_dead_zone(0.1, 0.1, false), 0.0);
        assert_eq!(apply_dead_zone(-0.05, 0.1, false), 0.0);
        assert_eq!(apply_dead_zone(0.11, 0.1, false), 0.11);
        assert_eq!(apply_dead_zone(0.95, 0.1, false), 0.95);
    }

    #[test]
    fn test_slider_dead_zone_snaps_edges() {
        assert_eq!(apply_dead_zone(0.9, 0.1, true), 1.0);
        assert_eq!(apply_dead_zone(0.95, 0.1, true), 1.0);
        assert_eq!(apply_dead_zone(-0.9, 0.1, true), -1.0);
        assert_eq!(apply_dead_zone(0.05, 0.1, true), 0.05);
        assert_eq!(apply_dead_zone(0.5, 0.1, true), 0.5);
    }

    #[test]
    fn test_condition_inverts_before_dead_zone() {
        let range = NumInterval::new(-100, 100);
        let control = Control::new(ControlType::Axis, true, 0.2, 1.0);
        let condition = |raw, slider| {
            apply_dead_zone(orient(raw, &range, &control), control.dead_zone, slider)
        };
        assert!(f32_approx_eq(condition(50, false), -0.5));
        assert_eq!(condition(10, false), 0.0);
        assert_eq!(condition(-100, true), 1.0);
        assert!(f32_approx_eq(orient(10, &range, &control), -0.1));
    }

    #[test]
    fn test_throttle_output_uses_unit_range() {
        assert!(f32_approx_eq(axis_output(-1.0, 1.0, Some(Channel::MainThrottle)), 0.0));
        assert!(f32_approx_eq(axis_output(0.0, 1.0, Some(Channel::MainThrottle)), 0.5));
        assert!(f32_approx_eq(axis_output(1.0, 1.0, Some(Channel::WheelThrottle)), 1.0));
        assert!(f32_approx_eq(axis_output(-0.5, 0.5, Some(Channel::Pitch)), -0.25));
        assert!(f32_approx_eq(axis_output(0.4, 2.0, None), 0.8));
    }

    #[test]
    fn test_continuous_side() {
        assert_eq!(continuous_side(-0.4), Some((Side::Negative, 0.4)));
        assert_eq!(continuous_side(0.7), Some((Side::Positive, 0.7)));
        assert_eq!(continuous_side(0.0), None);
    }

    #[test]
    fn test_one_shot_fires_once_per_excursion() {
        let mut latch = OneShotLatch::default();
        let edges: Vec<Edge> = [0.0, 0.6, 0.6, 0.6, 0.0]
            .into_iter()
            .flat_map(|v| latch.update(v, 0.5))
            .collect();
        assert_eq!(
            edges,
            vec![Edge::Press(Side::Positive), Edge::Release(Side::Positive)]
        );
    }

    #[test]
    fn test_one_shot_ignores_threshold_jitter() {
        let mut latch = OneShotLatch::default();
        let edges: Vec<Edge> = [0.51, 0.495, 0.505, 0.49, 0.52]
            .into_iter()
            .flat_map(|v| latch.update(v, 0.5))
            .collect();
        assert_eq!(edges, vec![Edge::Press(Side::Positive)]);
        assert!(latch.is_pressed(Side::Positive));

        assert_eq!(latch.update(0.47, 0.5), vec![Edge::Release(Side::Positive)]);
    }

    #[test]
    fn test_one_shot_swing_through_center() {
        let mut latch = OneShotLatch::default();
        assert_eq!(latch.update(0.8, 0.3), vec![Edge::Press(Side::Positive)]);
        assert_eq!(
            latch.update(-0.8, 0.3),
            vec![Edge::Release(Side::Positive), Edge::Press(Side::Negative)]
        );
        latch.clear();
        assert!(!latch.is_pressed(Side::Negative));
    }
}
