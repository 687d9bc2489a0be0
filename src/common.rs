use anyhow::{anyhow, bail, Context, Result};
use num_traits::{FromPrimitive, Num, NumCast, ToPrimitive};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::str::FromStr;
use std::sync::LazyLock;
use strum_macros::{Display, EnumString};

pub(crate) static SYMM_UNIT_INTERVAL: LazyLock<NumInterval<f32>> =
    LazyLock::new(|| NumInterval::new(-1.0, 1.0));

pub(crate) static UNIT_INTERVAL: LazyLock<NumInterval<f32>> =
    LazyLock::new(|| NumInterval::new(0.0, 1.0));

/// Button samples report "pressed" with this bit set.
pub const BUTTON_PRESSED_MASK: i32 = 0x80;
/// POV samples at rest, hundredths of a degree otherwise.
pub const POV_REST: i32 = -1;
/// Some drivers report the rest position as an all-ones 16 bit word.
pub(crate) const POV_REST_WORD: i32 = 0xFFFF;
pub(crate) const POV_FULL_CIRCLE: i32 = 36000;
/// A POV direction is active when the angle lies within this distance of its center.
pub(crate) const POV_DIRECTION_TOLERANCE: i32 = 6000;

//-------------------------------------------------------------
pub trait Widen {
    type Type: Num + PartialOrd;
}

macro_rules! impl_wider_num {
    ($($t:ty => $w:ty),* $(,)?) => {
        $(impl Widen for $t {
            type Type = $w ;
        })*
    };
}

impl_wider_num! {
    i16 => i32,
    i32 => i64,
    i64 => i128,
    u16 => u32,
    u32 => u64,
    f32 => f64,
    f64 => f64,
}

//-------------------------------------------------------------
/// Closed numeric interval, `from <= to`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NumInterval<T> {
    pub from: T,
    pub to: T,
}

impl<T> NumInterval<T>
where
    T: Num,
    T: PartialOrd,
    T: Widen,
    T: FromPrimitive,
    T: Copy,
    T: Debug,
    <T as Widen>::Type: ToPrimitive,
    <T as Widen>::Type: std::convert::From<T>,
{
    pub fn new(from: T, to: T) -> Self {
        if from > to {
            return Self { from: to, to: from };
        }
        Self { from, to }
    }

    /// Position of `value` inside the interval as a fraction of its span,
    /// 0 for a degenerate interval.
    pub(crate) fn normalize_to_unit(&self, value: T) -> f32 {
        let span = self.span_w();
        if span == T::zero().into() {
            return 0.0;
        }
        let diff_w = <T as Widen>::Type::from(value) - <T as Widen>::Type::from(self.from);
        match (diff_w.to_f32(), span.to_f32()) {
            (Some(diff), Some(span)) => diff / span,
            _ => 0.0,
        }
    }

    pub(crate) fn denormalize_from_unit(&self, normalized: f32) -> T
    where
        T: NumCast,
    {
        let span = self.span_w().to_f32().unwrap_or(0.0);
        <T as NumCast>::from(span * normalized)
            .map(|magnitude| self.from + magnitude)
            .unwrap_or(self.from)
    }

    pub(crate) fn map_from<FromT>(&self, value: FromT, input_range: &NumInterval<FromT>) -> T
    where
        T: NumCast,
        FromT: Widen,
        FromT: Num,
        FromT: Copy,
        FromT: FromPrimitive,
        FromT: PartialOrd,
        FromT: Debug,
        <FromT as Widen>::Type: From<FromT>,
        <FromT as Widen>::Type: ToPrimitive,
    {
        self.denormalize_from_unit(input_range.normalize_to_unit(value))
    }

    #[cfg(test)]
    pub(crate) fn contains_inclusive(&self, value: T) -> bool {
        value >= self.from && value <= self.to
    }

    pub(crate) fn clamp(&self, value: T) -> T {
        if value < self.from {
            self.from
        } else if value > self.to {
            self.to
        } else {
            value
        }
    }

    pub(crate) fn is_degenerate(&self) -> bool {
        self.span_w() == T::zero().into()
    }

    pub(crate) fn span_w(&self) -> <T as Widen>::Type {
        let wider_to: <T as Widen>::Type = self.to.into();
        let wider_from: <T as Widen>::Type = self.from.into();
        wider_to - wider_from
    }
}

// Serialized as a tuple [from, to].
impl<T> Serialize for NumInterval<T>
where
    T: Copy,
    T: Serialize,
{
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (self.from, self.to).serialize(serializer)
    }
}

impl<'de, T> Deserialize<'de> for NumInterval<T>
where
    T: Num,
    T: PartialOrd,
    T: Widen,
    T: FromPrimitive,
    T: Copy,
    T: Debug,
    T: Deserialize<'de>,
    <T as Widen>::Type: ToPrimitive,
    <T as Widen>::Type: From<T>,
{
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (from, to) = <(T, T)>::deserialize(deserializer)?;
        Ok(NumInterval::new(from, to))
    }
}

//-------------------------------------------------------------
/// Physical axes a game controller may expose. Names are the ones used in
/// configuration files and replay scripts.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    EnumString,
    Display,
    Serialize,
    Deserialize,
)]
pub enum AxisId {
    AxisX,
    AxisY,
    AxisZ,
    RotationX,
    RotationY,
    RotationZ,
    Slider1,
    Slider2,
}

impl AxisId {
    pub const ALL: [AxisId; 8] = [
        AxisId::AxisX,
        AxisId::AxisY,
        AxisId::AxisZ,
        AxisId::RotationX,
        AxisId::RotationY,
        AxisId::RotationZ,
        AxisId::Slider1,
        AxisId::Slider2,
    ];

    /// Sliders rest at one end of their travel, so their dead-zone snaps
    /// the edges instead of the center.
    pub fn is_slider(&self) -> bool {
        matches!(self, AxisId::Slider1 | AxisId::Slider2)
    }
}

/// Where a raw sample comes from. Button and POV indices are zero based
/// internally and one based in their textual form (`Button1`, `Pov1`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SampleOffset {
    Axis(AxisId),
    Button(u32),
    Pov(u32),
}

impl std::fmt::Display for SampleOffset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SampleOffset::Axis(axis) => write!(f, "{axis}"),
            SampleOffset::Button(index) => write!(f, "Button{}", index + 1),
            SampleOffset::Pov(index) => write!(f, "Pov{}", index + 1),
        }
    }
}

fn parse_one_based_index(prefix: &str, digits: &str) -> Result<u32> {
    let number: u32 = digits
        .parse()
        .with_context(|| format!("Invalid {prefix} number '{digits}'"))?;
    if number == 0 {
        bail!("{prefix} numbers start at 1, got '{prefix}{digits}'");
    }
    Ok(number - 1)
}

impl FromStr for SampleOffset {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(digits) = s.strip_prefix("Button") {
            return Ok(SampleOffset::Button(parse_one_based_index("Button", digits)?));
        }
        if let Some(digits) = s.strip_prefix("Pov") {
            return Ok(SampleOffset::Pov(parse_one_based_index("Pov", digits)?));
        }
        AxisId::from_str(s)
            .map(SampleOffset::Axis)
            .map_err(|_| anyhow!("Unknown input offset '{s}'"))
    }
}

/// One buffered hardware event as delivered by an input backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawSample {
    pub offset: SampleOffset,
    pub value: i32,
}

impl RawSample {
    pub fn new(offset: SampleOffset, value: i32) -> Self {
        Self { offset, value }
    }
}

impl std::fmt::Display for RawSample {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.offset, self.value)
    }
}

/// Parses the `Offset=value` notation used by replay scripts.
impl FromStr for RawSample {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let Some((offset, value)) = s.split_once('=') else {
            bail!("Sample '{s}' must look like 'Offset=value'");
        };
        let value = value
            .trim()
            .parse::<i32>()
            .with_context(|| format!("Invalid sample value in '{s}'"))?;
        Ok(RawSample {
            offset: offset.parse()?,
            value,
        })
    }
}

//-------------------------------------------------------------
/// The four virtual buttons of a hat switch, in angular order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, Display)]
#[strum(serialize_all = "snake_case")]
pub(crate) enum PovDirection {
    Up,
    Right,
    Down,
    Left,
}

impl PovDirection {
    pub(crate) const ALL: [PovDirection; 4] = [
        PovDirection::Up,
        PovDirection::Right,
        PovDirection::Down,
        PovDirection::Left,
    ];

    pub(crate) fn index(&self) -> usize {
        *self as usize
    }

    pub(crate) fn center_angle(&self) -> i32 {
        self.index() as i32 * (POV_FULL_CIRCLE / 4)
    }

    /// Directions pressed by a hat at `angle` (hundredths of a degree).
    /// One or two adjacent directions for a deflected hat, none at rest.
    pub(crate) fn active_for_angle(angle: i32) -> Vec<PovDirection> {
        if is_pov_rest(angle) {
            return Vec::new();
        }
        let angle = angle.rem_euclid(POV_FULL_CIRCLE);
        Self::ALL
            .into_iter()
            .filter(|direction| {
                let distance = (angle - direction.center_angle()).abs();
                let distance = distance.min(POV_FULL_CIRCLE - distance);
                distance <= POV_DIRECTION_TOLERANCE
            })
            .collect()
    }
}

pub(crate) fn is_pov_rest(angle: i32) -> bool {
    angle < 0 || angle == POV_REST_WORD
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const EPSILON: f32 = 0.0001;
    fn f32_approx_eq(a: f32, b: f32) -> bool {
        (a - b).abs() < EPSILON
    }

    #[test]
    fn test_construction_sorts_bounds() {
        let r = NumInterval::new(20_i32, -10);
        assert_eq!(r.from, -10);
        assert_eq!(r.to, 20);
        assert!(!r.is_degenerate());
        assert!(NumInterval::new(5_i32, 5).is_degenerate());
    }

    #[test]
    fn test_clamping() {
        let r = NumInterval::new(-10.0_f32, 20.0);
        assert_eq!(r.clamp(5.0), 5.0, "Clamping value inside range failed");
        assert_eq!(r.clamp(-50.0), -10.0, "Clamping value below 'from' failed");
        assert_eq!(r.clamp(30.0), 20.0, "Clamping value above 'to' failed");
        assert!(r.contains_inclusive(-10.0));
        assert!(r.contains_inclusive(20.0));
        assert!(!r.contains_inclusive(20.1));
    }

    #[test]
    fn test_normalization() {
        let raw = NumInterval::new(0_i32, 65535);
        assert!(f32_approx_eq(raw.normalize_to_unit(0), 0.0));
        assert!(f32_approx_eq(raw.normalize_to_unit(65535), 1.0));

        let symm = SYMM_UNIT_INTERVAL.map_from(0_i32, &raw);
        assert!(f32_approx_eq(symm, -1.0), "Got {symm}");
        let symm = SYMM_UNIT_INTERVAL.map_from(65535_i32, &raw);
        assert!(f32_approx_eq(symm, 1.0), "Got {symm}");

        let unit = UNIT_INTERVAL.map_from(0.0_f32, &SYMM_UNIT_INTERVAL);
        assert!(f32_approx_eq(unit, 0.5), "Got {unit}");

        let degenerate = NumInterval::new(7_i32, 7);
        assert_eq!(degenerate.normalize_to_unit(7), 0.0);
    }

    #[test]
    fn test_sample_offset_parsing() {
        assert_eq!(
            "AxisX".parse::<SampleOffset>().unwrap(),
            SampleOffset::Axis(AxisId::AxisX)
        );
        assert_eq!(
            "Button1".parse::<SampleOffset>().unwrap(),
            SampleOffset::Button(0)
        );
        assert_eq!("Pov2".parse::<SampleOffset>().unwrap(), SampleOffset::Pov(1));
        assert!("Button0".parse::<SampleOffset>().is_err());
        assert!("Throttle".parse::<SampleOffset>().is_err());
        assert_eq!(SampleOffset::Button(11).to_string(), "Button12");
    }

    #[test]
    fn test_raw_sample_parsing() {
        let sample: RawSample = "Slider1 = -300".parse().unwrap();
        assert_eq!(
            sample,
            RawSample::new(SampleOffset::Axis(AxisId::Slider1), -300)
        );
        assert!("Button1".parse::<RawSample>().is_err());
        assert!("Button1=pressed".parse::<RawSample>().is_err());
    }

    #[test]
    fn test_pov_buckets() {
        use PovDirection::*;
        assert_eq!(PovDirection::active_for_angle(0), vec![Up]);
        assert_eq!(PovDirection::active_for_angle(4500), vec![Up, Right]);
        assert_eq!(PovDirection::active_for_angle(9000), vec![Right]);
        assert_eq!(PovDirection::active_for_angle(31500), vec![Up, Left]);
        assert_eq!(PovDirection::active_for_angle(2999), vec![Up]);
        assert_eq!(PovDirection::active_for_angle(3000), vec![Up, Right]);
        assert!(PovDirection::active_for_angle(POV_REST).is_empty());
        assert!(PovDirection::active_for_angle(0xFFFF).is_empty());
    }

    #[test]
    fn test_slider_axes() {
        let sliders: Vec<AxisId> = AxisId::ALL.into_iter().filter(AxisId::is_slider).collect();
        assert_eq!(sliders, vec![AxisId::Slider1, AxisId::Slider2]);
    }
}
