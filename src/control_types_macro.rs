/// Generates the closed set of host control channels: the `Channel` enum with
/// its configuration names (parsed and printed with strum), group predicates,
/// value ranges, and the `ControlState` struct with typed accessors.
///
/// Groups:
/// - `attitude`: rotational channels watched for the stabilization override.
/// - `symmetric`: everything else living in [-1, 1].
/// - `throttle`: channels living in [0, 1].
#[macro_export]
macro_rules! define_channels {
    (
        attitude {
            $( $att_variant:ident => $att_field:ident, $att_name:literal $(, $att_doc:literal)? );* $(;)?
        }
        symmetric {
            $( $sym_variant:ident => $sym_field:ident, $sym_name:literal $(, $sym_doc:literal)? );* $(;)?
        }
        throttle {
            $( $thr_variant:ident => $thr_field:ident, $thr_name:literal $(, $thr_doc:literal)? );* $(;)?
        }
    ) => {
        /// Numeric channel of the host control state. The string form is the
        /// action name used in configuration files.
        #[derive(Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Clone, Copy, EnumString, Display)]
        pub enum Channel {
            $(
                $(#[doc = $att_doc])?
                #[strum(to_string = $att_name)]
                $att_variant,
            )*
            $(
                $(#[doc = $sym_doc])?
                #[strum(to_string = $sym_name)]
                $sym_variant,
            )*
            $(
                $(#[doc = $thr_doc])?
                #[strum(to_string = $thr_name)]
                $thr_variant,
            )*
        }

        impl Channel {
            pub const ALL: &'static [Channel] = &[
                $( Channel::$att_variant, )*
                $( Channel::$sym_variant, )*
                $( Channel::$thr_variant, )*
            ];

            pub fn is_attitude(&self) -> bool {
                matches!(self, $( Channel::$att_variant )|*)
            }

            pub fn is_throttle(&self) -> bool {
                matches!(self, $( Channel::$thr_variant )|*)
            }

            pub(crate) fn range(&self) -> $crate::common::NumInterval<f32> {
                if self.is_throttle() {
                    *$crate::common::UNIT_INTERVAL
                } else {
                    *$crate::common::SYMM_UNIT_INTERVAL
                }
            }
        }

        /// Snapshot of every host channel.
        #[derive(Debug, Clone, Copy, Default, PartialEq)]
        pub struct ControlState {
            $( pub $att_field: f32, )*
            $( pub $sym_field: f32, )*
            $( pub $thr_field: f32, )*
        }

        impl ControlState {
            pub fn get(&self, channel: Channel) -> f32 {
                match channel {
                    $( Channel::$att_variant => self.$att_field, )*
                    $( Channel::$sym_variant => self.$sym_field, )*
                    $( Channel::$thr_variant => self.$thr_field, )*
                }
            }

            pub fn get_mut(&mut self, channel: Channel) -> &mut f32 {
                match channel {
                    $( Channel::$att_variant => &mut self.$att_field, )*
                    $( Channel::$sym_variant => &mut self.$sym_field, )*
                    $( Channel::$thr_variant => &mut self.$thr_field, )*
                }
            }

            /// Stores `value` clamped to the channel range.
            pub fn set(&mut self, channel: Channel, value: f32) {
                *self.get_mut(channel) = channel.range().clamp(value);
            }
        }

        impl std::fmt::Display for ControlState {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                let mut first = true;
                for channel in Channel::ALL {
                    let value = self.get(*channel);
                    if value == 0.0 {
                        continue;
                    }
                    if !first {
                        write!(f, " ")?;
                    }
                    write!(f, "{channel}={value:.3}")?;
                    first = false;
                }
                if first {
                    write!(f, "(all zero)")?;
                }
                Ok(())
            }
        }
    };
}
