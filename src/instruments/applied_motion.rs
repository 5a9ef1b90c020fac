//! Applied Motion Products stepper controllers.

use crate::instrument::{InstrumentBuilder, Property};

/// ST5-Q stepper motor controller over RS-232.
///
/// The controller does not speak `*IDN?`; `HR` opens a serial session and
/// the acknowledgement starting with `?` doubles as the identity check.
/// Only direct motion commands are mapped; drive configuration happens in
/// the vendor's own tooling. Mind the current limit before commanding moves.
pub fn st5q() -> InstrumentBuilder {
    InstrumentBuilder::new("AppliedMotionST5Q")
        .identity_query("HR")
        .identity("?")
        .property("move_steps", Property::set_only("FL{value}", "steps"))
        .property("velocity", Property::get_set("VE", "VE{value}", "rev/s"))
}

/// Steps per millimetre of travel for the standard lead screw.
pub const ST5Q_STEPS_PER_MM: f64 = 2000.0;
