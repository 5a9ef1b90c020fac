//! Stanford Research Systems devices.
//!
//! - SR830 lock-in amplifier
//! - CTC100 cryogenic temperature controller (channelized: thermometer
//!   inputs, PID outputs, analog I/O)

use crate::instrument::{Instrument, InstrumentBuilder, Property};
use std::sync::Arc;

/// SR830 lock-in amplifier on a serial link.
///
/// `OUTX 0` routes responses to the RS-232 interface before the identity
/// check; on GPIB use [`sr830_gpib`] instead.
pub fn sr830_serial() -> InstrumentBuilder {
    sr830().setup_command("OUTX 0")
}

/// SR830 lock-in amplifier on GPIB.
pub fn sr830_gpib() -> InstrumentBuilder {
    sr830().setup_command("OUTX 1")
}

fn sr830() -> InstrumentBuilder {
    InstrumentBuilder::new("StanfordSR830")
        .identity("Stanford_Research_Systems,SR830")
        // measured results
        .property("x", Property::get_only("OUTP? 1", "V"))
        .property("y", Property::get_only("OUTP? 2", "V"))
        .property("r", Property::get_only("OUTP? 3", "V"))
        .property("theta", Property::get_only("OUTP? 4", "deg"))
        // X and Y in one exchange, so the pair is one sample event
        .property("xy", Property::get_only("SNAP? 1,2", "V").with_arity(2))
        // sine out and reference channel
        .property("ref_phase", Property::get_set("PHAS?", "PHAS {value}", "deg"))
        .property("ref_freq", Property::get_set("FREQ?", "FREQ {value}", "Hz"))
        .property("ref_harmonic", Property::get_set("HARM?", "HARM {value}", ""))
        .property("ref_amplitude", Property::get_set("SLVL?", "SLVL {value}", "V"))
        // input configuration
        .property("input_mode", Property::get_set("ISRC?", "ISRC {value}", ""))
        .property("input_line_filter", Property::get_set("ILIN?", "ILIN {value}", ""))
        // demodulator
        .property("sensitivity", Property::get_set("SENS?", "SENS {value}", ""))
        .property("reserve", Property::get_set("RMOD?", "RMOD {value}", ""))
        .property("time_constant", Property::get_set("OFLT?", "OFLT {value}", ""))
}

/// Automatically set sensitivity from the signal present right now.
pub async fn sr830_auto_sensitivity(lockin: &Instrument) -> crate::error::RigResult<()> {
    lockin.command("AGAN").await
}

/// Automatically set reserve from the signal present right now.
pub async fn sr830_auto_reserve(lockin: &Instrument) -> crate::error::RigResult<()> {
    lockin.command("ARSV").await
}

/// SR830 sensitivity steps, in volts, indexed by the `sensitivity` property.
pub const SR830_SENSITIVITIES: [f64; 27] = [
    2e-9, 5e-9, 10e-9, 20e-9, 50e-9, 100e-9, 200e-9, 500e-9, 1e-6, 2e-6, 5e-6, 10e-6, 20e-6,
    50e-6, 100e-6, 200e-6, 500e-6, 1e-3, 2e-3, 5e-3, 10e-3, 20e-3, 50e-3, 100e-3, 200e-3, 500e-3,
    1.0,
];

/// SR830 time-constant steps, in seconds, indexed by the `time_constant`
/// property.
pub const SR830_TIME_CONSTANTS: [f64; 19] = [
    10e-6, 30e-6, 100e-6, 300e-6, 1e-3, 3e-3, 10e-3, 30e-3, 100e-3, 300e-3, 1.0, 3.0, 10.0, 30.0,
    300.0, 1e3, 3e3, 10e3, 30e3,
];

/// Index of the lowest sensitivity not smaller than `value`.
pub fn sr830_next_sensitivity(value: f64) -> usize {
    SR830_SENSITIVITIES.partition_point(|s| *s < value)
}

/// Index of the lowest time constant not smaller than `value`.
pub fn sr830_next_time_constant(value: f64) -> usize {
    SR830_TIME_CONSTANTS.partition_point(|t| *t < value)
}

/// CTC100 temperature controller mainframe.
///
/// The mainframe itself exposes no properties; attach channels with
/// [`ctc100_input`], [`ctc100_output`] and [`ctc100_analog`]. Most
/// configuration (PID linking, units) lives on the front panel.
pub fn ctc100() -> InstrumentBuilder {
    InstrumentBuilder::new("StanfordCTC100")
        .identity("Stanford Research Systems, CTC100 Cryogenic Temperature Controller")
}

/// Thermometer input channel `n` (1 to 4) of a connected CTC100.
pub fn ctc100_input(mainframe: &Instrument, n: u8) -> Arc<Instrument> {
    InstrumentBuilder::new("Ctc100Input")
        .property("value", Property::get_only("in{subaddr}.Value?", "K"))
        .attach(mainframe, &n.to_string())
}

/// PID output channel `n` (1 or 2) of a connected CTC100.
///
/// Set `ramp` to 0 for an unlimited ramp rate.
pub fn ctc100_output(mainframe: &Instrument, n: u8) -> Arc<Instrument> {
    InstrumentBuilder::new("Ctc100Output")
        .property(
            "setpoint",
            Property::get_set("\"Out {subaddr}.PID.Setpoint?\"", "\"Out {subaddr}.PID.Setpoint\" {value}", "K"),
        )
        .property(
            "ramp",
            Property::get_set("\"Out {subaddr}.PID.Ramp?\"", "\"Out {subaddr}.PID.Ramp\" {value}", "K/s"),
        )
        .property(
            "ramp_target",
            Property::get_set("\"Out {subaddr}.PID.RampT?\"", "\"Out {subaddr}.PID.RampT\" {value}", "K"),
        )
        .property(
            "power",
            Property::get_set("\"Out {subaddr}.value?\"", "\"Out {subaddr}.value\" {value}", "W"),
        )
        .attach(mainframe, &n.to_string())
}

/// Analog I/O channel `n` (1 to 4) of a connected CTC100.
///
/// Reads work on inputs and outputs alike; only write a channel the front
/// panel has configured as an output.
pub fn ctc100_analog(mainframe: &Instrument, n: u8) -> Arc<Instrument> {
    InstrumentBuilder::new("Ctc100Analog")
        .property(
            "voltage",
            Property::get_set("\"AIO{subaddr}.Value?\"", "\"AIO{subaddr}.Value\" {value}", "V"),
        )
        .attach(mainframe, &n.to_string())
}
