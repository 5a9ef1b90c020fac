//! Per-device capability tables.
//!
//! Each function here returns an [`InstrumentBuilder`](crate::instrument::InstrumentBuilder)
//! carrying one device's identity check and property declarations — the thin
//! glue between the generic exchange machinery and a vendor command set.
//! Adding a device means adding one of these, nothing else.

use crate::error::RigResult;
use crate::instrument::{Instrument, InstrumentBuilder};

pub mod applied_motion;
pub mod stanford;
pub mod thorlabs;

/// Builder for a configured device kind, as named in `[instruments.*].kind`.
pub fn builder_for(kind: &str) -> Option<InstrumentBuilder> {
    match kind {
        "sr830" => Some(stanford::sr830_serial()),
        "sr830_gpib" => Some(stanford::sr830_gpib()),
        "ctc100" => Some(stanford::ctc100()),
        "tsp01" => Some(thorlabs::tsp01()),
        "st5q" => Some(applied_motion::st5q()),
        _ => None,
    }
}

/// Reset a SCPI instrument to power-on settings.
pub async fn reset(instrument: &Instrument) -> RigResult<()> {
    instrument.command("*RST").await
}

/// Clear a SCPI instrument's status bytes.
pub async fn clear_status(instrument: &Instrument) -> RigResult<()> {
    instrument.command("*CLS").await
}
