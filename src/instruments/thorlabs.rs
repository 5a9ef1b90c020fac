//! Thorlabs devices.

use crate::instrument::{InstrumentBuilder, Property};

/// TSP01 temperature and humidity dongle. All channels are read-only.
pub fn tsp01() -> InstrumentBuilder {
    InstrumentBuilder::new("ThorlabsTSP01")
        .identity("Thorlabs,TSP01,")
        .property("temperature_internal", Property::get_only("SENS1:TEMP:DATA?", "degC"))
        .property("temperature_external_1", Property::get_only("SENS3:TEMP:DATA?", "degC"))
        .property("temperature_external_2", Property::get_only("SENS4:TEMP:DATA?", "degC"))
        .property("humidity", Property::get_only("SENS2:HUM:DATA?", "%"))
}
