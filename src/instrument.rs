//! Typed instruments over shared connections.
//!
//! An [`Instrument`] is a thin, declarative wrapper: a capability table of
//! named properties (get/set command templates) bound to one
//! [`Connection`](crate::registry::Connection). The table is declared once on
//! an [`InstrumentBuilder`] and looked up by name at call time; there is no
//! per-device code beyond the declarations in [`instruments`](crate::instruments).
//!
//! Every property access is one locked exchange on the owning connection, so
//! instruments are freely shareable across tasks (`Arc<Instrument>`): two
//! tasks hitting the same device serialize at the connection, two tasks
//! hitting different devices do not contend at all.
//!
//! Construction fails fast: the builder probes the device's identity before
//! anything is driven, so a swapped cable turns into an
//! [`IdentificationMismatch`](crate::error::RigError::IdentificationMismatch)
//! instead of silently programming the wrong hardware.

use crate::error::{RigError, RigResult};
use crate::registry::{Connection, ConnectionAddress, ConnectionRegistry};
use crate::transport::TransportFactory;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// One entry in an instrument's capability table.
///
/// Command templates use `strfmt` placeholders: `{subaddr}` is replaced by
/// the instrument's sub-address (channel number in a mainframe), `{value}`
/// by the formatted value in set commands.
#[derive(Clone, Debug)]
pub struct Property {
    get: Option<String>,
    set: Option<String>,
    unit: String,
    arity: usize,
}

impl Property {
    /// A readable and settable property.
    pub fn get_set(get: &str, set: &str, unit: &str) -> Self {
        Self {
            get: Some(get.to_string()),
            set: Some(set.to_string()),
            unit: unit.to_string(),
            arity: 1,
        }
    }

    /// A read-only property (measured results, sensor readings).
    pub fn get_only(get: &str, unit: &str) -> Self {
        Self {
            get: Some(get.to_string()),
            set: None,
            unit: unit.to_string(),
            arity: 1,
        }
    }

    /// A write-only property (actuation commands with no readback).
    pub fn set_only(set: &str, unit: &str) -> Self {
        Self {
            get: None,
            set: Some(set.to_string()),
            unit: unit.to_string(),
            arity: 1,
        }
    }

    /// Number of comma-separated values in the response (default 1).
    pub fn with_arity(mut self, arity: usize) -> Self {
        self.arity = arity;
        self
    }

    /// Unit string for recorded columns.
    pub fn unit(&self) -> &str {
        &self.unit
    }

    /// Number of values one read of this property returns.
    pub fn arity(&self) -> usize {
        self.arity
    }

    /// True when the property has a set template.
    pub fn is_settable(&self) -> bool {
        self.set.is_some()
    }
}

/// Declarative description of an instrument type, consumed by `connect`.
pub struct InstrumentBuilder {
    kind: String,
    identity_query: String,
    identity_prefixes: Vec<String>,
    setup_commands: Vec<String>,
    config_commands: Vec<String>,
    properties: HashMap<&'static str, Property>,
}

impl InstrumentBuilder {
    /// Start a declaration for the given instrument kind.
    pub fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            identity_query: "*IDN?".to_string(),
            identity_prefixes: Vec::new(),
            setup_commands: Vec::new(),
            config_commands: Vec::new(),
            properties: HashMap::new(),
        }
    }

    /// Accept devices whose identity response starts with `prefix`.
    ///
    /// May be given more than once; any accepted prefix passes the check.
    pub fn identity(mut self, prefix: &str) -> Self {
        self.identity_prefixes.push(prefix.to_string());
        self
    }

    /// Replace the identity probe command.
    ///
    /// Most devices answer `*IDN?`; the odd one needs something else (the
    /// stepper controller opens its session with `HR`).
    pub fn identity_query(mut self, query: &str) -> Self {
        self.identity_query = query.to_string();
        self
    }

    /// Raw command written before the identity check (termination modes,
    /// interface selection).
    pub fn setup_command(mut self, command: &str) -> Self {
        self.setup_commands.push(command.to_string());
        self
    }

    /// Raw command written after the identity check (units, filters,
    /// measurement speed).
    pub fn config_command(mut self, command: &str) -> Self {
        self.config_commands.push(command.to_string());
        self
    }

    /// Declare a named property.
    pub fn property(mut self, name: &'static str, property: Property) -> Self {
        self.properties.insert(name, property);
        self
    }

    /// Connect: acquire the shared connection, verify the device identity,
    /// run configuration, and return the ready instrument.
    pub async fn connect(
        self,
        registry: &ConnectionRegistry,
        address: &ConnectionAddress,
        factory: &TransportFactory,
    ) -> RigResult<Arc<Instrument>> {
        let connection = registry.acquire(address, factory).await?;
        for command in &self.setup_commands {
            connection.command(command).await?;
        }
        if !self.identity_prefixes.is_empty() {
            let response = connection.query(&self.identity_query).await?;
            if !self.identity_prefixes.iter().any(|p| response.starts_with(p.as_str())) {
                return Err(RigError::IdentificationMismatch {
                    address: address.to_string(),
                    expected: self.identity_prefixes[0].clone(),
                    got: response,
                });
            }
        }
        for command in &self.config_commands {
            connection.command(command).await?;
        }
        let instrument = Arc::new(Instrument {
            kind: self.kind,
            connection,
            subaddr: String::new(),
            properties: self.properties,
        });
        info!(instrument = %instrument, "connected");
        Ok(instrument)
    }

    /// Attach as a channel of an already-connected parent.
    ///
    /// Shares the parent's connection (and therefore its lock); performs no
    /// identity check of its own, the mainframe already answered for the
    /// whole chassis. `{subaddr}` in this builder's templates renders as
    /// `subaddr`.
    pub fn attach(self, parent: &Instrument, subaddr: &str) -> Arc<Instrument> {
        let instrument = Arc::new(Instrument {
            kind: self.kind,
            connection: parent.connection.clone(),
            subaddr: subaddr.to_string(),
            properties: self.properties,
        });
        debug!(instrument = %instrument, "channel attached");
        instrument
    }
}

/// A connected instrument: capability table plus shared connection.
pub struct Instrument {
    kind: String,
    connection: Arc<Connection>,
    subaddr: String,
    properties: HashMap<&'static str, Property>,
}

impl Instrument {
    /// Instrument kind (e.g. `"StanfordSR830"`).
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The shared connection this instrument exchanges on.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Look up a declared property.
    pub fn property(&self, name: &str) -> RigResult<&Property> {
        self.properties
            .get(name)
            .ok_or_else(|| RigError::UnknownProperty {
                instrument: self.kind.clone(),
                property: name.to_string(),
            })
    }

    fn render(&self, template: &str, value: Option<&str>) -> RigResult<String> {
        let mut vars: HashMap<String, String> = HashMap::new();
        vars.insert("subaddr".to_string(), self.subaddr.clone());
        if let Some(value) = value {
            vars.insert("value".to_string(), value.to_string());
        }
        strfmt::strfmt(template, &vars).map_err(|e| RigError::Configuration(format!(
            "bad command template '{template}' on {}: {e}",
            self.kind
        )))
    }

    fn parse_response(&self, name: &str, arity: usize, response: &str) -> RigResult<Vec<f64>> {
        let values: Result<Vec<f64>, _> = response
            .split(',')
            .map(|field| field.trim().parse::<f64>())
            .collect();
        let values = values.map_err(|e| RigError::InstrumentIo {
            address: self.connection.address().to_string(),
            detail: format!("could not parse '{response}' for property '{name}': {e}"),
        })?;
        if values.len() != arity {
            return Err(RigError::InstrumentIo {
                address: self.connection.address().to_string(),
                detail: format!(
                    "property '{name}' expected {arity} value(s), response '{response}' had {}",
                    values.len()
                ),
            });
        }
        Ok(values)
    }

    /// Read a property: one locked exchange, response parsed as
    /// comma-separated floats.
    pub async fn get(&self, name: &str) -> RigResult<Vec<f64>> {
        let property = self.property(name)?;
        let template = property
            .get
            .as_deref()
            .ok_or_else(|| RigError::ReadOnly(format!("{}.{name} (write-only)", self.kind)))?;
        let arity = property.arity;
        let command = self.render(template, None)?;
        let response = self.connection.query(&command).await?;
        self.parse_response(name, arity, &response)
    }

    /// Write a property: values joined with `,` and substituted for
    /// `{value}` in the set template, sent as one locked write.
    pub async fn set(&self, name: &str, values: &[f64]) -> RigResult<()> {
        let property = self.property(name)?;
        let template = property
            .set
            .as_deref()
            .ok_or_else(|| RigError::ReadOnly(format!("{}.{name}", self.kind)))?;
        let rendered: Vec<String> = values.iter().map(|v| v.to_string()).collect();
        let command = self.render(template, Some(&rendered.join(",")))?;
        self.connection.command(&command).await
    }

    /// Raw query passthrough for commands outside the capability table.
    pub async fn query(&self, command: &str) -> RigResult<String> {
        let command = self.render(command, None)?;
        self.connection.query(&command).await
    }

    /// Raw write-only passthrough.
    pub async fn command(&self, command: &str) -> RigResult<()> {
        let command = self.render(command, None)?;
        self.connection.command(&command).await
    }
}

impl fmt::Debug for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instrument")
            .field("kind", &self.kind)
            .field("subaddr", &self.subaddr)
            .field("address", &self.connection.address().to_string())
            .field("properties", &self.properties)
            .finish()
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.subaddr.is_empty() {
            write!(f, "{} at {}", self.kind, self.connection.address())
        } else {
            write!(
                f,
                "{} subaddr={} at {}",
                self.kind,
                self.subaddr,
                self.connection.address()
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{factory, SimulatedInstrument, Transport};

    fn sim_factory() -> TransportFactory {
        factory(|_address| async {
            Ok(Box::new(
                SimulatedInstrument::new("ACME,Cryostat,sn042,1.0")
                    .with_ramping_register("KELV? 1", 10.0, 1.0)
                    .with_register("SETP?", 20.0)
                    .with_setter("SETP", "SETP?"),
            ) as Box<dyn Transport>)
        })
    }

    fn cryostat() -> InstrumentBuilder {
        InstrumentBuilder::new("AcmeCryostat")
            .identity("ACME,Cryostat")
            .property("temperature", Property::get_only("KELV? {subaddr}", "K"))
            .property("setpoint", Property::get_set("SETP?", "SETP {value}", "K"))
    }

    #[tokio::test]
    async fn test_identity_check_passes_and_reads() {
        let registry = ConnectionRegistry::new();
        let address = ConnectionAddress::new("ASRL7::INSTR");
        let factory = sim_factory();
        let parent = cryostat().connect(&registry, &address, &factory).await.unwrap();
        let channel = InstrumentBuilder::new("AcmeCryostatChannel")
            .property("temperature", Property::get_only("KELV? {subaddr}", "K"))
            .attach(&parent, "1");

        assert_eq!(channel.get("temperature").await.unwrap(), vec![10.0]);
        assert_eq!(channel.get("temperature").await.unwrap(), vec![11.0]);
    }

    #[tokio::test]
    async fn test_identity_mismatch_fails_fast() {
        let registry = ConnectionRegistry::new();
        let address = ConnectionAddress::new("ASRL8::INSTR");
        let factory = sim_factory();
        let err = InstrumentBuilder::new("OtherVendorThing")
            .identity("OTHER,Thing")
            .connect(&registry, &address, &factory)
            .await
            .unwrap_err();
        assert!(matches!(err, RigError::IdentificationMismatch { .. }));
    }

    #[tokio::test]
    async fn test_set_then_readback() {
        let registry = ConnectionRegistry::new();
        let address = ConnectionAddress::new("ASRL7::INSTR");
        let factory = sim_factory();
        let instrument = cryostat().connect(&registry, &address, &factory).await.unwrap();

        instrument.set("setpoint", &[42.5]).await.unwrap();
        assert_eq!(instrument.get("setpoint").await.unwrap(), vec![42.5]);
    }

    #[tokio::test]
    async fn test_write_to_get_only_property() {
        let registry = ConnectionRegistry::new();
        let address = ConnectionAddress::new("ASRL7::INSTR");
        let factory = sim_factory();
        let instrument = cryostat().connect(&registry, &address, &factory).await.unwrap();

        let err = instrument.set("temperature", &[0.0]).await.unwrap_err();
        assert!(matches!(err, RigError::ReadOnly(_)));
    }

    #[tokio::test]
    async fn test_unknown_property_is_loud() {
        let registry = ConnectionRegistry::new();
        let address = ConnectionAddress::new("ASRL7::INSTR");
        let factory = sim_factory();
        let instrument = cryostat().connect(&registry, &address, &factory).await.unwrap();

        let err = instrument.get("pressure").await.unwrap_err();
        assert!(matches!(err, RigError::UnknownProperty { .. }));
    }
}
