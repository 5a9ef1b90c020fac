//! Named, unit-tagged measurement and control points.
//!
//! A [`Quantity`] is the thing an experiment script or recorder actually
//! talks about: "sample temperature in K", "lock-in X and Y in V". It binds
//! display names and units to one or more accessors — instrument properties
//! or arbitrary async callables — and is immutable after construction.
//!
//! A multi-source quantity reads all of its accessors back to back as one
//! logical sample event. That event is only instrument-local atomic: sources
//! on one connection serialize under its lock, sources spanning connections
//! have no cross-instrument atomicity guarantee.

use crate::error::{RigError, RigResult};
use crate::instrument::Instrument;
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

type Callable = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<Vec<f64>>> + Send + Sync>;

enum Source {
    Property {
        instrument: Arc<Instrument>,
        property: String,
        arity: usize,
    },
    Callable {
        call: Callable,
        arity: usize,
    },
}

impl Source {
    fn arity(&self) -> usize {
        match self {
            Source::Property { arity, .. } | Source::Callable { arity, .. } => *arity,
        }
    }
}

/// A named, unit-tagged accessor bound to instrument properties or callables.
pub struct Quantity {
    names: Vec<String>,
    units: Vec<String>,
    scale: Vec<f64>,
    sources: Vec<Source>,
}

impl Quantity {
    /// Bind to one instrument property.
    ///
    /// `names` must have one entry per value the property returns (its
    /// arity); units come from the property declaration. The binding holds
    /// the instrument alive, which in turn keeps the connection registered —
    /// the registry refuses to release a connection under a live quantity.
    pub fn from_property(
        names: &[&str],
        instrument: &Arc<Instrument>,
        property: &str,
    ) -> RigResult<Self> {
        let prop = instrument.property(property)?;
        if names.len() != prop.arity() {
            return Err(RigError::Shape {
                name: names.join("/"),
                detail: format!(
                    "{} name(s) given for property '{property}' with arity {}",
                    names.len(),
                    prop.arity()
                ),
            });
        }
        let unit = prop.unit().to_string();
        let declared = prop.arity();
        debug!(
            quantity = %names.join("/"),
            source = %format!("{instrument}.{property}"),
            "quantity bound"
        );
        Ok(Self {
            names: names.iter().map(|s| s.to_string()).collect(),
            units: vec![unit; declared],
            scale: vec![1.0; declared],
            sources: vec![Source::Property {
                instrument: instrument.clone(),
                property: property.to_string(),
                arity: declared,
            }],
        })
    }

    /// Bind to an async callable producing the listed `(name, unit)` columns.
    ///
    /// Callable quantities are always read-only.
    pub fn from_fn<F, Fut>(columns: &[(&str, &str)], call: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<Vec<f64>>> + Send + 'static,
    {
        let arity = columns.len();
        Self {
            names: columns.iter().map(|(n, _)| n.to_string()).collect(),
            units: columns.iter().map(|(_, u)| u.to_string()).collect(),
            scale: vec![1.0; arity],
            sources: vec![Source::Callable {
                call: Arc::new(move || Box::pin(call())),
                arity,
            }],
        }
    }

    /// Concatenate several quantities into one wider sample event.
    pub fn join(parts: impl IntoIterator<Item = Quantity>) -> Self {
        let mut names = Vec::new();
        let mut units = Vec::new();
        let mut scale = Vec::new();
        let mut sources = Vec::new();
        for part in parts {
            names.extend(part.names);
            units.extend(part.units);
            scale.extend(part.scale);
            sources.extend(part.sources);
        }
        Self { names, units, scale, sources }
    }

    /// Multiply each read-back column by the given factors (pF from F, mW
    /// from W). Writes divide by the same factors.
    pub fn with_scale(mut self, scale: &[f64]) -> RigResult<Self> {
        if scale.len() != self.names.len() {
            return Err(RigError::Shape {
                name: self.display_name(),
                detail: format!(
                    "{} scale factor(s) for {} column(s)",
                    scale.len(),
                    self.names.len()
                ),
            });
        }
        self.scale = scale.to_vec();
        Ok(self)
    }

    /// Read the binding once to prove it works, then return it shareable.
    ///
    /// Catches a typo'd property name or a dead source at bind time instead
    /// of an hour into a run. Use plain construction when a probe read has
    /// side effects worth avoiding.
    pub async fn verified(self) -> RigResult<Arc<Self>> {
        self.read().await?;
        Ok(Arc::new(self))
    }

    /// Column display names (become CSV headers).
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Column units.
    pub fn units(&self) -> &[String] {
        &self.units
    }

    /// Total number of columns.
    pub fn arity(&self) -> usize {
        self.names.len()
    }

    fn display_name(&self) -> String {
        self.names.join("/")
    }

    /// Read every source back to back, apply scale factors, return one row
    /// of values in column order.
    pub async fn read(&self) -> RigResult<Vec<f64>> {
        let mut values = Vec::with_capacity(self.arity());
        for source in &self.sources {
            match source {
                Source::Property { instrument, property, .. } => {
                    values.extend(instrument.get(property).await?);
                }
                Source::Callable { call, .. } => {
                    let produced = call().await.map_err(|e| RigError::Source(format!(
                        "callable source of '{}' failed: {e}",
                        self.display_name()
                    )))?;
                    values.extend(produced);
                }
            }
        }
        if values.len() != self.arity() {
            return Err(RigError::Shape {
                name: self.display_name(),
                detail: format!("sources produced {} value(s), expected {}", values.len(), self.arity()),
            });
        }
        for (value, factor) in values.iter_mut().zip(&self.scale) {
            *value *= factor;
        }
        Ok(values)
    }

    /// True when every source is a settable instrument property.
    pub fn is_settable(&self) -> bool {
        self.sources.iter().all(|source| match source {
            Source::Property { instrument, property, .. } => instrument
                .property(property)
                .map(|p| p.is_settable())
                .unwrap_or(false),
            Source::Callable { .. } => false,
        })
    }

    /// Write values through to the bound properties, in column order.
    ///
    /// Fails with [`RigError::ReadOnly`] if any source has no setter, and
    /// with [`RigError::Shape`] on a value-count mismatch. Scale factors are
    /// applied inversely so callers write in the same units they read.
    pub async fn write(&self, values: &[f64]) -> RigResult<()> {
        if values.len() != self.arity() {
            return Err(RigError::Shape {
                name: self.display_name(),
                detail: format!("{} value(s) for {} column(s)", values.len(), self.arity()),
            });
        }
        if !self.is_settable() {
            return Err(RigError::ReadOnly(self.display_name()));
        }
        let device_values: Vec<f64> = values
            .iter()
            .zip(&self.scale)
            .map(|(v, s)| v / s)
            .collect();
        let mut offset = 0;
        for source in &self.sources {
            let arity = source.arity();
            if let Source::Property { instrument, property, .. } = source {
                instrument
                    .set(property, &device_values[offset..offset + arity])
                    .await?;
            }
            offset += arity;
        }
        Ok(())
    }
}

impl fmt::Debug for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Quantity({})", self.display_name())
    }
}
