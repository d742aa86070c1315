//! Renaming of decoded packet fields into caller-defined output keys.
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use rust_decimal::{Decimal, RoundingStrategy};
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use crate::specification::PacketField;

/// Formatted values keyed by packet field id.
pub type FormattedValues = BTreeMap<String, String>;

/// The payload built on every publish tick, keyed by output key.
pub type OutputParameters = BTreeMap<String, String>;

pub type Derivation = Arc<dyn Fn(&FormattedValues) -> Option<DerivedValue> + Send + Sync>;

#[derive(Error, Debug, PartialEq)]
pub enum FormattingError {
    #[error("value of field {field_id} is not a finite number")]
    NotFinite { field_id: String },
}

#[derive(Error, Debug)]
pub enum MappingError {
    #[error("field map is not a valid JSON object: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("derivation for {key:?} needs {expected} operands, got {actual}")]
    Operands {
        key: String,
        expected: usize,
        actual: usize,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum DerivedValue {
    Text(String),
    Number(f64),
}

#[derive(Clone)]
pub enum FieldMapping {
    /// Take the formatted value of this packet field id.
    Direct(String),
    /// Compute a value from all formatted values.
    Derived(Derivation),
}

impl fmt::Debug for FieldMapping {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FieldMapping::Direct(field_id) => f.debug_tuple("Direct").field(field_id).finish(),
            FieldMapping::Derived(_) => f.write_str("Derived(..)"),
        }
    }
}

/// Renders the raw value with the fixed number of decimals of its field type.
/// Exact halves round away from zero, `2.5` with no decimals is `"3"`.
pub fn format_value(field: &PacketField) -> Result<String, FormattingError> {
    if !field.raw_value.is_finite() {
        return Err(FormattingError::NotFinite {
            field_id: field.id.clone(),
        });
    }

    let precision = field.field_type.precision;
    let rounded = u32::try_from(precision).ok().and_then(|dp| {
        Decimal::from_f64_retain(field.raw_value)
            .map(|value| value.round_dp_with_strategy(dp, RoundingStrategy::MidpointAwayFromZero))
    });

    // Out of decimal range, only reachable for huge magnitudes
    Ok(match rounded {
        Some(value) => format!("{:.*}", precision, value),
        None => format!("{:.*}", precision, field.raw_value),
    })
}

/// Formats every field. A field that cannot be formatted is logged and left
/// out, the others are unaffected.
pub fn formatted_values(fields: &[PacketField]) -> FormattedValues {
    let mut values = FormattedValues::new();
    for field in fields {
        match format_value(field) {
            Ok(value) => {
                values.insert(field.id.clone(), value);
            }
            Err(error) => {
                warn!("omitting field from output: {}", error);
                metrics::counter!("vbus_fields_omitted_total").increment(1);
            }
        }
    }
    values
}

/// The output key to field mapping table.
#[derive(Clone, Debug, Default)]
pub struct OutputMapping {
    entries: Vec<(String, FieldMapping)>,
}

impl OutputMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn direct(mut self, key: &str, field_id: &str) -> Self {
        self.entries
            .push((key.to_owned(), FieldMapping::Direct(field_id.to_owned())));
        self
    }

    pub fn derived<F>(mut self, key: &str, derivation: F) -> Self
    where
        F: Fn(&FormattedValues) -> Option<DerivedValue> + Send + Sync + 'static,
    {
        self.entries
            .push((key.to_owned(), FieldMapping::Derived(Arc::new(derivation))));
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Builds the output parameters. Keys whose field is missing, or whose
    /// derivation yields nothing, are left out of the result.
    pub fn resolve(&self, values: &FormattedValues) -> OutputParameters {
        self.entries
            .iter()
            .filter_map(|(key, mapping)| {
                let value = match mapping {
                    FieldMapping::Direct(field_id) => values.get(field_id).cloned(),
                    FieldMapping::Derived(derivation) => match derivation(values)? {
                        DerivedValue::Text(text) => Some(text),
                        // Plain decimal notation at any magnitude, never exponents
                        DerivedValue::Number(number) if number.is_finite() => {
                            Some(number.to_string())
                        }
                        DerivedValue::Number(_) => {
                            warn!("derivation for {} produced a non-finite number", key);
                            None
                        }
                    },
                }?;
                Some((key.clone(), value))
            })
            .collect()
    }
}

/// Entry of a field map as written in configuration.
#[derive(Deserialize)]
#[serde(untagged)]
enum MappingEntry {
    Field(String),
    Sum { sum: Vec<String> },
    Difference { difference: Vec<String> },
}

impl FromStr for OutputMapping {
    type Err = MappingError;

    /// Parses a JSON object of `output key -> field id | {"sum": [..]} | {"difference": [a, b]}`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let table: BTreeMap<String, MappingEntry> = serde_json::from_str(s)?;

        table
            .into_iter()
            .try_fold(OutputMapping::new(), |mapping, (key, entry)| match entry {
                MappingEntry::Field(field_id) => Ok(mapping.direct(&key, &field_id)),
                MappingEntry::Sum { sum } => Ok(mapping.derived(&key, move |values| {
                    let operands = parse_operands(values, &sum)?;
                    Some(DerivedValue::Number(operands.iter().sum()))
                })),
                MappingEntry::Difference { difference } => {
                    if difference.len() != 2 {
                        return Err(MappingError::Operands {
                            key,
                            expected: 2,
                            actual: difference.len(),
                        });
                    }
                    Ok(mapping.derived(&key, move |values| {
                        let operands = parse_operands(values, &difference)?;
                        Some(DerivedValue::Number(operands[0] - operands[1]))
                    }))
                }
            })
    }
}

fn parse_operands(values: &FormattedValues, field_ids: &[String]) -> Option<Vec<f64>> {
    field_ids
        .iter()
        .map(|id| values.get(id)?.parse::<f64>().ok())
        .collect()
}
