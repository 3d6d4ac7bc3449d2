//! Warehouse-side schema model and the mapping from Parquet (Arrow) types
//! onto it.
//!
//! Source files carry their own Parquet schema; before the first bulk load
//! of a run we read one representative file and translate its schema into
//! warehouse field definitions, with per-field overrides taking precedence
//! over the inferred entries.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use arrow::datatypes::{DataType, Schema as ArrowSchema};
use snafu::Snafu;
use std::collections::BTreeMap;
use std::fmt;

/// Schema mapping error.
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("no warehouse mapping for field '{name}' of Parquet type {datatype}"))]
    UnsupportedType { name: String, datatype: String },
}

/// Schema mapping result.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Column types supported by the destination warehouse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WarehouseType {
    /// `BOOLEAN`
    Boolean,
    /// `INT64`; both 32 and 64 bit source integers widen to it.
    Int64,
    /// `FLOAT64`; both 32 and 64 bit source floats widen to it.
    Float64,
    /// `DATE`
    Date,
    /// `TIMESTAMP`
    Timestamp,
    /// `STRING`
    String,
    /// `NUMERIC`, the warehouse's fixed 38-digit decimal.
    Numeric,
    /// `DECIMAL(precision, scale)` with explicit parameters.
    Decimal {
        /// Total number of digits.
        precision: usize,
        /// Digits right of the decimal point.
        scale: usize,
    },
}

impl fmt::Display for WarehouseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Boolean => write!(f, "BOOLEAN"),
            Self::Int64 => write!(f, "INT64"),
            Self::Float64 => write!(f, "FLOAT64"),
            Self::Date => write!(f, "DATE"),
            Self::Timestamp => write!(f, "TIMESTAMP"),
            Self::String => write!(f, "STRING"),
            Self::Numeric => write!(f, "NUMERIC"),
            Self::Decimal { precision, scale } => write!(f, "DECIMAL({precision},{scale})"),
        }
    }
}

/// Field modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldMode {
    /// Scalar column, may hold NULL.
    Nullable,
    /// Array column; one value per source list element.
    Repeated,
}

/// One column of a warehouse table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarehouseField {
    /// Column name, identical to the source field name.
    pub name: String,
    /// Column type.
    pub field_type: WarehouseType,
    /// Column mode.
    pub mode: FieldMode,
}

impl WarehouseField {
    /// Nullable scalar field.
    pub fn new(name: impl Into<String>, field_type: WarehouseType) -> Self {
        Self {
            name: name.into(),
            field_type,
            mode: FieldMode::Nullable,
        }
    }

    /// Repeated field.
    pub fn repeated(name: impl Into<String>, field_type: WarehouseType) -> Self {
        Self {
            name: name.into(),
            field_type,
            mode: FieldMode::Repeated,
        }
    }
}

/// Map one source field onto a warehouse field.
///
/// Total over the types the upstream emitter produces; anything else is a
/// hard error that must abort the run before any load is attempted.
pub fn warehouse_field(name: &str, datatype: &DataType) -> Result<WarehouseField> {
    let field_type = match datatype {
        DataType::Boolean => WarehouseType::Boolean,
        DataType::Int32 | DataType::Int64 => WarehouseType::Int64,
        DataType::Float32 | DataType::Float64 => WarehouseType::Float64,
        DataType::Date32 | DataType::Date64 => WarehouseType::Date,
        DataType::Timestamp(_, _) => WarehouseType::Timestamp,
        DataType::Utf8 | DataType::LargeUtf8 => WarehouseType::String,
        DataType::Decimal(precision, scale) => decimal_type(*precision, *scale),
        DataType::List(inner) | DataType::LargeList(inner) => {
            // A list becomes a repeated column of the mapped element type;
            // nested lists flatten to the innermost element type.
            let inner = warehouse_field(name, inner.data_type())?;
            return Ok(WarehouseField::repeated(name, inner.field_type));
        }
        other => {
            return UnsupportedTypeSnafu {
                name,
                datatype: other.to_string(),
            }
            .fail()
        }
    };

    Ok(WarehouseField::new(name, field_type))
}

/// The emitter encodes the warehouse's parameterless `NUMERIC` as a
/// 100-digit, zero-scale decimal; everything else keeps its parameters.
fn decimal_type(precision: usize, scale: usize) -> WarehouseType {
    if precision == 100 && scale == 0 {
        WarehouseType::Numeric
    } else {
        WarehouseType::Decimal { precision, scale }
    }
}

/// Map a whole source schema, applying `overrides` by field name.
///
/// An override replaces the inferred entry intact, so an overridden field is
/// never run through the type mapping at all (its source type may even be
/// unmappable).
pub fn warehouse_schema(
    schema: &ArrowSchema,
    overrides: &[WarehouseField],
) -> Result<Vec<WarehouseField>> {
    let overrides: BTreeMap<&str, &WarehouseField> = overrides
        .iter()
        .map(|field| (field.name.as_str(), field))
        .collect();

    schema
        .fields()
        .iter()
        .map(|field| match overrides.get(field.name().as_str()) {
            Some(replacement) => Ok((*replacement).clone()),
            None => warehouse_field(field.name(), field.data_type()),
        })
        .collect()
}
