//! Default argument conversion.

use super::{NamedValue, Value};
use crate::error::{Error, Result};

/// Converts an argument into a value the driver accepts.
pub trait ValueConverter: Send + Sync {
    fn convert_value(&self, value: &Value) -> Result<Value>;
}

/// Canonicalises arguments to the kinds every driver must accept:
/// `Bool`, `BigInt`, `Double`, `String` and `Bytes`.
///
/// Narrower integers widen to `BigInt`, `Float` widens to `Double` and `Char`
/// becomes a one-character `String`. A null keeps its (widened) kind.
/// Unsigned values above `i64::MAX` and kinds outside the list are rejected.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultParameterConverter;

pub static DEFAULT_PARAMETER_CONVERTER: DefaultParameterConverter = DefaultParameterConverter;

impl ValueConverter for DefaultParameterConverter {
    fn convert_value(&self, value: &Value) -> Result<Value> {
        let converted = match value {
            Value::Bool(_)
            | Value::BigInt(_)
            | Value::Double(_)
            | Value::String(_)
            | Value::Bytes(_) => value.clone(),
            Value::TinyInt(v) => Value::BigInt(v.map(i64::from)),
            Value::SmallInt(v) => Value::BigInt(v.map(i64::from)),
            Value::Int(v) => Value::BigInt(v.map(i64::from)),
            Value::TinyUnsigned(v) => Value::BigInt(v.map(i64::from)),
            Value::SmallUnsigned(v) => Value::BigInt(v.map(i64::from)),
            Value::Unsigned(v) => Value::BigInt(v.map(i64::from)),
            Value::BigUnsigned(None) => Value::BigInt(None),
            Value::BigUnsigned(Some(v)) => {
                let v = i64::try_from(*v).map_err(|_| {
                    Error::Convert(format!(
                        "uint64 values with high bit set are not supported: {v}"
                    ))
                })?;
                Value::BigInt(Some(v))
            }
            Value::Float(v) => Value::Double(v.map(f64::from)),
            Value::Char(Some(c)) => Value::from(c.to_string()),
            Value::Char(None) => Value::String(None),
            #[allow(unreachable_patterns)]
            other => {
                return Err(Error::Convert(format!("unsupported type {other:?}")));
            }
        };
        Ok(converted)
    }
}

/// Run the default converter over `nv` in place.
pub fn default_check_named_value(nv: &mut NamedValue) -> Result<()> {
    nv.value = DEFAULT_PARAMETER_CONVERTER.convert_value(&nv.value)?;
    Ok(())
}
