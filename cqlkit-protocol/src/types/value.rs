use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::Hash;
use std::net::IpAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Typed CQL value, as bound to statements and returned in rows. Byte layout is left to the
/// message codec.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Value {
    #[default]
    Null,
    Boolean(bool),
    Int(i32),
    BigInt(i64),
    Double(f64),
    Text(String),
    Blob(Vec<u8>),
    Uuid(Uuid),
    /// Milliseconds since the Unix epoch.
    Timestamp(i64),
    Inet(IpAddr),
    List(Vec<Value>),
    Map(Vec<(Value, Value)>),
    Tuple(Vec<Value>),
}

impl Value {
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Boolean(_) => "boolean",
            Value::Int(_) => "int",
            Value::BigInt(_) => "bigint",
            Value::Double(_) => "double",
            Value::Text(_) => "text",
            Value::Blob(_) => "blob",
            Value::Uuid(_) => "uuid",
            Value::Timestamp(_) => "timestamp",
            Value::Inet(_) => "inet",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Tuple(_) => "tuple",
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::BigInt(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Double(value)
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Blob(value)
    }
}

impl From<Uuid> for Value {
    fn from(value: Uuid) -> Self {
        Value::Uuid(value)
    }
}

impl From<IpAddr> for Value {
    fn from(value: IpAddr) -> Self {
        Value::Inet(value)
    }
}

impl From<SystemTime> for Value {
    fn from(value: SystemTime) -> Self {
        let millis = match value.duration_since(UNIX_EPOCH) {
            Ok(since) => since.as_millis() as i64,
            Err(before) => -(before.duration().as_millis() as i64),
        };

        Value::Timestamp(millis)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

impl<K: Into<Value>, V: Into<Value>> From<HashMap<K, V>> for Value
where
    K: Hash + Eq,
{
    fn from(value: HashMap<K, V>) -> Self {
        Value::Map(value.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

macro_rules! value_from_tuple {
    ($($name:ident $var:ident),+) => {
        impl<$($name: Into<Value>),+> From<($($name,)+)> for Value {
            fn from(($($var,)+): ($($name,)+)) -> Self {
                Value::Tuple(vec![$($var.into()),+])
            }
        }

        impl<$($name: FromCqlValue),+> FromCqlValue for ($($name,)+) {
            fn from_cql(value: &Value) -> Result<Self> {
                match value {
                    Value::Tuple(items) => {
                        let mut items = items.iter();
                        Ok(($(
                            $name::from_cql(items.next().ok_or_else(|| {
                                Error::Column("Tuple has too few elements".into())
                            })?)?,
                        )+))
                    }
                    other => Err(mismatch("tuple", other)),
                }
            }
        }
    };
}

/// Conversion from a column value into a Rust type.
pub trait FromCqlValue: Sized {
    fn from_cql(value: &Value) -> Result<Self>;
}

fn mismatch(expected: &str, actual: &Value) -> Error {
    Error::Column(format!(
        "Cannot convert {} into {expected}",
        actual.type_name()
    ))
}

macro_rules! from_cql_value {
    ($ty:ty, $variant:ident, $name:literal) => {
        impl FromCqlValue for $ty {
            fn from_cql(value: &Value) -> Result<Self> {
                match value {
                    Value::$variant(inner) => Ok(inner.clone()),
                    other => Err(mismatch($name, other)),
                }
            }
        }
    };
}

from_cql_value!(bool, Boolean, "boolean");
from_cql_value!(i32, Int, "int");
from_cql_value!(f64, Double, "double");
from_cql_value!(String, Text, "text");
from_cql_value!(Vec<u8>, Blob, "blob");
from_cql_value!(Uuid, Uuid, "uuid");
from_cql_value!(IpAddr, Inet, "inet");

impl FromCqlValue for i64 {
    fn from_cql(value: &Value) -> Result<Self> {
        match value {
            Value::BigInt(inner) | Value::Timestamp(inner) => Ok(*inner),
            Value::Int(inner) => Ok(*inner as i64),
            other => Err(mismatch("bigint", other)),
        }
    }
}

impl FromCqlValue for SystemTime {
    fn from_cql(value: &Value) -> Result<Self> {
        match value {
            Value::Timestamp(millis) if *millis >= 0 => {
                Ok(UNIX_EPOCH + Duration::from_millis(*millis as u64))
            }
            Value::Timestamp(millis) => Ok(UNIX_EPOCH - Duration::from_millis(millis.unsigned_abs())),
            other => Err(mismatch("timestamp", other)),
        }
    }
}

impl<T: FromCqlValue> FromCqlValue for Option<T> {
    fn from_cql(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(None),
            value => T::from_cql(value).map(Some),
        }
    }
}

impl<T: FromCqlValue> FromCqlValue for Vec<T> {
    fn from_cql(value: &Value) -> Result<Self> {
        match value {
            Value::List(items) => items.iter().map(T::from_cql).collect(),
            other => Err(mismatch("list", other)),
        }
    }
}

impl<K: FromCqlValue + Hash + Eq, V: FromCqlValue> FromCqlValue for HashMap<K, V> {
    fn from_cql(value: &Value) -> Result<Self> {
        match value {
            Value::Map(entries) => entries
                .iter()
                .map(|(k, v)| Ok((K::from_cql(k)?, V::from_cql(v)?)))
                .collect(),
            other => Err(mismatch("map", other)),
        }
    }
}

impl FromCqlValue for Value {
    fn from_cql(value: &Value) -> Result<Self> {
        Ok(value.clone())
    }
}

value_from_tuple!(A a);
value_from_tuple!(A a, B b);
value_from_tuple!(A a, B b, C c);
value_from_tuple!(A a, B b, C c, D d);
value_from_tuple!(A a, B b, C c, D d, E e);
