use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::Hash;

use crate::types::value::Value;

/// Enum that represents two types of query values:
/// * values without name
/// * values with names
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QueryValues {
    SimpleValues(Vec<Value>),
    NamedValues(HashMap<String, Value>),
}

impl QueryValues {
    /// Returns `true` if query values is with names and `false` otherwise.
    #[inline]
    pub fn has_names(&self) -> bool {
        !matches!(*self, QueryValues::SimpleValues(_))
    }

    /// Returns the number of values.
    pub fn len(&self) -> usize {
        match self {
            QueryValues::SimpleValues(v) => v.len(),
            QueryValues::NamedValues(m) => m.len(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Looks up a value by position or, for named values, by name.
    pub fn get(&self, index: usize, name: &str) -> Option<&Value> {
        match self {
            QueryValues::SimpleValues(v) => v.get(index),
            QueryValues::NamedValues(m) => m.get(name),
        }
    }
}

impl<T: Into<Value>> From<Vec<T>> for QueryValues {
    fn from(values: Vec<T>) -> QueryValues {
        QueryValues::SimpleValues(values.into_iter().map(Into::into).collect())
    }
}

impl<S: ToString + Hash + Eq, V: Into<Value>> From<HashMap<S, V>> for QueryValues {
    fn from(values: HashMap<S, V>) -> QueryValues {
        QueryValues::NamedValues(
            values
                .into_iter()
                .map(|(name, value)| (name.to_string(), value.into()))
                .collect(),
        )
    }
}
