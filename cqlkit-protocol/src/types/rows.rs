use std::sync::Arc;

use crate::error::{column_is_empty_err, Error, Result};
use crate::frame::message_result::BodyResResultRows;
use crate::types::value::{FromCqlValue, Value};

/// Single result row with access to columns by name.
#[derive(Clone, Debug, PartialEq)]
pub struct Row {
    column_names: Arc<Vec<String>>,
    row_content: Vec<Value>,
}

impl Row {
    pub fn from_body(body: BodyResResultRows) -> Vec<Row> {
        let column_names = Arc::new(body.column_names);
        body.rows_content
            .into_iter()
            .map(|row_content| Row {
                column_names: column_names.clone(),
                row_content,
            })
            .collect()
    }

    /// Checks if a column is present in the row.
    pub fn contains_column(&self, name: &str) -> bool {
        self.column_names.iter().any(|column| column == name)
    }

    /// Checks for NULL for a given column. Returns false if given column does not exist.
    pub fn is_empty_by_name(&self, name: &str) -> bool {
        self.value_by_name(name).is_some_and(Value::is_null)
    }

    pub fn value_by_name(&self, name: &str) -> Option<&Value> {
        self.column_names
            .iter()
            .position(|column| column == name)
            .and_then(|index| self.row_content.get(index))
    }

    /// Returns `None` for a missing column or a NULL value.
    pub fn get_by_name<T: FromCqlValue>(&self, name: &str) -> Result<Option<T>> {
        match self.value_by_name(name) {
            Some(value) => Option::<T>::from_cql(value),
            None => Ok(None),
        }
    }

    /// Like `get_by_name`, but a missing column or NULL value is an error.
    pub fn get_r_by_name<T: FromCqlValue>(&self, name: &str) -> Result<T> {
        self.get_by_name(name)?
            .ok_or_else(|| column_is_empty_err(name))
    }

    pub fn get_by_index<T: FromCqlValue>(&self, index: usize) -> Result<Option<T>> {
        self.row_content
            .get(index)
            .ok_or_else(|| Error::Column(format!("Column index {index} out of bounds")))
            .and_then(Option::<T>::from_cql)
    }
}
