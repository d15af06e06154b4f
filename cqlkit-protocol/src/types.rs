pub mod rows;
pub mod value;

pub use rows::Row;
pub use value::{FromCqlValue, Value};
