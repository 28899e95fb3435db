//! Columnar materialization of decoded records as Arrow arrays.
//!
//! - [`ColumnBuffer`] accumulates one leaf field while rows are decoded and
//!   records per-row group lengths for repeated fields.
//! - [`Column`] is the finished form, either a typed Arrow array or a list of
//!   generic values for leaf types that have no fixed array representation.

pub mod builder;
pub mod column;

pub use builder::{ColumnBuffer, NullPolicy};
pub use column::{regroup, Column};
