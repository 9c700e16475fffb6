//! utilites for the primitive enum proc-macro

use thiserror::Error;

/// Error type used to denote that a given value is invalid for the operation
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("invalid value: {value:#x}")]
pub struct InvalidValue<T: core::fmt::LowerHex> {
    /// the invalid value
    pub value: T,
}
