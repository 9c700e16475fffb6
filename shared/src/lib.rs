//! Utilities shared between the driver crates
#![no_std]

#[cfg(test)]
extern crate std;

pub mod lockcell;
pub mod math;
pub mod primitive_enum;
