//! NVMe host controller driver
//!
//! Implements the queue pair submission/completion protocol, the command
//! context and DMA resource management and the controller bring-up and
//! shutdown state machine of an NVM Express host driver.
//!
//! The driver does not own any hardware itself. The environment provides
//! a [RegisterWindow] for the mapped controller registers, a [DmaAllocator]
//! for device visible memory and a [Delay] for bounded busy waiting.
//!
//! The specification documents can be found at <https://nvmexpress.org/specifications/>
//! specifically: NVM Express Base Specification and NVM Command Set Specification
#![no_std]

extern crate alloc;

#[cfg(any(test, feature = "sim"))]
extern crate std;

pub mod admin_commands;
pub mod ccb;
pub mod controller;
pub mod delay;
pub mod dma;
pub mod error;
pub mod generic_command;
pub mod io_commands;
pub mod namespace;
pub mod properties;
pub mod prp;
pub mod queue;
pub mod registers;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use ccb::{CcbPool, CommandContext};
pub use controller::{
    Controller, ControllerConfig, ControllerConfigBuilder, ControllerConfigError, ControllerInfo,
    ControllerState, InterruptMode,
};
pub use delay::Delay;
pub use dma::{DmaAllocator, DmaBuffer, DmaError, DmaRegion, IoBuffer, Segment, SyncDirection};
pub use error::{NvmeError, Resource, Violation};
pub use generic_command::{
    CommandIdentifier, CommandStatusCode, CommonCommand, CommonCompletionEntry,
    GenericCommandStatus,
};
pub use namespace::{CacheStatus, FlushOutcome, IoCompletion, Namespace, NamespaceInfo, SubmitError};
pub use queue::{DoneFn, Queue, QueueIdentifier};
pub use registers::{MmioRegisters, RegisterWindow};
