//! Software emulation of a controller and its environment
//!
//! Used by the tests and the host runner. [SimBench] wires a [SimController],
//! [SimMemory] and [SimDelay] together so a [Controller] can be attached to
//! it like to real hardware.

use core::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
use std::sync::Arc;

use crate::{
    controller::{Controller, ControllerConfig},
    delay::Delay,
    dma::DmaAllocator,
    error::NvmeError,
    registers::RegisterWindow,
};

mod device;
mod memory;

pub use device::*;
pub use memory::*;

/// A [Delay] that only counts the requested time.
///
/// With `sleep` set it actually sleeps, which is needed when the controller
/// runs concurrently with the driver.
#[derive(Debug, Default)]
pub struct SimDelay {
    waited_us: AtomicU64,
    sleep: bool,
}

impl SimDelay {
    pub fn sleeping() -> Self {
        Self {
            waited_us: AtomicU64::new(0),
            sleep: true,
        }
    }

    /// The total time waited in microseconds
    pub fn total_us(&self) -> u64 {
        self.waited_us.load(Ordering::Relaxed)
    }
}

impl Delay for SimDelay {
    fn delay_us(&self, us: u32) {
        self.waited_us.fetch_add(us as u64, Ordering::Relaxed);
        if self.sleep {
            std::thread::sleep(Duration::from_micros(us as u64));
        }
    }
}

/// A [SimController] together with the environment a [Controller] needs
#[derive(Debug, Clone)]
pub struct SimBench {
    pub device: Arc<SimController>,
    pub memory: Arc<SimMemory>,
    pub delay: Arc<SimDelay>,
}

impl SimBench {
    pub fn new(config: SimConfig) -> Self {
        Self::with_delay(config, SimDelay::default())
    }

    pub fn with_delay(config: SimConfig, delay: SimDelay) -> Self {
        let memory = Arc::new(SimMemory::new());
        let device = Arc::new(SimController::new(config, memory.clone()));
        Self {
            device,
            memory,
            delay: Arc::new(delay),
        }
    }

    /// Creates a detached [Controller] for the emulated device
    pub fn controller(&self, config: ControllerConfig) -> Result<Controller, NvmeError> {
        let registers: Arc<dyn RegisterWindow> = self.device.clone();
        let allocator: Arc<dyn DmaAllocator> = self.memory.clone();
        let delay: Arc<dyn Delay> = self.delay.clone();
        Controller::new(registers, allocator, delay, config)
    }
}
