//! Structs representing the different NVME Controller Properties
//!
//! Each register value is a newtype with named accessors. Callers of the
//! [Controller](crate::Controller) never see raw shifts and masks.
//!
//! The specification documents can be found at <https://nvmexpress.org/specifications/>
//! specifically: NVM Express Base Specification

use core::fmt::Display;

use bit_field::BitField;
use shared_derive::U8Enum;

/// The capabilities of the NVMe Controller
///
/// See: NVM Express Base Spec: Figure 36: Offset 0h: CAP
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities(u64);

impl Capabilities {
    /// The maximum number of entries of IO submission and completion queues.
    ///
    /// The register holds a 0 based value, this is converted to the actual count.
    pub fn maximum_queue_entries(self) -> u32 {
        self.0.get_bits(0..=15) as u32 + 1
    }

    /// CQR
    pub fn contiguous_queues_required(self) -> bool {
        self.0.get_bit(16)
    }

    /// AMS
    pub fn arbitrations_supported(self) -> u8 {
        self.0.get_bits(17..=18) as u8
    }

    /// Worst case time to wait for CSTS.RDY in 500ms units
    pub fn timeout(self) -> u8 {
        self.0.get_bits(24..=31) as u8
    }

    /// DSTRD, the raw doorbell stride exponent
    pub fn doorbell_stride_exponent(self) -> u8 {
        self.0.get_bits(32..=35) as u8
    }

    /// The distance between 2 doorbell registers in bytes
    pub fn doorbell_stride(self) -> usize {
        4 << self.doorbell_stride_exponent()
    }

    /// NSSRS
    pub fn subsystem_reset_supported(self) -> bool {
        self.0.get_bit(36)
    }

    /// CSS bit vector
    pub fn command_sets_supported(self) -> u8 {
        self.0.get_bits(37..=44) as u8
    }

    /// `true` if the NVM command set is supported
    pub fn supports_nvm_command_set(self) -> bool {
        self.command_sets_supported().get_bit(0)
    }

    /// The smallest supported memory page size as a shift (`size = 1 << shift`)
    pub fn min_page_shift(self) -> u8 {
        12 + self.0.get_bits(48..=51) as u8
    }

    /// The largest supported memory page size as a shift (`size = 1 << shift`)
    pub fn max_page_shift(self) -> u8 {
        12 + self.0.get_bits(52..=55) as u8
    }

    /// The raw register value
    pub fn value(self) -> u64 {
        self.0
    }
}

impl From<u64> for Capabilities {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Builder for raw capability values
///
/// Used to describe emulated controllers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilitiesBuilder {
    pub maximum_queue_entries: u32,
    pub contiguous_queues_required: bool,
    pub timeout: u8,
    pub doorbell_stride_exponent: u8,
    pub command_sets_supported: u8,
    pub min_page_shift: u8,
    pub max_page_shift: u8,
}

impl CapabilitiesBuilder {
    /// Creates the [Capabilities] described by this builder
    ///
    /// # Panics
    ///
    /// if any field does not fit into its register field
    pub fn build(self) -> Capabilities {
        assert!((2..=0x1_0000).contains(&self.maximum_queue_entries));
        assert!(self.doorbell_stride_exponent <= 0xf);
        assert!((12..=27).contains(&self.min_page_shift));
        assert!((self.min_page_shift..=27).contains(&self.max_page_shift));

        let mut value = 0u64;
        value.set_bits(0..=15, (self.maximum_queue_entries - 1) as u64);
        value.set_bit(16, self.contiguous_queues_required);
        value.set_bits(24..=31, self.timeout as u64);
        value.set_bits(32..=35, self.doorbell_stride_exponent as u64);
        value.set_bits(37..=44, self.command_sets_supported as u64);
        value.set_bits(48..=51, (self.min_page_shift - 12) as u64);
        value.set_bits(52..=55, (self.max_page_shift - 12) as u64);
        Capabilities(value)
    }
}

/// The NVMe version implemented by the controller
///
/// See: NVM Express Base Spec: Figure 37: Offset 8h: VS
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version(u32);

impl Version {
    pub const fn new(major: u16, minor: u8, tertiary: u8) -> Self {
        Self((major as u32) << 16 | (minor as u32) << 8 | tertiary as u32)
    }

    pub fn major(self) -> u16 {
        self.0.get_bits(16..=31) as u16
    }

    pub fn minor(self) -> u8 {
        self.0.get_bits(8..=15) as u8
    }

    pub fn tertiary(self) -> u8 {
        self.0.get_bits(0..=7) as u8
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

impl From<u32> for Version {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{}", self.major(), self.minor())?;
        if self.tertiary() != 0 {
            write!(f, ".{}", self.tertiary())?;
        }
        Ok(())
    }
}

/// Arbitration mechanism selected in [ControllerConfiguration]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, U8Enum)]
pub enum ArbitrationMechanism {
    RoundRobin = 0b000,
    WeightedRoundRobinWithUrgentPriorityClass = 0b001,
    VendorSpecific = 0b111,
}

/// Shutdown notification written to [ControllerConfiguration]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, U8Enum)]
pub enum ShutdownNotification {
    None = 0b00,
    Normal = 0b01,
    Abrupt = 0b10,
}

/// The configuration of the NVMe Controller
///
/// See: NVM Express Base Spec: Figure 46: Offset 14H: CC
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControllerConfiguration(u32);

impl ControllerConfiguration {
    pub fn enable(self) -> bool {
        self.0.get_bit(0)
    }

    pub fn set_enable(&mut self, enable: bool) {
        self.0.set_bit(0, enable);
    }

    /// CSS, 3 bit value set during initialization. `0` selects the NVM command set
    pub fn command_set_selected(self) -> u8 {
        self.0.get_bits(4..=6) as u8
    }

    pub fn set_command_set_selected(&mut self, css: u8) {
        self.0.set_bits(4..=6, css as u32);
    }

    /// The host memory page size as a shift. Calculated as `12 + MPS`
    pub fn memory_page_shift(self) -> u8 {
        12 + self.0.get_bits(7..=10) as u8
    }

    /// # Panics
    ///
    /// if `shift` is not in `12..=27`
    pub fn set_memory_page_shift(&mut self, shift: u8) {
        assert!((12..=27).contains(&shift), "invalid page shift {shift}");
        self.0.set_bits(7..=10, (shift - 12) as u32);
    }

    /// The selected arbitration mechanism, `None` for reserved values
    pub fn arbitration_mechanism(self) -> Option<ArbitrationMechanism> {
        (self.0.get_bits(11..=13) as u8).try_into().ok()
    }

    pub fn set_arbitration_mechanism(&mut self, ams: ArbitrationMechanism) {
        self.0.set_bits(11..=13, ams as u32);
    }

    /// SHN, `None` for the reserved value
    pub fn shutdown_notification(self) -> Option<ShutdownNotification> {
        (self.0.get_bits(14..=15) as u8).try_into().ok()
    }

    pub fn set_shutdown_notification(&mut self, shn: ShutdownNotification) {
        self.0.set_bits(14..=15, shn as u32);
    }

    /// IOSQES, the submission entry size as a power of 2
    pub fn io_submission_queue_entry_size(self) -> u8 {
        self.0.get_bits(16..=19) as u8
    }

    pub fn set_io_submission_queue_entry_size(&mut self, exponent: u8) {
        self.0.set_bits(16..=19, exponent as u32);
    }

    /// IOCQES, the completion entry size as a power of 2
    pub fn io_completion_queue_entry_size(self) -> u8 {
        self.0.get_bits(20..=23) as u8
    }

    pub fn set_io_completion_queue_entry_size(&mut self, exponent: u8) {
        self.0.set_bits(20..=23, exponent as u32);
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

impl From<u32> for ControllerConfiguration {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// The status reported by the controller
///
/// See: NVM Express Base Spec: Figure 47: Offset 1Ch: CSTS
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerStatus(u32);

impl ControllerStatus {
    /// RDY
    pub fn ready(self) -> bool {
        self.0.get_bit(0)
    }

    /// CFS
    pub fn fatal(self) -> bool {
        self.0.get_bit(1)
    }

    /// SHST
    pub fn shutdown_status(self) -> ShutdownStatus {
        match self.0.get_bits(2..=3) {
            0b00 => ShutdownStatus::NormalOperation,
            0b01 => ShutdownStatus::Occuring,
            0b10 => ShutdownStatus::Complete,
            _ => ShutdownStatus::Reserved,
        }
    }

    /// A controller that was hot removed or is otherwise not reachable reads as all ones
    pub fn is_unreadable(self) -> bool {
        self.0 == u32::MAX
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

impl From<u32> for ControllerStatus {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownStatus {
    NormalOperation,
    Occuring,
    Complete,
    Reserved,
}

impl ShutdownStatus {
    /// The raw SHST field value
    pub fn bits(self) -> u32 {
        match self {
            ShutdownStatus::NormalOperation => 0b00,
            ShutdownStatus::Occuring => 0b01,
            ShutdownStatus::Complete => 0b10,
            ShutdownStatus::Reserved => 0b11,
        }
    }
}

/// The sizes of the admin queues
///
/// See: NVM Express Base Spec: Figure 49: Offset 24h: AQA
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdminQueueAttributes(u32);

impl AdminQueueAttributes {
    /// Creates the attributes from the actual entry counts.
    ///
    /// # Panics
    ///
    /// if either size is not in `2..=4096`
    pub fn new(submission_queue_size: u16, completion_queue_size: u16) -> Self {
        assert!((2..=4096).contains(&submission_queue_size));
        assert!((2..=4096).contains(&completion_queue_size));

        let mut value = 0;
        // both sizes are 0 based values
        value.set_bits(0..=11, (submission_queue_size - 1) as u32);
        value.set_bits(16..=27, (completion_queue_size - 1) as u32);
        Self(value)
    }

    pub fn submission_queue_size(self) -> u16 {
        self.0.get_bits(0..=11) as u16 + 1
    }

    pub fn completion_queue_size(self) -> u16 {
        self.0.get_bits(16..=27) as u16 + 1
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

impl From<u32> for AdminQueueAttributes {
    fn from(value: u32) -> Self {
        Self(value)
    }
}
