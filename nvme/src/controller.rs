//! NVMe controller bring-up, shutdown and I/O queue management
//!
//! A [Controller] owns the admin queue, the I/O queues and the register
//! window of a single device. [Controller::attach] runs the full
//! initialization sequence and [Controller::shutdown] the reverse.
//!
//! The specification documents can be found at <https://nvmexpress.org/specifications/>
//! specifically: NVM Express Base Specification: 3.5 Controller Initialization
//! and 3.6 Shutdown Processing

use core::{
    mem,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use alloc::{string::String, sync::Arc, vec::Vec};
use derive_builder::Builder;
use derive_where::derive_where;
use thiserror::Error;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
    admin_commands::{
        abort_not_performed, create_abort_command, create_identify_command,
        create_io_completion_queue, create_io_submission_queue, create_set_features_command,
        delete_io_completion_queue, delete_io_submission_queue, CompletionInterrupt,
        IdentifyControllerData, IdentifyNamespaceData, IdentifyTarget, NumberOfQueues,
        SetFeatureData, IDENTIFY_DATA_SIZE,
    },
    delay::{iterations, Delay},
    dma::{DmaAllocator, DmaBuffer, SyncDirection},
    error::{NvmeError, Resource, Violation},
    generic_command::{CommandIdentifier, CommonCommand, CommonCompletionEntry},
    namespace::{Namespace, NamespaceInfo},
    properties::{
        AdminQueueAttributes, ArbitrationMechanism, Capabilities, ControllerConfiguration,
        ControllerStatus, ShutdownNotification, ShutdownStatus, Version,
    },
    prp::PRP_ENTRY_SIZE,
    queue::{ControllerHealth, Queue, QueueEnvironment, QueueIdentifier},
    registers::{
        RegisterWindow, ADMIN_COMPLETION_QUEUE, ADMIN_QUEUE_ATTRIBUTES, ADMIN_SUBMISSION_QUEUE,
        CAPABILITIES, CONTROLLER_CONFIGURATION, CONTROLLER_STATUS, INTERRUPT_MASK_CLEAR,
        INTERRUPT_MASK_SET, VERSION,
    },
};

/// Time the controller gets to latch ASQ, ACQ and AQA
const REGISTER_SETTLE_US: u32 = 5000;

/// CAP.TO is given in 500ms units
const READY_TIMEOUT_UNIT_MS: u64 = 500;

/// log2 of the submission entry size, written to CC.IOSQES
const SUBMISSION_ENTRY_SHIFT: u8 = 6;
/// log2 of the completion entry size, written to CC.IOCQES
const COMPLETION_ENTRY_SHIFT: u8 = 4;

/// The largest transfer the single page list of a command context can describe
fn page_list_limit(page_size: usize) -> usize {
    page_size / PRP_ENTRY_SIZE * page_size
}

/// How completion interrupts are routed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InterruptMode {
    /// All queues share vector 0. The handler masks it through INTMS/INTMC
    #[default]
    SingleVector,
    /// Every I/O queue uses the vector matching its identifier
    MultiVector,
}

/// Host side settings of a [Controller]
#[derive(Debug, Clone, Builder)]
#[builder(
    no_std,
    pattern = "owned",
    build_fn(validate = "Self::validate", error = "ControllerConfigError")
)]
pub struct ControllerConfig {
    /// host memory page size as a shift (`size = 1 << shift`)
    #[builder(default = "12")]
    pub page_shift: u8,

    /// the largest transfer the host supports in bytes.
    ///
    /// Limited to `(page_size / 8) * page_size`, what a single page of PRP
    /// entries can describe.
    #[builder(default = "131072")]
    pub max_transfer_size: usize,

    #[builder(default = "32")]
    pub admin_entries: u32,

    /// number of I/O queue pairs created by [Controller::attach]
    #[builder(default = "1")]
    pub io_queue_count: u16,

    #[builder(default = "256")]
    pub io_entries: u32,

    #[builder(default)]
    pub interrupt_mode: InterruptMode,

    /// delay between 2 checks of a polled command
    #[builder(default = "10")]
    pub poll_step_us: u32,

    /// delay between 2 checks of CSTS.RDY
    #[builder(default = "1000")]
    pub ready_step_us: u32,

    #[builder(default = "4000")]
    pub shutdown_iterations: u32,

    #[builder(default = "1000")]
    pub shutdown_step_us: u32,

    /// timeout for queue creation, deletion and other short admin commands
    #[builder(default = "Duration::from_secs(5)")]
    pub queue_timeout: Duration,

    #[builder(default = "Duration::from_secs(10)")]
    pub identify_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            page_shift: 12,
            max_transfer_size: 131072,
            admin_entries: 32,
            io_queue_count: 1,
            io_entries: 256,
            interrupt_mode: InterruptMode::SingleVector,
            poll_step_us: 10,
            ready_step_us: 1000,
            shutdown_iterations: 4000,
            shutdown_step_us: 1000,
            queue_timeout: Duration::from_secs(5),
            identify_timeout: Duration::from_secs(10),
        }
    }
}

impl ControllerConfigBuilder {
    fn validate(&self) -> Result<(), ControllerConfigError> {
        if let Some(shift) = self.page_shift {
            if !(12..=27).contains(&shift) {
                return Err(ControllerConfigError::PageShift(shift));
            }
        }
        let page_size = 1usize << self.page_shift.unwrap_or(12);
        if self.max_transfer_size.is_some_and(|size| size < page_size) {
            return Err(ControllerConfigError::MaxTransferSize);
        }
        if self
            .admin_entries
            .is_some_and(|entries| !(2..=4096).contains(&entries))
        {
            return Err(ControllerConfigError::QueueEntries("admin_entries"));
        }
        if self
            .io_entries
            .is_some_and(|entries| !(2..=1 << 16).contains(&entries))
        {
            return Err(ControllerConfigError::QueueEntries("io_entries"));
        }
        if self.io_queue_count.is_some_and(|count| count == u16::MAX) {
            return Err(ControllerConfigError::QueueCount);
        }
        Ok(())
    }
}

/// Error used by [ControllerConfigBuilder]
#[allow(missing_docs)]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ControllerConfigError {
    #[error("Field \"{0}\" not initialized in ControllerConfigBuilder")]
    UninitializedField(&'static str),
    #[error("page shift {0} outside of 12..=27")]
    PageShift(u8),
    #[error("max transfer size is smaller than a page")]
    MaxTransferSize,
    #[error("{0} is outside of the valid queue sizes")]
    QueueEntries(&'static str),
    #[error("too many io queues requested")]
    QueueCount,
}

impl From<derive_builder::UninitializedFieldError> for ControllerConfigError {
    fn from(value: derive_builder::UninitializedFieldError) -> Self {
        Self::UninitializedField(value.field_name())
    }
}

/// Bring-up state of a [Controller]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ControllerState {
    Disabled,
    AdminQueueConfigured,
    Enabled,
    Identified,
    IoQueuesReady,
    ShuttingDown,
    ShutdownComplete,
}

/// The controller data reported by Identify
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerInfo {
    pub model: String,
    pub serial: String,
    pub firmware: String,
    pub version: Version,
    pub controller_id: u16,
    /// NN
    pub namespace_count: u32,
    pub volatile_write_cache: bool,
    /// the effective limit after clamping to the host maximum
    pub max_transfer_size: usize,
}

/// A NVMe controller
#[derive_where(Debug)]
pub struct Controller {
    #[derive_where(skip)]
    registers: Arc<dyn RegisterWindow>,
    #[derive_where(skip)]
    allocator: Arc<dyn DmaAllocator>,
    #[derive_where(skip)]
    delay: Arc<dyn Delay>,
    health: Arc<ControllerHealth>,

    config: ControllerConfig,
    capabilities: Capabilities,
    version: Version,
    doorbell_stride: usize,
    /// iterations of [ControllerConfig::ready_step_us] until CSTS.RDY must follow CC.EN
    ready_iterations: u32,

    state: ControllerState,
    page_shift: u8,
    max_transfer_size: usize,
    info: Option<ControllerInfo>,
    namespaces: Vec<NamespaceInfo>,

    admin: Option<Queue>,
    io_queues: Vec<Queue>,
    next_queue: AtomicUsize,

    /// memory a timed out command may still access. Freed once the controller
    /// is disabled.
    retired_queues: Vec<Queue>,
    retired_buffers: Vec<DmaBuffer>,
}

impl Controller {
    /// Creates a controller for the registers in `registers`.
    ///
    /// Only reads CAP and VS. Use [Controller::attach] to bring the controller up.
    pub fn new(
        registers: Arc<dyn RegisterWindow>,
        allocator: Arc<dyn DmaAllocator>,
        delay: Arc<dyn Delay>,
        config: ControllerConfig,
    ) -> Result<Self, NvmeError> {
        let capabilities = Capabilities::from(registers.read64(CAPABILITIES));
        if capabilities.value() == u64::MAX {
            return Err(NvmeError::ProtocolViolation(
                Violation::ControllerNotResponding,
            ));
        }
        let version = Version::from(registers.read32(VERSION));
        debug!("NVMe version {version}, capabilities: {capabilities:?}");

        if !capabilities.supports_nvm_command_set() {
            return Err(NvmeError::DeviceNotSupported(
                "NVM command set not supported",
            ));
        }
        if capabilities.min_page_shift() > config.page_shift {
            return Err(NvmeError::DeviceNotSupported(
                "minimum page size is larger than the host page size",
            ));
        }
        let page_shift = config.page_shift.min(capabilities.max_page_shift());

        let ready_timeout_us = capabilities.timeout() as u128 * READY_TIMEOUT_UNIT_MS as u128 * 1000;
        let ready_iterations = iterations(ready_timeout_us, config.ready_step_us);
        trace!(
            "ready timeout: {} iterations of {}us",
            ready_iterations,
            config.ready_step_us
        );

        Ok(Self {
            registers,
            allocator,
            delay,
            health: Arc::new(ControllerHealth::default()),
            capabilities,
            version,
            doorbell_stride: capabilities.doorbell_stride(),
            ready_iterations,
            state: ControllerState::Disabled,
            page_shift,
            max_transfer_size: config.max_transfer_size.min(page_list_limit(1 << page_shift)),
            info: None,
            namespaces: Vec::new(),
            admin: None,
            io_queues: Vec::new(),
            next_queue: AtomicUsize::new(0),
            retired_queues: Vec::new(),
            retired_buffers: Vec::new(),
            config,
        })
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// The identify data, available once the controller is identified
    pub fn info(&self) -> Option<&ControllerInfo> {
        self.info.as_ref()
    }

    pub fn page_shift(&self) -> u8 {
        self.page_shift
    }

    pub fn page_size(&self) -> usize {
        1 << self.page_shift
    }

    /// The largest transfer a single command can describe
    pub fn max_transfer_size(&self) -> usize {
        self.max_transfer_size
    }

    /// The PRP entries a single command can need, MDTS divided by the page size
    pub fn max_sgl(&self) -> usize {
        (self.max_transfer_size / self.page_size()).max(1)
    }

    /// The CAP.TO derived bound for RDY transitions in iterations of
    /// [ControllerConfig::ready_step_us]
    pub fn ready_iterations(&self) -> u32 {
        self.ready_iterations
    }

    pub fn is_dead(&self) -> bool {
        self.health.is_dead()
    }

    pub fn admin_queue(&self) -> Option<&Queue> {
        self.admin.as_ref()
    }

    pub fn io_queues(&self) -> &[Queue] {
        &self.io_queues
    }

    pub fn io_queue(&self, id: QueueIdentifier) -> Option<&Queue> {
        self.io_queues.iter().find(|queue| queue.id() == id)
    }

    /// The active namespaces found by [Controller::attach]
    pub fn namespaces(&self) -> &[NamespaceInfo] {
        &self.namespaces
    }

    /// A handle to submit I/O to namespace `nsid`
    pub fn namespace(&self, nsid: u32) -> Result<Namespace<'_>, NvmeError> {
        let info = self
            .namespaces
            .iter()
            .find(|ns| ns.id == nsid)
            .ok_or(NvmeError::InvalidArgument("unknown namespace"))?;
        Ok(Namespace::new(self, *info))
    }

    /// Picks the I/O queue for the next command, round robin
    pub fn select_queue(&self) -> Option<&Queue> {
        if self.io_queues.is_empty() {
            return None;
        }
        let index = self.next_queue.fetch_add(1, Ordering::Relaxed) % self.io_queues.len();
        self.io_queues.get(index)
    }

    fn configuration(&self) -> ControllerConfiguration {
        ControllerConfiguration::from(self.registers.read32(CONTROLLER_CONFIGURATION))
    }

    fn write_configuration(&self, configuration: ControllerConfiguration) {
        self.registers
            .write32(CONTROLLER_CONFIGURATION, configuration.value());
        self.registers.barrier();
    }

    fn status(&self) -> ControllerStatus {
        ControllerStatus::from(self.registers.read32(CONTROLLER_STATUS))
    }

    fn check_alive(&self) -> Result<(), NvmeError> {
        match self.health.violation() {
            Some(violation) => Err(NvmeError::ProtocolViolation(violation)),
            None => Ok(()),
        }
    }

    /// Marks the controller as dead and fails every pending command
    fn kill(&self, violation: Violation) -> NvmeError {
        self.health.mark_dead(violation);
        let err = NvmeError::ProtocolViolation(violation);
        for queue in self.admin.iter().chain(self.io_queues.iter()) {
            queue.fail_all_pending(err);
        }
        err
    }

    /// Checks CSTS for a fatal controller status.
    ///
    /// A controller reporting CFS or reading as all ones is marked dead.
    pub fn check_status(&self) -> Result<(), NvmeError> {
        self.check_alive()?;
        let status = self.status();
        if status.is_unreadable() {
            return Err(self.kill(Violation::ControllerNotResponding));
        }
        if status.fatal() {
            return Err(self.kill(Violation::ControllerFatalStatus));
        }
        Ok(())
    }

    /// Waits until CSTS.RDY is `ready`, bounded by CAP.TO.
    fn wait_ready(&self, ready: bool) -> Result<(), NvmeError> {
        for _ in 0..self.ready_iterations {
            let status = self.status();
            if status.is_unreadable() {
                return Err(self.kill(Violation::ControllerNotResponding));
            }
            if status.ready() == ready {
                return Ok(());
            }
            self.delay.delay_us(self.config.ready_step_us);
            self.registers.barrier();
        }
        if self.status().ready() == ready {
            return Ok(());
        }
        warn!("controller did not set CSTS.RDY to {ready} in time");
        Err(NvmeError::Timeout)
    }

    fn queue_environment(&self, page_shift: u8) -> QueueEnvironment {
        QueueEnvironment {
            registers: self.registers.clone(),
            allocator: self.allocator.clone(),
            delay: self.delay.clone(),
            health: self.health.clone(),
            doorbell_stride: self.doorbell_stride,
            page_size: 1 << page_shift,
            max_list_entries: self.max_sgl(),
            poll_step_us: self.config.poll_step_us,
        }
    }

    fn admin(&self) -> Result<&Queue, NvmeError> {
        self.admin
            .as_ref()
            .ok_or(NvmeError::InvalidState(self.state))
    }

    fn require_state(&self, allowed: &[ControllerState]) -> Result<(), NvmeError> {
        self.check_alive()?;
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(NvmeError::InvalidState(self.state))
        }
    }

    /// Runs `command` on the admin queue and waits for its completion
    pub(crate) fn admin_command(
        &self,
        command: CommonCommand,
        timeout: Duration,
    ) -> Result<CommonCompletionEntry, NvmeError> {
        let admin = self.admin()?;
        let ccb = admin
            .acquire()
            .ok_or(NvmeError::OutOfResources(Resource::CommandContexts))?;
        admin.poll(ccb, |_, entry| *entry = command, timeout)
    }

    /// Runs a command that transfers data into `buffer`.
    ///
    /// On [NvmeError::Timeout] the controller may still write to `buffer`,
    /// so the buffer is kept alive until the controller is disabled.
    fn admin_data_command(
        &mut self,
        command: CommonCommand,
        buffer: DmaBuffer,
        timeout: Duration,
    ) -> Result<(CommonCompletionEntry, DmaBuffer), NvmeError> {
        buffer.sync(SyncDirection::BeforeDeviceWrite);
        match self.admin_command(command, timeout) {
            Ok(entry) => {
                buffer.sync(SyncDirection::AfterDeviceWrite);
                Ok((entry, buffer))
            }
            Err(NvmeError::Timeout) => {
                self.retired_buffers.push(buffer);
                Err(NvmeError::Timeout)
            }
            Err(err) => Err(err),
        }
    }

    /// Disables the controller.
    ///
    /// Returns immediately if the controller is already disabled. A controller
    /// that is still enabling has to become ready before it can be disabled.
    /// All queues are gone afterwards.
    pub fn disable(&mut self) -> Result<(), NvmeError> {
        let mut configuration = self.configuration();
        let status = self.status();
        trace!("disable: {configuration:?}, {status:?}");

        if status.is_unreadable() {
            return Err(self.kill(Violation::ControllerNotResponding));
        }

        if configuration.enable() {
            // a controller with CFS set will never become ready
            if !status.ready() && !status.fatal() {
                self.wait_ready(true)?;
            }
            configuration.set_enable(false);
            self.write_configuration(configuration);
            self.wait_ready(false)?;
        } else if status.ready() {
            // a previous disable is still in progress
            self.wait_ready(false)?;
        } else if self.admin.is_none() && self.io_queues.is_empty() {
            trace!("controller already disabled");
            self.state = ControllerState::Disabled;
            return Ok(());
        }

        self.release_queues(NvmeError::Aborted);
        self.state = ControllerState::Disabled;
        debug!("controller disabled");
        Ok(())
    }

    /// Drops all queues and retired memory. Only valid while the controller
    /// can not access host memory.
    fn release_queues(&mut self, err: NvmeError) {
        for queue in self.io_queues.drain(..).rev() {
            queue.fail_all_pending(err);
        }
        if let Some(admin) = self.admin.take() {
            admin.fail_all_pending(err);
        }
        for queue in self.retired_queues.drain(..) {
            queue.fail_all_pending(err);
        }
        self.retired_buffers.clear();
    }

    /// Allocates the admin queue for a controller page size of `1 << page_shift`
    pub fn configure_admin_queue(&mut self, page_shift: u8) -> Result<(), NvmeError> {
        self.require_state(&[
            ControllerState::Disabled,
            ControllerState::AdminQueueConfigured,
        ])?;
        self.check_page_shift(page_shift)?;

        let entries = self
            .config
            .admin_entries
            .min(self.capabilities.maximum_queue_entries());
        let admin = Queue::allocate(
            QueueIdentifier::ADMIN,
            entries,
            &self.queue_environment(page_shift),
        )?;
        trace!("admin queue: {admin:?}");
        self.admin = Some(admin);
        self.page_shift = page_shift;
        self.state = ControllerState::AdminQueueConfigured;
        Ok(())
    }

    fn check_page_shift(&self, page_shift: u8) -> Result<(), NvmeError> {
        let supported = self.capabilities.min_page_shift()..=self.capabilities.max_page_shift();
        if supported.contains(&page_shift) {
            Ok(())
        } else {
            Err(NvmeError::InvalidArgument(
                "page size not supported by the controller",
            ))
        }
    }

    /// Enables the controller with a memory page size of `1 << page_shift`.
    ///
    /// Allocates the admin queue if that did not happen yet.
    pub fn enable(&mut self, page_shift: u8) -> Result<(), NvmeError> {
        self.check_alive()?;
        self.check_page_shift(page_shift)?;

        let mut configuration = self.configuration();
        if configuration.enable() {
            if self.admin.is_none() {
                // enabled by someone else with queues we know nothing about
                return Err(NvmeError::InvalidState(self.state));
            }
            self.wait_ready(true)?;
            self.state = self.state.max(ControllerState::Enabled);
            return Ok(());
        }

        // 1. The host waits for the controller to indicate that any previous reset is complete by waiting for
        // CSTS.RDY to become ‘0’;
        self.wait_ready(false)?;

        // 2. The host configures the Admin Queue by setting the Admin Queue Attributes (AQA), Admin
        // Submission Queue Base Address (ASQ), and Admin Completion Queue Base Address (ACQ) to
        // appropriate values;
        if self.admin.is_none() || self.page_shift != page_shift {
            self.configure_admin_queue(page_shift)?;
        }
        let admin = self.admin()?;
        let entries = admin.entries() as u16;
        let submission_queue = admin.submission_queue_address();
        let completion_queue = admin.completion_queue_address();

        self.registers
            .write64(ADMIN_SUBMISSION_QUEUE, submission_queue);
        self.registers.barrier();
        self.delay.delay_us(REGISTER_SETTLE_US);
        self.registers
            .write64(ADMIN_COMPLETION_QUEUE, completion_queue);
        self.registers.barrier();
        self.delay.delay_us(REGISTER_SETTLE_US);
        self.registers.write32(
            ADMIN_QUEUE_ATTRIBUTES,
            AdminQueueAttributes::new(entries, entries).value(),
        );
        self.registers.barrier();
        self.delay.delay_us(REGISTER_SETTLE_US);

        // 3. The host determines the supported I/O Command Sets by checking the state of CAP.CSS and
        // appropriately initializing CC.CSS. Only the NVM command set is used.
        configuration.set_command_set_selected(0b000);

        // 4. The controller settings should be configured. Specifically:
        //      a. The arbitration mechanism should be selected in CC.AMS; and
        //      b. The memory page size should be initialized in CC.MPS;
        configuration.set_arbitration_mechanism(ArbitrationMechanism::RoundRobin);
        configuration.set_memory_page_shift(page_shift);
        configuration.set_shutdown_notification(ShutdownNotification::None);
        configuration.set_io_submission_queue_entry_size(SUBMISSION_ENTRY_SHIFT);
        configuration.set_io_completion_queue_entry_size(COMPLETION_ENTRY_SHIFT);

        // 5. The host enables the controller by setting CC.EN to ‘1’;
        configuration.set_enable(true);
        trace!("write configuration: {configuration:?}");
        self.write_configuration(configuration);

        // 6. The host waits for the controller to indicate that the controller is ready to process commands. The
        // controller is ready to process commands when CSTS.RDY is set to ‘1’;
        self.wait_ready(true)?;
        if self.status().fatal() {
            return Err(self.kill(Violation::ControllerFatalStatus));
        }

        self.state = ControllerState::Enabled;
        debug!("controller enabled, page size {:#x}", 1usize << page_shift);
        Ok(())
    }

    /// Issues Identify Controller and updates the transfer limits.
    ///
    /// MDTS is given in units of `1 << min_page_shift`. The resulting limit
    /// never exceeds [ControllerConfig::max_transfer_size] nor what a single
    /// page of PRP entries can describe.
    pub fn identify(&mut self, min_page_shift: u8) -> Result<ControllerInfo, NvmeError> {
        self.require_state(&[
            ControllerState::Enabled,
            ControllerState::Identified,
            ControllerState::IoQueuesReady,
        ])?;

        // 7. The host determines the configuration of the controller by issuing the Identify command specifying
        // the Identify Controller data structure (i.e., CNS 01h);
        let buffer = DmaBuffer::allocate(&self.allocator, IDENTIFY_DATA_SIZE, self.page_size())?;
        let command = create_identify_command(IdentifyTarget::Controller, buffer.device_address());
        let (_, buffer) =
            self.admin_data_command(command, buffer, self.config.identify_timeout)?;
        let identify = IdentifyControllerData::parse(&buffer.to_vec());
        trace!("identify controller: {identify:#?}");

        if identify.required_submission_entry_size() > 1 << SUBMISSION_ENTRY_SHIFT
            || identify.required_completion_entry_size() > 1 << COMPLETION_ENTRY_SHIFT
        {
            return Err(NvmeError::DeviceNotSupported(
                "controller requires larger queue entries",
            ));
        }

        let mut max_transfer_size = self
            .config
            .max_transfer_size
            .min(page_list_limit(self.page_size()));
        if identify.maximum_data_transfer_size > 0 {
            let shift = u32::from(identify.maximum_data_transfer_size) + u32::from(min_page_shift);
            let device_limit = 1usize.checked_shl(shift).unwrap_or(usize::MAX);
            max_transfer_size = max_transfer_size.min(device_limit);
        }
        self.max_transfer_size = max_transfer_size;

        let info = ControllerInfo {
            model: identify.model_number,
            serial: identify.serial_number,
            firmware: identify.firmware_revision,
            version: identify.version,
            controller_id: identify.controller_id,
            namespace_count: identify.number_of_namespaces,
            volatile_write_cache: identify.volatile_write_cache,
            max_transfer_size,
        };
        info!(
            "NVMe {}, firmware {}, serial {}, version {}",
            info.model, info.firmware, info.serial, self.version
        );
        debug!(
            "{} namespaces, max transfer {:#x}, volatile write cache: {}",
            info.namespace_count, info.max_transfer_size, info.volatile_write_cache
        );

        self.info = Some(info.clone());
        self.state = self.state.max(ControllerState::Identified);
        Ok(info)
    }

    /// Requests `count` I/O queue pairs from the controller.
    ///
    /// Returns the number of queue pairs that can be created, which can be
    /// less than requested.
    pub fn set_number_of_queues(&mut self, count: u16) -> Result<u16, NvmeError> {
        self.require_state(&[ControllerState::Identified])?;
        if count == 0 || count == u16::MAX {
            return Err(NvmeError::InvalidArgument("invalid io queue count"));
        }
        let command = create_set_features_command(SetFeatureData::NumberOfQueues {
            sub_count: count,
            comp_count: count,
        });
        let completion = self.admin_command(command, self.config.queue_timeout)?;
        let granted = NumberOfQueues::from_completion(completion.dword0());
        let usable = count
            .min(granted.submission_queues)
            .min(granted.completion_queues);
        debug!("requested {count} io queues, controller granted {granted:?}");
        Ok(usable)
    }

    /// Creates the I/O queue pair `id` with up to `entries` slots.
    ///
    /// The completion queue is created first, then the submission queue
    /// completing into it. `entries` is clamped to CAP.MQES.
    pub fn create_io_queue(&mut self, id: QueueIdentifier, entries: u32) -> Result<(), NvmeError> {
        self.require_state(&[ControllerState::Identified, ControllerState::IoQueuesReady])?;
        if id.is_admin() {
            return Err(NvmeError::InvalidArgument("queue 0 is the admin queue"));
        }
        if self.io_queue(id).is_some() {
            return Err(NvmeError::InvalidArgument("queue already exists"));
        }

        let max_entries = self.capabilities.maximum_queue_entries();
        if entries > max_entries {
            warn!("io queue size {entries} clamped to the controller maximum of {max_entries}");
        }
        let entries = entries.clamp(2, max_entries.max(2));
        let queue = Queue::allocate(id, entries, &self.queue_environment(self.page_shift))?;

        let interrupt = match self.config.interrupt_mode {
            InterruptMode::SingleVector => CompletionInterrupt::Vector(0),
            InterruptMode::MultiVector => CompletionInterrupt::Vector(id.as_u16()),
        };
        let timeout = self.config.queue_timeout;

        let command = create_io_completion_queue(
            id,
            entries,
            queue.completion_queue_address(),
            interrupt,
        );
        if let Err(err) = self.admin_command(command, timeout) {
            error!("failed to create io completion queue {id:?}: {err}");
            self.retire_on_timeout(queue, err);
            return Err(err);
        }

        let command = create_io_submission_queue(id, entries, queue.submission_queue_address());
        if let Err(err) = self.admin_command(command, timeout) {
            error!("failed to create io submission queue {id:?}: {err}");
            if err != NvmeError::Timeout {
                if let Err(delete_err) =
                    self.admin_command(delete_io_completion_queue(id), timeout)
                {
                    warn!("failed to delete io completion queue {id:?}: {delete_err}");
                    self.retired_queues.push(queue);
                    return Err(err);
                }
            }
            self.retire_on_timeout(queue, err);
            return Err(err);
        }

        debug!("created io queue {id:?} with {entries} entries");
        self.io_queues.push(queue);
        self.io_queues.sort_by_key(|queue| queue.id());
        self.state = ControllerState::IoQueuesReady;
        Ok(())
    }

    /// Keeps the memory of `queue` if the controller may still use it
    fn retire_on_timeout(&mut self, queue: Queue, err: NvmeError) {
        if err == NvmeError::Timeout {
            self.retired_queues.push(queue);
        }
    }

    /// Deletes the I/O queue pair `id`.
    ///
    /// The submission queue is deleted first. Commands the controller aborts
    /// because of that complete with their abort status, everything still
    /// pending afterwards fails with [NvmeError::Aborted].
    pub fn delete_io_queue(&mut self, id: QueueIdentifier) -> Result<(), NvmeError> {
        self.check_alive()?;
        let index = self
            .io_queues
            .iter()
            .position(|queue| queue.id() == id)
            .ok_or(NvmeError::InvalidArgument("unknown io queue"))?;
        let timeout = self.config.queue_timeout;

        self.admin_command(delete_io_submission_queue(id), timeout)?;
        self.io_queues[index].process_completions();

        let deleted = self.admin_command(delete_io_completion_queue(id), timeout);
        let queue = self.io_queues.remove(index);
        queue.fail_all_pending(NvmeError::Aborted);
        if self.io_queues.is_empty() && self.state == ControllerState::IoQueuesReady {
            self.state = ControllerState::Identified;
        }

        match deleted {
            Ok(_) => {
                debug!("deleted io queue {id:?}");
                Ok(())
            }
            Err(err) => {
                warn!("failed to delete io completion queue {id:?}: {err}");
                self.retired_queues.push(queue);
                Err(err)
            }
        }
    }

    /// Identifies all namespaces up to NN and keeps the active ones
    pub fn scan_namespaces(&mut self) -> Result<&[NamespaceInfo], NvmeError> {
        self.require_state(&[ControllerState::Identified, ControllerState::IoQueuesReady])?;
        let count = self
            .info
            .as_ref()
            .map_or(0, |info| info.namespace_count);

        let mut namespaces = Vec::new();
        let mut buffer =
            DmaBuffer::allocate(&self.allocator, IDENTIFY_DATA_SIZE, self.page_size())?;
        for nsid in 1..=count {
            buffer.zero();
            let command = create_identify_command(
                IdentifyTarget::Namespace { nsid },
                buffer.device_address(),
            );
            buffer = match self.admin_data_command(command, buffer, self.config.identify_timeout)
            {
                Ok((_, buffer)) => buffer,
                Err(NvmeError::DeviceError(status)) => {
                    warn!("identify namespace {nsid} failed: {status}");
                    DmaBuffer::allocate(&self.allocator, IDENTIFY_DATA_SIZE, self.page_size())?
                }
                Err(err) => return Err(err),
            };

            let identify = IdentifyNamespaceData::parse(&buffer.to_vec());
            if !identify.is_active() {
                trace!("namespace {nsid} is not active");
                continue;
            }
            let Some(format) = identify.active_format() else {
                warn!("namespace {nsid} uses an unknown LBA format");
                continue;
            };
            let info = NamespaceInfo {
                id: nsid,
                blocks: identify.size,
                capacity: identify.capacity,
                utilization: identify.utilization,
                block_shift: format.data_shift,
            };
            debug!("found {info:?}");
            namespaces.push(info);
        }

        self.namespaces = namespaces;
        Ok(&self.namespaces)
    }

    /// Brings the controller up.
    ///
    /// Disables the controller, configures and enables it, identifies it,
    /// creates the configured I/O queues and scans the namespaces. On failure
    /// everything created so far is released again.
    pub fn attach(&mut self) -> Result<(), NvmeError> {
        let result = self.try_attach();
        if let Err(err) = result {
            error!("controller attach failed: {err}");
            self.unwind_attach();
        }
        result
    }

    fn try_attach(&mut self) -> Result<(), NvmeError> {
        self.check_alive()?;
        if self.state != ControllerState::Disabled {
            return Err(NvmeError::InvalidState(self.state));
        }

        self.disable()?;
        self.configure_admin_queue(self.page_shift)?;
        self.enable(self.page_shift)?;
        self.identify(self.capabilities.min_page_shift())?;

        // 8. The host determines any I/O Command Set specific configuration information
        // and requests the number of I/O queues. Then the host allocates the
        // appropriate number of I/O Completion Queues followed by the I/O
        // Submission Queues;
        let requested = self.config.io_queue_count;
        if requested > 0 {
            let count = self.set_number_of_queues(requested)?;
            if count < requested {
                warn!("controller only supports {count} of {requested} io queues");
            }
            for index in 1..=count {
                self.create_io_queue(QueueIdentifier::new(index), self.config.io_entries)?;
            }
        }

        self.scan_namespaces()?;

        if self.config.interrupt_mode == InterruptMode::SingleVector {
            self.registers.write32(INTERRUPT_MASK_CLEAR, 1);
        }
        debug!(
            "controller attached with {} io queues and {} namespaces",
            self.io_queues.len(),
            self.namespaces.len()
        );
        Ok(())
    }

    fn unwind_attach(&mut self) {
        for queue in self.io_queues.iter() {
            queue.fail_all_pending(NvmeError::Aborted);
        }
        if self.health.is_dead() {
            // the controller may not react to a disable, keep all memory
            warn!("dead controller, keeping queue memory");
            return;
        }
        // a disabled controller forgets all queues, no need to delete them
        if let Err(err) = self.disable() {
            error!("failed to disable controller after failed attach: {err}");
            return;
        }
        self.namespaces.clear();
        self.info = None;
    }

    /// Shuts the controller down.
    ///
    /// Deletes all I/O queues, then sends a normal shutdown notification and
    /// waits for CSTS.SHST to report completion. If that never happens the
    /// controller is disabled instead.
    pub fn shutdown(&mut self) -> Result<(), NvmeError> {
        if self.config.interrupt_mode == InterruptMode::SingleVector {
            self.registers.write32(INTERRUPT_MASK_SET, 1);
        }
        self.state = ControllerState::ShuttingDown;

        let mut notify = !self.health.is_dead();
        while notify {
            let Some(id) = self.io_queues.last().map(|queue| queue.id()) else {
                break;
            };
            if let Err(err) = self.delete_io_queue(id) {
                warn!("failed to delete io queue {id:?} during shutdown: {err}");
                notify = false;
            }
        }

        if notify && self.configuration().enable() {
            let mut configuration = self.configuration();
            configuration.set_shutdown_notification(ShutdownNotification::Normal);
            self.write_configuration(configuration);

            for _ in 0..self.config.shutdown_iterations {
                self.registers.barrier();
                if self.status().shutdown_status() == ShutdownStatus::Complete {
                    debug!("controller shutdown complete");
                    self.state = ControllerState::ShutdownComplete;
                    return Ok(());
                }
                self.delay.delay_us(self.config.shutdown_step_us);
            }
            warn!("unable to shut down controller, disabling");
        }

        let result = self.disable();
        self.state = ControllerState::ShutdownComplete;
        result
    }

    /// Shuts the controller down and releases all memory
    pub fn detach(mut self) -> Result<(), NvmeError> {
        let result = match self.state {
            ControllerState::Disabled | ControllerState::ShutdownComplete => Ok(()),
            _ => self.shutdown(),
        };
        self.namespaces.clear();
        if result.is_ok() {
            self.release_queues(NvmeError::Aborted);
        }
        result
    }

    /// Processes the completions of all queues.
    ///
    /// Meant to be called from the interrupt handler. Returns `true` if any
    /// completion was consumed.
    pub fn handle_interrupt(&self) -> bool {
        let single = self.config.interrupt_mode == InterruptMode::SingleVector;
        if single {
            self.registers.write32(INTERRUPT_MASK_SET, 1);
        }

        let mut claimed = false;
        for queue in self.admin.iter().chain(self.io_queues.iter()) {
            claimed |= queue.process_completions() > 0;
        }

        if single {
            self.registers.write32(INTERRUPT_MASK_CLEAR, 1);
        }
        claimed
    }

    /// Asks the controller to abort command `cid` of submission queue `queue`.
    ///
    /// Returns `true` if the controller aborted the command. The command
    /// still completes through its queue.
    pub fn abort(&self, queue: QueueIdentifier, cid: CommandIdentifier) -> Result<bool, NvmeError> {
        self.check_alive()?;
        let completion =
            self.admin_command(create_abort_command(queue, cid), self.config.queue_timeout)?;
        let aborted = !abort_not_performed(completion.dword0());
        debug!("abort of {cid:?} on {queue:?}: {aborted}");
        Ok(aborted)
    }
}

impl Drop for Controller {
    /// Queue memory is only freed once the controller can no longer access it.
    ///
    /// An enabled controller is disabled first. If that fails or the
    /// controller is dead the memory is leaked.
    fn drop(&mut self) {
        let holds_memory = self.admin.is_some()
            || !self.io_queues.is_empty()
            || !self.retired_queues.is_empty()
            || !self.retired_buffers.is_empty();
        if !holds_memory {
            return;
        }

        let quiesced = if self.state == ControllerState::ShutdownComplete {
            true
        } else if self.health.is_dead() {
            false
        } else if self.configuration().enable() || self.status().ready() {
            match self.disable() {
                Ok(()) => true,
                Err(err) => {
                    error!("failed to disable dropped controller: {err}");
                    false
                }
            }
        } else {
            true
        };

        if quiesced {
            self.release_queues(NvmeError::Aborted);
            return;
        }

        warn!("controller may still access its queues, leaking queue memory");
        let queues = self
            .admin
            .take()
            .into_iter()
            .chain(self.io_queues.drain(..))
            .chain(self.retired_queues.drain(..));
        for queue in queues {
            queue.fail_all_pending(NvmeError::Aborted);
            mem::forget(queue);
        }
        mem::forget(mem::take(&mut self.retired_buffers));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        admin_commands::CommandOpcode as AdminOpcode,
        io_commands::{CommandOpcode as IoOpcode, LBA},
        namespace::IoCompletion,
        registers::DOORBELL_BASE,
        sim::{CompletionMode, RegisterAccess, SimBench, SimConfig, SimFaults},
    };
    use std::{sync::Mutex, vec};

    fn bench() -> SimBench {
        SimBench::new(SimConfig::default())
    }

    fn allocator(bench: &SimBench) -> Arc<dyn DmaAllocator> {
        bench.memory.clone()
    }

    fn attached(bench: &SimBench, config: ControllerConfig) -> Controller {
        let mut controller = bench.controller(config).unwrap();
        controller.attach().unwrap();
        controller
    }

    #[test]
    fn builder_defaults() {
        let config = ControllerConfigBuilder::default().build().unwrap();
        assert_eq!(config.page_shift, 12);
        assert_eq!(config.max_transfer_size, 131072);
        assert_eq!(config.io_entries, 256);
        assert_eq!(config.shutdown_iterations, 4000);
        assert_eq!(config.queue_timeout, Duration::from_secs(5));

        assert_eq!(
            ControllerConfigBuilder::default().page_shift(11).build().unwrap_err(),
            ControllerConfigError::PageShift(11)
        );
        assert_eq!(
            ControllerConfigBuilder::default()
                .max_transfer_size(512)
                .build()
                .unwrap_err(),
            ControllerConfigError::MaxTransferSize
        );
    }

    #[test]
    fn ready_timeout_from_capabilities() {
        let bench = bench();
        let controller = bench.controller(ControllerConfig::default()).unwrap();
        // CAP.TO = 20 in 500ms units, polled every millisecond
        assert_eq!(controller.ready_iterations(), 10_000);
    }

    #[test]
    fn disable_is_a_no_op_when_disabled() {
        let bench = bench();
        let mut controller = bench.controller(ControllerConfig::default()).unwrap();
        bench.device.clear_log();

        controller.disable().unwrap();

        assert!(bench.device.writes().is_empty());
        assert_eq!(controller.state(), ControllerState::Disabled);
        assert_eq!(bench.delay.total_us(), 0);
    }

    #[test]
    fn disable_waits_for_ready_to_clear() {
        let bench = bench();
        let mut controller = attached(&bench, ControllerConfig::default());
        bench.device.clear_log();

        controller.disable().unwrap();

        let writes = bench.device.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, CONTROLLER_CONFIGURATION);
        assert!(!ControllerConfiguration::from(writes[0].1).enable());
        assert!(controller.admin_queue().is_none());
        assert_eq!(bench.memory.live_allocations(), 0);
    }

    #[test]
    fn enable_times_out_when_ready_is_stuck() {
        let bench = bench();
        bench.device.set_faults(SimFaults {
            stuck_ready: true,
            ..Default::default()
        });
        let mut controller = bench.controller(ControllerConfig::default()).unwrap();

        assert_eq!(controller.attach(), Err(NvmeError::Timeout));
        // 10s of CAP.TO plus the register settle delays
        assert!(bench.delay.total_us() >= 10_000_000);
    }

    #[test]
    fn identify_clamps_transfer_size() {
        let bench = SimBench::new(SimConfig {
            mdts: 3,
            ..Default::default()
        });
        let mut controller = bench.controller(ControllerConfig::default()).unwrap();
        controller.disable().unwrap();
        controller.enable(12).unwrap();
        let info = controller.identify(12).unwrap();
        assert_eq!(info.max_transfer_size, 32768);
        assert_eq!(controller.max_transfer_size(), 32768);
        assert_eq!(controller.max_sgl(), 8);

        let config = ControllerConfigBuilder::default()
            .max_transfer_size(16384)
            .build()
            .unwrap();
        let bench = SimBench::new(SimConfig {
            mdts: 3,
            ..Default::default()
        });
        let mut controller = bench.controller(config).unwrap();
        controller.disable().unwrap();
        controller.enable(12).unwrap();
        controller.identify(12).unwrap();
        assert_eq!(controller.max_transfer_size(), 16384);
    }

    #[test]
    fn attach_end_to_end() {
        let bench = bench();
        let config = ControllerConfigBuilder::default()
            .io_queue_count(0)
            .build()
            .unwrap();
        let mut controller = bench.controller(config).unwrap();
        bench.device.clear_log();

        controller.attach().unwrap();

        // the admin queue is configured and the controller enabled before any doorbell
        let accesses = bench.device.accesses();
        let first_doorbell = accesses
            .iter()
            .position(|access| {
                matches!(access, RegisterAccess::Write { offset, .. } if *offset >= DOORBELL_BASE)
            })
            .unwrap();
        let bring_up = &accesses[..first_doorbell];
        let writes: Vec<_> = bring_up
            .iter()
            .filter_map(|access| match access {
                RegisterAccess::Write { offset, value } => Some((*offset, *value)),
                RegisterAccess::Read { .. } => None,
            })
            .collect();
        let offsets: Vec<_> = writes.iter().map(|(offset, _)| *offset).collect();
        assert_eq!(
            offsets,
            vec![
                ADMIN_SUBMISSION_QUEUE,
                ADMIN_SUBMISSION_QUEUE + 4,
                ADMIN_COMPLETION_QUEUE,
                ADMIN_COMPLETION_QUEUE + 4,
                ADMIN_QUEUE_ATTRIBUTES,
                CONTROLLER_CONFIGURATION,
            ]
        );
        let configuration = ControllerConfiguration::from(writes[5].1);
        assert!(configuration.enable());
        assert_eq!(configuration.io_submission_queue_entry_size(), 6);
        assert_eq!(configuration.io_completion_queue_entry_size(), 4);
        assert_eq!(configuration.memory_page_shift(), 12);
        assert_eq!(
            AdminQueueAttributes::from(writes[4].1).submission_queue_size(),
            32
        );

        // CSTS is polled after the enable until RDY is set
        let enable = bring_up
            .iter()
            .position(|access| {
                matches!(access, RegisterAccess::Write { offset, .. } if *offset == CONTROLLER_CONFIGURATION)
            })
            .unwrap();
        let status_reads = bring_up[enable + 1..]
            .iter()
            .filter(|access| **access == RegisterAccess::Read { offset: CONTROLLER_STATUS })
            .count();
        assert!(status_reads >= 3);

        // mdts = 0 keeps the host limit
        assert_eq!(controller.max_transfer_size(), 131072);
        assert_eq!(controller.state(), ControllerState::Identified);
        assert_eq!(controller.namespaces().len(), 1);

        bench.device.clear_log();
        controller
            .create_io_queue(QueueIdentifier::new(1), 256)
            .unwrap();
        let commands = bench.device.commands();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].opcode, AdminOpcode::CreateIOCompletionQueue as u8);
        assert_eq!(commands[1].opcode, AdminOpcode::CreateIOSubmissionQueue as u8);
        assert_eq!(commands[0].cdw[0] & 0xffff, 1);
        assert_eq!(commands[1].cdw[0] & 0xffff, 1);
        // clamped to CAP.MQES + 1
        assert_eq!(controller.io_queue(QueueIdentifier::new(1)).unwrap().entries(), 32);
        assert_eq!(controller.state(), ControllerState::IoQueuesReady);

        bench.device.set_completion_mode(CompletionMode::Manual);
        bench.device.clear_log();
        let buffer = DmaBuffer::allocate(&allocator(&bench), 4096, 4096).unwrap();
        let result: Arc<Mutex<Option<IoCompletion<DmaBuffer>>>> = Arc::new(Mutex::new(None));
        let done = result.clone();
        controller
            .namespace(1)
            .unwrap()
            .write(LBA::new(100), 8, buffer, move |completion| {
                *done.lock().unwrap() = Some(completion);
            })
            .unwrap();

        let commands = bench.device.commands();
        assert_eq!(commands.len(), 1);
        let write = commands[0];
        assert_eq!(write.opcode, IoOpcode::Write as u8);
        assert_eq!(write.nsid, 1);
        assert_eq!(write.slba(), 100);
        assert_eq!(write.nlb(), 7);
        assert!(result.lock().unwrap().is_none());

        let queue = write.queue;
        let cid = write.cid;
        bench.device.inject_completion(queue, cid);
        assert!(controller.handle_interrupt());

        let completion = result.lock().unwrap().take().unwrap();
        assert_eq!(completion.result, Ok(()));
        assert_eq!(completion.residual, 0);
        assert_eq!(controller.io_queue(queue).unwrap().in_flight(), 0);
    }

    #[test]
    fn attach_creates_configured_io_queues() {
        let bench = bench();
        let config = ControllerConfigBuilder::default()
            .io_queue_count(2)
            .build()
            .unwrap();
        let controller = attached(&bench, config);
        assert_eq!(controller.io_queues().len(), 2);
        assert_eq!(bench.device.io_queue_count(), 2);
        assert_eq!(bench.device.interrupt_mask(), 0);
    }

    #[test]
    fn granted_queue_count_limits_io_queues() {
        let bench = SimBench::new(SimConfig {
            max_io_queues: 2,
            ..Default::default()
        });
        let config = ControllerConfigBuilder::default()
            .io_queue_count(8)
            .build()
            .unwrap();
        let controller = attached(&bench, config);
        assert_eq!(controller.io_queues().len(), 2);
    }

    #[test]
    fn create_io_queue_rejects_duplicates() {
        let bench = bench();
        let mut controller = attached(&bench, ControllerConfig::default());
        assert!(matches!(
            controller.create_io_queue(QueueIdentifier::new(1), 16),
            Err(NvmeError::InvalidArgument(_))
        ));
        assert!(matches!(
            controller.create_io_queue(QueueIdentifier::ADMIN, 16),
            Err(NvmeError::InvalidArgument(_))
        ));
    }

    #[test]
    fn failed_submission_queue_creation_deletes_completion_queue() {
        let bench = SimBench::new(SimConfig {
            max_io_queues: 1,
            ..Default::default()
        });
        let config = ControllerConfigBuilder::default()
            .io_queue_count(0)
            .build()
            .unwrap();
        let mut controller = attached(&bench, config);
        let live = bench.memory.live_allocations();
        bench.device.clear_log();

        // queue 2 is beyond the granted queues
        let err = controller
            .create_io_queue(QueueIdentifier::new(2), 16)
            .unwrap_err();
        assert!(matches!(err, NvmeError::DeviceError(_)));
        assert_eq!(bench.device.io_queue_count(), 0);
        assert_eq!(bench.memory.live_allocations(), live);
    }

    #[test]
    fn delete_io_queue_aborts_pending_commands() {
        let bench = bench();
        let mut controller = attached(&bench, ControllerConfig::default());
        bench.device.set_completion_mode(CompletionMode::Manual);

        let buffer = DmaBuffer::allocate(&allocator(&bench), 512, 4096).unwrap();
        let result = Arc::new(Mutex::new(None));
        let done = result.clone();
        controller
            .namespace(1)
            .unwrap()
            .read(LBA::new(0), 1, buffer, move |completion: IoCompletion<DmaBuffer>| {
                *done.lock().unwrap() = Some(completion.result);
            })
            .unwrap();

        controller.delete_io_queue(QueueIdentifier::new(1)).unwrap();
        assert_eq!(bench.device.io_queue_count(), 0);
        assert_eq!(controller.state(), ControllerState::Identified);
        // the controller aborted the read when its submission queue was deleted
        assert!(matches!(
            result.lock().unwrap().take(),
            Some(Err(NvmeError::DeviceError(_)))
        ));
    }

    #[test]
    fn shutdown_notifies_controller() {
        let bench = bench();
        let mut controller = attached(&bench, ControllerConfig::default());
        bench.device.clear_log();

        controller.shutdown().unwrap();

        assert_eq!(controller.state(), ControllerState::ShutdownComplete);
        assert_eq!(bench.device.io_queue_count(), 0);
        let configuration = bench
            .device
            .writes()
            .into_iter()
            .filter(|(offset, _)| *offset == CONTROLLER_CONFIGURATION)
            .last()
            .map(|(_, value)| ControllerConfiguration::from(value))
            .unwrap();
        assert!(configuration.enable());
        assert_eq!(
            configuration.shutdown_notification(),
            Some(ShutdownNotification::Normal)
        );
        assert_eq!(bench.device.interrupt_mask(), 1);
    }

    #[test]
    fn shutdown_falls_back_to_disable() {
        let bench = bench();
        let mut controller = attached(&bench, ControllerConfig::default());
        bench.device.set_faults(SimFaults {
            shutdown_never_completes: true,
            ..Default::default()
        });
        let waited = bench.delay.total_us();

        controller.shutdown().unwrap();

        // 4000 polls of 1ms before giving up
        assert!(bench.delay.total_us() - waited >= 4_000_000);
        let configuration = bench
            .device
            .writes()
            .into_iter()
            .filter(|(offset, _)| *offset == CONTROLLER_CONFIGURATION)
            .last()
            .map(|(_, value)| ControllerConfiguration::from(value))
            .unwrap();
        assert!(!configuration.enable());
        assert_eq!(controller.state(), ControllerState::ShutdownComplete);
        assert!(controller.admin_queue().is_none());
        assert_eq!(bench.memory.live_allocations(), 0);
    }

    #[test]
    fn attach_failure_releases_all_memory() {
        let bench = bench();
        // the admin queue gets its 3 allocations, identify fails
        bench.memory.fail_allocations_after(3);
        let mut controller = bench.controller(ControllerConfig::default()).unwrap();

        assert_eq!(
            controller.attach(),
            Err(NvmeError::OutOfResources(Resource::Dma))
        );
        assert_eq!(controller.state(), ControllerState::Disabled);
        assert_eq!(bench.memory.live_allocations(), 0);

        bench.memory.stop_failing_allocations();
        controller.attach().unwrap();
        assert_eq!(controller.io_queues().len(), 1);
    }

    #[test]
    fn attach_failure_after_io_queues_releases_all_memory() {
        let bench = bench();
        let config = ControllerConfigBuilder::default()
            .io_queue_count(2)
            .build()
            .unwrap();
        // admin queue, identify, queue 1 and its 3 buffers, then fail queue 2
        bench.memory.fail_allocations_after(7);
        let mut controller = bench.controller(config).unwrap();

        assert!(controller.attach().is_err());
        assert_eq!(bench.device.io_queue_count(), 0);
        assert_eq!(bench.memory.live_allocations(), 0);
    }

    #[test]
    fn identify_timeout_keeps_buffer_until_disable() {
        let bench = bench();
        let config = ControllerConfigBuilder::default()
            .identify_timeout(Duration::from_millis(1))
            .build()
            .unwrap();
        let mut controller = bench.controller(config).unwrap();
        controller.disable().unwrap();
        controller.enable(12).unwrap();
        bench.device.set_faults(SimFaults {
            ignore_admin_commands: true,
            ..Default::default()
        });

        assert_eq!(controller.identify(12), Err(NvmeError::Timeout));
        // admin queue and the identify buffer
        assert_eq!(bench.memory.live_allocations(), 4);
        assert_eq!(controller.admin_queue().unwrap().in_flight(), 1);

        controller.disable().unwrap();
        assert_eq!(bench.memory.live_allocations(), 0);
    }

    #[test]
    fn fatal_status_kills_the_controller() {
        let bench = bench();
        let mut controller = attached(&bench, ControllerConfig::default());
        bench.device.set_faults(SimFaults {
            fatal_status: true,
            ..Default::default()
        });

        let expected = NvmeError::ProtocolViolation(Violation::ControllerFatalStatus);
        assert_eq!(controller.check_status(), Err(expected));
        assert!(controller.is_dead());
        assert_eq!(
            controller.create_io_queue(QueueIdentifier::new(2), 16),
            Err(expected)
        );
        assert_eq!(
            controller.abort(QueueIdentifier::new(1), CommandIdentifier::new(0)),
            Err(expected)
        );
    }

    #[test]
    fn bogus_completion_fails_pending_io() {
        let bench = bench();
        let controller = attached(&bench, ControllerConfig::default());
        bench.device.set_completion_mode(CompletionMode::Manual);

        let buffer = DmaBuffer::allocate(&allocator(&bench), 512, 4096).unwrap();
        let result = Arc::new(Mutex::new(None));
        let done = result.clone();
        controller
            .namespace(1)
            .unwrap()
            .read(LBA::new(0), 1, buffer, move |completion: IoCompletion<DmaBuffer>| {
                *done.lock().unwrap() = Some(completion);
            })
            .unwrap();

        let queue = QueueIdentifier::new(1);
        let (_, cid) = bench.device.pending_io()[0];
        let bogus = CommandIdentifier::new(cid.as_u16() + 5);
        bench.device.inject_completion(queue, bogus);
        controller.handle_interrupt();

        let violation = Violation::UnknownCommandIdentifier { queue, cid: bogus };
        let completion = result.lock().unwrap().take().unwrap();
        assert_eq!(
            completion.result,
            Err(NvmeError::ProtocolViolation(violation))
        );
        assert_eq!(completion.residual, 512);
        assert!(controller.is_dead());
    }

    #[test]
    fn abort_pending_command() {
        let bench = bench();
        let controller = attached(&bench, ControllerConfig::default());
        bench.device.set_completion_mode(CompletionMode::Manual);

        let buffer = DmaBuffer::allocate(&allocator(&bench), 512, 4096).unwrap();
        let result = Arc::new(Mutex::new(None));
        let done = result.clone();
        controller
            .namespace(1)
            .unwrap()
            .read(LBA::new(0), 1, buffer, move |completion: IoCompletion<DmaBuffer>| {
                *done.lock().unwrap() = Some(completion.result);
            })
            .unwrap();
        let (queue, cid) = bench.device.pending_io()[0];

        assert_eq!(controller.abort(queue, cid), Ok(true));
        controller.handle_interrupt();
        assert!(matches!(
            result.lock().unwrap().take(),
            Some(Err(NvmeError::DeviceError(_)))
        ));
        assert_eq!(controller.abort(queue, cid), Ok(false));
    }

    #[test]
    fn detach_releases_everything() {
        let bench = bench();
        let controller = attached(&bench, ControllerConfig::default());
        controller.detach().unwrap();
        assert_eq!(bench.memory.live_allocations(), 0);
        assert_eq!(bench.device.io_queue_count(), 0);
    }

    #[test]
    fn dropping_an_enabled_controller_disables_it() {
        let bench = bench();
        let controller = attached(&bench, ControllerConfig::default());
        bench.device.clear_log();

        drop(controller);

        let writes = bench.device.writes();
        let (offset, value) = *writes.last().unwrap();
        assert_eq!(offset, CONTROLLER_CONFIGURATION);
        assert!(!ControllerConfiguration::from(value).enable());
        assert_eq!(bench.memory.live_allocations(), 0);
    }

    #[test]
    fn dropping_a_dead_controller_keeps_queue_memory() {
        let bench = bench();
        let controller = attached(&bench, ControllerConfig::default());
        bench.device.set_faults(SimFaults {
            fatal_status: true,
            ..Default::default()
        });
        assert!(controller.check_status().is_err());
        let live = bench.memory.live_allocations();
        assert!(live > 0);
        bench.device.clear_log();

        drop(controller);

        assert!(bench.device.writes().is_empty());
        assert_eq!(bench.memory.live_allocations(), live);
    }
}
