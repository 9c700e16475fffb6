//! An emulated NVMe controller
//!
//! [SimController] implements the register interface of a controller and
//! executes the admin and NVM commands the driver uses against in memory
//! namespaces. Every register access and every fetched command is recorded,
//! so tests can check what the driver did.

use core::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use alloc::{string::String, vec, vec::Vec};
use bit_field::BitField;
use hashbrown::HashMap;
use shared::lockcell::{LockCell, SpinLock};

#[allow(unused_imports)]
use log::{debug, trace, warn};

use crate::{
    admin_commands::{CommandOpcode as AdminOpcode, FeatureIdentifier, IDENTIFY_DATA_SIZE},
    generic_command::{
        CommandIdentifier, CommonCommand, GenericCommandStatus, COMPLETION_COMMAND_ENTRY_SIZE,
        COMPLETION_STATUS_OFFSET, SUBMISSION_COMMAND_ENTRY_SIZE,
    },
    io_commands::CommandOpcode as IoOpcode,
    properties::{
        AdminQueueAttributes, Capabilities, CapabilitiesBuilder, ControllerConfiguration,
        ShutdownStatus, Version,
    },
    queue::QueueIdentifier,
    registers::{
        RegisterWindow, ADMIN_COMPLETION_QUEUE, ADMIN_QUEUE_ATTRIBUTES, ADMIN_SUBMISSION_QUEUE,
        CAPABILITIES, CONTROLLER_CONFIGURATION, CONTROLLER_STATUS, DOORBELL_BASE,
        INTERRUPT_MASK_CLEAR, INTERRUPT_MASK_SET, VERSION,
    },
};

use super::SimMemory;

/// Layout of an emulated namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimNamespaceConfig {
    pub blocks: u64,
    pub block_shift: u8,
}

/// Description of the emulated controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimConfig {
    /// MQES, 0 based
    pub max_queue_entries: u16,
    /// CAP.TO in 500ms units
    pub timeout: u8,
    pub doorbell_stride_exponent: u8,
    pub min_page_shift: u8,
    pub max_page_shift: u8,
    /// Identify MDTS
    pub mdts: u8,
    pub version: Version,
    pub namespaces: Vec<SimNamespaceConfig>,
    pub volatile_write_cache: bool,
    /// The number of io queue pairs the controller grants at most
    pub max_io_queues: u16,
    /// CSTS reads after an enable or disable until RDY follows CC.EN
    pub ready_delay_reads: u32,
    pub serial_number: String,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            max_queue_entries: 31,
            timeout: 20,
            doorbell_stride_exponent: 0,
            min_page_shift: 12,
            max_page_shift: 16,
            mdts: 0,
            version: Version::new(1, 4, 0),
            namespaces: vec![SimNamespaceConfig {
                blocks: 4096,
                block_shift: 9,
            }],
            volatile_write_cache: false,
            max_io_queues: 4,
            ready_delay_reads: 2,
            serial_number: String::from("SIM-0001"),
        }
    }
}

impl SimConfig {
    pub fn capabilities(&self) -> Capabilities {
        CapabilitiesBuilder {
            maximum_queue_entries: self.max_queue_entries as u32 + 1,
            contiguous_queues_required: true,
            timeout: self.timeout,
            doorbell_stride_exponent: self.doorbell_stride_exponent,
            // NVM command set
            command_sets_supported: 0b1,
            min_page_shift: self.min_page_shift,
            max_page_shift: self.max_page_shift,
        }
        .build()
    }
}

/// A single register access performed by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterAccess {
    Read { offset: usize },
    Write { offset: usize, value: u32 },
}

/// A command fetched by the emulated controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmittedCommand {
    pub queue: QueueIdentifier,
    pub opcode: u8,
    pub cid: CommandIdentifier,
    pub nsid: u32,
    pub prp1: u64,
    pub prp2: u64,
    /// command dwords 10 to 15
    pub cdw: [u32; 6],
}

impl SubmittedCommand {
    /// Starting LBA of a read or write
    pub fn slba(&self) -> u64 {
        (self.cdw[1] as u64) << 32 | self.cdw[0] as u64
    }

    /// 0 based block count of a read or write
    pub fn nlb(&self) -> u16 {
        self.cdw[2].get_bits(0..=15) as u16
    }
}

/// When io commands are completed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionMode {
    /// io commands complete when the submission doorbell is written
    #[default]
    Immediate,
    /// io commands wait for [SimController::complete_pending]
    Manual,
}

/// Misbehaviour of the emulated controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SimFaults {
    /// RDY never follows CC.EN
    pub stuck_ready: bool,
    /// SHST stays at "occurring" after a shutdown notification
    pub shutdown_never_completes: bool,
    /// admin commands are fetched but never completed
    pub ignore_admin_commands: bool,
    /// CSTS.CFS is set once the controller is enabled
    pub fatal_status: bool,
}

#[derive(Debug, Clone, Copy)]
struct SubmissionQueue {
    base: u64,
    entries: u32,
    head: u32,
    completion_queue: u16,
}

#[derive(Debug, Clone, Copy)]
struct CompletionQueue {
    base: u64,
    entries: u32,
    tail: u32,
    phase: bool,
    interrupts: bool,
}

#[derive(Debug, Clone, Copy)]
struct PendingIo {
    queue: QueueIdentifier,
    command: CommonCommand,
}

#[derive(Debug)]
struct Namespace {
    config: SimNamespaceConfig,
    data: Vec<u8>,
}

#[derive(Debug, Default)]
struct State {
    controller_configuration: u32,
    ready: bool,
    /// RDY target and remaining CSTS reads
    pending_ready: Option<(bool, u32)>,
    shutdown_status: u32,
    interrupt_mask: u32,
    admin_queue_attributes: u32,
    admin_submission_queue: u64,
    admin_completion_queue: u64,

    submission_queues: HashMap<u16, SubmissionQueue>,
    completion_queues: HashMap<u16, CompletionQueue>,
    granted_io_queues: Option<u16>,
    write_cache_enabled: bool,

    pending_io: Vec<PendingIo>,
    completion_mode: CompletionMode,
    faults: SimFaults,
    interrupt_pending: bool,
    interrupts_raised: usize,
    flushes: usize,

    accesses: Vec<RegisterAccess>,
    commands: Vec<SubmittedCommand>,
}

type CommandResult = Result<u32, (u8, u8)>;

const GENERIC: u8 = 0;
const COMMAND_SPECIFIC: u8 = 1;

fn generic(status: GenericCommandStatus) -> (u8, u8) {
    (GENERIC, status as u8)
}

/// An emulated NVMe controller
pub struct SimController {
    config: SimConfig,
    capabilities: Capabilities,
    memory: Arc<SimMemory>,
    state: SpinLock<State>,
    namespaces: SpinLock<Vec<Namespace>>,
}

impl core::fmt::Debug for SimController {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SimController")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SimController {
    pub fn new(config: SimConfig, memory: Arc<SimMemory>) -> Self {
        let namespaces = config
            .namespaces
            .iter()
            .map(|ns| Namespace {
                config: *ns,
                data: vec![0; (ns.blocks << ns.block_shift) as usize],
            })
            .collect();
        let capabilities = config.capabilities();
        Self {
            config,
            capabilities,
            memory,
            state: SpinLock::new(State::default()),
            namespaces: SpinLock::new(namespaces),
        }
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn set_faults(&self, faults: SimFaults) {
        self.state.lock().faults = faults;
    }

    pub fn set_completion_mode(&self, mode: CompletionMode) {
        self.state.lock().completion_mode = mode;
    }

    /// All register accesses since the last call to [Self::clear_log]
    pub fn accesses(&self) -> Vec<RegisterAccess> {
        self.state.lock().accesses.clone()
    }

    /// All register writes since the last call to [Self::clear_log]
    pub fn writes(&self) -> Vec<(usize, u32)> {
        self.state
            .lock()
            .accesses
            .iter()
            .filter_map(|access| match access {
                RegisterAccess::Write { offset, value } => Some((*offset, *value)),
                RegisterAccess::Read { .. } => None,
            })
            .collect()
    }

    /// All fetched commands since the last call to [Self::clear_log]
    pub fn commands(&self) -> Vec<SubmittedCommand> {
        self.state.lock().commands.clone()
    }

    pub fn clear_log(&self) {
        let mut state = self.state.lock();
        state.accesses.clear();
        state.commands.clear();
    }

    /// The io commands waiting for [Self::complete_pending]
    pub fn pending_io(&self) -> Vec<(QueueIdentifier, CommandIdentifier)> {
        self.state
            .lock()
            .pending_io
            .iter()
            .map(|pending| (pending.queue, pending.command.command_identifier()))
            .collect()
    }

    /// Executes a pending io command and posts its completion.
    ///
    /// Returns `false` if no such command is pending.
    pub fn complete_pending(&self, queue: QueueIdentifier, cid: CommandIdentifier) -> bool {
        let mut state = self.state.lock();
        let Some(pending) = Self::take_pending(&mut state, queue, cid) else {
            return false;
        };
        let result = self.execute_io(&mut state, &pending.command);
        self.post_completion(&mut state, queue, cid, result);
        true
    }

    /// Completes a pending io command with an error status without executing it
    pub fn fail_pending(
        &self,
        queue: QueueIdentifier,
        cid: CommandIdentifier,
        status_code_type: u8,
        status_code: u8,
    ) -> bool {
        let mut state = self.state.lock();
        if Self::take_pending(&mut state, queue, cid).is_none() {
            return false;
        }
        self.post_completion(&mut state, queue, cid, Err((status_code_type, status_code)));
        true
    }

    /// Completes every pending io command. Returns the number of completions
    pub fn complete_all_pending(&self) -> usize {
        let pending = self.pending_io();
        pending
            .into_iter()
            .filter(|(queue, cid)| self.complete_pending(*queue, *cid))
            .count()
    }

    /// Posts a successful completion for `cid` on `queue` without any command
    pub fn inject_completion(&self, queue: QueueIdentifier, cid: CommandIdentifier) {
        let mut state = self.state.lock();
        self.post_completion(&mut state, queue, cid, Ok(0));
    }

    /// Returns `true` once for every raised, unmasked interrupt
    pub fn take_interrupt(&self) -> bool {
        let mut state = self.state.lock();
        if state.interrupt_pending && !state.interrupt_mask.get_bit(0) {
            state.interrupt_pending = false;
            true
        } else {
            false
        }
    }

    pub fn interrupts_raised(&self) -> usize {
        self.state.lock().interrupts_raised
    }

    pub fn interrupt_mask(&self) -> u32 {
        self.state.lock().interrupt_mask
    }

    /// The number of io queue pairs that currently exist on the controller
    pub fn io_queue_count(&self) -> usize {
        self.state
            .lock()
            .submission_queues
            .keys()
            .filter(|qid| **qid != 0)
            .count()
    }

    pub fn flushes(&self) -> usize {
        self.state.lock().flushes
    }

    pub fn write_cache_enabled(&self) -> bool {
        self.state.lock().write_cache_enabled
    }

    /// Reads `data.len()` bytes of namespace `nsid` starting at byte `offset`
    pub fn read_namespace(&self, nsid: u32, offset: usize, data: &mut [u8]) {
        let namespaces = self.namespaces.lock();
        let namespace = &namespaces[nsid as usize - 1];
        data.copy_from_slice(&namespace.data[offset..offset + data.len()]);
    }

    pub fn write_namespace(&self, nsid: u32, offset: usize, data: &[u8]) {
        let mut namespaces = self.namespaces.lock();
        let namespace = &mut namespaces[nsid as usize - 1];
        namespace.data[offset..offset + data.len()].copy_from_slice(data);
    }

    fn take_pending(
        state: &mut State,
        queue: QueueIdentifier,
        cid: CommandIdentifier,
    ) -> Option<PendingIo> {
        let index = state.pending_io.iter().position(|pending| {
            pending.queue == queue && pending.command.command_identifier() == cid
        })?;
        Some(state.pending_io.remove(index))
    }

    fn page_size(&self, state: &State) -> u64 {
        1 << ControllerConfiguration::from(state.controller_configuration).memory_page_shift()
    }

    fn controller_status(&self, state: &mut State) -> u32 {
        if let Some((target, remaining)) = state.pending_ready {
            if remaining == 0 {
                state.ready = target;
                state.pending_ready = None;
            } else {
                state.pending_ready = Some((target, remaining - 1));
            }
        }
        let mut value = 0;
        value.set_bit(0, state.ready);
        value.set_bit(1, state.faults.fatal_status && state.ready);
        value.set_bits(2..=3, state.shutdown_status);
        value
    }

    fn write_configuration(&self, state: &mut State, value: u32) {
        let old = ControllerConfiguration::from(state.controller_configuration);
        let new = ControllerConfiguration::from(value);
        state.controller_configuration = value;

        if !old.enable() && new.enable() {
            debug!("sim: controller enabled");
            let attributes = AdminQueueAttributes::from(state.admin_queue_attributes);
            state.submission_queues.insert(
                0,
                SubmissionQueue {
                    base: state.admin_submission_queue,
                    entries: attributes.submission_queue_size() as u32,
                    head: 0,
                    completion_queue: 0,
                },
            );
            state.completion_queues.insert(
                0,
                CompletionQueue {
                    base: state.admin_completion_queue,
                    entries: attributes.completion_queue_size() as u32,
                    tail: 0,
                    phase: true,
                    interrupts: true,
                },
            );
            state.shutdown_status = ShutdownStatus::NormalOperation.bits();
            if !state.faults.stuck_ready {
                state.pending_ready = Some((true, self.config.ready_delay_reads));
            }
        } else if old.enable() && !new.enable() {
            debug!("sim: controller reset");
            state.submission_queues.clear();
            state.completion_queues.clear();
            state.pending_io.clear();
            state.granted_io_queues = None;
            state.shutdown_status = ShutdownStatus::NormalOperation.bits();
            state.pending_ready = Some((false, self.config.ready_delay_reads));
        }

        if old.shutdown_notification() != new.shutdown_notification()
            && new.shutdown_notification().is_some_and(|shn| shn as u8 != 0)
        {
            debug!("sim: shutdown notification");
            state.shutdown_status = if state.faults.shutdown_never_completes {
                ShutdownStatus::Occuring.bits()
            } else {
                ShutdownStatus::Complete.bits()
            };
        }
    }

    fn ring_submission_doorbell(&self, state: &mut State, qid: u16, tail: u32) {
        let Some(mut queue) = state.submission_queues.get(&qid).copied() else {
            warn!("sim: doorbell for unknown submission queue {qid}");
            return;
        };
        if tail >= queue.entries {
            warn!("sim: invalid tail {tail} for submission queue {qid}");
            return;
        }
        let queue_ident = QueueIdentifier::new(qid);

        while queue.head != tail {
            let address = queue.base + (queue.head as usize * SUBMISSION_COMMAND_ENTRY_SIZE) as u64;
            queue.head = (queue.head + 1) % queue.entries;
            state.submission_queues.insert(qid, queue);

            let Ok(command) = self.memory.try_device_read_value::<CommonCommand>(address) else {
                warn!("sim: submission queue {qid} memory is not mapped");
                return;
            };
            let cid = command.command_identifier();
            state.commands.push(SubmittedCommand {
                queue: queue_ident,
                opcode: command.opcode(),
                cid,
                nsid: command.namespace(),
                prp1: command.prp1(),
                prp2: command.prp2(),
                cdw: command.command_dwords(),
            });

            if qid == 0 {
                if state.faults.ignore_admin_commands {
                    continue;
                }
                let result = self.execute_admin(state, &command);
                self.post_completion(state, queue_ident, cid, result);
            } else if state.completion_mode == CompletionMode::Manual {
                state.pending_io.push(PendingIo {
                    queue: queue_ident,
                    command,
                });
            } else {
                let result = self.execute_io(state, &command);
                self.post_completion(state, queue_ident, cid, result);
            }

            // the admin command may have deleted this queue
            match state.submission_queues.get(&qid) {
                Some(current) => queue = *current,
                None => return,
            }
        }
    }

    fn post_completion(
        &self,
        state: &mut State,
        queue: QueueIdentifier,
        cid: CommandIdentifier,
        result: CommandResult,
    ) {
        let (sq_head, cqid) = match state.submission_queues.get(&queue.as_u16()) {
            Some(sq) => (sq.head as u16, sq.completion_queue),
            None => (0, queue.as_u16()),
        };
        let Some(cq) = state.completion_queues.get_mut(&cqid) else {
            warn!("sim: no completion queue {cqid} for completion of {cid:?}");
            return;
        };

        let (dword0, sct, sc) = match result {
            Ok(dword0) => (dword0, GENERIC, GenericCommandStatus::Success as u8),
            Err((sct, sc)) => (0, sct, sc),
        };
        let mut status = 0u16;
        status.set_bit(0, cq.phase);
        status.set_bits(1..=8, sc as u16);
        status.set_bits(9..=11, sct as u16);

        let address = cq.base + (cq.tail as usize * COMPLETION_COMMAND_ENTRY_SIZE) as u64;
        let written = self
            .memory
            .try_device_write_value(address, dword0)
            .and_then(|_| self.memory.try_device_write_value(address + 4, 0u32))
            .and_then(|_| self.memory.try_device_write_value(address + 8, sq_head))
            .and_then(|_| {
                self.memory
                    .try_device_write_value(address + 10, queue.as_u16())
            })
            .and_then(|_| self.memory.try_device_write_value(address + 12, cid.as_u16()));
        if written.is_err() {
            warn!("sim: completion queue {cqid} memory is not mapped");
            return;
        }
        // the phase tag is written last
        fence(Ordering::Release);
        let _ = self
            .memory
            .try_device_write_value(address + COMPLETION_STATUS_OFFSET as u64, status);

        cq.tail += 1;
        if cq.tail == cq.entries {
            cq.tail = 0;
            cq.phase = !cq.phase;
        }
        if cq.interrupts {
            state.interrupt_pending = true;
            state.interrupts_raised += 1;
        }
    }

    fn identify_controller(&self) -> Vec<u8> {
        let mut data = vec![0u8; IDENTIFY_DATA_SIZE];
        data[0..2].copy_from_slice(&0x1b36u16.to_le_bytes());
        data[2..4].copy_from_slice(&0x1af4u16.to_le_bytes());
        let mut copy_ascii = |range: core::ops::Range<usize>, text: &str| {
            let field = &mut data[range];
            field.fill(b' ');
            let len = text.len().min(field.len());
            field[..len].copy_from_slice(&text.as_bytes()[..len]);
        };
        copy_ascii(4..24, &self.config.serial_number);
        copy_ascii(24..64, "Simulated NVMe Controller");
        copy_ascii(64..72, "1.0");
        data[77] = self.config.mdts;
        data[78..80].copy_from_slice(&1u16.to_le_bytes());
        data[80..84].copy_from_slice(&self.config.version.value().to_le_bytes());
        data[512] = 0x66;
        data[513] = 0x44;
        data[516..520].copy_from_slice(&(self.config.namespaces.len() as u32).to_le_bytes());
        data[525] = self.config.volatile_write_cache as u8;
        data
    }

    fn identify_namespace(&self, nsid: u32) -> Vec<u8> {
        let mut data = vec![0u8; IDENTIFY_DATA_SIZE];
        let Some(namespace) = self.config.namespaces.get(nsid as usize - 1) else {
            return data;
        };
        data[0..8].copy_from_slice(&namespace.blocks.to_le_bytes());
        data[8..16].copy_from_slice(&namespace.blocks.to_le_bytes());
        data[16..24].copy_from_slice(&namespace.blocks.to_le_bytes());
        // one format, formatted with format 0
        data[25] = 0;
        data[26] = 0;
        data[128..132].copy_from_slice(&((namespace.block_shift as u32) << 16).to_le_bytes());
        data
    }

    fn execute_admin(&self, state: &mut State, command: &CommonCommand) -> CommandResult {
        let cdw = command.command_dwords();
        let Ok(opcode) = AdminOpcode::try_from(command.opcode()) else {
            return Err(generic(GenericCommandStatus::InvalidCommandOpcode));
        };
        trace!("sim: admin command {opcode:?}");
        let namespace_count = self.config.namespaces.len() as u32;

        match opcode {
            AdminOpcode::Identify => {
                let data = match cdw[0].get_bits(0..=7) {
                    0x0 => {
                        let nsid = command.namespace();
                        if nsid == 0 || nsid > namespace_count {
                            return Err(generic(GenericCommandStatus::InvalidNamespaceFormat));
                        }
                        self.identify_namespace(nsid)
                    }
                    0x1 => self.identify_controller(),
                    0x2 => {
                        let mut data = vec![0u8; IDENTIFY_DATA_SIZE];
                        let start = command.namespace();
                        for (index, nsid) in ((start + 1)..=namespace_count).enumerate() {
                            data[index * 4..index * 4 + 4].copy_from_slice(&nsid.to_le_bytes());
                        }
                        data
                    }
                    _ => return Err(generic(GenericCommandStatus::InvalidFieldInCommand)),
                };
                self.transfer_to_host(state, command, &data)?;
                Ok(0)
            }
            AdminOpcode::CreateIOCompletionQueue => {
                let qid = cdw[0].get_bits(0..=15) as u16;
                let entries = cdw[0].get_bits(16..=31) + 1;
                if !self.valid_io_queue_ident(state, qid)
                    || state.completion_queues.contains_key(&qid)
                {
                    return Err((COMMAND_SPECIFIC, 0x1));
                }
                if entries < 2 || entries > self.capabilities.maximum_queue_entries() {
                    return Err((COMMAND_SPECIFIC, 0x2));
                }
                if !cdw[1].get_bit(0) {
                    return Err(generic(GenericCommandStatus::InvalidFieldInCommand));
                }
                state.completion_queues.insert(
                    qid,
                    CompletionQueue {
                        base: command.prp1(),
                        entries,
                        tail: 0,
                        phase: true,
                        interrupts: cdw[1].get_bit(1),
                    },
                );
                Ok(0)
            }
            AdminOpcode::CreateIOSubmissionQueue => {
                let qid = cdw[0].get_bits(0..=15) as u16;
                let entries = cdw[0].get_bits(16..=31) + 1;
                let cqid = cdw[1].get_bits(16..=31) as u16;
                if cqid == 0 || !state.completion_queues.contains_key(&cqid) {
                    return Err((COMMAND_SPECIFIC, 0x0));
                }
                if !self.valid_io_queue_ident(state, qid)
                    || state.submission_queues.contains_key(&qid)
                {
                    return Err((COMMAND_SPECIFIC, 0x1));
                }
                if entries < 2 || entries > self.capabilities.maximum_queue_entries() {
                    return Err((COMMAND_SPECIFIC, 0x2));
                }
                state.submission_queues.insert(
                    qid,
                    SubmissionQueue {
                        base: command.prp1(),
                        entries,
                        head: 0,
                        completion_queue: cqid,
                    },
                );
                Ok(0)
            }
            AdminOpcode::DeleteIOSubmissionQueue => {
                let qid = cdw[0].get_bits(0..=15) as u16;
                if qid == 0 || !state.submission_queues.contains_key(&qid) {
                    return Err((COMMAND_SPECIFIC, 0x1));
                }
                let queue = QueueIdentifier::new(qid);
                let aborted: Vec<_> = state
                    .pending_io
                    .iter()
                    .filter(|pending| pending.queue == queue)
                    .map(|pending| pending.command.command_identifier())
                    .collect();
                state.pending_io.retain(|pending| pending.queue != queue);
                for cid in aborted {
                    self.post_completion(
                        state,
                        queue,
                        cid,
                        Err(generic(GenericCommandStatus::AbortSQDeletion)),
                    );
                }
                state.submission_queues.remove(&qid);
                Ok(0)
            }
            AdminOpcode::DeleteIOCompletionQueue => {
                let qid = cdw[0].get_bits(0..=15) as u16;
                if qid == 0 || !state.completion_queues.contains_key(&qid) {
                    return Err((COMMAND_SPECIFIC, 0x1));
                }
                if state
                    .submission_queues
                    .values()
                    .any(|sq| sq.completion_queue == qid)
                {
                    // Invalid Queue Deletion
                    return Err((COMMAND_SPECIFIC, 0xc));
                }
                state.completion_queues.remove(&qid);
                Ok(0)
            }
            AdminOpcode::SetFeatures => match FeatureIdentifier::try_from(cdw[0] as u8) {
                Ok(FeatureIdentifier::NumberOfQueues) => {
                    if state.granted_io_queues.is_some() {
                        // Command Sequence Error, only allowed once after reset
                        return Err(generic(GenericCommandStatus::SequenceError));
                    }
                    let requested = (cdw[1].get_bits(0..=15) as u16)
                        .min(cdw[1].get_bits(16..=31) as u16)
                        .saturating_add(1);
                    let granted = requested.min(self.config.max_io_queues);
                    state.granted_io_queues = Some(granted);
                    Ok(Self::number_of_queues_result(granted))
                }
                Ok(FeatureIdentifier::VolatileWriteCache) if self.config.volatile_write_cache => {
                    state.write_cache_enabled = cdw[1].get_bit(0);
                    Ok(0)
                }
                _ => Err(generic(GenericCommandStatus::InvalidFieldInCommand)),
            },
            AdminOpcode::GetFeatures => match FeatureIdentifier::try_from(cdw[0] as u8) {
                Ok(FeatureIdentifier::NumberOfQueues) => Ok(Self::number_of_queues_result(
                    state.granted_io_queues.unwrap_or(self.config.max_io_queues),
                )),
                Ok(FeatureIdentifier::VolatileWriteCache) if self.config.volatile_write_cache => {
                    Ok(state.write_cache_enabled as u32)
                }
                _ => Err(generic(GenericCommandStatus::InvalidFieldInCommand)),
            },
            AdminOpcode::Abort => {
                let queue = QueueIdentifier::new(cdw[0].get_bits(0..=15) as u16);
                let cid = CommandIdentifier::new(cdw[0].get_bits(16..=31) as u16);
                if Self::take_pending(state, queue, cid).is_some() {
                    self.post_completion(
                        state,
                        queue,
                        cid,
                        Err(generic(GenericCommandStatus::AbortRequested)),
                    );
                    Ok(0)
                } else {
                    // not aborted
                    Ok(1)
                }
            }
            AdminOpcode::GetLogPage
            | AdminOpcode::AsynchronousEventRequest
            | AdminOpcode::KeepAlive => Err(generic(GenericCommandStatus::InvalidCommandOpcode)),
        }
    }

    fn number_of_queues_result(granted: u16) -> u32 {
        let granted = (granted - 1) as u32;
        granted | granted << 16
    }

    fn valid_io_queue_ident(&self, state: &State, qid: u16) -> bool {
        let limit = state.granted_io_queues.unwrap_or(self.config.max_io_queues);
        qid != 0 && qid <= limit
    }

    /// The host addresses described by the PRP entries of `command`
    fn prp_chunks(
        &self,
        state: &State,
        command: &CommonCommand,
        len: usize,
    ) -> Result<Vec<(u64, usize)>, (u8, u8)> {
        let transfer_error = generic(GenericCommandStatus::DataTransferError);
        let page_size = self.page_size(state);
        let first = command.prp1();
        let offset = first % page_size;
        if offset % 4 != 0 {
            return Err(generic(GenericCommandStatus::InvalidPrpOffset));
        }

        let first_len = ((page_size - offset) as usize).min(len);
        let mut chunks = vec![(first, first_len)];
        let mut remaining = len - first_len;
        if remaining == 0 {
            return Ok(chunks);
        }
        if remaining <= page_size as usize {
            chunks.push((command.prp2(), remaining));
            return Ok(chunks);
        }

        let mut list = command.prp2();
        while remaining > 0 {
            let last_in_page = list % page_size == page_size - 8;
            let entry: u64 = self
                .memory
                .try_device_read_value(list)
                .map_err(|_| transfer_error)?;
            if last_in_page && remaining > page_size as usize {
                // pointer to the next list page
                list = entry;
                continue;
            }
            if entry % page_size != 0 {
                return Err(generic(GenericCommandStatus::InvalidPrpOffset));
            }
            let chunk = remaining.min(page_size as usize);
            chunks.push((entry, chunk));
            remaining -= chunk;
            list += 8;
        }
        Ok(chunks)
    }

    fn transfer_to_host(
        &self,
        state: &State,
        command: &CommonCommand,
        data: &[u8],
    ) -> Result<(), (u8, u8)> {
        let mut position = 0;
        for (address, len) in self.prp_chunks(state, command, data.len())? {
            self.memory
                .device_write(address, &data[position..position + len])
                .map_err(|_| generic(GenericCommandStatus::DataTransferError))?;
            position += len;
        }
        Ok(())
    }

    fn transfer_from_host(
        &self,
        state: &State,
        command: &CommonCommand,
        data: &mut [u8],
    ) -> Result<(), (u8, u8)> {
        let mut position = 0;
        for (address, len) in self.prp_chunks(state, command, data.len())? {
            self.memory
                .device_read(address, &mut data[position..position + len])
                .map_err(|_| generic(GenericCommandStatus::DataTransferError))?;
            position += len;
        }
        Ok(())
    }

    fn execute_io(&self, state: &mut State, command: &CommonCommand) -> CommandResult {
        let Ok(opcode) = IoOpcode::try_from(command.opcode()) else {
            return Err(generic(GenericCommandStatus::InvalidCommandOpcode));
        };
        let nsid = command.namespace();
        if nsid == 0 || nsid as usize > self.config.namespaces.len() {
            return Err(generic(GenericCommandStatus::InvalidNamespaceFormat));
        }
        let mut namespaces = self.namespaces.lock();
        let namespace = &mut namespaces[nsid as usize - 1];

        match opcode {
            IoOpcode::Flush => {
                state.flushes += 1;
                Ok(0)
            }
            IoOpcode::Read | IoOpcode::Write => {
                let cdw = command.command_dwords();
                let slba = (cdw[1] as u64) << 32 | cdw[0] as u64;
                let blocks = cdw[2].get_bits(0..=15) as u64 + 1;
                if slba
                    .checked_add(blocks)
                    .map_or(true, |end| end > namespace.config.blocks)
                {
                    return Err(generic(GenericCommandStatus::LbaOutOfRange));
                }
                let shift = namespace.config.block_shift;
                let start = (slba << shift) as usize;
                let end = start + (blocks << shift) as usize;
                let data = &mut namespace.data[start..end];
                if opcode == IoOpcode::Read {
                    self.transfer_to_host(state, command, data)?;
                } else {
                    self.transfer_from_host(state, command, data)?;
                }
                Ok(0)
            }
            _ => Err(generic(GenericCommandStatus::InvalidCommandOpcode)),
        }
    }
}

impl RegisterWindow for SimController {
    fn read32(&self, offset: usize) -> u32 {
        let mut state = self.state.lock();
        state.accesses.push(RegisterAccess::Read { offset });
        match offset {
            CAPABILITIES => self.capabilities.value() as u32,
            o if o == CAPABILITIES + 4 => (self.capabilities.value() >> 32) as u32,
            VERSION => self.config.version.value(),
            INTERRUPT_MASK_SET | INTERRUPT_MASK_CLEAR => state.interrupt_mask,
            CONTROLLER_CONFIGURATION => state.controller_configuration,
            CONTROLLER_STATUS => self.controller_status(&mut state),
            ADMIN_QUEUE_ATTRIBUTES => state.admin_queue_attributes,
            ADMIN_SUBMISSION_QUEUE => state.admin_submission_queue as u32,
            o if o == ADMIN_SUBMISSION_QUEUE + 4 => (state.admin_submission_queue >> 32) as u32,
            ADMIN_COMPLETION_QUEUE => state.admin_completion_queue as u32,
            o if o == ADMIN_COMPLETION_QUEUE + 4 => (state.admin_completion_queue >> 32) as u32,
            _ => 0,
        }
    }

    fn write32(&self, offset: usize, value: u32) {
        let mut state = self.state.lock();
        state.accesses.push(RegisterAccess::Write { offset, value });
        match offset {
            INTERRUPT_MASK_SET => state.interrupt_mask |= value,
            INTERRUPT_MASK_CLEAR => state.interrupt_mask &= !value,
            CONTROLLER_CONFIGURATION => self.write_configuration(&mut state, value),
            ADMIN_QUEUE_ATTRIBUTES => state.admin_queue_attributes = value,
            ADMIN_SUBMISSION_QUEUE => {
                state.admin_submission_queue.set_bits(0..=31, value as u64);
            }
            o if o == ADMIN_SUBMISSION_QUEUE + 4 => {
                state.admin_submission_queue.set_bits(32..=63, value as u64);
            }
            ADMIN_COMPLETION_QUEUE => {
                state.admin_completion_queue.set_bits(0..=31, value as u64);
            }
            o if o == ADMIN_COMPLETION_QUEUE + 4 => {
                state.admin_completion_queue.set_bits(32..=63, value as u64);
            }
            o if o >= DOORBELL_BASE => {
                if !state.ready {
                    warn!("sim: doorbell write while the controller is not ready");
                    return;
                }
                let index = (o - DOORBELL_BASE) / self.capabilities.doorbell_stride();
                let qid = (index / 2) as u16;
                if index % 2 == 0 {
                    self.ring_submission_doorbell(&mut state, qid, value);
                }
                // completion head doorbells need no action, the driver never
                // has more commands in flight than fit into a queue
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::properties::ControllerStatus;

    fn enabled_controller() -> (Arc<SimMemory>, SimController) {
        let memory = Arc::new(SimMemory::new());
        let controller = SimController::new(SimConfig::default(), memory.clone());
        let mut configuration = ControllerConfiguration::default();
        configuration.set_enable(true);
        controller.write32(CONTROLLER_CONFIGURATION, configuration.value());
        (memory, controller)
    }

    #[test]
    fn ready_follows_enable_after_delay() {
        let (_memory, controller) = enabled_controller();
        let ready = |c: &SimController| ControllerStatus::from(c.read32(CONTROLLER_STATUS)).ready();
        assert!(!ready(&controller));
        assert!(!ready(&controller));
        assert!(ready(&controller));

        controller.write32(CONTROLLER_CONFIGURATION, 0);
        assert!(ready(&controller));
        assert!(ready(&controller));
        assert!(!ready(&controller));
    }

    #[test]
    fn shutdown_notification_sets_status() {
        let (_memory, controller) = enabled_controller();
        let mut configuration = ControllerConfiguration::default();
        configuration.set_enable(true);
        configuration
            .set_shutdown_notification(crate::properties::ShutdownNotification::Normal);
        controller.write32(CONTROLLER_CONFIGURATION, configuration.value());
        assert_eq!(
            ControllerStatus::from(controller.read32(CONTROLLER_STATUS)).shutdown_status(),
            ShutdownStatus::Complete
        );
    }

    #[test]
    fn capabilities_register() {
        let memory = Arc::new(SimMemory::new());
        let controller = SimController::new(SimConfig::default(), memory);
        let capabilities = Capabilities::from(controller.read64(CAPABILITIES));
        assert_eq!(capabilities.maximum_queue_entries(), 32);
        assert_eq!(capabilities.timeout(), 20);
        assert_eq!(capabilities.doorbell_stride(), 4);
        assert!(capabilities.supports_nvm_command_set());
        assert_eq!(
            controller.accesses(),
            vec![
                RegisterAccess::Read { offset: 0 },
                RegisterAccess::Read { offset: 4 }
            ]
        );
    }
}
