//! Data structures and functions for using NVME Command Queues.
//!
//! A [Queue] is a submission queue paired 1:1 with a completion queue.
//! Commands are tracked by their [CommandContext] from [Queue::submit] until
//! the matching completion entry is consumed by [Queue::process_completions].
//!
//! The specification documents can be found at <https://nvmexpress.org/specifications/>
//! specifically: NVM Express Base Specification

use core::{
    fmt::Debug,
    sync::atomic::{fence, AtomicBool, Ordering},
    time::Duration,
};

use alloc::{boxed::Box, sync::Arc, vec::Vec};
use derive_where::derive_where;
use shared::{
    lockcell::{LockCell, SpinLock},
    math::WrappingValue,
};

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use crate::{
    ccb::{CcbPool, CommandContext},
    delay::{iterations, Delay},
    dma::{DmaAllocator, DmaBuffer, SyncDirection},
    error::{NvmeError, Violation},
    generic_command::{
        CommonCommand, CommonCompletionEntry, StatusAndPhase, COMPLETION_COMMAND_ENTRY_SIZE,
        COMPLETION_STATUS_OFFSET, SUBMISSION_COMMAND_ENTRY_SIZE,
    },
    registers::{completion_head_doorbell, submission_tail_doorbell, RegisterWindow},
};

#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct QueueIdentifier(u16);

impl QueueIdentifier {
    /// The admin queue pair
    pub const ADMIN: QueueIdentifier = QueueIdentifier(0);

    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    pub const fn as_u16(self) -> u16 {
        self.0
    }

    pub fn is_admin(self) -> bool {
        self == Self::ADMIN
    }
}

/// Callback invoked exactly once for every submitted command.
///
/// `Ok` carries the raw completion entry, which can still report a command
/// error. `Err` is used when the command was discarded without a completion.
pub type DoneFn = Box<dyn FnOnce(Result<CommonCompletionEntry, NvmeError>) + Send>;

/// Liveness of a controller, shared by all of its queues
#[derive(Debug, Default)]
pub(crate) struct ControllerHealth {
    dead: AtomicBool,
    violation: SpinLock<Option<Violation>>,
}

impl ControllerHealth {
    /// Marks the controller as dead. Returns `true` for the first call.
    pub(crate) fn mark_dead(&self, violation: Violation) -> bool {
        let mut reason = self.violation.lock();
        if reason.is_some() {
            return false;
        }
        error!("controller is dead: {violation}");
        *reason = Some(violation);
        self.dead.store(true, Ordering::Release);
        true
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    pub(crate) fn violation(&self) -> Option<Violation> {
        if !self.is_dead() {
            return None;
        }
        *self.violation.lock()
    }
}

/// Everything a [Queue] shares with its controller
#[derive(Clone)]
pub(crate) struct QueueEnvironment {
    pub(crate) registers: Arc<dyn RegisterWindow>,
    pub(crate) allocator: Arc<dyn DmaAllocator>,
    pub(crate) delay: Arc<dyn Delay>,
    pub(crate) health: Arc<ControllerHealth>,
    pub(crate) doorbell_stride: usize,
    pub(crate) page_size: usize,
    /// PRP list entries per command context
    pub(crate) max_list_entries: usize,
    pub(crate) poll_step_us: u32,
}

#[derive(Debug)]
struct SubmissionRing {
    memory: DmaBuffer,
    /// Index of the next slot to write a command to
    tail: WrappingValue<u32>,
}

#[derive(Debug)]
struct CompletionRing {
    memory: DmaBuffer,
    /// Index of the next entry to read
    head: WrappingValue<u32>,
    /// The phase of a new entry at `head`.
    ///
    /// This starts out at `true` and switches every time the completion queue
    /// wraps around to the `0th` index
    expected_phase: bool,
}

struct InFlight {
    ccb: CommandContext,
    done: DoneFn,
}

/// A submission and completion queue pair
#[derive_where(Debug)]
pub struct Queue {
    id: QueueIdentifier,
    entries: u32,

    #[derive_where(skip)]
    registers: Arc<dyn RegisterWindow>,
    #[derive_where(skip)]
    delay: Arc<dyn Delay>,
    health: Arc<ControllerHealth>,
    poll_step_us: u32,

    submission_doorbell: usize,
    completion_doorbell: usize,

    submission: SpinLock<SubmissionRing>,
    completion: SpinLock<CompletionRing>,

    ccbs: CcbPool,
    /// Indexed by command identifier
    #[derive_where(skip)]
    in_flight: Vec<SpinLock<Option<InFlight>>>,
}

impl Queue {
    /// Allocates the rings and command contexts for a queue with `entries` slots.
    ///
    /// The queue is only usable after the controller knows about the rings,
    /// either through ASQ/ACQ or the create io queue commands.
    pub(crate) fn allocate(
        id: QueueIdentifier,
        entries: u32,
        environment: &QueueEnvironment,
    ) -> Result<Self, NvmeError> {
        if !(2..=1 << 16).contains(&entries) {
            return Err(NvmeError::InvalidArgument("queue size must be in 2..=65536"));
        }

        let submission_memory = DmaBuffer::allocate(
            &environment.allocator,
            entries as usize * SUBMISSION_COMMAND_ENTRY_SIZE,
            environment.page_size,
        )?;
        let completion_memory = DmaBuffer::allocate(
            &environment.allocator,
            entries as usize * COMPLETION_COMMAND_ENTRY_SIZE,
            environment.page_size,
        )?;
        // one slot always stays empty to tell a full from an empty ring
        let capacity = (entries - 1) as u16;
        let ccbs = CcbPool::new(
            &environment.allocator,
            id,
            capacity,
            environment.max_list_entries,
            environment.page_size,
        )?;

        trace!("allocated queue {:?} with {} entries", id, entries);

        Ok(Self {
            id,
            entries,
            registers: environment.registers.clone(),
            delay: environment.delay.clone(),
            health: environment.health.clone(),
            poll_step_us: environment.poll_step_us,
            submission_doorbell: submission_tail_doorbell(id, environment.doorbell_stride),
            completion_doorbell: completion_head_doorbell(id, environment.doorbell_stride),
            submission: SpinLock::new(SubmissionRing {
                memory: submission_memory,
                tail: WrappingValue::zero(entries),
            }),
            completion: SpinLock::new(CompletionRing {
                memory: completion_memory,
                head: WrappingValue::zero(entries),
                expected_phase: true,
            }),
            ccbs,
            in_flight: (0..capacity).map(|_| SpinLock::new(None)).collect(),
        })
    }

    /// The [QueueIdentifier] for this [Queue]
    pub fn id(&self) -> QueueIdentifier {
        self.id
    }

    /// The number of slots in each ring
    pub fn entries(&self) -> u32 {
        self.entries
    }

    pub fn ccbs(&self) -> &CcbPool {
        &self.ccbs
    }

    /// Takes a free [CommandContext] of this queue
    pub fn acquire(&self) -> Option<CommandContext> {
        self.ccbs.acquire()
    }

    pub fn release(&self, ccb: CommandContext) {
        self.ccbs.release(ccb)
    }

    pub fn submission_queue_address(&self) -> u64 {
        self.submission.lock().memory.device_address()
    }

    pub fn completion_queue_address(&self) -> u64 {
        self.completion.lock().memory.device_address()
    }

    /// The index of the next completion entry
    pub fn head(&self) -> u32 {
        self.completion.lock().head.value()
    }

    /// The index of the next submission slot
    pub fn tail(&self) -> u32 {
        self.submission.lock().tail.value()
    }

    /// The phase bit expected for the entry at [Self::head]
    pub fn expected_phase(&self) -> bool {
        self.completion.lock().expected_phase
    }

    /// The number of commands submitted but not yet completed
    pub fn in_flight(&self) -> usize {
        self.ccbs.capacity() - self.ccbs.available()
    }

    /// Submits a command.
    ///
    /// `fill` builds the command from a zeroed entry. The command identifier
    /// is set afterwards. `done` is called once the command completes or is
    /// discarded, after which `ccb` returns to the pool.
    ///
    /// If this returns an error the command never reached the controller,
    /// `ccb` is released and `done` is dropped without being called. A `ccb`
    /// of another queue is rejected with [NvmeError::InvalidArgument] and
    /// not returned to any pool.
    pub fn submit<F>(&self, ccb: CommandContext, fill: F, done: DoneFn) -> Result<(), NvmeError>
    where
        F: FnOnce(&CommandContext, &mut CommonCommand),
    {
        if ccb.queue() != self.id {
            error!(
                "command context of queue {:?} submitted to queue {:?}",
                ccb.queue(),
                self.id
            );
            return Err(NvmeError::InvalidArgument(
                "command context belongs to another queue",
            ));
        }

        if let Some(violation) = self.health.violation() {
            self.ccbs.release(ccb);
            return Err(NvmeError::ProtocolViolation(violation));
        }

        let mut command = CommonCommand::default();
        fill(&ccb, &mut command);
        let cid = ccb.id();
        command.set_command_identifier(cid);

        let mut submission = self.submission.lock();
        let slot = submission.tail.value() as usize;
        let offset = slot * SUBMISSION_COMMAND_ENTRY_SIZE;
        if let Err(err) = submission.memory.write(offset, command) {
            drop(submission);
            self.ccbs.release(ccb);
            return Err(err.into());
        }

        let previous = self.in_flight[cid.as_u16() as usize]
            .lock()
            .replace(InFlight { ccb, done });
        debug_assert!(previous.is_none(), "command identifier {cid:#x} in use");

        submission
            .memory
            .sync_range(offset, SUBMISSION_COMMAND_ENTRY_SIZE, SyncDirection::BeforeDeviceRead);
        submission.tail += 1;
        trace!(
            "submit command({:#x}) to queue {:?}, new tail {}",
            cid,
            self.id,
            submission.tail.value()
        );

        // the doorbell is written while holding the lock, so the controller
        // only ever sees the tail move forward
        self.registers.barrier();
        self.registers
            .write32(self.submission_doorbell, submission.tail.value());

        Ok(())
    }

    /// Consumes all new completion entries and runs their callbacks.
    ///
    /// Returns the number of consumed entries. Returns 0 without waiting if
    /// another thread is already processing this queue.
    pub fn process_completions(&self) -> usize {
        if let Some(violation) = self.health.violation() {
            self.fail_all_pending(NvmeError::ProtocolViolation(violation));
            return 0;
        }

        let Some(mut completion) = self.completion.try_lock() else {
            return 0;
        };

        let mut finished = Vec::new();
        let mut violation = None;
        let mut processed = 0;

        loop {
            let offset = completion.head.value() as usize * COMPLETION_COMMAND_ENTRY_SIZE;
            completion.memory.sync_range(
                offset,
                COMPLETION_COMMAND_ENTRY_SIZE,
                SyncDirection::AfterDeviceWrite,
            );
            let Ok(status) = completion
                .memory
                .read::<u16>(offset + COMPLETION_STATUS_OFFSET)
            else {
                break;
            };
            if StatusAndPhase::from_raw(status).phase() != completion.expected_phase {
                // phase did not match, therefor this is an old completion entry
                break;
            }
            // the rest of the entry is only valid once the phase is observed
            fence(Ordering::Acquire);
            let Ok(entry) = completion.memory.read::<CommonCompletionEntry>(offset) else {
                break;
            };

            completion.head += 1;
            if completion.head.value() == 0 {
                trace!("completion queue {:?} wrapping", self.id);
                completion.expected_phase = !completion.expected_phase;
            }
            processed += 1;

            if entry.submission_queue_ident() != self.id.as_u16() {
                violation = Some(Violation::QueueMismatch {
                    completion_queue: self.id,
                    submission_queue: entry.submission_queue_ident(),
                });
                break;
            }
            let cid = entry.command_ident();
            let Some(in_flight) = self
                .in_flight
                .get(cid.as_u16() as usize)
                .and_then(|slot| slot.lock().take())
            else {
                violation = Some(Violation::UnknownCommandIdentifier { queue: self.id, cid });
                break;
            };

            trace!("completion for command({:#x}) on queue {:?}", cid, self.id);
            finished.push((in_flight, entry));
        }

        if processed > 0 {
            self.registers.barrier();
            self.registers
                .write32(self.completion_doorbell, completion.head.value());
        }
        drop(completion);

        for (InFlight { ccb, done }, entry) in finished {
            done(Ok(entry));
            self.ccbs.release(ccb);
        }

        if let Some(violation) = violation {
            self.health.mark_dead(violation);
            self.fail_all_pending(NvmeError::ProtocolViolation(violation));
        }

        processed
    }

    /// Completes every in flight command with `err`
    pub(crate) fn fail_all_pending(&self, err: NvmeError) {
        for slot in self.in_flight.iter() {
            let in_flight = slot.lock().take();
            if let Some(InFlight { ccb, done }) = in_flight {
                debug!("failing command({:#x}) on queue {:?}: {err}", ccb.id(), self.id);
                done(Err(err));
                self.ccbs.release(ccb);
            }
        }
    }

    /// Submits a command and busy waits for its completion.
    ///
    /// Returns [NvmeError::DeviceError] if the command completed with an error
    /// status. On [NvmeError::Timeout] the command stays in flight. Its
    /// context is released once a late completion arrives or the queue is
    /// torn down.
    pub fn poll<F>(
        &self,
        ccb: CommandContext,
        fill: F,
        timeout: Duration,
    ) -> Result<CommonCompletionEntry, NvmeError>
    where
        F: FnOnce(&CommandContext, &mut CommonCommand),
    {
        let cid = ccb.id();
        let state: Arc<SpinLock<Option<Result<CommonCompletionEntry, NvmeError>>>> =
            Arc::new(SpinLock::new(None));
        let result = state.clone();

        self.submit(
            ccb,
            fill,
            Box::new(move |completion| {
                *result.lock() = Some(completion);
            }),
        )?;

        let finish = |completion: Result<CommonCompletionEntry, NvmeError>| {
            let entry = completion?;
            let status = entry.status();
            if status.is_success() {
                Ok(entry)
            } else {
                Err(NvmeError::DeviceError(status))
            }
        };

        for _ in 0..iterations(timeout.as_micros(), self.poll_step_us) {
            if let Some(completion) = state.lock().take() {
                return finish(completion);
            }
            if self.process_completions() == 0 {
                self.delay.delay_us(self.poll_step_us);
            }
        }
        if let Some(completion) = state.lock().take() {
            return finish(completion);
        }

        warn!(
            "polled command({:#x}) on queue {:?} timed out after {:?}",
            cid, self.id, timeout
        );
        Err(NvmeError::Timeout)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        generic_command::CommandIdentifier,
        sim::{SimDelay, SimMemory},
    };
    use proptest::prelude::*;
    use std::{sync::Mutex, vec};

    /// Records doorbell writes, everything else reads as 0
    #[derive(Default)]
    struct DoorbellLog {
        writes: Mutex<Vec<(usize, u32)>>,
    }

    impl RegisterWindow for DoorbellLog {
        fn read32(&self, _offset: usize) -> u32 {
            0
        }

        fn write32(&self, offset: usize, value: u32) {
            self.writes.lock().unwrap().push((offset, value));
        }
    }

    /// Plays the controller side of a single queue
    struct Loopback {
        memory: Arc<SimMemory>,
        registers: Arc<DoorbellLog>,
        delay: Arc<SimDelay>,
        queue: Queue,
        sq_head: u32,
        cq_tail: u32,
        phase: bool,
    }

    impl Loopback {
        fn new(entries: u32) -> Self {
            let memory = Arc::new(SimMemory::new());
            let registers = Arc::new(DoorbellLog::default());
            let delay = Arc::new(SimDelay::default());
            let environment = QueueEnvironment {
                registers: registers.clone(),
                allocator: memory.clone(),
                delay: delay.clone(),
                health: Arc::new(ControllerHealth::default()),
                doorbell_stride: 4,
                page_size: 4096,
                max_list_entries: 32,
                poll_step_us: 10,
            };
            let queue = Queue::allocate(QueueIdentifier::new(1), entries, &environment).unwrap();
            Self {
                memory,
                registers,
                delay,
                queue,
                sq_head: 0,
                cq_tail: 0,
                phase: true,
            }
        }

        fn submission_tail(&self) -> u32 {
            self.registers
                .writes
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|(offset, _)| *offset == 0x1008)
                .map_or(0, |(_, value)| *value)
        }

        /// Fetches the next submitted command, if any
        fn fetch(&mut self) -> Option<CommonCommand> {
            if self.sq_head == self.submission_tail() {
                return None;
            }
            let address = self.queue.submission_queue_address()
                + (self.sq_head as usize * SUBMISSION_COMMAND_ENTRY_SIZE) as u64;
            self.sq_head = (self.sq_head + 1) % self.queue.entries();
            Some(self.memory.device_read_value(address))
        }

        /// Posts a completion entry for `cid`
        fn post(&mut self, cid: CommandIdentifier, status: StatusAndPhase) {
            let status = StatusAndPhase::new(
                self.phase,
                status.status_code_type(),
                status.status_code(),
            );
            let entry = CommonCompletionEntry::new(
                0,
                self.sq_head as u16,
                QueueIdentifier::new(1),
                cid,
                status,
            );
            let address = self.queue.completion_queue_address()
                + (self.cq_tail as usize * COMPLETION_COMMAND_ENTRY_SIZE) as u64;
            self.memory.device_write_value(address, entry);
            self.cq_tail += 1;
            if self.cq_tail == self.queue.entries() {
                self.cq_tail = 0;
                self.phase = !self.phase;
            }
        }

        /// Completes the next fetched command successfully
        fn complete_next(&mut self) -> bool {
            match self.fetch() {
                Some(command) => {
                    self.post(command.command_identifier(), StatusAndPhase::success(true));
                    true
                }
                None => false,
            }
        }
    }

    fn counting_done(counter: &Arc<Mutex<usize>>) -> DoneFn {
        let counter = counter.clone();
        Box::new(move |result| {
            assert!(result.is_ok());
            *counter.lock().unwrap() += 1;
        })
    }

    #[test]
    fn submit_writes_slot_and_doorbell() {
        let mut device = Loopback::new(8);
        let ccb = device.queue.acquire().unwrap();
        let cid = ccb.id();
        device
            .queue
            .submit(
                ccb,
                |_, command| *command = CommonCommand::with_opcode(0x02),
                Box::new(|_| {}),
            )
            .unwrap();

        assert_eq!(device.submission_tail(), 1);
        let command = device.fetch().unwrap();
        assert_eq!(command.opcode(), 0x02);
        assert_eq!(command.command_identifier(), cid);
        assert_eq!(device.queue.in_flight(), 1);
    }

    #[test]
    fn completion_runs_callback_and_releases_context() {
        let mut device = Loopback::new(8);
        let counter = Arc::new(Mutex::new(0));
        let ccb = device.queue.acquire().unwrap();
        device
            .queue
            .submit(ccb, |_, _| {}, counting_done(&counter))
            .unwrap();
        assert!(device.complete_next());

        assert_eq!(device.queue.process_completions(), 1);
        assert_eq!(*counter.lock().unwrap(), 1);
        assert_eq!(device.queue.in_flight(), 0);
        assert_eq!(device.queue.head(), 1);
        // completion doorbell of queue 1 with stride 4
        assert_eq!(
            device.registers.writes.lock().unwrap().last(),
            Some(&(0x100c, 1))
        );
        assert_eq!(device.queue.process_completions(), 0);
    }

    #[test]
    fn foreign_command_context_is_rejected() {
        let device = Loopback::new(8);
        let allocator: Arc<dyn DmaAllocator> = device.memory.clone();
        let other = CcbPool::new(&allocator, QueueIdentifier::new(2), 4, 1, 4096).unwrap();
        let ccb = other.acquire().unwrap();

        let called = Arc::new(Mutex::new(false));
        let done = called.clone();
        let result = device.queue.submit(
            ccb,
            |_, _| {},
            Box::new(move |_| *done.lock().unwrap() = true),
        );

        assert!(matches!(result, Err(NvmeError::InvalidArgument(_))));
        assert!(!*called.lock().unwrap());
        assert!(device.registers.writes.lock().unwrap().is_empty());
        assert_eq!(device.queue.in_flight(), 0);
        assert_eq!(device.queue.ccbs().available(), 7);
        assert_eq!(other.available(), 3);
    }

    #[test]
    fn pool_is_one_smaller_than_the_ring() {
        let device = Loopback::new(4);
        let taken: Vec<_> = core::iter::from_fn(|| device.queue.acquire()).collect();
        assert_eq!(taken.len(), 3);
    }

    #[test]
    fn poll_reports_device_error() {
        let mut device = Loopback::new(4);
        // the controller answers before the poll starts waiting
        let ccb = device.queue.acquire().unwrap();
        let cid = ccb.id();
        device
            .queue
            .submit(ccb, |_, _| {}, Box::new(|_| {}))
            .unwrap();
        device.fetch();
        device.post(cid, StatusAndPhase::new(true, 0, 0x80));
        assert_eq!(device.queue.process_completions(), 1);

        let ccb = device.queue.acquire().unwrap();
        let cid = ccb.id();
        // nothing answers this one
        assert_eq!(
            device
                .queue
                .poll(ccb, |_, _| {}, Duration::from_millis(1)),
            Err(NvmeError::Timeout)
        );
        assert_eq!(device.delay.total_us(), 1000);
        assert_eq!(device.queue.in_flight(), 1);

        // a late completion still releases the context
        device.fetch();
        device.post(cid, StatusAndPhase::success(true));
        assert_eq!(device.queue.process_completions(), 1);
        assert_eq!(device.queue.in_flight(), 0);
    }

    #[test]
    fn unknown_command_identifier_kills_the_controller() {
        let mut device = Loopback::new(8);
        let failed = Arc::new(Mutex::new(Vec::new()));
        let ccb = device.queue.acquire().unwrap();
        let result = failed.clone();
        device
            .queue
            .submit(
                ccb,
                |_, _| {},
                Box::new(move |completion| result.lock().unwrap().push(completion)),
            )
            .unwrap();

        device.post(CommandIdentifier::new(6), StatusAndPhase::success(true));
        assert_eq!(device.queue.process_completions(), 1);

        let expected = Violation::UnknownCommandIdentifier {
            queue: QueueIdentifier::new(1),
            cid: CommandIdentifier::new(6),
        };
        assert_eq!(
            failed.lock().unwrap().as_slice(),
            &[Err(NvmeError::ProtocolViolation(expected))]
        );
        assert!(device.queue.health.is_dead());
        assert_eq!(device.queue.in_flight(), 0);

        let ccb = device.queue.acquire().unwrap();
        assert_eq!(
            device.queue.submit(ccb, |_, _| {}, Box::new(|_| {})),
            Err(NvmeError::ProtocolViolation(expected))
        );
        assert_eq!(device.queue.in_flight(), 0);
    }

    #[test]
    fn phase_flips_once_per_wrap() {
        let entries = 4;
        let mut device = Loopback::new(entries);
        let counter = Arc::new(Mutex::new(0));

        for round in 1..=(3 * entries as usize + 1) {
            let ccb = device.queue.acquire().unwrap();
            device
                .queue
                .submit(ccb, |_, _| {}, counting_done(&counter))
                .unwrap();
            assert!(device.complete_next());
            assert_eq!(device.queue.process_completions(), 1);

            let wraps = round / entries as usize;
            assert_eq!(device.queue.expected_phase(), wraps % 2 == 0);
            assert_eq!(device.queue.head() as usize, round % entries as usize);
        }
        assert_eq!(*counter.lock().unwrap(), 3 * entries as usize + 1);
    }

    #[derive(Debug, Clone)]
    enum Step {
        Submit,
        Complete,
        Process,
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![Just(Step::Submit), Just(Step::Complete), Just(Step::Process)]
    }

    proptest! {
        #[test]
        fn ring_round_trip(entries in 2u32..16, steps in proptest::collection::vec(step(), 1..400)) {
            let mut device = Loopback::new(entries);
            let counter = Arc::new(Mutex::new(0));
            let mut submitted = 0usize;

            for step in steps {
                match step {
                    Step::Submit => {
                        if let Some(ccb) = device.queue.acquire() {
                            device.queue.submit(ccb, |_, _| {}, counting_done(&counter)).unwrap();
                            submitted += 1;
                        } else {
                            prop_assert_eq!(device.queue.in_flight(), entries as usize - 1);
                        }
                    }
                    Step::Complete => {
                        device.complete_next();
                    }
                    Step::Process => {
                        device.queue.process_completions();
                    }
                }
                prop_assert!(device.queue.in_flight() <= entries as usize - 1);
            }

            while device.complete_next() {}
            device.queue.process_completions();
            prop_assert_eq!(device.queue.in_flight(), 0);
            prop_assert_eq!(*counter.lock().unwrap(), submitted);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(8))]

        #[test]
        fn command_contexts_are_conserved(steps in proptest::collection::vec(any::<bool>(), 10_000)) {
            let mut device = Loopback::new(32);
            let capacity = device.queue.ccbs().capacity();
            let counter = Arc::new(Mutex::new(0));
            let mut held = vec![];

            for acquire in steps {
                if acquire {
                    match device.queue.acquire() {
                        Some(ccb) if held.len() % 2 == 0 => held.push(ccb),
                        Some(ccb) => device.queue.submit(ccb, |_, _| {}, counting_done(&counter)).unwrap(),
                        None => {}
                    }
                } else if let Some(ccb) = held.pop() {
                    device.queue.release(ccb);
                } else {
                    device.complete_next();
                    device.queue.process_completions();
                }
                prop_assert_eq!(
                    device.queue.ccbs().available() + held.len() + device.queue.in_flight_commands(),
                    capacity
                );
            }
        }
    }

    impl Queue {
        /// Commands with a registered callback
        fn in_flight_commands(&self) -> usize {
            self.in_flight
                .iter()
                .filter(|slot| slot.lock().is_some())
                .count()
        }
    }
}
