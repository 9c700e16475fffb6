//! Block I/O on a namespace
//!
//! A [Namespace] borrows its [Controller] and submits read, write and flush
//! commands to the controllers I/O queues. Commands complete asynchronously
//! through a callback that gets the buffer back.

use alloc::{boxed::Box, sync::Arc};
use derive_where::derive_where;
use shared::lockcell::{LockCell, SpinLock};
use thiserror::Error;

#[allow(unused_imports)]
use log::{debug, error, trace, warn};

use crate::{
    admin_commands::{
        create_get_features_command, create_set_features_command, FeatureIdentifier,
        SetFeatureData,
    },
    ccb::CommandContext,
    controller::Controller,
    dma::{IoBuffer, SyncDirection},
    error::{NvmeError, Resource},
    generic_command::CommonCompletionEntry,
    io_commands::{
        create_flush_command, create_read_write_command, CommandOpcode, LBA,
        MAX_BLOCKS_PER_COMMAND,
    },
    prp::Prp,
    queue::{DoneFn, Queue},
};

/// An active namespace as reported by Identify Namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamespaceInfo {
    /// NSID, starting at 1
    pub id: u32,
    /// NSZE
    pub blocks: u64,
    /// NCAP
    pub capacity: u64,
    /// NUSE
    pub utilization: u64,
    /// the logical block size as a power of two
    pub block_shift: u8,
}

impl NamespaceInfo {
    pub fn block_size(&self) -> usize {
        1 << self.block_shift
    }

    /// The size of the namespace in bytes
    pub fn size(&self) -> u64 {
        self.blocks << self.block_shift
    }
}

/// The result of a read or write, handed to the completion callback
#[derive(Debug)]
pub struct IoCompletion<B> {
    pub buffer: B,
    pub result: Result<(), NvmeError>,
    /// the bytes that were not transferred
    pub residual: usize,
}

/// A command that could not be submitted. The buffer is handed back.
#[derive_where(Debug)]
#[derive(Error)]
#[error("failed to submit io command: {error}")]
pub struct SubmitError<B> {
    #[derive_where(skip)]
    pub buffer: B,
    pub error: NvmeError,
}

/// The outcome of [Namespace::flush]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Submitted,
    /// the controller has no volatile write cache, nothing was submitted
    NotNeeded,
}

/// The state of the volatile write cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    NotPresent,
    Enabled,
    Disabled,
}

/// A command that got its queue, command context and PRP entries
struct Prepared<'q> {
    queue: &'q Queue,
    ccb: CommandContext,
    prp1: u64,
    prp2: u64,
    length: usize,
}

fn sync_directions(opcode: CommandOpcode) -> (SyncDirection, SyncDirection) {
    match opcode {
        CommandOpcode::Write => (
            SyncDirection::BeforeDeviceRead,
            SyncDirection::AfterDeviceRead,
        ),
        _ => (
            SyncDirection::BeforeDeviceWrite,
            SyncDirection::AfterDeviceWrite,
        ),
    }
}

fn completion_result(completion: Result<CommonCompletionEntry, NvmeError>) -> Result<(), NvmeError> {
    let entry = completion?;
    let status = entry.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(NvmeError::DeviceError(status))
    }
}

/// A namespace of an attached [Controller]
#[derive(Debug, Clone, Copy)]
pub struct Namespace<'c> {
    controller: &'c Controller,
    info: NamespaceInfo,
}

impl<'c> Namespace<'c> {
    pub(crate) fn new(controller: &'c Controller, info: NamespaceInfo) -> Self {
        Self { controller, info }
    }

    pub fn info(&self) -> &NamespaceInfo {
        &self.info
    }

    pub fn id(&self) -> u32 {
        self.info.id
    }

    /// Reads `count` blocks starting at `lba` into `buffer`.
    ///
    /// `done` is called once the command completes, with the buffer and the
    /// result. On error the buffer is returned immediately and `done` is
    /// never called.
    pub fn read<B, F>(&self, lba: LBA, count: u32, buffer: B, done: F) -> Result<(), SubmitError<B>>
    where
        B: IoBuffer + 'static,
        F: FnOnce(IoCompletion<B>) + Send + 'static,
    {
        self.submit_io(CommandOpcode::Read, lba, count, buffer, done)
    }

    /// Writes `count` blocks from `buffer` starting at `lba`.
    ///
    /// See [Namespace::read].
    pub fn write<B, F>(&self, lba: LBA, count: u32, buffer: B, done: F) -> Result<(), SubmitError<B>>
    where
        B: IoBuffer + 'static,
        F: FnOnce(IoCompletion<B>) + Send + 'static,
    {
        self.submit_io(CommandOpcode::Write, lba, count, buffer, done)
    }

    /// Reads `count` blocks and busy waits for the completion.
    ///
    /// For contexts without interrupts. On [NvmeError::Timeout] the command is
    /// still in flight and the controller may write to `buffer` until it is
    /// disabled.
    pub fn read_polled<B: IoBuffer>(&self, lba: LBA, count: u32, buffer: &B) -> Result<(), NvmeError> {
        self.poll_io(CommandOpcode::Read, lba, count, buffer)
    }

    /// Writes `count` blocks and busy waits for the completion.
    ///
    /// See [Namespace::read_polled].
    pub fn write_polled<B: IoBuffer>(&self, lba: LBA, count: u32, buffer: &B) -> Result<(), NvmeError> {
        self.poll_io(CommandOpcode::Write, lba, count, buffer)
    }

    fn transfer_length(&self, lba: LBA, count: u32) -> Result<usize, NvmeError> {
        if count == 0 || count > MAX_BLOCKS_PER_COMMAND {
            return Err(NvmeError::InvalidArgument("block count must be in 1..=65536"));
        }
        let end = lba.value().checked_add(count as u64);
        if end.map_or(true, |end| end > self.info.blocks) {
            return Err(NvmeError::InvalidArgument(
                "transfer beyond the end of the namespace",
            ));
        }
        let length = (count as usize) << self.info.block_shift;
        if length > self.controller.max_transfer_size() {
            return Err(NvmeError::InvalidArgument(
                "transfer exceeds the maximum transfer size",
            ));
        }
        Ok(length)
    }

    /// Validates the transfer, picks a queue and builds the PRP entries
    fn prepare<B: IoBuffer>(&self, lba: LBA, count: u32, buffer: &B) -> Result<Prepared<'c>, NvmeError> {
        let length = self.transfer_length(lba, count)?;
        if buffer.len() < length {
            return Err(NvmeError::InvalidArgument(
                "buffer is smaller than the transfer",
            ));
        }
        let prp = Prp::from_segments(buffer.segments(), length, self.controller.page_size())
            .map_err(|err| {
                warn!("buffer not usable for io: {err}");
                NvmeError::InvalidArgument("buffer can not be described by PRP entries")
            })?;

        let queue = self
            .controller
            .select_queue()
            .ok_or(NvmeError::InvalidState(self.controller.state()))?;
        let ccb = queue
            .acquire()
            .ok_or(NvmeError::OutOfResources(Resource::CommandContexts))?;

        let prp2 = match &prp {
            Prp::Entry(_) => 0,
            Prp::DoubleEntry(_, second) => second.as_u64(),
            Prp::List { rest, .. } => match queue.ccbs().write_page_list(&ccb, rest) {
                Ok(address) => address,
                Err(err) => {
                    queue.release(ccb);
                    return Err(err);
                }
            },
        };

        Ok(Prepared {
            queue,
            ccb,
            prp1: prp.entry_1().as_u64(),
            prp2,
            length,
        })
    }

    fn submit_io<B, F>(
        &self,
        opcode: CommandOpcode,
        lba: LBA,
        count: u32,
        buffer: B,
        done: F,
    ) -> Result<(), SubmitError<B>>
    where
        B: IoBuffer + 'static,
        F: FnOnce(IoCompletion<B>) + Send + 'static,
    {
        let prepared = match self.prepare(lba, count, &buffer) {
            Ok(prepared) => prepared,
            Err(error) => return Err(SubmitError { buffer, error }),
        };
        let Prepared {
            queue,
            ccb,
            prp1,
            prp2,
            length,
        } = prepared;

        let (before, after) = sync_directions(opcode);
        buffer.sync(before);

        // the buffer is handed back either through `done` or the error
        let slot = Arc::new(SpinLock::new(Some(buffer)));
        let completion_slot = slot.clone();
        let on_complete: DoneFn = Box::new(move |completion| {
            let Some(buffer) = completion_slot.lock().take() else {
                error!("io completion without a buffer");
                return;
            };
            buffer.sync(after);
            let result = completion_result(completion);
            let residual = if result.is_ok() { 0 } else { length };
            done(IoCompletion {
                buffer,
                result,
                residual,
            });
        });

        let nsid = self.info.id;
        trace!("{opcode:?} ns {nsid} lba {lba:?} count {count} on queue {:?}", queue.id());
        let submitted = queue.submit(
            ccb,
            |_, command| {
                *command = create_read_write_command(opcode, nsid, lba, count, prp1, prp2);
            },
            on_complete,
        );

        match submitted {
            Ok(()) => Ok(()),
            Err(error) => match slot.lock().take() {
                Some(buffer) => Err(SubmitError { buffer, error }),
                None => unreachable!("failed submission consumed its buffer"),
            },
        }
    }

    fn poll_io<B: IoBuffer>(
        &self,
        opcode: CommandOpcode,
        lba: LBA,
        count: u32,
        buffer: &B,
    ) -> Result<(), NvmeError> {
        let Prepared {
            queue,
            ccb,
            prp1,
            prp2,
            ..
        } = self.prepare(lba, count, buffer)?;
        let nsid = self.info.id;

        let (before, after) = sync_directions(opcode);
        buffer.sync(before);
        let result = queue.poll(
            ccb,
            |_, command| {
                *command = create_read_write_command(opcode, nsid, lba, count, prp1, prp2);
            },
            self.controller.config().queue_timeout,
        );
        if !matches!(result, Err(NvmeError::Timeout)) {
            buffer.sync(after);
        }
        result.map(|_| ())
    }

    fn has_write_cache(&self) -> bool {
        self.controller
            .info()
            .is_some_and(|info| info.volatile_write_cache)
    }

    /// Commits the volatile write cache to non volatile media.
    ///
    /// Without a volatile write cache nothing is submitted and `done` is not
    /// called.
    pub fn flush<F>(&self, done: F) -> Result<FlushOutcome, NvmeError>
    where
        F: FnOnce(Result<(), NvmeError>) + Send + 'static,
    {
        if !self.has_write_cache() {
            trace!("flush of ns {} skipped, no volatile write cache", self.info.id);
            return Ok(FlushOutcome::NotNeeded);
        }
        let queue = self
            .controller
            .select_queue()
            .ok_or(NvmeError::InvalidState(self.controller.state()))?;
        let ccb = queue
            .acquire()
            .ok_or(NvmeError::OutOfResources(Resource::CommandContexts))?;
        let nsid = self.info.id;
        queue.submit(
            ccb,
            |_, command| *command = create_flush_command(nsid),
            Box::new(move |completion| done(completion_result(completion))),
        )?;
        Ok(FlushOutcome::Submitted)
    }

    /// Like [Namespace::flush] but busy waits for the completion
    pub fn flush_polled(&self) -> Result<FlushOutcome, NvmeError> {
        if !self.has_write_cache() {
            return Ok(FlushOutcome::NotNeeded);
        }
        let queue = self
            .controller
            .select_queue()
            .ok_or(NvmeError::InvalidState(self.controller.state()))?;
        let ccb = queue
            .acquire()
            .ok_or(NvmeError::OutOfResources(Resource::CommandContexts))?;
        let nsid = self.info.id;
        queue.poll(
            ccb,
            |_, command| *command = create_flush_command(nsid),
            self.controller.config().queue_timeout,
        )?;
        Ok(FlushOutcome::Submitted)
    }

    /// Queries whether the volatile write cache is enabled
    pub fn cache_status(&self) -> Result<CacheStatus, NvmeError> {
        if !self.has_write_cache() {
            return Ok(CacheStatus::NotPresent);
        }
        let completion = self.controller.admin_command(
            create_get_features_command(FeatureIdentifier::VolatileWriteCache),
            self.controller.config().queue_timeout,
        )?;
        Ok(if completion.dword0() & 1 == 1 {
            CacheStatus::Enabled
        } else {
            CacheStatus::Disabled
        })
    }

    /// Enables or disables the volatile write cache.
    ///
    /// The cache is shared by all namespaces of the controller.
    pub fn set_write_cache(&self, enable: bool) -> Result<(), NvmeError> {
        if !self.has_write_cache() {
            return Err(NvmeError::DeviceNotSupported(
                "controller has no volatile write cache",
            ));
        }
        self.controller.admin_command(
            create_set_features_command(SetFeatureData::VolatileWriteCache { enable }),
            self.controller.config().queue_timeout,
        )?;
        debug!("volatile write cache enabled: {enable}");
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        controller::{ControllerConfig, ControllerConfigBuilder},
        dma::{DmaAllocator, DmaBuffer, Segment},
        generic_command::GenericCommandStatus,
        sim::{CompletionMode, SimBench, SimConfig, SimNamespaceConfig},
    };
    use core::sync::atomic::{AtomicUsize, Ordering};
    use std::{sync::Mutex, thread, vec, vec::Vec};

    type Slot = Arc<Mutex<Option<IoCompletion<DmaBuffer>>>>;

    fn attached(config: SimConfig) -> (SimBench, Controller) {
        let bench = SimBench::new(config);
        let mut controller = bench.controller(ControllerConfig::default()).unwrap();
        controller.attach().unwrap();
        (bench, controller)
    }

    fn buffer(bench: &SimBench, size: usize) -> DmaBuffer {
        let allocator: Arc<dyn DmaAllocator> = bench.memory.clone();
        DmaBuffer::allocate(&allocator, size, 4096).unwrap()
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|index| (index * 7 % 251) as u8).collect()
    }

    fn record(slot: &Slot) -> impl FnOnce(IoCompletion<DmaBuffer>) + Send + 'static {
        let slot = slot.clone();
        move |completion| *slot.lock().unwrap() = Some(completion)
    }

    #[test]
    fn write_then_read() {
        let (bench, controller) = attached(SimConfig::default());
        let ns = controller.namespace(1).unwrap();
        assert_eq!(ns.info().block_size(), 512);

        let data = pattern(4096);
        let source = buffer(&bench, 4096);
        source.write_bytes(0, &data).unwrap();
        let written = Slot::default();
        ns.write(LBA::new(16), 8, source, record(&written)).unwrap();
        assert!(controller.handle_interrupt());
        let completion = written.lock().unwrap().take().unwrap();
        assert_eq!(completion.result, Ok(()));

        let mut stored = vec![0; 4096];
        bench.device.read_namespace(1, 16 * 512, &mut stored);
        assert_eq!(stored, data);

        let read = Slot::default();
        ns.read(LBA::new(16), 8, buffer(&bench, 4096), record(&read))
            .unwrap();
        controller.handle_interrupt();
        let completion = read.lock().unwrap().take().unwrap();
        assert_eq!(completion.result, Ok(()));
        assert_eq!(completion.residual, 0);
        assert_eq!(completion.buffer.to_vec(), data);
    }

    #[test]
    fn prp_entries_follow_transfer_size() {
        let (bench, controller) = attached(SimConfig::default());
        let ns = controller.namespace(1).unwrap();
        bench.device.set_completion_mode(CompletionMode::Manual);

        // a single page
        let one = buffer(&bench, 4096);
        let one_address = one.device_address();
        ns.read(LBA::new(0), 8, one, |_| {}).unwrap();
        // two pages
        let two = buffer(&bench, 8192);
        let two_address = two.device_address();
        ns.read(LBA::new(0), 16, two, |_| {}).unwrap();
        // five pages need a page list
        let five = buffer(&bench, 5 * 4096);
        let five_address = five.device_address();
        ns.read(LBA::new(0), 40, five, |_| {}).unwrap();

        let commands = bench.device.commands();
        let io: Vec<_> = commands
            .iter()
            .filter(|command| !command.queue.is_admin())
            .collect();
        assert_eq!(io.len(), 3);

        assert_eq!(io[0].prp1, one_address);
        assert_eq!(io[0].prp2, 0);
        assert_eq!(io[1].prp1, two_address);
        assert_eq!(io[1].prp2, two_address + 4096);
        assert_eq!(io[2].prp1, five_address);
        let list = io[2].prp2;
        assert!(list < five_address || list >= five_address + 5 * 4096);
        for index in 0..4 {
            let entry: u64 = bench.memory.device_read_value(list + index * 8);
            assert_eq!(entry, five_address + (index + 1) * 4096);
        }

        assert_eq!(bench.device.complete_all_pending(), 3);
        controller.handle_interrupt();
        assert_eq!(controller.io_queues()[0].in_flight(), 0);
    }

    /// Two separate pages used as a single buffer
    struct Scattered {
        pages: Vec<DmaBuffer>,
        segments: Vec<Segment>,
    }

    impl IoBuffer for Scattered {
        fn segments(&self) -> &[Segment] {
            &self.segments
        }

        fn sync(&self, direction: SyncDirection) {
            for page in self.pages.iter() {
                page.sync(direction);
            }
        }
    }

    #[test]
    fn scattered_buffer() {
        let (bench, controller) = attached(SimConfig::default());
        let ns = controller.namespace(1).unwrap();
        let data = pattern(8192);
        bench.device.write_namespace(1, 0, &data);

        let pages = vec![buffer(&bench, 4096), buffer(&bench, 4096)];
        let segments = pages
            .iter()
            .map(|page| Segment::new(page.device_address(), 4096))
            .collect();
        let scattered = Scattered { pages, segments };

        let result = Arc::new(Mutex::new(None));
        let done = result.clone();
        ns.read(LBA::new(0), 16, scattered, move |completion: IoCompletion<Scattered>| {
            *done.lock().unwrap() = Some(completion);
        })
        .unwrap();
        controller.handle_interrupt();

        let completion = result.lock().unwrap().take().unwrap();
        assert_eq!(completion.result, Ok(()));
        assert_eq!(completion.buffer.pages[0].to_vec(), data[..4096]);
        assert_eq!(completion.buffer.pages[1].to_vec(), data[4096..]);
    }

    #[test]
    fn invalid_transfers_return_the_buffer() {
        let bench = SimBench::new(SimConfig {
            mdts: 1,
            ..Default::default()
        });
        let mut controller = bench.controller(ControllerConfig::default()).unwrap();
        controller.attach().unwrap();
        assert_eq!(controller.max_transfer_size(), 8192);
        let ns = controller.namespace(1).unwrap();
        bench.device.clear_log();

        let cases = [
            (LBA::new(0), 0, 4096),
            (LBA::new(4095), 2, 4096),
            (LBA::new(u64::MAX), 1, 4096),
            (LBA::new(0), 24, 3 * 4096),
            (LBA::new(0), 16, 4096),
        ];
        for (lba, count, size) in cases {
            let source = buffer(&bench, size);
            let address = source.device_address();
            let err = ns.write(lba, count, source, |_| {}).unwrap_err();
            assert!(matches!(err.error, NvmeError::InvalidArgument(_)));
            assert_eq!(err.buffer.device_address(), address);
        }
        assert!(bench.device.commands().is_empty());
    }

    #[test]
    fn transfer_size_is_limited_by_the_page_list() {
        let bench = SimBench::new(SimConfig {
            namespaces: vec![SimNamespaceConfig {
                blocks: 16384,
                block_shift: 9,
            }],
            ..Default::default()
        });
        let config = ControllerConfigBuilder::default()
            .max_transfer_size(4 << 20)
            .build()
            .unwrap();
        let mut controller = bench.controller(config).unwrap();
        controller.attach().unwrap();
        // a 4096 byte page list holds 512 entries
        assert_eq!(controller.max_transfer_size(), 2 << 20);
        let ns = controller.namespace(1).unwrap();

        let err = ns
            .write(LBA::new(0), 6144, buffer(&bench, 3 << 20), |_| {})
            .unwrap_err();
        assert!(matches!(err.error, NvmeError::InvalidArgument(_)));

        let data = pattern(2 << 20);
        let source = buffer(&bench, 2 << 20);
        source.write_bytes(0, &data).unwrap();
        let written = Slot::default();
        ns.write(LBA::new(0), 4096, source, record(&written)).unwrap();
        controller.handle_interrupt();
        assert_eq!(written.lock().unwrap().take().unwrap().result, Ok(()));

        let mut stored = vec![0; 2 << 20];
        bench.device.read_namespace(1, 0, &mut stored);
        assert_eq!(stored, data);
    }

    #[test]
    fn command_contexts_run_out() {
        let (bench, controller) = attached(SimConfig::default());
        let ns = controller.namespace(1).unwrap();
        bench.device.set_completion_mode(CompletionMode::Manual);
        let capacity = controller.io_queues()[0].ccbs().capacity();
        assert_eq!(capacity, 31);

        let completed = Arc::new(Mutex::new(0));
        for _ in 0..capacity {
            let completed = completed.clone();
            ns.read(LBA::new(0), 1, buffer(&bench, 512), move |completion| {
                assert_eq!(completion.result, Ok(()));
                *completed.lock().unwrap() += 1;
            })
            .unwrap();
        }

        let err = ns
            .read(LBA::new(0), 1, buffer(&bench, 512), |_| {})
            .unwrap_err();
        assert_eq!(
            err.error,
            NvmeError::OutOfResources(Resource::CommandContexts)
        );

        assert_eq!(bench.device.complete_all_pending(), capacity);
        controller.handle_interrupt();
        assert_eq!(*completed.lock().unwrap(), capacity);
        assert_eq!(controller.io_queues()[0].ccbs().available(), capacity);
    }

    #[test]
    fn device_error_reports_residual() {
        let (bench, controller) = attached(SimConfig::default());
        let ns = controller.namespace(1).unwrap();
        bench.device.set_completion_mode(CompletionMode::Manual);

        let result = Slot::default();
        ns.write(LBA::new(8), 4, buffer(&bench, 2048), record(&result))
            .unwrap();
        let (queue, cid) = bench.device.pending_io()[0];
        assert!(bench.device.fail_pending(
            queue,
            cid,
            0,
            GenericCommandStatus::DataTransferError as u8
        ));
        controller.handle_interrupt();

        let completion = result.lock().unwrap().take().unwrap();
        assert!(matches!(completion.result, Err(NvmeError::DeviceError(_))));
        assert_eq!(completion.residual, 2048);
    }

    #[test]
    fn concurrent_submitters_and_interrupts() {
        const THREADS: usize = 4;
        const READS: usize = 3000;

        let bench = SimBench::new(SimConfig::default());
        let config = ControllerConfigBuilder::default()
            .io_queue_count(2)
            .build()
            .unwrap();
        let mut controller = bench.controller(config).unwrap();
        controller.attach().unwrap();

        let completions: Arc<Vec<AtomicUsize>> =
            Arc::new((0..THREADS * READS).map(|_| AtomicUsize::new(0)).collect());

        thread::scope(|scope| {
            for worker in 0..THREADS {
                let controller = &controller;
                let bench = &bench;
                let completions = &completions;
                scope.spawn(move || {
                    let ns = controller.namespace(1).unwrap();
                    for read in 0..READS {
                        let request = worker * READS + read;
                        let mut buffer = buffer(bench, 512);
                        loop {
                            let completions = completions.clone();
                            let done = move |completion: IoCompletion<DmaBuffer>| {
                                assert_eq!(completion.result, Ok(()));
                                completions[request].fetch_add(1, Ordering::SeqCst);
                            };
                            match ns.read(LBA::new(request as u64 % 64), 1, buffer, done) {
                                Ok(()) => break,
                                Err(err) => {
                                    assert_eq!(
                                        err.error,
                                        NvmeError::OutOfResources(Resource::CommandContexts)
                                    );
                                    buffer = err.buffer;
                                    controller.handle_interrupt();
                                }
                            }
                        }
                        if read % 8 == 0 {
                            controller.handle_interrupt();
                        }
                    }
                });
            }
        });

        for _ in 0..4 {
            controller.handle_interrupt();
        }
        for queue in controller.io_queues() {
            assert_eq!(queue.in_flight(), 0);
        }
        assert!(completions
            .iter()
            .all(|count| count.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn polled_io() {
        let (bench, controller) = attached(SimConfig::default());
        let ns = controller.namespace(1).unwrap();
        let data = pattern(1024);

        let source = buffer(&bench, 1024);
        source.write_bytes(0, &data).unwrap();
        ns.write_polled(LBA::new(100), 2, &source).unwrap();

        let target = buffer(&bench, 1024);
        ns.read_polled(LBA::new(100), 2, &target).unwrap();
        assert_eq!(target.to_vec()[..1024], data[..]);
    }

    #[test]
    fn flush_without_write_cache() {
        let (bench, controller) = attached(SimConfig::default());
        let ns = controller.namespace(1).unwrap();

        let called = Arc::new(Mutex::new(false));
        let done = called.clone();
        let outcome = ns
            .flush(move |_| *done.lock().unwrap() = true)
            .unwrap();
        assert_eq!(outcome, FlushOutcome::NotNeeded);
        assert!(!*called.lock().unwrap());
        assert_eq!(ns.flush_polled(), Ok(FlushOutcome::NotNeeded));
        assert_eq!(bench.device.flushes(), 0);
        assert_eq!(ns.cache_status(), Ok(CacheStatus::NotPresent));
    }

    #[test]
    fn flush_with_write_cache() {
        let (bench, controller) = attached(SimConfig {
            volatile_write_cache: true,
            ..Default::default()
        });
        let ns = controller.namespace(1).unwrap();

        let result = Arc::new(Mutex::new(None));
        let done = result.clone();
        let outcome = ns
            .flush(move |flushed| *done.lock().unwrap() = Some(flushed))
            .unwrap();
        assert_eq!(outcome, FlushOutcome::Submitted);
        controller.handle_interrupt();
        assert_eq!(*result.lock().unwrap(), Some(Ok(())));
        assert_eq!(ns.flush_polled(), Ok(FlushOutcome::Submitted));
        assert_eq!(bench.device.flushes(), 2);

        ns.set_write_cache(true).unwrap();
        assert_eq!(ns.cache_status(), Ok(CacheStatus::Enabled));
        ns.set_write_cache(false).unwrap();
        assert_eq!(ns.cache_status(), Ok(CacheStatus::Disabled));
        assert!(!bench.device.write_cache_enabled());
    }

    #[test]
    fn unknown_namespace() {
        let (_bench, controller) = attached(SimConfig::default());
        assert!(matches!(
            controller.namespace(2),
            Err(NvmeError::InvalidArgument(_))
        ));
    }

    #[test]
    fn no_io_queues() {
        let bench = SimBench::new(SimConfig::default());
        let config = ControllerConfigBuilder::default()
            .io_queue_count(0)
            .build()
            .unwrap();
        let mut controller = bench.controller(config).unwrap();
        controller.attach().unwrap();
        let ns = controller.namespace(1).unwrap();
        let err = ns
            .read(LBA::new(0), 1, buffer(&bench, 512), |_| {})
            .unwrap_err();
        assert!(matches!(err.error, NvmeError::InvalidState(_)));
    }
}
