//! Write, read back and verify every namespace of a controller

use std::{collections::VecDeque, sync::Arc, time::Duration};

use anyhow::{bail, ensure, Context, Result};
use log::{debug, info};
use nvme::{
    io_commands::LBA, sim::SimBench, CacheStatus, Controller, DmaAllocator, DmaBuffer,
    FlushOutcome, IoCompletion, Namespace, NvmeError, Resource,
};
use tokio::{
    sync::oneshot::{self, error::TryRecvError, Receiver},
    time,
};

use crate::args::WorkloadArgs;

const IO_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn run(bench: &SimBench, controller: &Controller, args: &WorkloadArgs) -> Result<()> {
    ensure!(args.request_blocks > 0, "requests need at least 1 block");
    let allocator: Arc<dyn DmaAllocator> = bench.memory.clone();

    for info in controller.namespaces() {
        let ns = controller.namespace(info.id)?;
        let blocks = args.request_blocks as u64;
        let slots = info.blocks / blocks;
        ensure!(slots > 0, "namespace {} is too small for a request", info.id);
        let length = (args.request_blocks as usize) << info.block_shift;

        let mut writes = VecDeque::new();
        for request in 0..args.requests {
            let lba = LBA::new(request as u64 % slots * blocks);
            let buffer = DmaBuffer::allocate(&allocator, length, controller.page_size())?;
            buffer.write_bytes(0, &pattern(info.id, lba, length))?;
            let write = submit(&ns, lba, args.request_blocks, buffer, true, &mut writes).await?;
            writes.push_back((lba, write));
        }
        for (_, write) in writes {
            wait(write).await?;
        }
        flush(&ns).await?;

        let mut reads = VecDeque::new();
        let mut verified = 0;
        // only the last write to each slot is visible
        let first = args.requests.saturating_sub(slots as u32);
        for request in first..args.requests {
            let lba = LBA::new(request as u64 % slots * blocks);
            let buffer = DmaBuffer::allocate(&allocator, length, controller.page_size())?;
            let read = submit(&ns, lba, args.request_blocks, buffer, false, &mut reads).await?;
            reads.push_back((lba, read));
            verified += verify_done(&mut reads, info.id, length)?;
        }
        for (lba, read) in reads {
            verify(info.id, lba, length, wait(read).await?)?;
            verified += 1;
        }
        debug!("namespace {}: {verified} reads verified", info.id);

        info!(
            "namespace {}: {} writes of {:#x} bytes verified",
            info.id, args.requests, length
        );
    }
    Ok(())
}

fn pattern(nsid: u32, lba: LBA, length: usize) -> Vec<u8> {
    let seed = lba.value() as usize ^ (nsid as usize) << 24;
    (0..length)
        .map(|index| (seed.wrapping_add(index) % 251) as u8)
        .collect()
}

type Pending = VecDeque<(LBA, Receiver<IoCompletion<DmaBuffer>>)>;

fn verify(nsid: u32, lba: LBA, length: usize, buffer: DmaBuffer) -> Result<()> {
    if buffer.to_vec() != pattern(nsid, lba, length) {
        bail!("data mismatch in namespace {nsid} at lba {lba:?}");
    }
    Ok(())
}

/// Verifies the reads that already completed, in submission order
fn verify_done(reads: &mut Pending, nsid: u32, length: usize) -> Result<usize> {
    let mut verified = 0;
    while let Some((lba, read)) = reads.front_mut() {
        let lba = *lba;
        let completion = match read.try_recv() {
            Ok(completion) => completion,
            Err(TryRecvError::Empty) => break,
            Err(TryRecvError::Closed) => bail!("io request dropped without completion"),
        };
        reads.pop_front();
        completion.result.context("read failed")?;
        verify(nsid, lba, length, completion.buffer)?;
        verified += 1;
    }
    Ok(verified)
}

/// Submits a read or write.
///
/// Waits for the oldest request in `pending` whenever the queues are full.
async fn submit(
    ns: &Namespace<'_>,
    lba: LBA,
    count: u32,
    mut buffer: DmaBuffer,
    write: bool,
    pending: &mut Pending,
) -> Result<Receiver<IoCompletion<DmaBuffer>>> {
    loop {
        let (sender, receiver) = oneshot::channel();
        let done = move |completion: IoCompletion<DmaBuffer>| {
            // the receiver is only gone if the workload already failed
            let _ = sender.send(completion);
        };
        let submitted = if write {
            ns.write(lba, count, buffer, done)
        } else {
            ns.read(lba, count, buffer, done)
        };
        match submitted {
            Ok(()) => return Ok(receiver),
            Err(err) if err.error == NvmeError::OutOfResources(Resource::CommandContexts) => {
                let Some((oldest_lba, oldest)) = pending.pop_front() else {
                    bail!("no command context available for {lba:?}");
                };
                let completed = wait(oldest).await?;
                if !write {
                    let length = (count as usize) << ns.info().block_shift;
                    verify(ns.id(), oldest_lba, length, completed)?;
                }
                buffer = err.buffer;
            }
            Err(err) => bail!("failed to submit {lba:?}: {}", err.error),
        }
    }
}

async fn wait(receiver: Receiver<IoCompletion<DmaBuffer>>) -> Result<DmaBuffer> {
    let completion = time::timeout(IO_TIMEOUT, receiver)
        .await
        .context("io request timed out")?
        .context("io request dropped without completion")?;
    completion.result.with_context(|| {
        format!(
            "io request failed with {:#x} bytes not transferred",
            completion.residual
        )
    })?;
    Ok(completion.buffer)
}

async fn flush(ns: &Namespace<'_>) -> Result<()> {
    let (sender, receiver) = oneshot::channel();
    let outcome = ns.flush(move |result| {
        let _ = sender.send(result);
    })?;
    if outcome == FlushOutcome::Submitted {
        time::timeout(IO_TIMEOUT, receiver)
            .await
            .context("flush timed out")?
            .context("flush dropped without completion")??;
    }
    let cache = ns.cache_status()?;
    debug!("namespace {}: flush {outcome:?}, write cache {cache:?}", ns.id());
    if cache == CacheStatus::Disabled {
        ns.set_write_cache(true)?;
    }
    Ok(())
}
