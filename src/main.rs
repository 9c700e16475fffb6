use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{bail, ensure, Context, Result};
use args::Arguments;
use clap::Parser;
use log::{debug, info, warn, LevelFilter};
use nvme::{
    sim::{SimBench, SimConfig, SimDelay, SimFaults, SimNamespaceConfig},
    Controller, ControllerConfigBuilder, ControllerState,
};
use simple_logger::SimpleLogger;
use tokio::{task::JoinHandle, time};

mod args;
mod workload;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Arguments::parse();
    let log_level = if args.verbose {
        if cfg!(debug_assertions) {
            LevelFilter::Trace
        } else {
            LevelFilter::Debug
        }
    } else {
        LevelFilter::Info
    };
    SimpleLogger::new()
        .with_level(log_level)
        .env()
        .init()
        .context("Failed to initialize logger")?;

    let device = &args.device;
    ensure!(
        device.block_size.is_power_of_two() && (512..=65536).contains(&device.block_size),
        "block size must be a power of two between 512 and 65536"
    );
    let sim_config = SimConfig {
        mdts: device.mdts,
        volatile_write_cache: device.vwc,
        namespaces: (0..device.namespaces)
            .map(|_| SimNamespaceConfig {
                blocks: device.blocks,
                block_shift: device.block_size.trailing_zeros() as u8,
            })
            .collect(),
        ..Default::default()
    };
    let bench = SimBench::with_delay(sim_config, SimDelay::sleeping());

    let config = ControllerConfigBuilder::default()
        .io_queue_count(args.driver.io_queues)
        .io_entries(args.driver.queue_entries)
        .max_transfer_size(args.driver.max_transfer)
        .build()
        .context("Invalid driver configuration")?;

    let mut controller = bench.controller(config)?;
    controller.attach().context("Failed to attach controller")?;
    if let Some(info) = controller.info() {
        info!(
            "attached {} ({} namespaces, {} io queues, max transfer {:#x})",
            info.model,
            controller.namespaces().len(),
            controller.io_queues().len(),
            info.max_transfer_size
        );
    }

    let controller = Arc::new(controller);
    let finish = Arc::new(AtomicBool::new(false));
    let interrupts = spawn_interrupt_handler(bench.clone(), controller.clone(), finish.clone());

    let result = workload::run(&bench, &controller, &args.workload).await;

    finish.store(true, Ordering::Release);
    interrupts
        .await
        .context("Interrupt handler panicked")?;

    if device.stuck_shutdown {
        bench.device.set_faults(SimFaults {
            shutdown_never_completes: true,
            ..Default::default()
        });
    }

    let Some(controller) = Arc::into_inner(controller) else {
        bail!("controller still in use after the workload finished");
    };
    shutdown(controller)?;
    debug!(
        "{} interrupts raised, {} DMA regions still allocated",
        bench.device.interrupts_raised(),
        bench.memory.live_allocations()
    );

    result
}

/// Emulates the interrupt line of the controller
fn spawn_interrupt_handler(
    bench: SimBench,
    controller: Arc<Controller>,
    finish: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while !finish.load(Ordering::Acquire) {
            if bench.device.take_interrupt() {
                controller.handle_interrupt();
            } else {
                time::sleep(Duration::from_micros(100)).await;
            }
        }
    })
}

fn shutdown(mut controller: Controller) -> Result<()> {
    if let Err(err) = controller.shutdown() {
        warn!("shutdown failed: {err}");
    }
    ensure!(
        controller.state() == ControllerState::ShutdownComplete,
        "controller not shut down: {:?}",
        controller.state()
    );
    controller.detach().context("Failed to detach controller")?;
    info!("controller detached");
    Ok(())
}
