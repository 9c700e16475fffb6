use clap::Parser;

/// Attaches the NVMe driver to an emulated controller and runs a
/// write/read/verify workload against it
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Arguments {
    /// verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    #[command(flatten)]
    pub device: DeviceArgs,

    #[command(flatten)]
    pub driver: DriverArgs,

    #[command(flatten)]
    pub workload: WorkloadArgs,
}

/// Settings of the emulated controller
#[derive(clap::Args, Debug)]
pub struct DeviceArgs {
    /// number of namespaces on the controller
    #[arg(long, default_value_t = 1)]
    pub namespaces: u32,

    /// size of every namespace in blocks
    #[arg(long, default_value_t = 8192)]
    pub blocks: u64,

    /// logical block size in bytes. Must be a power of two
    #[arg(long, default_value_t = 512)]
    pub block_size: u32,

    /// maximum data transfer size as a power of two in pages. 0 means no limit
    #[arg(long, default_value_t = 0)]
    pub mdts: u8,

    /// the controller has a volatile write cache
    #[arg(long)]
    pub vwc: bool,

    /// the controller never reports a completed shutdown
    #[arg(long)]
    pub stuck_shutdown: bool,
}

/// Settings of the driver
#[derive(clap::Args, Debug)]
pub struct DriverArgs {
    /// number of io queue pairs to request
    #[arg(long, default_value_t = 2)]
    pub io_queues: u16,

    /// entries per io queue. Clamped to the controller maximum
    #[arg(long, default_value_t = 256)]
    pub queue_entries: u32,

    /// largest transfer the host supports in bytes
    #[arg(long, default_value_t = 131072)]
    pub max_transfer: usize,
}

#[derive(clap::Args, Debug)]
pub struct WorkloadArgs {
    /// number of write requests per namespace
    #[arg(long, default_value_t = 64)]
    pub requests: u32,

    /// blocks per request
    #[arg(long, default_value_t = 8)]
    pub request_blocks: u32,
}
