use clap::Parser;
use lockstep_common::config::JobConfig;
use lockstep_runtime::distributed::master::{Master, MasterConfig};
use lockstep_runtime::load::TextLoader;
use lockstep_runtime::observability::{init_prometheus, init_tracing};
use lockstep_runtime::persist::FsPersister;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Parser)]
struct Args {
    #[arg(long)]
    listen: SocketAddr,

    #[arg(long)]
    job_id: String,

    /// Graph source files, dealt out to workers at load time.
    #[arg(long = "load-path")]
    load_paths: Vec<String>,

    /// Checkpoint and result directory, shared with the workers.
    #[arg(long)]
    data_dir: PathBuf,

    #[arg(long, default_value_t = 1)]
    min_workers: u64,

    #[arg(long, default_value_t = 30_000)]
    register_wait_ms: u64,

    #[arg(long, default_value_t = 1)]
    partitions_per_worker: u64,

    #[arg(long, default_value_t = 10_000)]
    heartbeat_ms: u64,

    /// 0 means unbounded.
    #[arg(long, default_value_t = 0)]
    max_steps: u64,

    /// Restart from the checkpoint taken at this superstep.
    #[arg(long, default_value_t = 0)]
    start_step: u64,

    /// Checkpoint every k-th superstep; 0 disables.
    #[arg(long, default_value_t = 0)]
    checkpoint_interval: u64,

    #[arg(long)]
    metrics_listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing();
    if let Some(addr) = args.metrics_listen {
        let _handle = init_prometheus(addr)?;
    }

    let mut job = JobConfig::new(args.job_id);
    job.min_workers = args.min_workers;
    job.register_wait = Duration::from_millis(args.register_wait_ms);
    job.min_partitions_per_worker = args.partitions_per_worker;
    job.heartbeat_interval = Duration::from_millis(args.heartbeat_ms);
    job.max_steps = args.max_steps;
    job.start_step = args.start_step;
    job.checkpoint_interval = args.checkpoint_interval;
    job.load_paths = args.load_paths;

    let master = Master::new(
        MasterConfig {
            listen_addr: args.listen,
            job,
        },
        Arc::new(TextLoader),
        Arc::new(FsPersister::new(args.data_dir)),
    );

    let report = master.run().await?;
    println!(
        "superstep={} total_sent_msgs={} active_verts={} num_verts={}",
        report.superstep, report.total_sent_msgs, report.active_verts, report.num_verts
    );
    Ok(())
}
