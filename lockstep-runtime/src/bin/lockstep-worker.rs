use clap::Parser;
use lockstep_api::Program;
use lockstep_runtime::distributed::worker::{run_worker, WorkerConfig};
use lockstep_runtime::load::TextLoader;
use lockstep_runtime::observability::{init_prometheus, init_tracing};
use lockstep_runtime::persist::FsPersister;
use lockstep_runtime::programs::{MaxValueProgram, TokenForwardProgram};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Parser)]
struct Args {
    #[arg(long)]
    listen: SocketAddr,

    #[arg(long)]
    master: SocketAddr,

    /// Checkpoint and result directory, shared with the master.
    #[arg(long)]
    data_dir: PathBuf,

    /// Built-in vertex program to run.
    #[arg(long, default_value = "max-value")]
    program: String,

    /// Origin vertex for the token-forward program.
    #[arg(long, default_value = "0")]
    origin: String,

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

    let program: Arc<dyn Program> = match args.program.as_str() {
        "max-value" => Arc::new(MaxValueProgram),
        "token-forward" => Arc::new(TokenForwardProgram {
            origin: args.origin,
        }),
        other => return Err(format!("unknown program: {other}").into()),
    };

    run_worker(
        WorkerConfig {
            listen_addr: args.listen,
            master_addr: args.master,
        },
        program,
        Arc::new(TextLoader),
        Arc::new(FsPersister::new(args.data_dir)),
    )
    .await?;
    Ok(())
}
