use lockstep_api::{Context, Program};
use lockstep_common::config::JobConfig;
use lockstep_common::error::LockstepResult;
use lockstep_common::types::{Message, VertexState};
use lockstep_runtime::distributed::master::{Master, MasterConfig};
use lockstep_runtime::distributed::worker::{run_worker, WorkerConfig};
use lockstep_runtime::load::TextLoader;
use lockstep_runtime::persist::FsPersister;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

fn free_local_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// Never votes to halt and never converges.
struct NeverHaltProgram;

impl Program for NeverHaltProgram {
    fn compute(
        &self,
        _vertex: &mut VertexState,
        _messages: &[Message],
        _ctx: &mut dyn Context,
    ) -> LockstepResult<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_max_steps_cuts_off_nonterminating_compute() {
    let master_addr = free_local_addr();
    let data_dir = tempfile::tempdir().unwrap();

    let graph_dir = tempfile::tempdir().unwrap();
    let v1 = graph_dir.path().join("v.csv");
    std::fs::write(&v1, "A,1,B\nB,2,A\nC,3\n").unwrap();

    let worker = tokio::spawn(run_worker(
        WorkerConfig {
            listen_addr: free_local_addr(),
            master_addr,
        },
        Arc::new(NeverHaltProgram),
        Arc::new(TextLoader),
        Arc::new(FsPersister::new(data_dir.path())),
    ));

    let mut job = JobConfig::new("job_capped");
    job.min_workers = 1;
    job.register_wait = Duration::from_secs(10);
    job.max_steps = 5;
    job.load_paths = vec![v1.to_string_lossy().to_string()];

    let master = Master::new(
        MasterConfig {
            listen_addr: master_addr,
            job,
        },
        Arc::new(TextLoader),
        Arc::new(FsPersister::new(data_dir.path())),
    );

    let report = master.run().await.unwrap();
    assert_eq!(report.superstep, 5);
    assert_eq!(report.num_verts, 3);
    assert!(report.active_verts > 0);

    // WRITE_RESULTS still runs after the cutoff.
    let results = data_dir.path().join("results");
    assert!(results.exists());
    assert!(std::fs::read_dir(results).unwrap().count() > 0);

    worker.abort();
}
