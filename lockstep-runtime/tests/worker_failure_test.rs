use lockstep_api::Program;
use lockstep_common::config::JobConfig;
use lockstep_runtime::distributed::master::{Master, MasterConfig};
use lockstep_runtime::distributed::worker::{run_worker, WorkerConfig};
use lockstep_runtime::load::TextLoader;
use lockstep_runtime::persist::FsPersister;
use lockstep_runtime::programs::MaxValueProgram;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn free_local_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

fn spawn_worker(
    listen: SocketAddr,
    master: SocketAddr,
    program: Arc<dyn Program>,
    data_dir: &Path,
) -> tokio::task::JoinHandle<lockstep_common::error::LockstepResult<()>> {
    let persister = Arc::new(FsPersister::new(data_dir));
    tokio::spawn(run_worker(
        WorkerConfig {
            listen_addr: listen,
            master_addr: master,
        },
        program,
        Arc::new(TextLoader),
        persister,
    ))
}

fn read_results(base: &Path) -> Vec<(String, u64)> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(base.join("results")).unwrap() {
        let path = entry.unwrap().path();
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_path(&path)
            .unwrap();
        for rec in rdr.records() {
            let rec = rec.unwrap();
            out.push((
                rec.get(0).unwrap().to_string(),
                rec.get(1).unwrap().parse().unwrap(),
            ));
        }
    }
    out.sort();
    out
}

#[tokio::test]
async fn test_worker_failure_recovers_from_checkpoint() {
    let master_addr = free_local_addr();
    let data_dir = tempfile::tempdir().unwrap();

    // Long max-value chain so computation outlives the injected crash;
    // the head value must still reach every vertex.
    let chain_len: usize = 16;
    let mut graph = String::from("v00,999,v01\n");
    for i in 1..chain_len {
        let next = if i + 1 < chain_len {
            format!(",v{:02}", i + 1)
        } else {
            String::new()
        };
        graph.push_str(&format!("v{i:02},{i}{next}\n"));
    }
    let graph_dir = tempfile::tempdir().unwrap();
    let v1 = graph_dir.path().join("v.csv");
    std::fs::write(&v1, graph).unwrap();

    let w1 = spawn_worker(
        free_local_addr(),
        master_addr,
        Arc::new(MaxValueProgram),
        data_dir.path(),
    );
    let w2 = spawn_worker(
        free_local_addr(),
        master_addr,
        Arc::new(MaxValueProgram),
        data_dir.path(),
    );
    let w3 = spawn_worker(
        free_local_addr(),
        master_addr,
        Arc::new(MaxValueProgram),
        data_dir.path(),
    );

    let killer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(250)).await;
        w3.abort();
    });

    let mut job = JobConfig::new("job_crash");
    job.min_workers = 3;
    job.register_wait = Duration::from_secs(10);
    job.heartbeat_interval = Duration::from_millis(100);
    job.checkpoint_interval = 1;
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
    assert_eq!(report.num_verts, chain_len as u64);
    assert_eq!(report.active_verts, 0);

    // Same fixpoint a failure-free run reaches.
    let results = read_results(data_dir.path());
    assert_eq!(results.len(), chain_len);
    for (id, value) in results {
        assert_eq!(value, 999, "vertex {id} did not converge");
    }

    let _ = killer.await;
    w1.abort();
    w2.abort();
}
