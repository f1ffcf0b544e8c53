use lockstep_api::Program;
use lockstep_common::config::JobConfig;
use lockstep_runtime::distributed::master::{Master, MasterConfig};
use lockstep_runtime::distributed::worker::{run_worker, WorkerConfig};
use lockstep_runtime::load::TextLoader;
use lockstep_runtime::persist::FsPersister;
use lockstep_runtime::programs::TokenForwardProgram;
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
async fn test_token_chain_runs_to_completion() {
    let master_addr = free_local_addr();
    let data_dir = tempfile::tempdir().unwrap();

    let graph_dir = tempfile::tempdir().unwrap();
    let v1 = graph_dir.path().join("v1.csv");
    let v2 = graph_dir.path().join("v2.csv");
    std::fs::write(&v1, "A,1,B\nB,2,C\n").unwrap();
    std::fs::write(&v2, "C,3,D\nD,4\n").unwrap();

    let program = Arc::new(TokenForwardProgram {
        origin: "A".to_string(),
    });
    let w1 = spawn_worker(
        free_local_addr(),
        master_addr,
        program.clone(),
        data_dir.path(),
    );
    let w2 = spawn_worker(free_local_addr(), master_addr, program, data_dir.path());

    let mut job = JobConfig::new("job_token");
    job.min_workers = 2;
    job.min_partitions_per_worker = 2;
    job.register_wait = Duration::from_secs(10);
    job.heartbeat_interval = Duration::from_millis(500);
    job.load_paths = vec![
        v1.to_string_lossy().to_string(),
        v2.to_string_lossy().to_string(),
    ];

    let master = Master::new(
        MasterConfig {
            listen_addr: master_addr,
            job,
        },
        Arc::new(TextLoader),
        Arc::new(FsPersister::new(data_dir.path())),
    );

    let report = master.run().await.unwrap();
    assert_eq!(report.superstep, 4);
    assert_eq!(report.total_sent_msgs, 3);
    assert_eq!(report.active_verts, 0);
    assert_eq!(report.num_verts, 4);

    // Token forwarding never rewrites values.
    let results = read_results(data_dir.path());
    assert_eq!(
        results,
        vec![
            ("A".to_string(), 1),
            ("B".to_string(), 2),
            ("C".to_string(), 3),
            ("D".to_string(), 4),
        ]
    );

    w1.abort();
    w2.abort();
}
