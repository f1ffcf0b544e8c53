use lockstep_api::Program;
use lockstep_common::config::JobConfig;
use lockstep_common::error::LockstepError;
use lockstep_runtime::distributed::master::{Master, MasterConfig};
use lockstep_runtime::distributed::protocol::{request, MasterRequest, MasterResponse};
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

#[tokio::test]
async fn test_insufficient_workers_fails_the_job() {
    let master_addr = free_local_addr();
    let data_dir = tempfile::tempdir().unwrap();

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

    let mut job = JobConfig::new("job_short");
    job.min_workers = 3;
    job.register_wait = Duration::from_secs(2);

    let master = Master::new(
        MasterConfig {
            listen_addr: master_addr,
            job,
        },
        Arc::new(TextLoader),
        Arc::new(FsPersister::new(data_dir.path())),
    );

    let err = master.run().await.unwrap_err();
    assert!(matches!(
        err,
        LockstepError::InsufficientWorkers {
            registered: 2,
            required: 3
        }
    ));

    // No phases ran, so nothing was written.
    assert!(!data_dir.path().join("results").exists());

    w1.abort();
    w2.abort();
}

#[tokio::test]
async fn test_duplicate_registration_is_idempotent() {
    let master_addr = free_local_addr();
    let data_dir = tempfile::tempdir().unwrap();

    let graph_dir = tempfile::tempdir().unwrap();
    let v1 = graph_dir.path().join("v.csv");
    std::fs::write(&v1, "A,1\n").unwrap();

    let w1_addr = free_local_addr();
    let w1 = spawn_worker(
        w1_addr,
        master_addr,
        Arc::new(MaxValueProgram),
        data_dir.path(),
    );

    let mut job = JobConfig::new("job_dup");
    job.min_workers = 2;
    job.register_wait = Duration::from_secs(10);
    job.load_paths = vec![v1.to_string_lossy().to_string()];

    let master = Master::new(
        MasterConfig {
            listen_addr: master_addr,
            job,
        },
        Arc::new(TextLoader),
        Arc::new(FsPersister::new(data_dir.path())),
    );
    let handle = master.handle();
    let run = tokio::spawn(master.run());

    // Wait for the first worker to join, then register it a second time
    // by hand. The master must reply with the job id without growing the
    // pool.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(handle.worker_count().await, 1);

    let resp: MasterResponse = request(
        &master_addr.to_string(),
        &MasterRequest::Register {
            host: w1_addr.ip().to_string(),
            port: w1_addr.port(),
        },
    )
    .await
    .unwrap();
    match resp {
        MasterResponse::Registered { job_id } => assert_eq!(job_id, "job_dup"),
        other => panic!("unexpected response: {other:?}"),
    }
    assert_eq!(handle.worker_count().await, 1);

    let w2 = spawn_worker(
        free_local_addr(),
        master_addr,
        Arc::new(MaxValueProgram),
        data_dir.path(),
    );

    let report = run.await.unwrap().unwrap();
    assert_eq!(report.num_verts, 1);

    w1.abort();
    w2.abort();
}
