use lockstep_api::{Loader, Persister};
use lockstep_common::config::JobConfig;
use lockstep_common::error::{LockstepError, LockstepResult};
use lockstep_common::types::PartitionId;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use crate::distributed::ekg::FailureDetector;
use crate::distributed::phase::PhaseId;
use crate::distributed::protocol::{
    framed, recv_msg, request, send_msg, MasterRequest, MasterResponse, PhaseExec, PhaseSummary,
    TopologyInfo, WorkerRequest, WorkerResponse,
};

const REGISTER_POLL: Duration = Duration::from_millis(50);
const MAX_PHASE_ATTEMPTS: u32 = 3;

#[derive(Clone)]
pub struct MasterConfig {
    pub listen_addr: SocketAddr,
    pub job: JobConfig,
}

#[derive(Debug)]
pub(crate) enum BarrierEntry {
    Summary(PhaseSummary),
    Remove { host_port: String, reason: String },
}

#[derive(Debug)]
pub(crate) struct WorkerInfo {
    pub failed: bool,
    pub error_msg: Option<String>,
    pub last_heartbeat: Option<Instant>,
}

pub(crate) struct MasterShared {
    pub job_id: String,
    pub can_register: AtomicBool,
    pub pool: RwLock<HashMap<String, WorkerInfo>>,
    pub barrier_tx: mpsc::UnboundedSender<BarrierEntry>,
}

impl MasterShared {
    pub async fn register_worker(&self, host: String, port: u16) -> LockstepResult<String> {
        let mut pool = self.pool.write().await;
        if !self.can_register.load(Ordering::SeqCst) {
            return Err(LockstepError::RegistrationClosed);
        }
        let host_port = format!("{host}:{port}");
        if pool.contains_key(&host_port) {
            // duplicate registration is okay
            debug!(worker = %host_port, "already in the worker pool, replying with job id");
            return Ok(self.job_id.clone());
        }
        pool.insert(
            host_port.clone(),
            WorkerInfo {
                failed: false,
                error_msg: None,
                last_heartbeat: None,
            },
        );
        info!(worker = %host_port, job = %self.job_id, "registered worker");
        Ok(self.job_id.clone())
    }

    pub async fn mark_worker_failed(&self, host_port: &str, reason: &str) {
        let mut pool = self.pool.write().await;
        match pool.get_mut(host_port) {
            Some(info) if !info.failed => {
                warn!(
                    worker = %host_port,
                    reason,
                    last_heartbeat = ?info.last_heartbeat,
                    "marking worker as failed"
                );
                info.failed = true;
                info.error_msg = Some(reason.to_string());
                let _ = self.barrier_tx.send(BarrierEntry::Remove {
                    host_port: host_port.to_string(),
                    reason: reason.to_string(),
                });
            }
            Some(_) => {}
            None => {
                debug!(worker = %host_port, reason, "cannot find worker in the pool to mark as failed");
            }
        }
    }

    pub async fn record_heartbeat(&self, host_port: &str) {
        let mut pool = self.pool.write().await;
        if let Some(info) = pool.get_mut(host_port) {
            info.last_heartbeat = Some(Instant::now());
        }
    }

    pub async fn live_workers(&self) -> Vec<String> {
        let pool = self.pool.read().await;
        let mut out: Vec<String> = pool
            .iter()
            .filter(|(_, info)| !info.failed)
            .map(|(hp, _)| hp.clone())
            .collect();
        out.sort();
        out
    }

    pub async fn any_failed(&self) -> bool {
        self.pool.read().await.values().any(|info| info.failed)
    }
}

#[derive(Debug, Clone, Default)]
struct PhaseInfo {
    active_verts: u64,
    num_verts: u64,
    sent_msgs: u64,
    lost_workers: Vec<String>,
    errors: Vec<String>,
}

#[derive(Debug, Clone, Default)]
struct JobInfo {
    superstep: u64,
    last_checkpoint: u64,
    checkpointed: bool,
    total_sent_msgs: u64,
    phase_info: PhaseInfo,
}

#[derive(Debug, Clone)]
pub struct JobReport {
    pub superstep: u64,
    pub total_sent_msgs: u64,
    pub active_verts: u64,
    pub num_verts: u64,
}

/// Read-only view of the master's worker pool, usable while `run` owns
/// the master.
#[derive(Clone)]
pub struct MasterHandle {
    shared: Arc<MasterShared>,
}

impl MasterHandle {
    pub async fn worker_count(&self) -> usize {
        self.shared.pool.read().await.len()
    }

    pub async fn live_workers(&self) -> Vec<String> {
        self.shared.live_workers().await
    }
}

pub struct Master {
    config: MasterConfig,
    shared: Arc<MasterShared>,
    barrier_rx: mpsc::UnboundedReceiver<BarrierEntry>,
    partition_map: HashMap<PartitionId, String>,
    topology_dirty: bool,
    job_info: JobInfo,
    loader: Arc<dyn Loader>,
    persister: Arc<dyn Persister>,
    checkpoint_fn: Box<dyn Fn(u64) -> bool + Send + Sync>,
}

impl Master {
    pub fn new(config: MasterConfig, loader: Arc<dyn Loader>, persister: Arc<dyn Persister>) -> Self {
        let (barrier_tx, barrier_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(MasterShared {
            job_id: config.job.job_id.clone(),
            can_register: AtomicBool::new(false),
            pool: RwLock::new(HashMap::new()),
            barrier_tx,
        });
        let interval = config.job.checkpoint_interval;
        Self {
            config,
            shared,
            barrier_rx,
            partition_map: HashMap::new(),
            topology_dirty: false,
            job_info: JobInfo::default(),
            loader,
            persister,
            checkpoint_fn: Box::new(move |superstep| {
                interval != 0 && superstep % interval == interval - 1
            }),
        }
    }

    /// Replace the checkpoint policy derived from `checkpoint_interval`.
    pub fn with_checkpoint_fn(
        mut self,
        f: impl Fn(u64) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.checkpoint_fn = Box::new(f);
        self
    }

    pub fn handle(&self) -> MasterHandle {
        MasterHandle {
            shared: self.shared.clone(),
        }
    }

    pub async fn run(mut self) -> LockstepResult<JobReport> {
        let listener = TcpListener::bind(self.config.listen_addr)
            .await
            .map_err(|e| LockstepError::Internal(format!("bind master: {e}")))?;
        // Open the admission window before the first Register can arrive.
        self.shared.can_register.store(true, Ordering::SeqCst);
        let rpc = spawn_rpc_server(listener, self.shared.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ekg = FailureDetector::spawn(
            self.shared.clone(),
            self.config.job.heartbeat_interval,
            shutdown_rx,
        );

        let result = self.run_inner().await;

        let _ = shutdown_tx.send(true);
        if result.is_ok() {
            self.shutdown_workers().await;
        }
        rpc.abort();
        let _ = ekg.await;
        result
    }

    async fn run_inner(&mut self) -> LockstepResult<JobReport> {
        let workers = self.register_workers().await?;

        if self.config.job.start_step == 0 {
            self.determine_partitions(&workers);
            self.topology_dirty = true;
            self.initial_load().await?;
        } else {
            // Restart: recover the persisted partition set so partition
            // ids line up with the checkpoint files.
            let start = self.config.job.start_step;
            let persisted = self.persister.load_master(start)?;
            self.assign_persisted_partitions(&workers, &persisted);
            self.topology_dirty = true;
            self.load_from_checkpoint(start).await?;
        }

        let start_time = Instant::now();
        self.compute().await?;

        let mut attempts = 0;
        loop {
            let mut errors = self.execute_phase(PhaseId::WriteResults).await?;
            if errors.is_empty() {
                break;
            }
            attempts += 1;
            if attempts >= MAX_PHASE_ATTEMPTS {
                return Err(errors.remove(0));
            }
            self.recover_from_failure().await?;
            self.compute().await?;
        }

        info!(
            elapsed_ms = start_time.elapsed().as_millis() as u64,
            total_sent_msgs = self.job_info.total_sent_msgs,
            superstep = self.job_info.superstep,
            "job complete"
        );

        Ok(JobReport {
            superstep: self.job_info.superstep,
            total_sent_msgs: self.job_info.total_sent_msgs,
            active_verts: self.job_info.phase_info.active_verts,
            num_verts: self.job_info.phase_info.num_verts,
        })
    }

    async fn register_workers(&self) -> LockstepResult<Vec<String>> {
        info!("starting registration phase");
        let min = self.config.job.min_workers;
        let wait = self.config.job.register_wait;

        let deadline = Instant::now() + wait;
        loop {
            let n = self.shared.pool.read().await.len() as u64;
            if min > 0 && n >= min {
                break;
            }
            if Instant::now() >= deadline {
                break;
            }
            sleep(REGISTER_POLL).await;
        }
        self.shared.can_register.store(false, Ordering::SeqCst);

        let registered = self.shared.pool.read().await.len();
        if registered == 0 || ((registered as u64) < min && !wait.is_zero()) {
            return Err(LockstepError::InsufficientWorkers {
                registered,
                required: min,
            });
        }

        info!(workers = registered, "registration phase complete");
        Ok(self.shared.live_workers().await)
    }

    fn determine_partitions(&mut self, workers: &[String]) {
        self.partition_map.clear();
        let mut p: PartitionId = 0;
        for _ in 0..self.config.job.min_partitions_per_worker {
            for host_port in workers {
                self.partition_map.insert(p, host_port.clone());
                p += 1;
            }
        }
        info!(
            partitions = self.partition_map.len(),
            workers = workers.len(),
            "assigned partitions"
        );
    }

    fn assign_persisted_partitions(
        &mut self,
        workers: &[String],
        persisted: &HashMap<PartitionId, String>,
    ) {
        let mut pids: Vec<PartitionId> = persisted.keys().copied().collect();
        pids.sort_unstable();
        self.partition_map = pids
            .iter()
            .zip(workers.iter().cycle())
            .map(|(pid, hp)| (*pid, hp.clone()))
            .collect();
        info!(
            partitions = self.partition_map.len(),
            workers = workers.len(),
            "reassigned persisted partitions"
        );
    }

    async fn push_topology(&mut self) -> LockstepResult<()> {
        let workers = self.shared.live_workers().await;
        let load_assignments = self
            .loader
            .assign_load(&workers, &self.config.job.load_paths)?;
        let top = TopologyInfo {
            job_id: self.config.job.job_id.clone(),
            partition_map: self.partition_map.clone(),
            load_assignments,
        };

        debug!(workers = workers.len(), "distributing topology information");
        let mut tasks = Vec::with_capacity(workers.len());
        for host_port in workers {
            let shared = self.shared.clone();
            let top = top.clone();
            tasks.push(tokio::spawn(async move {
                match request::<_, WorkerResponse>(&host_port, &WorkerRequest::PushTopology(top))
                    .await
                {
                    Ok(WorkerResponse::Ack) => {}
                    Ok(WorkerResponse::Error { message }) => {
                        shared.mark_worker_failed(&host_port, &message).await;
                    }
                    Err(e) => {
                        shared.mark_worker_failed(&host_port, &e.to_string()).await;
                    }
                }
            }));
        }
        for task in tasks {
            let _ = task.await;
        }
        self.topology_dirty = false;
        Ok(())
    }

    /// Delete failed workers from the pool and move their partitions to
    /// survivors. Returns the purged host:ports.
    async fn purge_failed_workers(&mut self) -> LockstepResult<Vec<String>> {
        let mut pool = self.shared.pool.write().await;
        let failed: Vec<String> = pool
            .iter()
            .filter(|(_, info)| info.failed)
            .map(|(hp, _)| hp.clone())
            .collect();
        if failed.is_empty() {
            return Ok(failed);
        }
        for host_port in &failed {
            let info = pool.remove(host_port);
            info!(
                worker = %host_port,
                reason = info.and_then(|i| i.error_msg).as_deref().unwrap_or("unknown"),
                "purging failed worker"
            );
        }
        if pool.is_empty() {
            return Err(LockstepError::NoWorkersLeft);
        }
        let mut survivors: Vec<String> = pool.keys().cloned().collect();
        survivors.sort();
        drop(pool);

        for host_port in &failed {
            self.move_partitions(host_port, &survivors)?;
        }
        self.topology_dirty = true;
        Ok(failed)
    }

    /// Move every partition owned by `from` to the first surviving worker.
    fn move_partitions(&mut self, from: &str, survivors: &[String]) -> LockstepResult<()> {
        let new_owner = survivors
            .iter()
            .find(|hp| hp.as_str() != from)
            .ok_or(LockstepError::NoWorkersLeft)?
            .clone();
        for (pid, owner) in self.partition_map.iter_mut() {
            if owner == from {
                debug!(partition = *pid, from, to = %new_owner, "moving partition");
                *owner = new_owner.clone();
            }
        }
        Ok(())
    }

    async fn execute_phase(&mut self, phase: PhaseId) -> LockstepResult<Vec<LockstepError>> {
        // Repair the pool and topology until the fan-out set is stable;
        // a push failure can itself mark workers failed.
        let mut purged = Vec::new();
        loop {
            purged.extend(self.purge_failed_workers().await?);
            if self.topology_dirty {
                self.push_topology().await?;
            }
            if !self.shared.any_failed().await {
                break;
            }
        }

        // A purge reassigned partitions whose live state died with their
        // owner. Only the load phases rebuild that state from a source;
        // any other phase must fail so the caller replays the load.
        if !purged.is_empty() && !matches!(phase, PhaseId::LoadData | PhaseId::LoadPersisted) {
            return Ok(purged.into_iter().map(LockstepError::WorkerLost).collect());
        }

        let expected = self.shared.live_workers().await;
        if expected.is_empty() {
            return Err(LockstepError::NoWorkersLeft);
        }

        let exec = PhaseExec {
            phase,
            job_id: self.config.job.job_id.clone(),
            superstep: self.job_info.superstep,
            num_verts: self.job_info.phase_info.num_verts,
            checkpoint: phase == PhaseId::Superstep
                && (self.checkpoint_fn)(self.job_info.superstep),
        };

        debug!(%phase, superstep = exec.superstep, workers = expected.len(), "executing phase");
        self.send_exec_to_all(&exec, &expected);

        let mut info = PhaseInfo::default();
        self.barrier(&exec, &expected, &mut info).await?;

        let mut phase_errors: Vec<LockstepError> = info
            .lost_workers
            .iter()
            .map(|hp| LockstepError::WorkerLost(hp.clone()))
            .collect();
        phase_errors.extend(info.errors.iter().cloned().map(LockstepError::Worker));
        if !phase_errors.is_empty() {
            warn!(%phase, errors = phase_errors.len(), "phase failed, not committing");
            return Ok(phase_errors);
        }

        debug!(
            %phase,
            active_verts = info.active_verts,
            sent_msgs = info.sent_msgs,
            "phase complete"
        );
        self.commit_phase_info(info);
        Ok(Vec::new())
    }

    fn send_exec_to_all(&self, exec: &PhaseExec, expected: &[String]) {
        for host_port in expected {
            let shared = self.shared.clone();
            let exec = exec.clone();
            let host_port = host_port.clone();
            tokio::spawn(async move {
                match request::<_, WorkerResponse>(
                    &host_port,
                    &WorkerRequest::ExecutePhase(exec),
                )
                .await
                {
                    Ok(WorkerResponse::Ack) => {}
                    Ok(WorkerResponse::Error { message }) => {
                        shared.mark_worker_failed(&host_port, &message).await;
                    }
                    Err(e) => {
                        shared.mark_worker_failed(&host_port, &e.to_string()).await;
                    }
                }
            });
        }
    }

    /// Wait until every worker in the phase snapshot reports a summary or
    /// is removed as failed.
    async fn barrier(
        &mut self,
        exec: &PhaseExec,
        expected: &[String],
        info: &mut PhaseInfo,
    ) -> LockstepResult<()> {
        let mut outstanding: HashSet<String> = expected.iter().cloned().collect();
        while !outstanding.is_empty() {
            let entry = self
                .barrier_rx
                .recv()
                .await
                .ok_or_else(|| LockstepError::Internal("barrier channel closed".to_string()))?;
            match entry {
                BarrierEntry::Summary(summary) => {
                    if !outstanding.contains(&summary.worker_id) {
                        debug!(worker = %summary.worker_id, "not in the barrier map, discarding entry");
                        continue;
                    }
                    if summary.job_id != exec.job_id {
                        return Err(LockstepError::Protocol(format!(
                            "job id mismatch from {}: {} != {}",
                            summary.worker_id, summary.job_id, exec.job_id
                        )));
                    }
                    if summary.phase != exec.phase {
                        return Err(LockstepError::Protocol(format!(
                            "phase mismatch from {}: {} != {}",
                            summary.worker_id, summary.phase, exec.phase
                        )));
                    }
                    debug!(worker = %summary.worker_id, "entering the barrier");
                    info.active_verts += summary.active_verts;
                    info.num_verts += summary.num_verts;
                    info.sent_msgs += summary.sent_msgs;
                    info.errors.extend(summary.errors);
                    outstanding.remove(&summary.worker_id);
                }
                BarrierEntry::Remove { host_port, reason } => {
                    if outstanding.remove(&host_port) {
                        debug!(worker = %host_port, reason, "removing from barrier map");
                        info.lost_workers.push(host_port);
                    }
                }
            }
        }
        Ok(())
    }

    fn commit_phase_info(&mut self, info: PhaseInfo) {
        self.job_info.total_sent_msgs += info.sent_msgs;
        self.job_info.phase_info = info;
    }

    /// Run supersteps until no vertices are active and no messages are in
    /// flight, or the step cap is hit. Only committed phase info advances
    /// the decision.
    async fn compute(&mut self) -> LockstepResult<()> {
        info!(
            active_verts = self.job_info.phase_info.active_verts,
            "starting computation"
        );
        loop {
            let committed = &self.job_info.phase_info;
            if committed.active_verts == 0 && committed.sent_msgs == 0 {
                break;
            }
            let max_steps = self.config.job.max_steps;
            if max_steps > 0 && self.job_info.superstep >= max_steps {
                info!("hit max steps, breaking computation loop");
                break;
            }

            let superstep = self.job_info.superstep;
            debug!(superstep, "preparing superstep");
            let mut errors = self.execute_phase(PhaseId::StepPrepare).await?;
            if errors.is_empty() {
                debug!(superstep, "starting superstep");
                errors = self.execute_phase(PhaseId::Superstep).await?;
            }
            if !errors.is_empty() {
                self.recover_from_failure().await?;
                continue;
            }

            if (self.checkpoint_fn)(superstep) {
                // A persister failure on the master is unrecoverable.
                self.persister.persist_master(superstep, &self.partition_map)?;
                self.job_info.last_checkpoint = superstep;
                self.job_info.checkpointed = true;
                debug!(superstep, "checkpoint committed");
            }

            debug!(
                superstep,
                active_verts = self.job_info.phase_info.active_verts,
                sent_msgs = self.job_info.phase_info.sent_msgs,
                "superstep complete"
            );
            self.job_info.superstep += 1;
        }
        info!("computation complete");
        Ok(())
    }

    /// Run phases in order. `Ok(None)` when every phase committed,
    /// `Ok(Some(err))` at the first phase that did not.
    async fn try_sequence(
        &mut self,
        phases: &[PhaseId],
    ) -> LockstepResult<Option<LockstepError>> {
        for &phase in phases {
            let mut errors = self.execute_phase(phase).await?;
            if !errors.is_empty() {
                warn!(%phase, error = %errors[0], "phase failed");
                return Ok(Some(errors.remove(0)));
            }
        }
        Ok(None)
    }

    async fn initial_load(&mut self) -> LockstepResult<()> {
        let mut last = None;
        for attempt in 0..MAX_PHASE_ATTEMPTS {
            if attempt > 0 {
                warn!(attempt, "replaying initial load");
            }
            self.job_info.superstep = 0;
            match self
                .try_sequence(&[PhaseId::LoadData, PhaseId::DistributeVertices])
                .await?
            {
                None => return Ok(()),
                Some(err) => last = Some(err),
            }
        }
        Err(last.unwrap_or_else(|| LockstepError::Internal("initial load failed".to_string())))
    }

    /// Reload worker state from the checkpoint taken at `target` and
    /// resume computation at the following superstep. A failure inside
    /// the sequence restarts it whole: a half-loaded pool is not a state
    /// that later phases can repair.
    async fn load_from_checkpoint(&mut self, target: u64) -> LockstepResult<()> {
        let mut last = None;
        for attempt in 0..MAX_PHASE_ATTEMPTS {
            if attempt > 0 {
                warn!(attempt, superstep = target, "replaying checkpoint load");
            }
            self.job_info.superstep = target;
            match self
                .try_sequence(&[
                    PhaseId::LoadPersisted,
                    PhaseId::DistributeVertices,
                    PhaseId::Recover,
                ])
                .await?
            {
                None => {
                    self.job_info.last_checkpoint = target;
                    self.job_info.checkpointed = true;
                    self.job_info.superstep = target + 1;
                    return Ok(());
                }
                Some(err) => last = Some(err),
            }
        }
        Err(last.unwrap_or_else(|| LockstepError::Internal("checkpoint load failed".to_string())))
    }

    async fn recover_from_failure(&mut self) -> LockstepResult<()> {
        if self.job_info.checkpointed {
            let target = self.job_info.last_checkpoint;
            warn!(superstep = target, "recovering from last checkpoint");
            self.load_from_checkpoint(target).await
        } else {
            warn!("no checkpoint taken, replaying from initial load");
            let mut last = None;
            for attempt in 0..MAX_PHASE_ATTEMPTS {
                if attempt > 0 {
                    warn!(attempt, "replaying initial load");
                }
                self.job_info.superstep = 0;
                match self
                    .try_sequence(&[
                        PhaseId::LoadData,
                        PhaseId::DistributeVertices,
                        PhaseId::Recover,
                    ])
                    .await?
                {
                    None => return Ok(()),
                    Some(err) => last = Some(err),
                }
            }
            Err(last.unwrap_or_else(|| LockstepError::Internal("replay failed".to_string())))
        }
    }

    async fn shutdown_workers(&self) {
        let workers = self.shared.live_workers().await;
        let mut tasks = Vec::with_capacity(workers.len());
        for host_port in workers {
            tasks.push(tokio::spawn(async move {
                let _ = request::<_, WorkerResponse>(&host_port, &WorkerRequest::Shutdown).await;
            }));
        }
        for task in tasks {
            let _ = task.await;
        }
    }
}

fn spawn_rpc_server(
    listener: TcpListener,
    shared: Arc<MasterShared>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => continue,
            };
            let shared = shared.clone();
            tokio::spawn(async move {
                let _ = handle_connection(stream, shared).await;
            });
        }
    })
}

async fn handle_connection(stream: TcpStream, shared: Arc<MasterShared>) -> LockstepResult<()> {
    let mut framed = framed(stream);
    loop {
        let req: MasterRequest = recv_msg(&mut framed).await?;
        match req {
            MasterRequest::Register { host, port } => {
                let resp = match shared.register_worker(host, port).await {
                    Ok(job_id) => MasterResponse::Registered { job_id },
                    Err(e) => MasterResponse::Error {
                        message: e.to_string(),
                    },
                };
                send_msg(&mut framed, &resp).await?;
            }
            MasterRequest::EnterBarrier(summary) => {
                // Ack only; the driver validates and accounts for the
                // summary when it drains the barrier channel.
                let _ = shared.barrier_tx.send(BarrierEntry::Summary(summary));
                send_msg(&mut framed, &MasterResponse::Ack).await?;
            }
        }
    }
}
