//! Background work queued by ingestion.
//!
//! Jobs are split into lanes by kind: ticket reconciliation and metrics
//! delivery. Each lane has its own bounded channel, dispatcher and worker
//! limit, so a collector outage stuck in retry sleeps never holds a worker
//! that reconciliation needs. Submitting never waits: a full lane rejects the
//! job.
use crate::metrics_defs::{TASKS_INFLIGHT, TASKS_REJECTED};
use crate::reconcile::{ReconcileJob, Reconciler};
use crate::telemetry::MetricsEmitter;
use crate::types::ScanPayload;
use async_trait::async_trait;
use parking_lot::Mutex;
use shared::{counter, gauge};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Notify, Semaphore, mpsc};
use tokio::task::JoinHandle;

#[derive(Debug)]
pub enum Job {
    Reconcile(ReconcileJob),
    EmitMetrics(Box<ScanPayload>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Lane {
    Tickets,
    Telemetry,
}

impl Lane {
    const ALL: [Lane; 2] = [Lane::Tickets, Lane::Telemetry];

    fn as_str(&self) -> &'static str {
        match self {
            Lane::Tickets => "tickets",
            Lane::Telemetry => "telemetry",
        }
    }
}

impl Job {
    fn kind(&self) -> &'static str {
        match self {
            Job::Reconcile(_) => "reconcile",
            Job::EmitMetrics(_) => "emit_metrics",
        }
    }

    fn lane(&self) -> Lane {
        match self {
            Job::Reconcile(_) => Lane::Tickets,
            Job::EmitMetrics(_) => Lane::Telemetry,
        }
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum TaskError {
    #[error("task queue is full")]
    QueueFull,
    #[error("task queue is shut down")]
    Closed,
}

#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: Job);
}

/// Runs jobs against the reconciler and the metrics emitter.
pub struct JobRunner {
    reconciler: Arc<Reconciler>,
    emitter: Arc<MetricsEmitter>,
}

impl JobRunner {
    pub fn new(reconciler: Arc<Reconciler>, emitter: Arc<MetricsEmitter>) -> Self {
        Self {
            reconciler,
            emitter,
        }
    }
}

#[async_trait]
impl JobHandler for JobRunner {
    async fn handle(&self, job: Job) {
        match job {
            Job::Reconcile(job) => {
                // Outcome is logged by the reconciler.
                let _ = self.reconciler.run(job).await;
            }
            Job::EmitMetrics(payload) => {
                self.emitter.emit(&payload).await;
            }
        }
    }
}

#[derive(Default)]
struct Pending {
    count: AtomicUsize,
    idle: Notify,
}

impl Pending {
    fn start(&self) {
        let now = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        gauge!(TASKS_INFLIGHT).set(now as f64);
    }

    fn finish(&self) {
        let before = self.count.fetch_sub(1, Ordering::SeqCst);
        gauge!(TASKS_INFLIGHT).set((before - 1) as f64);
        if before == 1 {
            self.idle.notify_waiters();
        }
    }
}

// Marks a job finished even if its handler panics.
struct InFlight(Arc<Pending>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.finish();
    }
}

struct LaneQueue {
    lane: Lane,
    sender: Mutex<Option<mpsc::Sender<(Job, InFlight)>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl LaneQueue {
    fn start(lane: Lane, handler: Arc<dyn JobHandler>, workers: usize, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let semaphore = Arc::new(Semaphore::new(workers.max(1)));
        let dispatcher = tokio::spawn(dispatch(receiver, handler, semaphore));

        LaneQueue {
            lane,
            sender: Mutex::new(Some(sender)),
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    fn reject(&self, kind: &'static str, error: TaskError) -> Result<(), TaskError> {
        let reason = match error {
            TaskError::QueueFull => "full",
            TaskError::Closed => "closed",
        };
        counter!(TASKS_REJECTED, "lane" => self.lane.as_str(), "reason" => reason).increment(1);
        tracing::error!(kind, lane = self.lane.as_str(), error = %error, "dropping job");
        Err(error)
    }

    fn submit(&self, job: Job, pending: &Arc<Pending>) -> Result<(), TaskError> {
        let kind = job.kind();
        let Some(sender) = self.sender.lock().clone() else {
            return self.reject(kind, TaskError::Closed);
        };

        pending.start();
        match sender.try_send((job, InFlight(pending.clone()))) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => self.reject(kind, TaskError::QueueFull),
            Err(TrySendError::Closed(_)) => self.reject(kind, TaskError::Closed),
        }
    }

    async fn close(&self) {
        self.sender.lock().take();

        let dispatcher = self.dispatcher.lock().take();
        if let Some(dispatcher) = dispatcher
            && let Err(e) = dispatcher.await
        {
            tracing::error!(lane = self.lane.as_str(), error = %e, "task dispatcher failed");
        }
    }
}

pub struct TaskQueue {
    lanes: Vec<LaneQueue>,
    pending: Arc<Pending>,
}

impl TaskQueue {
    /// Starts one dispatcher per lane, each allowing `workers` jobs at a time
    /// and `capacity` waiting ones. Must be called from within a tokio runtime.
    pub fn start(handler: Arc<dyn JobHandler>, workers: usize, capacity: usize) -> Self {
        let lanes = Lane::ALL
            .iter()
            .map(|&lane| LaneQueue::start(lane, handler.clone(), workers, capacity))
            .collect();

        TaskQueue {
            lanes,
            pending: Arc::new(Pending::default()),
        }
    }

    fn lane(&self, lane: Lane) -> &LaneQueue {
        &self.lanes[lane as usize]
    }

    pub fn submit(&self, job: Job) -> Result<(), TaskError> {
        self.lane(job.lane()).submit(job, &self.pending)
    }

    /// Jobs queued or running, over all lanes.
    pub fn pending(&self) -> usize {
        self.pending.count.load(Ordering::SeqCst)
    }

    /// Resolves once every submitted job has finished.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.pending.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stops accepting jobs, then waits for the queued ones to finish.
    pub async fn shutdown(&self) {
        for lane in &self.lanes {
            lane.close().await;
        }

        self.wait_idle().await;
        tracing::info!("task queue drained");
    }
}

async fn dispatch(
    mut receiver: mpsc::Receiver<(Job, InFlight)>,
    handler: Arc<dyn JobHandler>,
    semaphore: Arc<Semaphore>,
) {
    while let Some((job, in_flight)) = receiver.recv().await {
        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            break;
        };
        let handler = handler.clone();

        tokio::spawn(async move {
            handler.handle(job).await;
            drop(permit);
            drop(in_flight);
        });
    }
}
