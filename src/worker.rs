use crate::store::KeyValueStore;
use crate::{JobRecord, Queue, Result};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::{
    sync::{broadcast, Semaphore},
    task::JoinHandle,
    time::{interval, sleep, timeout, Duration},
};
use tracing::{error, info, info_span, warn, Instrument};

/// Caller-supplied job executor. Any returned error is a failure signal
/// and is routed into the retry state machine.
#[async_trait::async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, job: &JobRecord) -> anyhow::Result<()>;
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Queue name this worker drains.
    pub kind: String,
    pub max_concurrent: usize,
    /// Sleep between polls when the queue is empty.
    pub poll_interval: Duration,
    /// Sleep when all concurrency slots are busy.
    pub busy_interval: Duration,
    /// How often to sweep expired leases. Only used when the queue was
    /// configured with a lease duration.
    pub sweep_interval: Duration,
    pub worker_id: String,
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            kind: "default".to_string(),
            max_concurrent: 1,
            poll_interval: Duration::from_millis(1_000),
            busy_interval: Duration::from_millis(100),
            sweep_interval: Duration::from_secs(30),
            worker_id: format!("worker-{}", uuid::Uuid::new_v4()),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Fluent construction for [`Worker`].
pub struct WorkerBuilder<S> {
    config: WorkerConfig,
    queue: Arc<Queue<S>>,
    handler: Arc<dyn Handler>,
}

impl<S: KeyValueStore> WorkerBuilder<S> {
    pub fn new(queue: Arc<Queue<S>>, kind: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        Self {
            config: WorkerConfig {
                kind: kind.into(),
                ..WorkerConfig::default()
            },
            queue,
            handler,
        }
    }

    pub fn max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.config.max_concurrent = max_concurrent;
        self
    }

    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.config.poll_interval = poll_interval;
        self
    }

    pub fn shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.config.shutdown_timeout = shutdown_timeout;
        self
    }

    pub fn worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.config.worker_id = worker_id.into();
        self
    }

    pub fn sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.config.sweep_interval = sweep_interval;
        self
    }

    pub fn build(self) -> Worker<S> {
        let (shutdown_tx, _) = broadcast::channel(1);
        Worker {
            semaphore: Arc::new(Semaphore::new(self.config.max_concurrent)),
            config: self.config,
            queue: self.queue,
            handler: self.handler,
            handles: Vec::new(),
            shutdown_tx,
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Stops a [`Worker`] from outside the task that is running it.
#[derive(Clone)]
pub struct StopHandle {
    shutdown_tx: broadcast::Sender<()>,
    stopping: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
    }
}

/// Polling worker that drains one named queue.
///
/// A handler error never crashes the loop; it is caught and reported via
/// [`Queue::fail`]. A store error during polling is logged and retried
/// after the poll interval. The loop stops only on [`Worker::stop`] or a
/// termination signal.
pub struct Worker<S> {
    config: WorkerConfig,
    queue: Arc<Queue<S>>,
    handler: Arc<dyn Handler>,
    semaphore: Arc<Semaphore>,
    handles: Vec<JoinHandle<()>>,
    shutdown_tx: broadcast::Sender<()>,
    stopping: Arc<AtomicBool>,
}

impl<S: KeyValueStore> Worker<S> {
    /// Run until a shutdown signal arrives, then drain active jobs.
    pub async fn start(&mut self) -> Result<()> {
        info!(
            worker_id = %self.config.worker_id,
            kind = %self.config.kind,
            max_concurrent = self.config.max_concurrent,
            "worker starting"
        );

        // subscribe before spawning anything so a concurrent stop() cannot
        // slip between setup and the wait below
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        self.setup_signal_handlers();

        let poll_handle = self.spawn_poll_loop();
        self.handles.push(poll_handle);

        if self.queue.config().lease.is_some() {
            let sweep_handle = self.spawn_lease_sweeper();
            self.handles.push(sweep_handle);
        }

        // a stop() issued before start() had any receiver only left the
        // stopping flag behind
        if !self.stopping.load(Ordering::SeqCst) {
            shutdown_rx.recv().await.ok();
        }

        self.graceful_shutdown().await;
        Ok(())
    }

    /// Process at most one job, then return whether one was processed.
    /// Suits single-shot invocations that cannot host a resident loop.
    pub async fn run_once(&self) -> Result<bool> {
        match self.queue.dequeue(&self.config.kind).await? {
            Some(job) => {
                Self::execute_job(&self.queue, &self.handler, job).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Request a graceful stop. Safe to call before [`Worker::start`]: the
    /// worker then shuts down as soon as it is started.
    pub fn stop(&self) {
        info!(worker_id = %self.config.worker_id, "stop requested");
        self.stopping.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
    }

    /// Handle that can stop this worker from another task.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            shutdown_tx: self.shutdown_tx.clone(),
            stopping: Arc::clone(&self.stopping),
        }
    }

    fn setup_signal_handlers(&self) {
        let shutdown_tx = self.shutdown_tx.clone();
        let worker_id = self.config.worker_id.clone();

        tokio::spawn(async move {
            Self::wait_for_shutdown_signal().await;
            info!(worker_id = %worker_id, "shutdown signal received");
            let _ = shutdown_tx.send(());
        });
    }

    async fn wait_for_shutdown_signal() {
        use tokio::signal;

        #[cfg(unix)]
        {
            use signal::unix::{signal, SignalKind};

            let mut sigterm =
                signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

            tokio::select! {
                _ = sigterm.recv() => info!("SIGTERM received"),
                _ = signal::ctrl_c() => info!("SIGINT received"),
            }
        }

        #[cfg(not(unix))]
        {
            signal::ctrl_c()
                .await
                .expect("failed to install CTRL+C handler");
            info!("CTRL+C received");
        }
    }

    async fn graceful_shutdown(&mut self) {
        self.stopping.store(true, Ordering::SeqCst);

        for handle in self.handles.drain(..) {
            handle.abort();
        }

        let active = self.config.max_concurrent - self.semaphore.available_permits();
        if active > 0 {
            info!(active, "waiting for active jobs to settle");
            match timeout(self.config.shutdown_timeout, self.wait_for_jobs()).await {
                Ok(()) => info!("all active jobs settled"),
                Err(_) => {
                    let remaining =
                        self.config.max_concurrent - self.semaphore.available_permits();
                    warn!(remaining, "shutdown timeout reached with jobs still running");
                }
            }
        }

        info!(worker_id = %self.config.worker_id, "worker stopped");
    }

    async fn wait_for_jobs(&self) {
        // all permits available means no job task is holding one
        if let Ok(permits) = self
            .semaphore
            .clone()
            .acquire_many_owned(self.config.max_concurrent as u32)
            .await
        {
            drop(permits);
        }
    }

    fn spawn_poll_loop(&self) -> JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let handler = Arc::clone(&self.handler);
        let semaphore = Arc::clone(&self.semaphore);
        let stopping = Arc::clone(&self.stopping);
        let kind = self.config.kind.clone();
        let poll_interval = self.config.poll_interval;
        let busy_interval = self.config.busy_interval;

        tokio::spawn(async move {
            loop {
                if stopping.load(Ordering::SeqCst) {
                    break;
                }

                if semaphore.available_permits() == 0 {
                    sleep(busy_interval).await;
                    continue;
                }

                match queue.dequeue(&kind).await {
                    Ok(Some(job)) => {
                        let permit = match semaphore.clone().acquire_owned().await {
                            Ok(permit) => permit,
                            Err(_) => break, // semaphore closed, shutting down
                        };

                        let task_queue = Arc::clone(&queue);
                        let task_handler = Arc::clone(&handler);
                        tokio::spawn(async move {
                            let _permit = permit;
                            Self::execute_job(&task_queue, &task_handler, job).await;
                        });
                    }
                    Ok(None) => sleep(poll_interval).await,
                    Err(e) => {
                        error!(kind = %kind, error = %e, "dequeue failed");
                        sleep(poll_interval).await;
                    }
                }
            }

            info!(kind = %kind, "poll loop terminated");
        })
    }

    fn spawn_lease_sweeper(&self) -> JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let stopping = Arc::clone(&self.stopping);
        let kind = self.config.kind.clone();
        let sweep_interval = self.config.sweep_interval;

        tokio::spawn(async move {
            let mut ticker = interval(sweep_interval);
            loop {
                if stopping.load(Ordering::SeqCst) {
                    break;
                }
                ticker.tick().await;

                match queue.requeue_expired(&kind).await {
                    Ok(0) => {}
                    Ok(swept) => info!(kind = %kind, swept, "requeued jobs with expired leases"),
                    Err(e) => error!(kind = %kind, error = %e, "lease sweep failed"),
                }
            }
        })
    }

    async fn execute_job(queue: &Queue<S>, handler: &Arc<dyn Handler>, job: JobRecord) {
        let span = info_span!(
            "job_execution",
            job_id = %job.id,
            kind = %job.kind,
            attempt = job.attempts,
        );
        let job_id = job.id.clone();

        // run the handler in its own task so a panic is contained and
        // still counts as a failed attempt
        let task_handler = Arc::clone(handler);
        let result =
            tokio::spawn(async move { task_handler.handle(&job).await }.instrument(span)).await;

        let outcome = match result {
            Ok(Ok(())) => queue.complete(&job_id).await,
            Ok(Err(e)) => queue.fail(&job_id, &format!("{e:#}")).await.map(|_| ()),
            Err(join_err) => queue
                .fail(&job_id, &format!("handler panicked: {join_err}"))
                .await
                .map(|_| ()),
        };

        if let Err(e) = outcome {
            // the record transition failed; the lease sweep (when enabled)
            // will recover the job
            error!(job_id = %job_id, error = %e, "failed to record job outcome");
        }
    }
}
