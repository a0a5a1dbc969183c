//! Startup, signal handling and coordinated shutdown.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{ServiceConfig, SourceMode},
    job::JobValidator,
    report::DeliveryClient,
    runner::{DockerRuntime, SandboxRuntime},
    source::{self, http, poll::PollSource},
    worker::{Worker, WorkerConfig},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Running,
    ShuttingDown,
    Stopped,
}

/// Cancel `shutdown` on the first SIGINT/SIGTERM, exit with 101 on the second.
pub fn install_signal_handler(shutdown: CancellationToken) -> anyhow::Result<()> {
    let signalled = AtomicBool::new(false);
    ctrlc::set_handler(move || {
        if !signalled.swap(true, Ordering::SeqCst) {
            tracing::warn!(
                "Shutting down after the current job... Press Ctrl-C again to force quit."
            );
            shutdown.cancel();
        } else {
            tracing::error!("Force quit!");
            std::process::exit(101);
        }
    })?;
    Ok(())
}

/// Build the service against the local docker daemon and run it until it
/// stops.
pub async fn run_service(cfg: ServiceConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
    let runtime = Arc::new(DockerRuntime::connect(cfg.docker_config_dir())?);
    Service::new(&cfg, runtime, shutdown)?.start()?.wait().await
}

/// Every long-lived object of the service, built once at startup.
pub struct Service {
    mode: SourceMode,
    worker: Worker,
    validator: Arc<JobValidator>,
    queue_capacity: usize,
    poll_interval: Duration,
    max_idle_time: Option<Duration>,
    shutdown_grace: Duration,
    shutdown: CancellationToken,
}

impl Service {
    pub fn new(
        cfg: &ServiceConfig,
        runtime: Arc<dyn SandboxRuntime>,
        shutdown: CancellationToken,
    ) -> anyhow::Result<Service> {
        let mode = cfg.source_mode()?;
        let validator = Arc::new(JobValidator::new()?);
        let delivery = DeliveryClient::new()?;

        // Only a poller may kill its in-flight sandbox; queued jobs are drained.
        let abort = match mode {
            SourceMode::Poll { .. } => shutdown.clone(),
            SourceMode::Push { .. } => CancellationToken::new(),
        };
        let worker = Worker::new(
            runtime,
            delivery,
            WorkerConfig {
                volume_root: cfg.volume_root(),
                credentials: cfg.credentials(),
            },
            abort,
        );

        Ok(Service {
            mode,
            worker,
            validator,
            queue_capacity: cfg.queue_capacity,
            poll_interval: cfg.poll_interval(),
            max_idle_time: cfg.max_idle_time(),
            shutdown_grace: cfg.shutdown_grace(),
            shutdown,
        })
    }

    /// Bind the job source and spawn the worker.
    pub fn start(self) -> anyhow::Result<RunningService> {
        let (state_tx, state_rx) = watch::channel(LifecycleState::Running);
        let shutdown = self.shutdown.clone();
        let grace = self.shutdown_grace;
        let worker = self.worker;

        match self.mode {
            SourceMode::Push { listen } => {
                let (admission, mut queue) = source::bounded(self.queue_capacity, self.validator);
                let close_queue = queue.closer();
                let server = http::bind(listen, admission, shutdown.clone())?;
                let local_addr = server.local_addr;

                let worker = tokio::spawn(async move { worker.run(&mut queue).await });
                let server = tokio::spawn(server.serve);
                let task = tokio::spawn(supervise_push(
                    worker,
                    server,
                    close_queue,
                    grace,
                    shutdown,
                    state_tx,
                ));
                tracing::info!("Service running in push mode");
                Ok(RunningService {
                    local_addr: Some(local_addr),
                    state: state_rx,
                    task,
                })
            }
            SourceMode::Poll { endpoint } => {
                tracing::info!("Service running in poll mode, polling {}", endpoint);
                let mut source = PollSource::new(
                    endpoint,
                    self.validator,
                    self.poll_interval,
                    self.max_idle_time,
                    shutdown.clone(),
                )?;
                let worker = tokio::spawn(async move { worker.run(&mut source).await });
                let task = tokio::spawn(supervise_poll(worker, shutdown, state_tx));
                Ok(RunningService {
                    local_addr: None,
                    state: state_rx,
                    task,
                })
            }
        }
    }
}

/// Handle to a started [`Service`].
pub struct RunningService {
    /// Address of the admission listener, in push mode.
    pub local_addr: Option<SocketAddr>,
    state: watch::Receiver<LifecycleState>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl RunningService {
    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Wait until the service has stopped. `Err` means it did not stop
    /// cleanly.
    pub async fn wait(self) -> anyhow::Result<()> {
        self.task.await?
    }
}

async fn supervise_push(
    mut worker: JoinHandle<anyhow::Result<()>>,
    mut server: JoinHandle<hyper::Result<()>>,
    close_queue: CancellationToken,
    grace: Duration,
    shutdown: CancellationToken,
    state: watch::Sender<LifecycleState>,
) -> anyhow::Result<()> {
    let mut worker_res = None;
    let mut server_res = None;
    tokio::select! {
        _ = shutdown.cancelled() => {}
        res = &mut worker => worker_res = Some(flatten(res)),
        res = &mut server => server_res = Some(res),
    }
    let _ = state.send(LifecycleState::ShuttingDown);
    tracing::info!("Shutting down");
    shutdown.cancel();

    let server_outcome = match server_res {
        Some(res) => flatten_server(res),
        None => match tokio::time::timeout(grace, &mut server).await {
            Ok(res) => flatten_server(res),
            Err(_) => {
                server.abort();
                Err(anyhow::anyhow!(
                    "Admission listener did not shut down within {:?}",
                    grace
                ))
            }
        },
    };
    if let Err(e) = &server_outcome {
        tracing::error!("{:#}", e);
    }

    close_queue.cancel();
    let worker_outcome = match worker_res {
        Some(res) => res,
        None => {
            tracing::info!("Waiting for queued jobs to finish");
            flatten(worker.await)
        }
    };

    let _ = state.send(LifecycleState::Stopped);
    tracing::info!("Service stopped");
    worker_outcome.and(server_outcome)
}

async fn supervise_poll(
    mut worker: JoinHandle<anyhow::Result<()>>,
    shutdown: CancellationToken,
    state: watch::Sender<LifecycleState>,
) -> anyhow::Result<()> {
    let worker_res = tokio::select! {
        _ = shutdown.cancelled() => None,
        res = &mut worker => Some(flatten(res)),
    };
    let _ = state.send(LifecycleState::ShuttingDown);
    shutdown.cancel();

    let outcome = match worker_res {
        Some(res) => res,
        None => flatten(worker.await),
    };
    let _ = state.send(LifecycleState::Stopped);
    tracing::info!("Service stopped");
    outcome
}

fn flatten(res: Result<anyhow::Result<()>, tokio::task::JoinError>) -> anyhow::Result<()> {
    res.map_err(|e| anyhow::anyhow!("Worker task failed: {}", e))?
}

fn flatten_server(res: Result<hyper::Result<()>, tokio::task::JoinError>) -> anyhow::Result<()> {
    res.map_err(|e| anyhow::anyhow!("Admission listener task failed: {}", e))?
        .map_err(|e| anyhow::anyhow!("Admission listener failed: {}", e))
}
