//! The execution worker: one job at a time, from source to delivery.

use std::{
    any::Any,
    collections::BTreeMap,
    io,
    panic::AssertUnwindSafe,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use bollard::auth::DockerCredentials;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use crate::{
    err::JobExecErr,
    job::Job,
    report::{DeliveryClient, ResultCollector, ResultEnvelope},
    runner::{
        model::{MountPaths, SandboxConfig, Volume},
        volume::HostVolume,
        SandboxRuntime,
    },
    source::JobSource,
    util::short_id,
};

/// Permissions of the directory holding the submitted files.
pub const SUBMISSION_DIR_MODE: u32 = 0o755;
/// Permissions of the directory the grader writes into. The grader may run as
/// any user.
pub const OUTPUT_DIR_MODE: u32 = 0o777;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Parent directory of every job's volumes.
    pub volume_root: PathBuf,
    /// Credentials used for every image pull.
    pub credentials: Option<DockerCredentials>,
}

/// The host directories belonging to one job.
///
/// Release order is always submission first, then output. Dropping the
/// workspace removes whatever is left in the same order.
#[derive(Debug)]
pub struct JobWorkspace {
    submission: Option<HostVolume>,
    output: Option<HostVolume>,
}

impl JobWorkspace {
    pub async fn provision(volume_root: &Path) -> io::Result<JobWorkspace> {
        let output = HostVolume::create(volume_root, OUTPUT_DIR_MODE).await?;
        let submission = HostVolume::create(volume_root, SUBMISSION_DIR_MODE).await?;
        Ok(JobWorkspace {
            submission: Some(submission),
            output: Some(output),
        })
    }

    pub async fn write_submission(&self, files: &BTreeMap<String, String>) -> io::Result<()> {
        match &self.submission {
            Some(vol) => vol.write_files(files).await,
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                "submission volume already released",
            )),
        }
    }

    /// Bind both volumes at the paths the image asked for.
    pub fn volumes(&self, paths: &MountPaths) -> Vec<Volume> {
        let mut volumes = vec![];
        if let Some(out) = &self.output {
            volumes.push(Volume {
                host_path: out.path().to_owned(),
                guest_path: paths.output.clone(),
                read_only: false,
            });
        }
        if let Some(sub) = &self.submission {
            volumes.push(Volume {
                host_path: sub.path().to_owned(),
                guest_path: paths.submission.clone(),
                read_only: true,
            });
        }
        volumes
    }

    pub fn output_dir(&self) -> Option<&Path> {
        self.output.as_ref().map(HostVolume::path)
    }

    pub async fn release_submission(&mut self) {
        if let Some(mut vol) = self.submission.take() {
            if let Err(e) = vol.teardown().await {
                tracing::error!("Failed to remove submission volume: {}", e);
            }
        }
    }

    pub async fn release_output(&mut self) {
        if let Some(mut vol) = self.output.take() {
            if let Err(e) = vol.teardown().await {
                tracing::error!("Failed to remove output volume: {}", e);
            }
        }
    }

    pub async fn teardown(mut self) {
        self.release_submission().await;
        self.release_output().await;
    }
}

pub struct Worker {
    runtime: Arc<dyn SandboxRuntime>,
    collector: ResultCollector,
    delivery: DeliveryClient,
    cfg: WorkerConfig,
    /// Kills the in-flight sandbox when cancelled.
    abort: CancellationToken,
}

impl Worker {
    pub fn new(
        runtime: Arc<dyn SandboxRuntime>,
        delivery: DeliveryClient,
        cfg: WorkerConfig,
        abort: CancellationToken,
    ) -> Worker {
        Worker {
            runtime,
            collector: ResultCollector::new(),
            delivery,
            cfg,
            abort,
        }
    }

    /// Process jobs from `source` until it runs dry.
    ///
    /// Returns `Err` only for faults that cannot be reported as a job result.
    pub async fn run(&self, source: &mut dyn JobSource) -> anyhow::Result<()> {
        tracing::info!("Worker started, sandbox runtime: {}", self.runtime.name());
        while let Some(job) = source.next_job().await {
            let job_id = short_id();
            let meta = job.meta_str().to_owned();
            let span = tracing::info_span!("handle_job", %job_id, image = %job.docker_image);

            let res = AssertUnwindSafe(self.handle_job(job).instrument(span))
                .catch_unwind()
                .await;
            match res {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!("{}: fatal error, metadata {}: {:?}", job_id, meta, e);
                    return Err(e);
                }
                Err(panic) => {
                    let msg = panic_message(&*panic);
                    tracing::error!("{}: job processing panicked, metadata {}: {}", job_id, meta, msg);
                    return Err(anyhow::anyhow!("Job processing panicked: {}", msg));
                }
            }
        }
        tracing::info!("Job source exhausted, worker stopping");
        Ok(())
    }

    /// Run one job and deliver its result.
    pub async fn handle_job(&self, job: Job) -> anyhow::Result<()> {
        tracing::info!("Starting job, metadata {}", job.meta_str());

        let mut builder = SandboxConfig::builder();
        builder
            .image(job.docker_image.clone())
            .timeout(Duration::from_secs(job.max_run_time.into()))
            .memory(job.memory_bytes());
        if let Some(credentials) = &self.cfg.credentials {
            builder.credentials(credentials.clone());
        }
        let mut sandbox = builder
            .build()
            .map_err(|e| anyhow::anyhow!("Cannot build sandbox config: {}", e))?;

        if let Err(e) = self.runtime.pull_image(&sandbox).await {
            tracing::warn!("Cannot pull image {}: {:#}", job.docker_image, e);
        }

        let mut workspace = None;
        let outcome = match self.runtime.mount_paths(&job.docker_image).await {
            Ok(paths) => {
                tracing::debug!(?paths, "Discovered mount paths");
                let ws = workspace.insert(
                    JobWorkspace::provision(&self.cfg.volume_root)
                        .await
                        .map_err(|e| anyhow::anyhow!("Cannot create job volumes: {}", e))?,
                );
                match ws.write_submission(&job.files).await {
                    Ok(()) => {
                        sandbox.volumes = ws.volumes(&paths);
                        self.runtime.execute(&sandbox, &self.abort).await
                    }
                    Err(e) => Err(JobExecErr::VolumeWrite(e)),
                }
            }
            Err(e) => Err(e),
        };

        match &outcome {
            Ok(_) => tracing::info!("Sandbox finished"),
            Err(e) => tracing::warn!("Job failed: {}", e),
        }

        let mut envelope = ResultEnvelope::new(job.meta_data.clone());
        envelope.record_run(&outcome);

        if let Some(mut ws) = workspace {
            ws.release_submission().await;
            if let Some(out) = ws.output_dir() {
                self.collector.collect(&mut envelope, &job, out).await;
            }
            ws.teardown().await;
        }

        match self.delivery.deliver(&job.return_url, &envelope).await {
            Ok(()) => tracing::info!("Result delivered to {}", job.return_url),
            Err(e) => tracing::error!("Cannot deliver result to {}: {}", job.return_url, e),
        }
        Ok(())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".into()
    }
}
