use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::backend::Backend;
use crate::carry::CarryStore;
use crate::downloader::Downloader;
use crate::http::ControlPlaneClient;
use crate::model::{ConvertParams, Stage, Task, TaskStatus};
use crate::queue::TaskQueue;
use crate::state_machine::{drive, StateContext, TaskState};
use crate::system_probe;
use crate::transcoder::Transcoder;
use crate::workspace;
use runner_config::{EncoderHint, EnvConfig, IdentityStore, RunnerIdentity};

const DISPATCH_INTERVAL: Duration = Duration::from_millis(500);
const POLL_INTERVAL: Duration = Duration::from_secs(5);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

const DOWNLOAD_CAP: usize = 1;
const CONVERT_CAP: usize = 1;
const UPLOAD_CAP: usize = 1;

/// Default transcode parameters applied to tasks adapted from the
/// control plane's remote shape, which carries no codec preferences of
/// its own (spec §4.9's poll loop: "adapt the remote task shape to the
/// local shape with default convert params").
fn default_convert_params(encoder: system_probe::Encoder) -> ConvertParams {
    ConvertParams {
        video_codec: match encoder {
            system_probe::Encoder::Hardware => "h264_nvenc".to_string(),
            system_probe::Encoder::Cpu => "libx264".to_string(),
        },
        audio_codec: "aac".to_string(),
        preset: match encoder {
            system_probe::Encoder::Hardware => "p4".to_string(),
            system_probe::Encoder::Cpu => "medium".to_string(),
        },
        resolution: None,
    }
}

/// Lifecycle orchestrator (C10): register, heartbeat, poll/bind, dispatch
/// to the state machine and queue, cleanup. Grounded on the teacher's
/// `EngineRuntime`/`start_engine`/`run_engine` bootstrap (`engine.rs`):
/// build the HTTP client, probe the system once at startup, spawn the
/// independent tickers, drive everything from a `tokio::select!` loop
/// until shutdown is requested.
pub struct Runner {
    backend: Arc<Backend>,
    queue: Arc<Mutex<TaskQueue>>,
    carry: Arc<CarryStore>,
    downloader: Arc<Downloader>,
    transcoder: Arc<Transcoder>,
    cancel: CancellationToken,
    encoder: system_probe::Encoder,
}

impl Runner {
    pub async fn bootstrap(env: EnvConfig, identity_store: IdentityStore) -> anyhow::Result<Self> {
        workspace::ensure_scratch_root().await?;

        let (system_info, encoder) = system_probe::probe().await;
        let encoder = match env.encoder_hint {
            Some(EncoderHint::Cpu) => system_probe::Encoder::Cpu,
            Some(EncoderHint::Hardware) if system_info.gpu.is_some() => system_probe::Encoder::Hardware,
            _ => encoder,
        };

        let identity = identity_store.load().unwrap_or_else(|| RunnerIdentity {
            id: generate_machine_id(),
            token: env.bootstrap_token.clone(),
            name: env.hostname.clone(),
        });

        // Registration is blocking and fatal on failure (spec §4.9). A
        // stale/mismatched persisted identity surfaces here as a rejected
        // token; re-register fresh rather than loop forever on it.
        let client = ControlPlaneClient::new(env.base_url.clone(), identity.token.clone())?;
        let probe_backend = Backend::new(client);
        let (identity, backend) = match probe_backend
            .online(&identity.id, &identity.name, &system_info, &encoder.to_string())
            .await
        {
            Ok(()) => (identity, probe_backend),
            Err(_) => {
                let fresh = RunnerIdentity {
                    id: generate_machine_id(),
                    token: env.bootstrap_token.clone(),
                    name: env.hostname.clone(),
                };
                let client = ControlPlaneClient::new(env.base_url.clone(), fresh.token.clone())?;
                let backend = Backend::new(client);
                backend
                    .online(&fresh.id, &fresh.name, &system_info, &encoder.to_string())
                    .await?;
                (fresh, backend)
            }
        };
        identity_store.save(&identity)?;
        tracing::info!(machine_id = %identity.id, base_url = %env.base_url, encoder = %encoder, "registered with control plane");

        // Spec §4.9: credential fetch at startup is soft-fail; a failure here
        // just means the first upload retries it from scratch.
        if let Err(err) = backend.minio_credentials().await {
            tracing::warn!(error = %err, "could not warm object-store credentials at startup, will retry on first upload");
        }

        let backend = Arc::new(backend);

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            backend,
            queue: Arc::new(Mutex::new(TaskQueue::new(DOWNLOAD_CAP, CONVERT_CAP, UPLOAD_CAP))),
            carry: Arc::new(CarryStore::new()),
            downloader: Arc::new(Downloader::new(http)),
            transcoder: Arc::new(Transcoder::new("ffmpeg", "ffprobe")),
            cancel: CancellationToken::new(),
            encoder,
        })
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Starts the heartbeat, poll, and dispatch loops and runs until the
    /// cancellation token fires (spec §4.9 "Shutdown: stop tickers;
    /// abandon in-flight tasks; exit").
    pub async fn run(self) {
        let runner = Arc::new(self);
        let heartbeat = tokio::spawn(heartbeat_loop(Arc::clone(&runner)));
        let poll = tokio::spawn(poll_loop(Arc::clone(&runner)));
        let dispatch = tokio::spawn(dispatch_loop(Arc::clone(&runner)));

        runner.cancel.cancelled().await;
        tracing::info!("shutdown requested, abandoning in-flight tasks");

        heartbeat.abort();
        poll.abort();
        dispatch.abort();
    }

    fn state_context(&self) -> StateContext {
        StateContext {
            backend: Arc::clone(&self.backend),
            carry: Arc::clone(&self.carry),
            downloader: Arc::clone(&self.downloader),
            transcoder: Arc::clone(&self.transcoder),
            cancel: self.cancel.clone(),
        }
    }
}

async fn heartbeat_loop(runner: Arc<Runner>) {
    let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = runner.cancel.cancelled() => break,
        }
        let (system_info, _encoder) = system_probe::probe().await;
        if let Err(err) = runner
            .backend
            .heartbeat(&system_info, &runner.encoder.to_string())
            .await
        {
            tracing::warn!(error = %err, "heartbeat failed");
        }
    }
}

async fn poll_loop(runner: Arc<Runner>) {
    let mut interval = tokio::time::interval(POLL_INTERVAL);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = runner.cancel.cancelled() => break,
        }

        let has_capacity = runner.queue.lock().await.download_has_capacity();
        if !has_capacity {
            continue;
        }

        let remote_task = match runner.backend.get_task().await {
            Ok(Some(task)) => task,
            Ok(None) => continue,
            Err(err) => {
                tracing::warn!(error = %err, "getTask failed");
                continue;
            }
        };

        if remote_task.status != TaskStatus::Waiting {
            continue;
        }

        match runner.backend.start(&remote_task.id).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(task_id = %remote_task.id, "lost bind race, skipping task");
                continue;
            }
            Err(err) => {
                tracing::warn!(task_id = %remote_task.id, error = %err, "start failed");
                continue;
            }
        }

        let mut task = remote_task;
        if task.convert_params.video_codec.is_empty() {
            task.convert_params = default_convert_params(runner.encoder);
        }

        runner.carry.create(&task.id);
        runner.queue.lock().await.add(task);
    }
}

async fn dispatch_loop(runner: Arc<Runner>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(DISPATCH_INTERVAL) => {}
            _ = runner.cancel.cancelled() => break,
        }

        let next_download = runner.queue.lock().await.next_download();
        let next_convert = runner.queue.lock().await.next_convert();
        let next_upload = runner.queue.lock().await.next_upload();

        if let Some(task) = next_download {
            spawn_stage(Arc::clone(&runner), task, Stage::Download);
        }
        if let Some(task) = next_convert {
            spawn_stage(Arc::clone(&runner), task, Stage::Convert);
        }
        if let Some(task) = next_upload {
            spawn_stage(Arc::clone(&runner), task, Stage::Upload);
        }
    }
}

fn spawn_stage(runner: Arc<Runner>, mut task: Task, stage: Stage) {
    tokio::spawn(async move {
        let ctx = runner.state_context();
        let entry_state = TaskState::entry_for(stage);
        drive(entry_state, &mut task, &ctx).await;

        let mut queue = runner.queue.lock().await;
        match (stage, task.status) {
            (Stage::Download, TaskStatus::Failed) => queue.fail(&task.id, Stage::Download),
            (Stage::Convert, TaskStatus::Failed) => queue.fail(&task.id, Stage::Convert),
            (Stage::Upload, TaskStatus::Failed) => queue.fail(&task.id, Stage::Upload),
            (Stage::Download, _) => queue.complete_download(task),
            (Stage::Convert, _) => queue.complete_convert(task),
            (Stage::Upload, _) => queue.complete_upload(&task.id),
        }
    });
}

fn generate_machine_id() -> String {
    (0..16).map(|_| format!("{:02x}", rand::random::<u8>())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_convert_params_prefer_hardware_codec_when_available() {
        let params = default_convert_params(system_probe::Encoder::Hardware);
        assert_eq!(params.video_codec, "h264_nvenc");
    }

    #[test]
    fn default_convert_params_fall_back_to_software_codec() {
        let params = default_convert_params(system_probe::Encoder::Cpu);
        assert_eq!(params.video_codec, "libx264");
    }
}
