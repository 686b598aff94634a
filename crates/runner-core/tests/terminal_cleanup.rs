//! Invariant 5 (spec §8): once a task reaches a terminal status, its carry
//! entry is gone and its scratch files are gone from disk. Exercised
//! through the real state machine against a mocked control plane so the
//! `complete`/`fail` HTTP calls the processors make along the way still
//! happen.

use std::sync::Arc;

use httpmock::prelude::*;
use reqwest::Client;
use tokio_util::sync::CancellationToken;

use runner_core::backend::Backend;
use runner_core::carry::CarryStore;
use runner_core::downloader::Downloader;
use runner_core::http::ControlPlaneClient;
use runner_core::error::RunnerError;
use runner_core::model::{ConvertParams, Task, TaskStatus};
use runner_core::state_machine::{StateContext, TaskState};
use runner_core::transcoder::Transcoder;
use runner_core::workspace::TaskWorkspace;

fn task(id: &str) -> Task {
    Task {
        id: id.to_string(),
        source: "https://example.test/video.mp4".to_string(),
        status: TaskStatus::Uploading,
        priority: 0,
        convert_params: ConvertParams {
            video_codec: "h264".into(),
            audio_codec: "aac".into(),
            preset: "fast".into(),
            resolution: None,
        },
        download_info: None,
        convert_info: None,
        upload_info: Some(runner_core::model::ProgressRecord {
            target_url: Some("https://store.example.test/t1.mp4".into()),
            ..Default::default()
        }),
        result: None,
        error: None,
        video_duration_ms: None,
    }
}

fn context(base_url: String) -> StateContext {
    let client = ControlPlaneClient::new(base_url, "test-token").unwrap();
    StateContext {
        backend: Arc::new(Backend::new(client)),
        carry: Arc::new(CarryStore::new()),
        downloader: Arc::new(Downloader::new(Client::new())),
        transcoder: Arc::new(Transcoder::new("ffmpeg", "ffprobe")),
        cancel: CancellationToken::new(),
    }
}

#[tokio::test]
async fn completing_a_task_clears_its_carry_entry_and_scratch_files() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST).path("/api/runner/t1/complete");
        then.status(200).json_body(serde_json::json!({ "success": true }));
    });

    let ctx = context(server.base_url());
    let ws = TaskWorkspace::create("t1").await.unwrap();
    tokio::fs::write(ws.dir().join("source"), b"source bytes").await.unwrap();
    ctx.carry.set_downloaded("t1", ws.download_dest().display().to_string());

    let mut t = task("t1");
    TaskState::Complete.process(&mut t, &ctx).await.unwrap();

    mock.assert();
    assert_eq!(t.status, TaskStatus::Finished);
    assert!(ctx.carry.get("t1").is_none());
    assert!(!ws.dir().exists());
}

#[tokio::test]
async fn failing_a_task_clears_its_carry_entry_and_scratch_files() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST).path("/api/runner/t1/fail");
        then.status(200).json_body(serde_json::json!({ "success": true }));
    });

    let ctx = context(server.base_url());
    let ws = TaskWorkspace::create("t1").await.unwrap();
    tokio::fs::write(ws.dir().join("source"), b"source bytes").await.unwrap();
    ctx.carry.set_downloaded("t1", ws.download_dest().display().to_string());

    let mut t = task("t1");
    TaskState::Failed(RunnerError::convert("encoder exited with status 1"))
        .process(&mut t, &ctx)
        .await
        .unwrap();

    mock.assert();
    assert_eq!(t.status, TaskStatus::Failed);
    let err = t.error.expect("terminal failure must carry task.error");
    assert!(!err.message.is_empty());
    assert_eq!(err.code, runner_core::error::ErrorCode::ConvertError);
    assert!(ctx.carry.get("t1").is_none());
    assert!(!ws.dir().exists());
}
