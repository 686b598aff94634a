use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use reqwest::Client;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::error::RunnerError;
use crate::model::ProgressRecord;

const CHUNK_SIZE: u64 = 5 * 1024 * 1024;
const MAX_CHUNKS: usize = 32;
const DEFAULT_MIN_CHUNKS: usize = 1;
const MAX_IN_FLIGHT: usize = 8;
const CHUNK_RETRY_ATTEMPTS: u32 = 5;
const SPEED_WINDOW: usize = 5;

#[derive(Debug, Clone, Copy)]
struct ChunkSpec {
    index: usize,
    start: u64,
    end: u64,
}

impl ChunkSpec {
    fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Resumable chunked downloader (C4): HEADs the URL for size, splits it
/// into up to `MAX_CHUNKS` ranged fetches capped at `MAX_IN_FLIGHT`
/// in-flight, and resumes from any `.partN` siblings already on disk.
/// Grounded on `multipart_download_strategy.rs`'s piece/part-file model
/// and `alexykn-sps2`'s `net/src/download/{stream,resume,retry}.rs` for
/// the streaming-with-progress and resume-offset idiom.
pub struct Downloader {
    client: Client,
    min_chunks: usize,
}

impl Downloader {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            min_chunks: DEFAULT_MIN_CHUNKS,
        }
    }

    #[cfg(test)]
    fn with_min_chunks(client: Client, min_chunks: usize) -> Self {
        Self { client, min_chunks }
    }

    /// `download(url, destPath, onProgress) -> downloadedPath`.
    pub async fn download(
        &self,
        url: &str,
        dest_path: &Path,
        cancel: CancellationToken,
        on_progress: impl Fn(ProgressRecord) + Send + Sync + 'static,
    ) -> Result<PathBuf, RunnerError> {
        let content_length = self.head_content_length(url).await?;
        let on_progress = Arc::new(on_progress);
        let start_time = chrono::Utc::now().timestamp_millis();

        let plan = plan_chunks(content_length, self.min_chunks);
        let downloaded = Arc::new(AtomicU64::new(0));
        for chunk in &plan {
            downloaded.fetch_add(existing_part_bytes(dest_path, chunk.index), Ordering::Relaxed);
        }

        let reporter = spawn_progress_reporter(
            Arc::clone(&downloaded),
            content_length,
            start_time,
            Arc::clone(&on_progress),
        );

        let client = self.client.clone();
        let dest_path_owned = dest_path.to_path_buf();
        let results = stream::iter(plan.clone().into_iter().map(|chunk| {
            let client = client.clone();
            let dest_path = dest_path_owned.clone();
            let downloaded = Arc::clone(&downloaded);
            let cancel = cancel.clone();
            let url = url.to_string();
            async move {
                fetch_chunk_with_retry(&client, &url, &dest_path, chunk, downloaded, cancel).await
            }
        }))
        .buffer_unordered(MAX_IN_FLIGHT)
        .collect::<Vec<_>>()
        .await;

        reporter.stop().await;

        for result in results {
            result?;
        }

        let final_path = concatenate_parts(dest_path, &plan).await?;

        let final_size = tokio::fs::metadata(&final_path)
            .await
            .map_err(|e| RunnerError::download(format!("stat'ing {}: {e}", final_path.display())))?
            .len();
        if final_size != content_length {
            return Err(RunnerError::download(format!(
                "downloaded size {final_size} does not match expected {content_length}"
            )));
        }

        // Spec §4.3 step 7 / "also fire on terminal transition": the 1 Hz
        // reporter is already stopped by now, so a download that finishes
        // between ticks would otherwise never report 100%.
        on_progress(ProgressRecord {
            start_time,
            end_time: Some(chrono::Utc::now().timestamp_millis()),
            total_size: Some(content_length),
            current_size: content_length,
            progress: 100.0,
            ..Default::default()
        });

        Ok(final_path)
    }

    async fn head_content_length(&self, url: &str) -> Result<u64, RunnerError> {
        let response = self
            .client
            .head(url)
            .send()
            .await
            .map_err(|e| RunnerError::download(format!("HEAD {url} failed: {e}")))?;
        if !response.status().is_success() {
            return Err(RunnerError::download(format!(
                "HEAD {url} returned {}",
                response.status()
            )));
        }
        let length = response
            .content_length()
            .ok_or_else(|| RunnerError::download(format!("HEAD {url} did not report content-length")))?;
        if length == 0 {
            return Err(RunnerError::download(format!("HEAD {url} reported zero content-length")));
        }
        Ok(length)
    }
}

fn plan_chunks(total_size: u64, configured_min: usize) -> Vec<ChunkSpec> {
    let ideal = total_size.div_ceil(CHUNK_SIZE).max(1) as usize;
    let num_chunks = ideal.clamp(configured_min.max(1), MAX_CHUNKS);
    let base = total_size / num_chunks as u64;
    let remainder = total_size % num_chunks as u64;

    let mut chunks = Vec::with_capacity(num_chunks);
    let mut start = 0u64;
    for index in 0..num_chunks {
        let extra = if (index as u64) < remainder { 1 } else { 0 };
        let len = base + extra;
        let end = start + len - 1;
        chunks.push(ChunkSpec { index, start, end });
        start = end + 1;
    }
    chunks
}

fn part_path(dest_path: &Path, index: usize) -> PathBuf {
    dest_path.with_file_name(format!(
        "{}.part{index}",
        dest_path.file_name().and_then(|n| n.to_str()).unwrap_or("download")
    ))
}

fn existing_part_bytes(dest_path: &Path, index: usize) -> u64 {
    std::fs::metadata(part_path(dest_path, index))
        .map(|m| m.len())
        .unwrap_or(0)
}

async fn fetch_chunk_with_retry(
    client: &Client,
    url: &str,
    dest_path: &Path,
    chunk: ChunkSpec,
    downloaded: Arc<AtomicU64>,
    cancel: CancellationToken,
) -> Result<(), RunnerError> {
    let mut last_err = None;
    for attempt in 0..CHUNK_RETRY_ATTEMPTS {
        if cancel.is_cancelled() {
            return Err(RunnerError::download("download cancelled"));
        }
        match fetch_chunk_once(client, url, dest_path, chunk, Arc::clone(&downloaded), cancel.clone()).await {
            Ok(()) => return Ok(()),
            Err(err) => {
                tracing::warn!(chunk = chunk.index, attempt, error = %err, "chunk fetch failed, retrying");
                last_err = Some(err);
                let delay = Duration::from_secs(1) * 2u32.pow(attempt.min(4));
                tokio::time::sleep(delay.min(Duration::from_secs(30))).await;
            }
        }
    }
    Err(last_err.unwrap_or_else(|| RunnerError::download("chunk fetch failed with no attempts")))
}

async fn fetch_chunk_once(
    client: &Client,
    url: &str,
    dest_path: &Path,
    chunk: ChunkSpec,
    downloaded: Arc<AtomicU64>,
    cancel: CancellationToken,
) -> Result<(), RunnerError> {
    let part_path = part_path(dest_path, chunk.index);
    let already = existing_part_bytes(dest_path, chunk.index);
    if already >= chunk.len() {
        return Ok(());
    }
    let range_start = chunk.start + already;

    let response = client
        .get(url)
        .header("Range", format!("bytes={range_start}-{}", chunk.end))
        .send()
        .await
        .map_err(|e| RunnerError::download(format!("GET chunk {} failed: {e}", chunk.index)))?;

    if !response.status().is_success() {
        return Err(RunnerError::download(format!(
            "chunk {} returned {}",
            chunk.index,
            response.status()
        )));
    }

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&part_path)
        .await
        .map_err(|e| RunnerError::download(format!("opening {}: {e}", part_path.display())))?;

    let mut stream = response.bytes_stream();
    while let Some(next) = tokio::select! {
        chunk = stream.next() => chunk,
        _ = cancel.cancelled() => return Err(RunnerError::download("download cancelled")),
    } {
        let bytes: bytes::Bytes =
            next.map_err(|e| RunnerError::download(format!("reading chunk {}: {e}", chunk.index)))?;
        file.write_all(&bytes)
            .await
            .map_err(|e| RunnerError::download(format!("writing {}: {e}", part_path.display())))?;
        downloaded.fetch_add(bytes.len() as u64, Ordering::Relaxed);
    }
    file.flush().await.ok();
    Ok(())
}

async fn concatenate_parts(dest_path: &Path, plan: &[ChunkSpec]) -> Result<PathBuf, RunnerError> {
    let mut output = tokio::fs::File::create(dest_path)
        .await
        .map_err(|e| RunnerError::download(format!("creating {}: {e}", dest_path.display())))?;

    for chunk in plan {
        let part = part_path(dest_path, chunk.index);
        let bytes = tokio::fs::read(&part)
            .await
            .map_err(|e| RunnerError::download(format!("reading {}: {e}", part.display())))?;
        output
            .write_all(&bytes)
            .await
            .map_err(|e| RunnerError::download(format!("writing {}: {e}", dest_path.display())))?;
        let _ = tokio::fs::remove_file(&part).await;
    }
    output.flush().await.ok();
    Ok(dest_path.to_path_buf())
}

struct ProgressReporter {
    stop_tx: tokio::sync::watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
}

impl ProgressReporter {
    async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.handle.await;
    }
}

fn spawn_progress_reporter(
    downloaded: Arc<AtomicU64>,
    total_size: u64,
    start_time: i64,
    on_progress: Arc<impl Fn(ProgressRecord) + Send + Sync + 'static>,
) -> ProgressReporter {
    let (stop_tx, mut stop_rx) = tokio::sync::watch::channel(false);

    let handle = tokio::spawn(async move {
        let mut window: VecDeque<(Instant, u64)> = VecDeque::with_capacity(SPEED_WINDOW);
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        let mut first_tick = true;
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        break;
                    }
                    continue;
                }
            }
            let current = downloaded.load(Ordering::Relaxed);
            let now = Instant::now();
            window.push_back((now, current));
            while window.len() > SPEED_WINDOW {
                window.pop_front();
            }

            let (speed, average_speed) = speed_from_window(&window, current, start_time);
            let remaining = total_size.saturating_sub(current);
            let eta = if speed > 0.0 { remaining as f64 / speed } else { 0.0 };

            on_progress(ProgressRecord {
                start_time,
                end_time: None,
                file_size: None,
                total_size: Some(total_size),
                current_size: current,
                progress: (current as f64 / total_size as f64 * 100.0).min(100.0),
                current_speed: speed,
                average_speed,
                eta,
                ..Default::default()
            });
            first_tick = false;
        }
        let _ = first_tick;
    });

    ProgressReporter { stop_tx, handle }
}

fn speed_from_window(window: &VecDeque<(Instant, u64)>, current: u64, start_time_ms: i64) -> (f64, f64) {
    let speed = if window.len() >= 2 {
        let (oldest_at, oldest_bytes) = window.front().copied().unwrap();
        let elapsed = oldest_at.elapsed().as_secs_f64().max(0.001);
        (current.saturating_sub(oldest_bytes)) as f64 / elapsed
    } else {
        0.0
    };
    let elapsed_total = ((chrono::Utc::now().timestamp_millis() - start_time_ms).max(1)) as f64 / 1000.0;
    let average_speed = current as f64 / elapsed_total;
    (speed, average_speed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_chunks_covers_the_whole_file_with_no_gaps() {
        let plan = plan_chunks(23 * 1024 * 1024, 1);
        assert_eq!(plan.first().unwrap().start, 0);
        for window in plan.windows(2) {
            assert_eq!(window[0].end + 1, window[1].start);
        }
        assert_eq!(plan.last().unwrap().end, 23 * 1024 * 1024 - 1);
    }

    #[test]
    fn plan_chunks_is_capped_at_32() {
        let plan = plan_chunks(1024 * 1024 * 1024, 1);
        assert!(plan.len() <= MAX_CHUNKS);
    }

    #[test]
    fn plan_chunks_respects_configured_minimum() {
        let plan = plan_chunks(1024, 4);
        assert_eq!(plan.len(), 4);
    }

    #[test]
    fn tiny_file_still_yields_at_least_one_chunk() {
        let plan = plan_chunks(1, 1);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].start, 0);
        assert_eq!(plan[0].end, 0);
    }

    #[tokio::test]
    async fn concatenate_parts_joins_in_order_and_removes_parts() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        let plan = vec![
            ChunkSpec { index: 0, start: 0, end: 2 },
            ChunkSpec { index: 1, start: 3, end: 5 },
        ];
        tokio::fs::write(part_path(&dest, 0), b"abc").await.unwrap();
        tokio::fs::write(part_path(&dest, 1), b"def").await.unwrap();

        let result = concatenate_parts(&dest, &plan).await.unwrap();
        let contents = tokio::fs::read(&result).await.unwrap();
        assert_eq!(contents, b"abcdef");
        assert!(!part_path(&dest, 0).exists());
        assert!(!part_path(&dest, 1).exists());
    }

    #[test]
    fn downloader_with_min_chunks_is_constructible() {
        let _ = Downloader::with_min_chunks(Client::new(), 2);
    }

    #[tokio::test]
    async fn download_emits_a_terminal_hundred_percent_tick() {
        use httpmock::prelude::*;
        use std::sync::Mutex;

        let body = vec![7u8; 1024];
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(HEAD).path("/video.mp4");
            then.status(200).header("content-length", body.len().to_string());
        });
        server.mock(|when, then| {
            when.method(GET).path("/video.mp4");
            then.status(206).body(body.clone());
        });

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("source");
        let downloader = Downloader::new(Client::new());
        let ticks: Arc<Mutex<Vec<ProgressRecord>>> = Arc::new(Mutex::new(Vec::new()));
        let ticks_clone = Arc::clone(&ticks);

        downloader
            .download(
                &server.url("/video.mp4"),
                &dest,
                CancellationToken::new(),
                move |record| ticks_clone.lock().unwrap().push(record),
            )
            .await
            .unwrap();

        let ticks = ticks.lock().unwrap();
        let last = ticks.last().expect("download must emit at least one progress tick");
        assert_eq!(last.progress, 100.0);
        assert_eq!(last.current_size, body.len() as u64);
        assert!(last.end_time.is_some());
    }
}
