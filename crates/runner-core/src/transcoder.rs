use std::path::Path;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::error::RunnerError;
use crate::model::{ConvertParams, ProgressRecord};

const DEFAULT_MAX_FILE_SIZE: u64 = 3_800 * 1024 * 1024; // 3.8 GiB
const AUDIO_BITRATE_KBPS: u64 = 192;
const AUDIO_OUTPUT_BITRATE_KBPS: u64 = 128;
const MAX_VIDEO_BITRATE_KBPS: u64 = 20_000;
const MIN_VIDEO_BITRATE_KBPS: u64 = 100;

#[derive(Debug, Clone, Copy)]
pub struct TranscodeOutcome {
    pub duration_ms: u64,
    pub bitrate_kbps: u64,
}

/// Solves the target video bitrate for a duration and size ceiling (spec
/// §4.4 step 2).
fn solve_video_bitrate_kbps(duration_secs: f64, max_file_size: u64) -> u64 {
    if duration_secs <= 0.0 {
        return MIN_VIDEO_BITRATE_KBPS;
    }
    let total_kbps = (max_file_size as f64 * 8.0 / 1000.0 / duration_secs).floor() as u64;
    total_kbps
        .saturating_sub(AUDIO_BITRATE_KBPS)
        .min(MAX_VIDEO_BITRATE_KBPS)
        .max(MIN_VIDEO_BITRATE_KBPS)
}

/// Subprocess-driven transcoder (C5): probes input duration, solves a
/// target bitrate, launches the encoder binary with a variable-bitrate
/// scheme, and parses its stderr progress stream. Grounded on
/// `conversion/parallel.rs`'s spawn/stderr-tail/exit-code idiom and
/// `job_runner_process.rs`'s staged prepare/execute split.
pub struct Transcoder {
    encoder_binary: String,
    probe_binary: String,
    max_file_size: u64,
}

impl Transcoder {
    pub fn new(encoder_binary: impl Into<String>, probe_binary: impl Into<String>) -> Self {
        Self {
            encoder_binary: encoder_binary.into(),
            probe_binary: probe_binary.into(),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }

    /// `transcode(input, output, params, onProgress) -> { duration, bitrate }`.
    pub async fn transcode(
        &self,
        input: &Path,
        output: &Path,
        params: &ConvertParams,
        cancel: CancellationToken,
        on_progress: impl Fn(ProgressRecord) + Send + Sync + 'static,
    ) -> Result<TranscodeOutcome, RunnerError> {
        let duration_secs = self.probe_duration(input).await?;
        let bitrate_kbps = solve_video_bitrate_kbps(duration_secs, self.max_file_size);

        let command_line = self.build_command_line(input, output, params, bitrate_kbps);
        let mut child = Command::new(&self.encoder_binary)
            .args(&command_line)
            .stderr(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()
            .map_err(|e| RunnerError::convert(format!("failed to spawn encoder: {e}")))?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RunnerError::convert("encoder did not expose a stderr pipe"))?;

        let mut reader = BufReader::new(stderr).lines();
        let mut tail: Vec<String> = Vec::new();
        let start_time = chrono::Utc::now().timestamp_millis();

        loop {
            tokio::select! {
                line = reader.next_line() => {
                    let Some(line) = line.map_err(|e| RunnerError::convert(format!("reading encoder stderr: {e}")))? else {
                        break;
                    };
                    if tail.len() >= 20 {
                        tail.remove(0);
                    }
                    tail.push(line.clone());
                    if let Some(progress) = parse_progress_line(&line, start_time, duration_secs, params) {
                        on_progress(progress);
                    }
                }
                _ = cancel.cancelled() => {
                    kill_and_cleanup(&mut child, output).await;
                    return Err(RunnerError::convert("transcode cancelled"));
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| RunnerError::convert(format!("waiting for encoder: {e}")))?;

        if !status.success() {
            let _ = tokio::fs::remove_file(output).await;
            let stderr_tail = tail.join("\n");
            return Err(RunnerError::convert(format!(
                "encoder exited with {status}: {stderr_tail}"
            ))
            .with_command(command_line.join(" ")));
        }

        let metadata = tokio::fs::metadata(output)
            .await
            .map_err(|e| RunnerError::convert(format!("output missing after encode: {e}")))?;
        if metadata.len() == 0 {
            return Err(RunnerError::convert("encoder produced an empty output file"));
        }

        Ok(TranscodeOutcome {
            duration_ms: (duration_secs * 1000.0) as u64,
            bitrate_kbps,
        })
    }

    async fn probe_duration(&self, input: &Path) -> Result<f64, RunnerError> {
        let output = Command::new(&self.probe_binary)
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ])
            .arg(input)
            .output()
            .await
            .map_err(|e| RunnerError::convert(format!("failed to probe duration: {e}")))?;

        if !output.status.success() {
            return Err(RunnerError::convert(format!(
                "duration probe exited with {}",
                output.status
            )));
        }

        String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse::<f64>()
            .map_err(|_| RunnerError::convert("duration probe produced no usable output"))
    }

    fn build_command_line(
        &self,
        input: &Path,
        output: &Path,
        params: &ConvertParams,
        bitrate_kbps: u64,
    ) -> Vec<String> {
        let max_bitrate = (bitrate_kbps as f64 * 1.5) as u64;
        let buffer_size = bitrate_kbps * 2;

        let mut args = vec![
            "-y".to_string(),
            "-i".to_string(),
            input.display().to_string(),
            "-c:v".to_string(),
            params.video_codec.clone(),
            "-preset".to_string(),
            params.preset.clone(),
            "-b:v".to_string(),
            format!("{bitrate_kbps}k"),
            "-maxrate".to_string(),
            format!("{max_bitrate}k"),
            "-bufsize".to_string(),
            format!("{buffer_size}k"),
        ];

        if let Some(resolution) = &params.resolution {
            args.push("-s".to_string());
            args.push(format!("{}x{}", resolution.w, resolution.h));
        }

        args.push("-c:a".to_string());
        args.push(params.audio_codec.clone());
        args.push("-b:a".to_string());
        args.push(format!("{AUDIO_OUTPUT_BITRATE_KBPS}k"));
        args.push("-movflags".to_string());
        args.push("+faststart".to_string());
        args.push(output.display().to_string());
        args
    }
}

/// Encoder progress lines look like
/// `frame=  120 fps= 30 ... bitrate=1234.5kbits/s time=00:00:04.00 ...`.
fn parse_progress_line(
    line: &str,
    start_time: i64,
    duration_secs: f64,
    params: &ConvertParams,
) -> Option<ProgressRecord> {
    if !line.contains("frame=") {
        return None;
    }
    let frame = extract_field(line, "frame=")?.parse::<u64>().ok();
    let fps = extract_field(line, "fps=")?.parse::<f64>().ok();
    let bitrate = extract_field(line, "bitrate=")
        .and_then(|v| v.trim_end_matches("kbits/s").parse::<f64>().ok());
    let elapsed_secs = extract_timemark(line)?;

    let progress = if duration_secs > 0.0 {
        (elapsed_secs / duration_secs * 100.0).clamp(0.0, 100.0)
    } else {
        0.0
    };

    Some(ProgressRecord {
        start_time,
        progress,
        current_fps: fps,
        current_frame: frame,
        current_bitrate: bitrate.map(|b| b as u64),
        preset: Some(params.preset.clone()),
        params: Some(params.clone()),
        resolution: params.resolution.clone(),
        ..Default::default()
    })
}

fn extract_field<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let idx = line.find(key)? + key.len();
    line[idx..].split_whitespace().next()
}

fn extract_timemark(line: &str) -> Option<f64> {
    let token = extract_field(line, "time=")?;
    let mut parts = token.split(':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

async fn kill_and_cleanup(child: &mut Child, output: &Path) {
    let _ = child.start_kill();
    let _ = child.wait().await;
    let _ = tokio::fs::remove_file(output).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Resolution;

    fn params() -> ConvertParams {
        ConvertParams {
            video_codec: "h264_nvenc".into(),
            audio_codec: "aac".into(),
            preset: "fast".into(),
            resolution: Some(Resolution { w: 1920, h: 1080 }),
        }
    }

    #[test]
    fn solves_bitrate_within_bounds() {
        let bitrate = solve_video_bitrate_kbps(3600.0, DEFAULT_MAX_FILE_SIZE);
        assert!(bitrate >= MIN_VIDEO_BITRATE_KBPS);
        assert!(bitrate <= MAX_VIDEO_BITRATE_KBPS);
    }

    #[test]
    fn very_long_duration_clamps_to_minimum_bitrate() {
        let bitrate = solve_video_bitrate_kbps(1_000_000.0, DEFAULT_MAX_FILE_SIZE);
        assert_eq!(bitrate, MIN_VIDEO_BITRATE_KBPS);
    }

    #[test]
    fn zero_duration_does_not_panic() {
        assert_eq!(solve_video_bitrate_kbps(0.0, DEFAULT_MAX_FILE_SIZE), MIN_VIDEO_BITRATE_KBPS);
    }

    #[test]
    fn build_command_line_includes_solved_bitrate_and_resolution() {
        let transcoder = Transcoder::new("ffmpeg", "ffprobe");
        let args = transcoder.build_command_line(
            Path::new("in.mp4"),
            Path::new("out.mp4"),
            &params(),
            2500,
        );
        assert!(args.contains(&"-b:v".to_string()));
        assert!(args.contains(&"2500k".to_string()));
        assert!(args.contains(&"1920x1080".to_string()));
    }

    #[test]
    fn parses_a_realistic_progress_line() {
        let line = "frame=  120 fps= 30 q=28.0 size=    1024kB time=00:00:04.00 bitrate=2048.0kbits/s speed=1.2x";
        let record = parse_progress_line(line, 0, 10.0, &params()).unwrap();
        assert_eq!(record.current_frame, Some(120));
        assert_eq!(record.current_fps, Some(30.0));
        assert_eq!(record.current_bitrate, Some(2048));
        assert!((record.progress - 40.0).abs() < 0.01);
    }

    #[test]
    fn non_progress_lines_are_ignored() {
        assert!(parse_progress_line("Stream mapping:", 0, 10.0, &params()).is_none());
    }
}
