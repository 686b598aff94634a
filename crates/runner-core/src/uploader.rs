use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;

use crate::error::RunnerError;
use crate::model::ProgressRecord;

const SINGLE_SHOT_THRESHOLD: u64 = 10 * 1024 * 1024;
const PART_SIZE: u64 = 5 * 1024 * 1024;
const PRESIGN_VALIDITY: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// S3-compatible object metadata keys from spec §6: `taskId`, `timestamp`,
/// `duration`, `bitrate`, `size`, `width`, `height`.
#[derive(Debug, Clone, Default)]
pub struct UploadMetadata {
    pub task_id: String,
    pub timestamp: String,
    pub duration: String,
    pub bitrate: String,
    pub size: String,
    pub width: String,
    pub height: String,
}

impl UploadMetadata {
    fn as_map(&self) -> HashMap<String, String> {
        HashMap::from([
            ("taskId".to_string(), self.task_id.clone()),
            ("timestamp".to_string(), self.timestamp.clone()),
            ("duration".to_string(), self.duration.clone()),
            ("bitrate".to_string(), self.bitrate.clone()),
            ("size".to_string(), self.size.clone()),
            ("width".to_string(), self.width.clone()),
            ("height".to_string(), self.height.clone()),
        ])
    }
}

/// Chunked S3-compatible uploader (C6): single-shot PUT under the 10 MiB
/// threshold, multipart (5 MiB parts) above it, presigned 7-day GET URL on
/// success. Grounded on the `aws-sdk-s3`/`aws-config` dependency choice
/// used for object storage across the example pack (the teacher has no
/// object-store client of its own).
pub struct Uploader {
    client: S3Client,
    bucket: String,
}

impl Uploader {
    /// Builds a client against a MinIO-compatible endpoint: custom
    /// endpoint URL, path-style addressing, static credentials refreshed
    /// per task from the control plane's `/runner/minio` response.
    pub async fn new(endpoint: &str, access_key: &str, secret_key: &str, bucket: &str) -> Self {
        let endpoint = normalize_endpoint(endpoint);
        let credentials = aws_sdk_s3::config::Credentials::new(
            access_key,
            secret_key,
            None,
            None,
            "videoconverter-runner",
        );
        let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .endpoint_url(endpoint)
            .credentials_provider(credentials)
            .region(aws_sdk_s3::config::Region::new("us-east-1"))
            .load()
            .await;
        let s3_config = aws_sdk_s3::config::Builder::from(&config)
            .force_path_style(true)
            .build();
        Self {
            client: S3Client::from_conf(s3_config),
            bucket: bucket.to_string(),
        }
    }

    /// `upload(localPath, objectKey, metadata, onProgress) -> uploadInfo`.
    pub async fn upload(
        &self,
        local_path: &Path,
        object_key: &str,
        metadata: &UploadMetadata,
        on_progress: impl Fn(ProgressRecord) + Send + Sync,
    ) -> Result<String, RunnerError> {
        let file_meta = tokio::fs::metadata(local_path)
            .await
            .map_err(|e| RunnerError::upload(format!("stat'ing {}: {e}", local_path.display())))?;
        if file_meta.len() == 0 {
            return Err(RunnerError::upload("local file is empty"));
        }
        let local_size = file_meta.len();

        let result = if local_size <= SINGLE_SHOT_THRESHOLD {
            self.put_single_shot(local_path, object_key, metadata, local_size, &on_progress)
                .await
        } else {
            self.put_multipart(local_path, object_key, metadata, local_size, &on_progress)
                .await
        };

        if let Err(err) = &result {
            self.cleanup_partial(object_key).await;
            return Err(RunnerError::upload(err.to_string()));
        }

        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(object_key)
            .send()
            .await
            .map_err(|e| RunnerError::upload(format!("head_object after upload: {e}")))?;
        let remote_size = head.content_length().unwrap_or_default() as u64;
        if remote_size != local_size {
            self.cleanup_partial(object_key).await;
            return Err(RunnerError::upload(format!(
                "uploaded size {remote_size} does not match local size {local_size}"
            )));
        }

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(object_key)
            .presigned(
                PresigningConfig::expires_in(PRESIGN_VALIDITY)
                    .map_err(|e| RunnerError::upload(format!("building presign config: {e}")))?,
            )
            .await
            .map_err(|e| RunnerError::upload(format!("presigning {object_key}: {e}")))?;

        Ok(presigned.uri().to_string())
    }

    async fn put_single_shot(
        &self,
        local_path: &Path,
        object_key: &str,
        metadata: &UploadMetadata,
        local_size: u64,
        on_progress: &(impl Fn(ProgressRecord) + Send + Sync),
    ) -> Result<(), RunnerError> {
        let body = ByteStream::from_path(local_path)
            .await
            .map_err(|e| RunnerError::upload(format!("reading {}: {e}", local_path.display())))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(object_key)
            .body(body)
            .content_type("video/mp4")
            .set_metadata(Some(metadata.as_map()))
            .send()
            .await
            .map_err(|e| RunnerError::upload(format!("put_object {object_key}: {e}")))?;

        let start_time = chrono::Utc::now().timestamp_millis();
        on_progress(ProgressRecord {
            start_time,
            current_size: local_size,
            progress: 100.0,
            ..Default::default()
        });
        Ok(())
    }

    async fn put_multipart(
        &self,
        local_path: &Path,
        object_key: &str,
        metadata: &UploadMetadata,
        local_size: u64,
        on_progress: &(impl Fn(ProgressRecord) + Send + Sync),
    ) -> Result<(), RunnerError> {
        let start_time = chrono::Utc::now().timestamp_millis();
        let create = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(object_key)
            .content_type("video/mp4")
            .set_metadata(Some(metadata.as_map()))
            .send()
            .await
            .map_err(|e| RunnerError::upload(format!("create_multipart_upload: {e}")))?;
        let upload_id = create
            .upload_id()
            .ok_or_else(|| RunnerError::upload("create_multipart_upload did not return an id"))?
            .to_string();

        let abort = async {
            let _ = self
                .client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(object_key)
                .upload_id(&upload_id)
                .send()
                .await;
        };

        let mut completed_parts = Vec::new();
        let mut uploaded: u64 = 0;
        let mut last_reported_percent: i64 = -1;
        let num_parts = local_size.div_ceil(PART_SIZE);

        for part_number in 1..=num_parts {
            let offset = (part_number - 1) * PART_SIZE;
            let length = PART_SIZE.min(local_size - offset);
            let body = ByteStream::read_from()
                .path(local_path)
                .offset(offset)
                .length(aws_sdk_s3::primitives::Length::Exact(length))
                .build()
                .await
                .map_err(|e| RunnerError::upload(format!("reading part {part_number}: {e}")))?;

            let part_result = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(object_key)
                .upload_id(&upload_id)
                .part_number(part_number as i32)
                .body(body)
                .send()
                .await;

            let part_result = match part_result {
                Ok(result) => result,
                Err(err) => {
                    abort.await;
                    return Err(RunnerError::upload(format!("upload_part {part_number}: {err}")));
                }
            };

            completed_parts.push(
                aws_sdk_s3::types::CompletedPart::builder()
                    .part_number(part_number as i32)
                    .set_e_tag(part_result.e_tag().map(str::to_string))
                    .build(),
            );

            uploaded += length;
            let percent = (uploaded as f64 / local_size as f64 * 100.0) as i64;
            let is_last = part_number == num_parts;
            if percent > last_reported_percent || is_last {
                last_reported_percent = percent;
                on_progress(ProgressRecord {
                    start_time,
                    current_size: uploaded,
                    progress: percent as f64,
                    ..Default::default()
                });
            }
        }

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(object_key)
            .upload_id(&upload_id)
            .multipart_upload(
                aws_sdk_s3::types::CompletedMultipartUpload::builder()
                    .set_parts(Some(completed_parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| RunnerError::upload(format!("complete_multipart_upload: {e}")))?;

        Ok(())
    }

    /// Deletes a partially-uploaded object and any dangling multipart
    /// state. Best-effort: logged, never propagated.
    async fn cleanup_partial(&self, object_key: &str) {
        if let Err(err) = self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(object_key)
            .send()
            .await
        {
            tracing::warn!(object_key, error = %err, "failed to clean up partial upload");
        }
    }
}

fn normalize_endpoint(endpoint: &str) -> String {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else {
        format!("https://{endpoint}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_endpoint_adds_https_scheme_when_missing() {
        assert_eq!(normalize_endpoint("minio.example.test"), "https://minio.example.test");
        assert_eq!(normalize_endpoint("http://minio.local:9000"), "http://minio.local:9000");
        assert_eq!(normalize_endpoint("https://minio.local"), "https://minio.local");
    }

    #[test]
    fn upload_metadata_as_map_carries_all_seven_keys() {
        let metadata = UploadMetadata {
            task_id: "t1".into(),
            timestamp: "1700000000".into(),
            duration: "120000".into(),
            bitrate: "2500".into(),
            size: "12345".into(),
            width: "1920".into(),
            height: "1080".into(),
        };
        let map = metadata.as_map();
        assert_eq!(map.get("taskId").map(String::as_str), Some("t1"));
        assert_eq!(map.len(), 7);
    }
}
