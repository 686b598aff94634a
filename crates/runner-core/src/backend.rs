use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::http::ControlPlaneClient;
use crate::model::{Task, TaskError};
use crate::system_probe::SystemInfo;

#[derive(Debug, Serialize)]
struct MachineInfo<'a> {
    id: &'a str,
    name: &'a str,
    #[serde(rename = "deviceInfo")]
    device_info: &'a SystemInfo,
    encoder: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct RunnerAck {
    pub runner: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct GetTaskResponse {
    task: Option<Task>,
}

#[derive(Debug, Deserialize)]
pub struct MinioCredentials {
    pub endpoint: String,
    #[serde(rename = "accessKey")]
    pub access_key: String,
    #[serde(rename = "secretKey")]
    pub secret_key: String,
    pub bucket: String,
}

#[derive(Debug, Deserialize)]
struct SuccessBody {
    success: bool,
}

/// Thin wrapper over [`ControlPlaneClient`] with one method per control-plane
/// endpoint from spec §6's table.
pub struct Backend {
    client: ControlPlaneClient,
}

impl Backend {
    pub fn new(client: ControlPlaneClient) -> Self {
        Self { client }
    }

    pub async fn online(
        &self,
        id: &str,
        name: &str,
        device_info: &SystemInfo,
        encoder: &str,
    ) -> anyhow::Result<()> {
        let body = json!({ "machine": MachineInfo { id, name, device_info, encoder } });
        let _: RunnerAck = self
            .client
            .request(Method::POST, "/runner/online", Some(&body))
            .await?;
        Ok(())
    }

    pub async fn heartbeat(&self, device_info: &SystemInfo, encoder: &str) -> anyhow::Result<()> {
        let body = json!({ "deviceInfo": device_info, "encoder": encoder });
        let _: RunnerAck = self
            .client
            .request(Method::POST, "/runner/heartbeat", Some(&body))
            .await?;
        Ok(())
    }

    pub async fn get_task(&self) -> anyhow::Result<Option<Task>> {
        match self
            .client
            .request::<(), GetTaskResponse>(Method::GET, "/runner/getTask", None)
            .await
        {
            Ok(resp) => Ok(resp.task),
            Err(err) if err.to_string().contains("404") => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Binds `task_id` to this runner. Returns `false` (without erroring)
    /// when the control plane answers with a non-success body — the losing
    /// side of a bind race (spec §8 scenario 5) rather than a transport
    /// fault, so the caller can skip the task instead of retrying it.
    pub async fn start(&self, task_id: &str) -> anyhow::Result<bool> {
        let path = format!("/runner/{task_id}/start");
        let resp: SuccessBody = self
            .client
            .request::<(), SuccessBody>(Method::POST, &path, None)
            .await?;
        Ok(resp.success)
    }

    pub async fn download_complete(
        &self,
        task_id: &str,
        downloaded_file_path: &str,
    ) -> anyhow::Result<()> {
        let path = format!("/runner/{task_id}/downloadComplete");
        let body = json!({ "downloadedFilePath": downloaded_file_path });
        let _: SuccessBody = self
            .client
            .request(Method::POST, &path, Some(&body))
            .await?;
        Ok(())
    }

    pub async fn download_progress(
        &self,
        task_id: &str,
        download_info: &crate::model::ProgressRecord,
    ) -> anyhow::Result<()> {
        self.progress_tick(task_id, "download", "downloadInfo", download_info)
            .await
    }

    pub async fn convert_progress(
        &self,
        task_id: &str,
        convert_info: &crate::model::ProgressRecord,
    ) -> anyhow::Result<()> {
        self.progress_tick(task_id, "convert", "convertInfo", convert_info)
            .await
    }

    pub async fn upload_progress(
        &self,
        task_id: &str,
        upload_info: &crate::model::ProgressRecord,
    ) -> anyhow::Result<()> {
        self.progress_tick(task_id, "upload", "uploadInfo", upload_info)
            .await
    }

    async fn progress_tick(
        &self,
        task_id: &str,
        stage_path: &str,
        field: &str,
        record: &crate::model::ProgressRecord,
    ) -> anyhow::Result<()> {
        let path = format!("/runner/{task_id}/{stage_path}");
        let body = json!({ field: record });
        let _: serde_json::Value = self
            .client
            .request(Method::POST, &path, Some(&body))
            .await?;
        Ok(())
    }

    pub async fn complete(&self, task_id: &str, path_on_store: &str) -> anyhow::Result<()> {
        let path = format!("/runner/{task_id}/complete");
        let body = json!({ "result": { "status": "success", "path": path_on_store } });
        let _: SuccessBody = self
            .client
            .request(Method::POST, &path, Some(&body))
            .await?;
        Ok(())
    }

    /// Posts the fully-formed `task.error` (spec §7: `code`, `message`, and
    /// any relevant paths), not just its message, so the control plane
    /// learns the error kind rather than an opaque string.
    pub async fn fail(&self, task_id: &str, error: &TaskError) -> anyhow::Result<()> {
        let path = format!("/runner/{task_id}/fail");
        let body = json!({ "error": error });
        let _: SuccessBody = self
            .client
            .request(Method::POST, &path, Some(&body))
            .await?;
        Ok(())
    }

    pub async fn minio_credentials(&self) -> anyhow::Result<MinioCredentials> {
        self.client
            .request::<(), MinioCredentials>(Method::GET, "/runner/minio", None)
            .await
    }
}
