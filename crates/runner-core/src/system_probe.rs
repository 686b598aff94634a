use std::time::Duration;

use serde::{Deserialize, Serialize};
use sysinfo::{Disks, System};
use tokio::process::Command;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuInfo {
    pub brand: String,
    pub cores: usize,
    #[serde(rename = "speedMhz")]
    pub speed_mhz: u64,
    #[serde(rename = "loadPercent")]
    pub load_percent: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryInfo {
    pub total: u64,
    pub free: u64,
    pub used: u64,
    #[serde(rename = "usedPercent")]
    pub used_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskInfo {
    pub total: u64,
    pub free: u64,
    pub used: u64,
    #[serde(rename = "usedPercent")]
    pub used_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuInfo {
    pub vendor: String,
    pub model: String,
    #[serde(rename = "memoryTotal")]
    pub memory_total: u64,
    pub utilization: f32,
    pub temperature: f32,
    #[serde(rename = "driverVersion")]
    pub driver_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub cpu: CpuInfo,
    pub memory: MemoryInfo,
    pub disk: DiskInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu: Option<GpuInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoder {
    Hardware,
    Cpu,
}

impl std::fmt::Display for Encoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hardware => write!(f, "hardware"),
            Self::Cpu => write!(f, "cpu"),
        }
    }
}

const NVIDIA_SMI_TIMEOUT: Duration = Duration::from_secs(5);

/// Snapshots CPU/memory/disk and attempts NVENC-capable GPU detection.
/// Never fails: any probing trouble degrades to a CPU-only snapshot with a
/// logged warning, since a bad probe must never abort the runner.
pub async fn probe() -> (SystemInfo, Encoder) {
    let mut sys = System::new_all();
    sys.refresh_all();

    let cpu = cpu_info(&sys);
    let memory = memory_info(&sys);
    let disk = disk_info();

    let gpu = match probe_nvidia_gpu().await {
        Ok(gpu) => gpu,
        Err(err) => {
            tracing::debug!(error = %err, "no NVENC-capable GPU detected");
            None
        }
    };

    let encoder = if gpu.is_some() {
        Encoder::Hardware
    } else {
        Encoder::Cpu
    };

    (
        SystemInfo {
            cpu,
            memory,
            disk,
            gpu,
        },
        encoder,
    )
}

fn cpu_info(sys: &System) -> CpuInfo {
    let cpus = sys.cpus();
    let brand = cpus
        .first()
        .map(|c| c.brand().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let speed_mhz = cpus.first().map(|c| c.frequency()).unwrap_or_default();
    let load_percent = if cpus.is_empty() {
        0.0
    } else {
        cpus.iter().map(|c| c.cpu_usage()).sum::<f32>() / cpus.len() as f32
    };
    CpuInfo {
        brand,
        cores: cpus.len(),
        speed_mhz,
        load_percent,
    }
}

fn memory_info(sys: &System) -> MemoryInfo {
    let total = sys.total_memory();
    let used = sys.used_memory();
    let free = total.saturating_sub(used);
    let used_percent = if total == 0 {
        0.0
    } else {
        used as f64 / total as f64 * 100.0
    };
    MemoryInfo {
        total,
        free,
        used,
        used_percent,
    }
}

fn disk_info() -> DiskInfo {
    let disks = Disks::new_with_refreshed_list();
    let total: u64 = disks.iter().map(|d| d.total_space()).sum();
    let free: u64 = disks.iter().map(|d| d.available_space()).sum();
    let used = total.saturating_sub(free);
    let used_percent = if total == 0 {
        0.0
    } else {
        used as f64 / total as f64 * 100.0
    };
    DiskInfo {
        total,
        free,
        used,
        used_percent,
    }
}

async fn probe_nvidia_gpu() -> anyhow::Result<Option<GpuInfo>> {
    let query = "name,memory.total,utilization.gpu,temperature.gpu,driver_version";
    let output = tokio::time::timeout(
        NVIDIA_SMI_TIMEOUT,
        Command::new("nvidia-smi")
            .args(["--query-gpu", query, "--format=csv,noheader,nounits"])
            .output(),
    )
    .await??;

    if !output.status.success() {
        return Ok(None);
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let first_line = stdout.lines().next().unwrap_or_default();
    let fields: Vec<&str> = first_line.split(',').map(str::trim).collect();
    if fields.len() < 5 {
        return Ok(None);
    }

    Ok(Some(GpuInfo {
        vendor: "NVIDIA".to_string(),
        model: fields[0].to_string(),
        memory_total: fields[1].parse::<u64>().unwrap_or_default() * 1024 * 1024,
        utilization: fields[2].parse().unwrap_or_default(),
        temperature: fields[3].parse().unwrap_or_default(),
        driver_version: fields[4].to_string(),
    }))
}
