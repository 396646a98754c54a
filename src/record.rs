use serde::Serialize;

const BYTES_PER_GB: f64 = 1e9;
const BYTES_PER_MB: f64 = 1e6;

/// Reading of one accelerator at a single cycle. Memory is kept in raw bytes,
/// conversion to GB happens only on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSample {
    pub index: u32,
    pub utilization_percent: f64,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    pub temperature: f64,
    pub power_watts: f64,
    pub name: String,
    pub partitions: u32,
}

impl DeviceSample {
    pub fn new(
        index: u32,
        utilization_percent: f64,
        memory_used_bytes: u64,
        memory_total_bytes: u64,
        temperature: f64,
        power_watts: f64,
        name: &str,
    ) -> Self {
        Self {
            index,
            utilization_percent: utilization_percent.clamp(0.0, 100.0),
            memory_used_bytes: memory_used_bytes.min(memory_total_bytes),
            memory_total_bytes,
            temperature,
            power_watts,
            name: normalize_device_name(name, index),
            partitions: 0,
        }
    }

    /// Device that was detected but cannot be read.
    pub fn placeholder(index: u32, name: &str) -> Self {
        Self::new(index, 0.0, 0, 0, 0.0, 0.0, name)
    }

    pub fn vram_percent(&self) -> f64 {
        if self.memory_total_bytes == 0 {
            return 0.0;
        }
        (self.memory_used_bytes as f64 / self.memory_total_bytes as f64) * 100.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HostSample {
    pub cpu_percent: f64,
    pub ram_percent: f64,
    /// Cumulative since boot, not per interval.
    pub disk_read_bytes: u64,
    pub disk_write_bytes: u64,
    pub disk_used_bytes: u64,
    pub disk_total_bytes: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleRecord {
    Metrics {
        devices: Vec<DeviceSample>,
        host: HostSample,
    },
    Failed {
        error: String,
    },
}

pub fn aggregate(devices: Vec<DeviceSample>, host: HostSample) -> CycleRecord {
    CycleRecord::Metrics { devices, host }
}

impl CycleRecord {
    pub fn failed(error: impl ToString) -> Self {
        Self::Failed {
            error: error.to_string(),
        }
    }

    pub fn devices(&self) -> &[DeviceSample] {
        match self {
            Self::Metrics { devices, .. } => devices,
            Self::Failed { .. } => &[],
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    pub fn to_wire(&self) -> WireRecord {
        match self {
            Self::Metrics { devices, host } => {
                let gpus: Vec<WireDevice> = devices.iter().map(WireDevice::from).collect();
                WireRecord::Metrics(WireMetrics {
                    metrics: gpus.clone(),
                    gpu_list: gpus,
                    cpu: host.cpu_percent,
                    ram: host.ram_percent,
                    disk_read: host.disk_read_bytes as f64 / BYTES_PER_MB,
                    disk_write: host.disk_write_bytes as f64 / BYTES_PER_MB,
                    disk_used: host.disk_used_bytes as f64 / BYTES_PER_GB,
                    disk_total: host.disk_total_bytes as f64 / BYTES_PER_GB,
                })
            }
            Self::Failed { error } => WireRecord::Error {
                error: error.clone(),
            },
        }
    }

    pub fn to_json_line(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut line = serde_json::to_vec(&self.to_wire())?;
        line.push(b'\n');
        Ok(line)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum WireRecord {
    Metrics(WireMetrics),
    Error { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct WireMetrics {
    pub metrics: Vec<WireDevice>,
    pub gpu_list: Vec<WireDevice>,
    pub cpu: f64,
    pub ram: f64,
    pub disk_read: f64,
    pub disk_write: f64,
    pub disk_used: f64,
    pub disk_total: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WireDevice {
    pub gpu: f64,
    pub vram: f64,
    pub vram_total: f64,
    pub temp: f64,
    pub power: f64,
    pub name: String,
    pub mig: u32,
}

impl From<&DeviceSample> for WireDevice {
    fn from(value: &DeviceSample) -> Self {
        Self {
            gpu: value.utilization_percent,
            vram: value.memory_used_bytes as f64 / BYTES_PER_GB,
            vram_total: value.memory_total_bytes as f64 / BYTES_PER_GB,
            temp: value.temperature,
            power: value.power_watts,
            name: value.name.clone(),
            mig: value.partitions,
        }
    }
}

fn normalize_device_name(raw: &str, index: u32) -> String {
    let name = raw.trim_matches(|c: char| c == '\0' || c.is_whitespace());
    if name.is_empty() {
        format!("GPU {index}")
    } else {
        name.to_string()
    }
}
