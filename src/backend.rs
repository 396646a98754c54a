use crate::record::DeviceSample;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

pub const AMD_PROBE_TOOL: &str = "rocm-smi";
pub const AMD_PLACEHOLDER_NAME: &str = "AMD GPU";

#[derive(Debug, Error)]
pub enum GpuError {
    #[error("вызов библиотеки GPU завершился ошибкой: {0}")]
    Vendor(String),
    #[error("вызов библиотеки GPU не уложился в {0:?}")]
    Timeout(Duration),
    #[error("поток опроса GPU аварийно завершился: {0}")]
    Worker(String),
    #[error("предыдущий вызов библиотеки GPU ещё не завершился")]
    Busy,
    #[cfg(any(not(feature = "nvml"), test))]
    #[error("поддержка {0} не собрана в этот бинарник")]
    NotCompiled(&'static str),
}

/// Minimal capability an accelerator monitoring library has to offer.
/// Calls are blocking and may hang, callers wrap them in a timeout.
pub trait GpuApi: Send + Sync {
    fn vendor(&self) -> &'static str;
    fn device_count(&self) -> Result<u32, GpuError>;
    fn read_device(&self, index: u32) -> Result<DeviceSample, GpuError>;
}

/// Vendor library plus a flag that stays set while one of its calls runs,
/// including calls the sampler stopped waiting for.
#[derive(Clone)]
pub struct VendorHandle {
    api: Arc<dyn GpuApi>,
    busy: Arc<AtomicBool>,
}

impl VendorHandle {
    pub fn new(api: Arc<dyn GpuApi>) -> Self {
        Self {
            api,
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn api(&self) -> &Arc<dyn GpuApi> {
        &self.api
    }

    #[cfg(test)]
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Marks the library busy. `None` if a previous call has not returned yet.
    pub fn try_begin(&self) -> Option<CallGuard> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| CallGuard(Arc::clone(&self.busy)))
    }
}

/// Clears the busy flag when the call finishes, panics included.
pub struct CallGuard(Arc<AtomicBool>);

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Backend chosen once at startup and kept for the lifetime of the process.
#[derive(Clone)]
pub enum ActiveBackend {
    None,
    Nvidia(VendorHandle),
    /// Vendor tooling found on the host, but no sampling path for it yet.
    AmdStub,
}

impl ActiveBackend {
    pub fn nvidia(api: Arc<dyn GpuApi>) -> Self {
        Self::Nvidia(VendorHandle::new(api))
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Nvidia(_) => "nvml",
            Self::AmdStub => "rocm-stub",
        }
    }
}

impl fmt::Debug for ActiveBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

pub fn detect() -> ActiveBackend {
    detect_with(init_nvidia, || tool_on_path(AMD_PROBE_TOOL))
}

pub fn detect_with<N, A>(init_nvidia: N, amd_present: A) -> ActiveBackend
where
    N: FnOnce() -> Result<Arc<dyn GpuApi>, GpuError>,
    A: FnOnce() -> bool,
{
    match init_nvidia() {
        Ok(api) => {
            info!(vendor = api.vendor(), "обнаружен GPU-бэкенд NVIDIA");
            return ActiveBackend::nvidia(api);
        }
        Err(err) => {
            debug!(error = %err, "NVML недоступен");
        }
    }

    if amd_present() {
        info!(
            tool = AMD_PROBE_TOOL,
            "обнаружен инструментарий AMD, метрики будут заглушкой"
        );
        return ActiveBackend::AmdStub;
    }

    info!("GPU не обнаружены, собираются только метрики хоста");
    ActiveBackend::None
}

fn tool_on_path(tool: &str) -> bool {
    which::which(tool).is_ok()
}

#[cfg(feature = "nvml")]
fn init_nvidia() -> Result<Arc<dyn GpuApi>, GpuError> {
    let api = nvml::NvmlApi::init()?;
    Ok(Arc::new(api))
}

#[cfg(not(feature = "nvml"))]
fn init_nvidia() -> Result<Arc<dyn GpuApi>, GpuError> {
    Err(GpuError::NotCompiled("nvml"))
}

#[cfg(feature = "nvml")]
mod nvml {
    use super::{GpuApi, GpuError};
    use crate::record::DeviceSample;
    use nvml_wrapper::enum_wrappers::device::TemperatureSensor;
    use nvml_wrapper::error::NvmlError;
    use nvml_wrapper::Nvml;

    impl From<NvmlError> for GpuError {
        fn from(value: NvmlError) -> Self {
            GpuError::Vendor(value.to_string())
        }
    }

    pub struct NvmlApi {
        nvml: Nvml,
    }

    impl NvmlApi {
        pub fn init() -> Result<Self, GpuError> {
            Ok(Self { nvml: Nvml::init()? })
        }
    }

    impl GpuApi for NvmlApi {
        fn vendor(&self) -> &'static str {
            "nvidia"
        }

        fn device_count(&self) -> Result<u32, GpuError> {
            Ok(self.nvml.device_count()?)
        }

        fn read_device(&self, index: u32) -> Result<DeviceSample, GpuError> {
            let device = self.nvml.device_by_index(index)?;
            let mem = device.memory_info()?;
            let util = device.utilization_rates()?;
            let temp = device.temperature(TemperatureSensor::Gpu)?;
            // milliwatts
            let power_mw = device.power_usage()?;
            let name = device.name()?;

            Ok(DeviceSample::new(
                index,
                util.gpu as f64,
                mem.used,
                mem.total,
                temp as f64,
                power_mw as f64 / 1000.0,
                &name,
            ))
        }
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    /// Scripted accelerator used across sampler and scheduler tests.
    pub struct FakeGpu {
        pub devices: Vec<Result<DeviceSample, String>>,
        pub count_error: bool,
        pub hang: Option<Duration>,
    }

    impl FakeGpu {
        pub fn with_devices(devices: Vec<DeviceSample>) -> Self {
            Self {
                devices: devices.into_iter().map(Ok).collect(),
                count_error: false,
                hang: None,
            }
        }

        /// Two devices at 30% and 70% with 4/8 GB and 2/16 GB used.
        pub fn two_devices() -> Self {
            Self::with_devices(vec![
                DeviceSample::new(0, 30.0, 4_000_000_000, 8_000_000_000, 60.0, 150.0, "GPU 0"),
                DeviceSample::new(1, 70.0, 2_000_000_000, 16_000_000_000, 70.0, 250.0, "GPU 1"),
            ])
        }
    }

    impl GpuApi for FakeGpu {
        fn vendor(&self) -> &'static str {
            "fake"
        }

        fn device_count(&self) -> Result<u32, GpuError> {
            if self.count_error {
                return Err(GpuError::Vendor("count failed".to_string()));
            }
            Ok(self.devices.len() as u32)
        }

        fn read_device(&self, index: u32) -> Result<DeviceSample, GpuError> {
            if let Some(hang) = self.hang {
                std::thread::sleep(hang);
            }
            match self.devices.get(index as usize) {
                Some(Ok(d)) => Ok(d.clone()),
                Some(Err(msg)) => Err(GpuError::Vendor(msg.clone())),
                None => Err(GpuError::Vendor(format!("no device {index}"))),
            }
        }
    }

    #[test]
    fn nvidia_wins_and_amd_is_not_probed() {
        let mut probed = false;
        let backend = detect_with(
            || Ok(Arc::new(FakeGpu::two_devices()) as Arc<dyn GpuApi>),
            || {
                probed = true;
                true
            },
        );
        assert!(matches!(backend, ActiveBackend::Nvidia(_)));
        assert!(!probed);
    }

    #[test]
    fn amd_probe_used_when_nvidia_fails() {
        let backend = detect_with(
            || Err(GpuError::Vendor("libnvidia-ml.so not found".into())),
            || true,
        );
        assert!(matches!(backend, ActiveBackend::AmdStub));
        assert_eq!(backend.label(), "rocm-stub");
    }

    #[test]
    fn nothing_detected_is_none() {
        let backend = detect_with(|| Err(GpuError::NotCompiled("nvml")), || false);
        assert!(matches!(backend, ActiveBackend::None));
    }

    #[test]
    fn busy_flag_is_released_when_the_call_ends() {
        let handle = VendorHandle::new(Arc::new(FakeGpu::two_devices()));
        let guard = handle.try_begin().expect("библиотека свободна");
        assert!(handle.is_busy());
        assert!(handle.try_begin().is_none());
        drop(guard);
        assert!(!handle.is_busy());
        assert!(handle.try_begin().is_some());
    }

    #[test]
    fn missing_tool_is_not_on_path() {
        assert!(!tool_on_path("gpumond-definitely-missing-tool-0x1f"));
    }
}
