use crate::backend::{ActiveBackend, GpuApi, GpuError, VendorHandle, AMD_PLACEHOLDER_NAME};
use crate::record::DeviceSample;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::warn;

/// Reads every device of the active backend. Never fails: a broken read
/// drops the accelerator part of this cycle and yields an empty list.
pub async fn collect_gpus(backend: &ActiveBackend, call_timeout: Duration) -> Vec<DeviceSample> {
    match backend {
        ActiveBackend::None => Vec::new(),
        ActiveBackend::AmdStub => vec![DeviceSample::placeholder(0, AMD_PLACEHOLDER_NAME)],
        ActiveBackend::Nvidia(handle) => match read_all(handle, call_timeout).await {
            Ok(devices) => devices,
            Err(err) => {
                warn!(
                    error = %err,
                    vendor = handle.api().vendor(),
                    "опрос GPU пропущен в этом цикле"
                );
                Vec::new()
            }
        },
    }
}

async fn read_all(
    handle: &VendorHandle,
    call_timeout: Duration,
) -> Result<Vec<DeviceSample>, GpuError> {
    let count = call_blocking(handle, call_timeout, |api| api.device_count()).await?;
    let mut devices = Vec::with_capacity(count as usize);
    for index in 0..count {
        let device = call_blocking(handle, call_timeout, move |api| api.read_device(index)).await?;
        devices.push(device);
    }
    Ok(devices)
}

/// Vendor calls are synchronous FFI and may hang; run them off the runtime
/// and stop waiting after `limit`. A hung worker is abandoned but keeps the
/// library marked busy, so later cycles skip it instead of stacking threads.
async fn call_blocking<T, F>(
    handle: &VendorHandle,
    limit: Duration,
    call: F,
) -> Result<T, GpuError>
where
    T: Send + 'static,
    F: FnOnce(&dyn GpuApi) -> Result<T, GpuError> + Send + 'static,
{
    let guard = handle.try_begin().ok_or(GpuError::Busy)?;
    let api = Arc::clone(handle.api());
    let task = tokio::task::spawn_blocking(move || {
        let _guard = guard;
        call(api.as_ref())
    });
    match time::timeout(limit, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(GpuError::Worker(join_err.to_string())),
        Err(_) => Err(GpuError::Timeout(limit)),
    }
}
