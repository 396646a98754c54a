use crate::record::DeviceSample;
use prometheus::core::Collector;
use prometheus::{opts, Counter, Encoder, Gauge, GaugeVec, Registry, TextEncoder};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub gpu_util: GaugeVec,
    pub gpu_vram: GaugeVec,
    pub agent_gpu_count: Gauge,
    pub agent_gpu_backend_info: GaugeVec,
    pub agent_cycles_total: Counter,
    pub agent_cycle_errors_total: Counter,
    pub agent_scrape_count_total: Counter,
    pub agent_last_collect_timestamp_seconds: Gauge,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let gpu_util = GaugeVec::new(opts!("gpu_util", "GPU util %"), &["gpu"])?;
        let gpu_vram = GaugeVec::new(opts!("gpu_vram", "VRAM %"), &["gpu"])?;
        let agent_gpu_count = Gauge::with_opts(opts!(
            "agent_gpu_count",
            "Number of GPUs reported in the last successful cycle"
        ))?;
        let agent_gpu_backend_info = GaugeVec::new(
            opts!(
                "agent_gpu_backend_info",
                "GPU backend selected at startup (value is always 1)"
            ),
            &["backend"],
        )?;
        let agent_cycles_total = Counter::with_opts(opts!(
            "agent_cycles_total",
            "Sampling cycles completed, successful or not"
        ))?;
        let agent_cycle_errors_total = Counter::with_opts(opts!(
            "agent_cycle_errors_total",
            "Sampling cycles that produced an error record"
        ))?;
        let agent_scrape_count_total =
            Counter::with_opts(opts!("agent_scrape_count_total", "Total /metrics scrapes"))?;
        let agent_last_collect_timestamp_seconds = Gauge::with_opts(opts!(
            "agent_last_collect_timestamp_seconds",
            "Unix timestamp of the last successful cycle"
        ))?;

        register(&registry, &gpu_util)?;
        register(&registry, &gpu_vram)?;
        register(&registry, &agent_gpu_count)?;
        register(&registry, &agent_gpu_backend_info)?;
        register(&registry, &agent_cycles_total)?;
        register(&registry, &agent_cycle_errors_total)?;
        register(&registry, &agent_scrape_count_total)?;
        register(&registry, &agent_last_collect_timestamp_seconds)?;

        Ok(Arc::new(Self {
            registry,
            gpu_util,
            gpu_vram,
            agent_gpu_count,
            agent_gpu_backend_info,
            agent_cycles_total,
            agent_cycle_errors_total,
            agent_scrape_count_total,
            agent_last_collect_timestamp_seconds,
        }))
    }

    pub fn set_backend(&self, backend: &str) {
        self.agent_gpu_backend_info.reset();
        self.agent_gpu_backend_info
            .with_label_values(&[backend])
            .set(1.0);
    }

    /// Replaces the per-device gauges. Devices missing from `devices` lose
    /// their series.
    pub fn update_devices(&self, devices: &[DeviceSample]) {
        self.gpu_util.reset();
        self.gpu_vram.reset();
        for d in devices {
            let label = d.index.to_string();
            self.gpu_util
                .with_label_values(&[&label])
                .set(d.utilization_percent);
            self.gpu_vram
                .with_label_values(&[&label])
                .set(d.vram_percent());
        }
        self.agent_gpu_count.set(devices.len() as f64);
        self.agent_last_collect_timestamp_seconds
            .set(now_unix() as f64);
    }

    pub fn inc_cycle(&self, failed: bool) {
        self.agent_cycles_total.inc();
        if failed {
            self.agent_cycle_errors_total.inc();
        }
    }

    pub fn inc_scrape_count(&self) {
        self.agent_scrape_count_total.inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(metrics: &Metrics) -> String {
        String::from_utf8(metrics.encode_metrics().expect("кодирование метрик")).unwrap()
    }

    #[test]
    fn device_gauges_are_labeled_by_index() {
        let metrics = Metrics::new().expect("инициализация метрик");
        metrics.update_devices(&[
            DeviceSample::new(0, 55.0, 2_000_000_000, 8_000_000_000, 50.0, 100.0, "a"),
            DeviceSample::new(1, 10.0, 0, 8_000_000_000, 50.0, 100.0, "b"),
        ]);

        let out = text(&metrics);
        assert!(out.contains("gpu_util{gpu=\"0\"} 55"));
        assert!(out.contains("gpu_util{gpu=\"1\"} 10"));
        assert!(out.contains("gpu_vram{gpu=\"0\"} 25"));
        assert!(out.contains("agent_gpu_count 2"));
    }

    #[test]
    fn vanished_devices_are_cleared() {
        let metrics = Metrics::new().expect("инициализация метрик");
        metrics.update_devices(&[
            DeviceSample::new(0, 1.0, 0, 1, 0.0, 0.0, "a"),
            DeviceSample::new(1, 2.0, 0, 1, 0.0, 0.0, "b"),
        ]);
        metrics.update_devices(&[DeviceSample::new(0, 3.0, 0, 1, 0.0, 0.0, "a")]);

        let out = text(&metrics);
        assert!(out.contains("gpu_util{gpu=\"0\"} 3"));
        assert!(!out.contains("gpu=\"1\""));
    }

    #[test]
    fn backend_info_and_cycle_counters() {
        let metrics = Metrics::new().expect("инициализация метрик");
        metrics.set_backend("nvml");
        metrics.inc_cycle(false);
        metrics.inc_cycle(true);

        let out = text(&metrics);
        assert!(out.contains("agent_gpu_backend_info{backend=\"nvml\"} 1"));
        assert!(out.contains("agent_cycles_total 2"));
        assert!(out.contains("agent_cycle_errors_total 1"));
    }
}
