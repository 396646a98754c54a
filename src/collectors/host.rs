use crate::record::HostSample;
#[cfg(target_os = "linux")]
use std::fs;
use std::path::{Path, PathBuf};
use sysinfo::{CpuExt, DiskExt, System, SystemExt};
use thiserror::Error;

#[cfg(any(target_os = "linux", test))]
const SECTOR_BYTES: u64 = 512;
#[cfg(target_os = "linux")]
const DISKSTATS_PATH: &str = "/proc/diskstats";

#[derive(Debug, Error)]
pub enum HostError {
    #[error("не удалось прочитать {path}: {source}")]
    Read {
        path: &'static str,
        source: std::io::Error,
    },
    #[error("точка монтирования {0} не найдена среди дисков")]
    MountNotFound(String),
}

/// Source of host-wide utilization numbers. No retries here, failures go to
/// the scheduler.
pub trait HostStats: Send {
    fn sample(&mut self) -> Result<HostSample, HostError>;
}

pub struct SysinfoHost {
    system: System,
    mount: PathBuf,
    io: IoTotals,
}

impl SysinfoHost {
    pub fn new(mount: impl Into<PathBuf>) -> Self {
        let mut system = System::new();
        // First CPU reading is measured against this refresh.
        system.refresh_cpu();
        Self {
            system,
            mount: mount.into(),
            io: IoTotals::default(),
        }
    }
}

impl HostStats for SysinfoHost {
    fn sample(&mut self) -> Result<HostSample, HostError> {
        self.system.refresh_cpu();
        self.system.refresh_memory();
        self.system.refresh_disks_list();

        let cpu_percent = self.system.global_cpu_info().cpu_usage() as f64;
        let ram_percent = ram_percent(
            self.system.total_memory(),
            self.system.available_memory(),
        );
        let (disk_used_bytes, disk_total_bytes) = self.disk_usage()?;
        let raw_io = read_disk_io(&mut self.system)?;
        let (disk_read_bytes, disk_write_bytes) = self.io.observe(raw_io);

        Ok(HostSample {
            cpu_percent,
            ram_percent,
            disk_read_bytes,
            disk_write_bytes,
            disk_used_bytes,
            disk_total_bytes,
        })
    }
}

impl SysinfoHost {
    fn disk_usage(&self) -> Result<(u64, u64), HostError> {
        let disk = self
            .system
            .disks()
            .iter()
            .find(|d| d.mount_point() == self.mount.as_path())
            .ok_or_else(|| HostError::MountNotFound(self.mount.display().to_string()))?;
        let total = disk.total_space();
        Ok((total.saturating_sub(disk.available_space()), total))
    }
}

/// Read/write totals that never go down. The raw sums shrink when a process
/// exits or a device goes away; only growth since the last reading is added.
#[derive(Debug, Default)]
struct IoTotals {
    last_raw: Option<(u64, u64)>,
    total: (u64, u64),
}

impl IoTotals {
    fn observe(&mut self, raw: (u64, u64)) -> (u64, u64) {
        self.total = match self.last_raw {
            None => raw,
            Some((last_read, last_written)) => (
                self.total.0.saturating_add(raw.0.saturating_sub(last_read)),
                self.total.1.saturating_add(raw.1.saturating_sub(last_written)),
            ),
        };
        self.last_raw = Some(raw);
        self.total
    }
}

fn ram_percent(total: u64, available: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (total.saturating_sub(available) as f64 / total as f64) * 100.0
}

#[cfg(target_os = "linux")]
fn read_disk_io(_system: &mut System) -> Result<(u64, u64), HostError> {
    let text = fs::read_to_string(DISKSTATS_PATH).map_err(|source| HostError::Read {
        path: DISKSTATS_PATH,
        source,
    })?;
    Ok(parse_diskstats(&text, is_whole_block_device))
}

#[cfg(not(target_os = "linux"))]
fn read_disk_io(system: &mut System) -> Result<(u64, u64), HostError> {
    use sysinfo::ProcessExt;

    system.refresh_processes();
    let (read, written) = system
        .processes()
        .values()
        .map(|p| p.disk_usage())
        .fold((0_u64, 0_u64), |(r, w), u| {
            (
                r.saturating_add(u.total_read_bytes),
                w.saturating_add(u.total_written_bytes),
            )
        });
    Ok((read, written))
}

/// Partitions are listed next to their parent disk; only entries that exist
/// under /sys/block are counted so nothing is summed twice.
#[cfg(target_os = "linux")]
fn is_whole_block_device(name: &str) -> bool {
    Path::new("/sys/block").join(name.replace('/', "!")).exists()
}

#[cfg(any(target_os = "linux", test))]
fn parse_diskstats(text: &str, is_device: impl Fn(&str) -> bool) -> (u64, u64) {
    let mut read = 0_u64;
    let mut written = 0_u64;
    for line in text.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 || !is_device(fields[2]) {
            continue;
        }
        let sectors_read = fields[5].parse::<u64>().unwrap_or(0);
        let sectors_written = fields[9].parse::<u64>().unwrap_or(0);
        read = read.saturating_add(sectors_read.saturating_mul(SECTOR_BYTES));
        written = written.saturating_add(sectors_written.saturating_mul(SECTOR_BYTES));
    }
    (read, written)
}
