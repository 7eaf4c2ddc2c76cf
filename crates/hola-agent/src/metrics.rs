//! Host metrics.

use std::time::Duration;

use async_trait::async_trait;
use hola_common::{HolaError, HolaResult};
use serde::{Deserialize, Serialize};
use sysinfo::{Components, Disks, System};

/// Readings above this are treated as sensor glitches.
const MAX_PLAUSIBLE_CELSIUS: f32 = 150.0;

/// One snapshot of host metrics, the `metrics` message payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    /// Host name.
    pub hostname: String,
    /// Seconds since boot.
    pub uptime_seconds: u64,
    /// CPU usage.
    pub cpu: CpuMetrics,
    /// Memory usage.
    pub memory: MemoryMetrics,
    /// Usage per mounted filesystem.
    pub disk: Vec<DiskMetric>,
}

/// CPU section of [`SystemMetrics`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuMetrics {
    /// Usage across all cores, 0-100.
    pub usage_percent: f64,
    /// Logical core count.
    pub cores: usize,
    /// Package temperature when a usable sensor exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature_celsius: Option<f64>,
}

/// Memory section of [`SystemMetrics`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryMetrics {
    /// Installed memory.
    pub total_bytes: u64,
    /// Memory in use.
    pub used_bytes: u64,
    /// `used / total * 100`.
    pub usage_percent: f64,
}

/// Usage of one mounted filesystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskMetric {
    /// Where it is mounted.
    pub mount_point: String,
    /// Filesystem size.
    pub total_bytes: u64,
    /// Space in use.
    pub used_bytes: u64,
    /// `used / total * 100`.
    pub usage_percent: f64,
}

/// Produces host metrics snapshots.
#[async_trait]
pub trait MetricsSource: Send + Sync + 'static {
    /// Take one snapshot.
    async fn collect(&self) -> HolaResult<SystemMetrics>;
}

/// [`MetricsSource`] reading the local host through `sysinfo`.
#[derive(Debug, Clone)]
pub struct SystemSampler {
    cpu_window: Duration,
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self {
            cpu_window: Duration::from_millis(500),
        }
    }
}

impl SystemSampler {
    /// Create a sampler with the default CPU measurement window.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set how long CPU usage is measured over.
    #[must_use]
    pub fn with_cpu_window(mut self, window: Duration) -> Self {
        self.cpu_window = window.max(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
        self
    }

    fn sample(&self) -> SystemMetrics {
        let mut system = System::new();
        system.refresh_cpu_usage();
        std::thread::sleep(self.cpu_window);
        system.refresh_cpu_usage();
        system.refresh_memory();

        let total = system.total_memory();
        let used = system.used_memory();

        let disks = Disks::new_with_refreshed_list();
        let disk = disks
            .list()
            .iter()
            .filter(|disk| disk.total_space() > 0)
            .map(|disk| {
                let total = disk.total_space();
                let used = total.saturating_sub(disk.available_space());
                DiskMetric {
                    mount_point: disk.mount_point().display().to_string(),
                    total_bytes: total,
                    used_bytes: used,
                    usage_percent: percent(used, total),
                }
            })
            .collect();

        let components = Components::new_with_refreshed_list();
        let temperature_celsius = select_cpu_temperature(components.list().iter().filter_map(
            |component| {
                let reading: Option<f32> = component.temperature().into();
                reading.map(|celsius| (component.label(), celsius))
            },
        ));

        SystemMetrics {
            hostname: System::host_name().unwrap_or_default(),
            uptime_seconds: System::uptime(),
            cpu: CpuMetrics {
                usage_percent: f64::from(system.global_cpu_usage()),
                cores: system.cpus().len(),
                temperature_celsius,
            },
            memory: MemoryMetrics {
                total_bytes: total,
                used_bytes: used,
                usage_percent: percent(used, total),
            },
            disk,
        }
    }
}

#[async_trait]
impl MetricsSource for SystemSampler {
    async fn collect(&self) -> HolaResult<SystemMetrics> {
        let sampler = self.clone();
        tokio::task::spawn_blocking(move || sampler.sample())
            .await
            .map_err(|err| HolaError::Metrics {
                message: err.to_string(),
            })
    }
}

#[allow(clippy::cast_precision_loss)]
fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    used as f64 / total as f64 * 100.0
}

/// Pick the sensor most likely to be the CPU package temperature.
///
/// Labels rank in this order: `package`, `tdie`, `tctl`/`cpu_thermal`/
/// `cpu-thermal`, `cpu`/`core`, anything else. The first reading of the best
/// rank wins.
/// Readings at or below zero or above 150 °C are ignored.
pub fn select_cpu_temperature<'a>(
    readings: impl IntoIterator<Item = (&'a str, f32)>,
) -> Option<f64> {
    let mut best: Option<(u8, f32)> = None;

    for (label, celsius) in readings {
        if celsius.is_nan() || celsius <= 0.0 || celsius > MAX_PLAUSIBLE_CELSIUS {
            continue;
        }

        let priority = sensor_priority(label);
        if best.is_none_or(|(best_priority, _)| priority > best_priority) {
            best = Some((priority, celsius));
        }
    }

    best.map(|(_, celsius)| f64::from(celsius))
}

fn sensor_priority(label: &str) -> u8 {
    let label = label.to_lowercase();
    if label.contains("package") {
        5
    } else if label.contains("tdie") {
        4
    } else if ["tctl", "cpu_thermal", "cpu-thermal"]
        .iter()
        .any(|key| label.contains(key))
    {
        3
    } else if label.contains("cpu") || label.contains("core") {
        2
    } else {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn package_sensor_wins() {
        let readings = [
            ("acpitz temp1", 40.0),
            ("coretemp Core 0", 55.0),
            ("coretemp Package id 0", 58.0),
            ("coretemp Core 1", 60.0),
        ];
        assert_eq!(select_cpu_temperature(readings), Some(58.0));
    }

    #[test]
    fn amd_and_arm_sensors() {
        assert_eq!(
            select_cpu_temperature([("k10temp Tctl", 61.0), ("k10temp Tdie", 51.0)]),
            Some(51.0)
        );
        assert_eq!(
            select_cpu_temperature([("nvme Composite", 38.0), ("cpu_thermal temp1", 47.5)]),
            Some(47.5)
        );
    }

    #[test]
    fn first_of_equal_priority_wins() {
        assert_eq!(
            select_cpu_temperature([("Core 0", 50.0), ("Core 1", 70.0)]),
            Some(50.0)
        );
    }

    #[test]
    fn implausible_readings_ignored() {
        assert_eq!(
            select_cpu_temperature([("Package id 0", 0.0), ("Package id 1", 200.0)]),
            None
        );
        assert_eq!(
            select_cpu_temperature([("Package id 0", -5.0), ("acpitz", 35.0)]),
            Some(35.0)
        );
        assert_eq!(select_cpu_temperature(Vec::<(&str, f32)>::new()), None);
    }

    #[test]
    fn percent_of_zero_total() {
        assert!(percent(10, 0).abs() < f64::EPSILON);
        assert!((percent(25, 100) - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn temperature_omitted_when_absent() {
        let cpu = CpuMetrics {
            usage_percent: 12.5,
            cores: 4,
            temperature_celsius: None,
        };
        let value = serde_json::to_value(cpu).unwrap();
        assert!(value.get("temperature_celsius").is_none());
    }

    #[tokio::test]
    async fn sampler_reports_host() {
        let metrics = SystemSampler::new()
            .with_cpu_window(Duration::ZERO)
            .collect()
            .await
            .unwrap();
        assert!(metrics.cpu.cores >= 1);
        assert!(metrics.memory.total_bytes > 0);
    }
}
