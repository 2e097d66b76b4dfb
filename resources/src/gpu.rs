//! GPU discovery, allocation, and sampling

use nvml_wrapper::enum_wrappers::device::TemperatureSensor;
use nvml_wrapper::Nvml;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// GPU sampling cadence
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

/// Utilization above which an unallocated device is considered busy
const BUSY_UTILIZATION_PERCENT: f32 = 90.0;

/// Device state as tracked by the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuStatus {
    Available,
    Allocated,
    Busy,
    Error,
}

/// Which interface the device table came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuProvider {
    Nvml,
    Smi,
    /// Synthesized table for development/CI; the scheduler never places
    /// real GPU jobs on mock devices.
    Mock,
}

/// One GPU device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuDevice {
    pub index: u32,
    pub name: String,
    pub memory_total_mib: u64,
    pub memory_used_mib: u64,
    pub utilization_percent: f32,
    pub temperature_c: i32,
    pub power_watts: u32,
    pub status: GpuStatus,
    pub holder: Option<String>,
    /// Memory reserved for the holding job in MiB
    pub reserved_mib: u64,
}

impl GpuDevice {
    fn free_mib(&self) -> u64 {
        self.memory_total_mib.saturating_sub(self.memory_used_mib)
    }

    fn unreserved_mib(&self) -> u64 {
        self.memory_total_mib.saturating_sub(self.reserved_mib)
    }
}

/// Aggregate view for heartbeats and the status endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuSnapshot {
    pub provider: GpuProvider,
    pub total_gpus: usize,
    pub available_gpus: usize,
    pub allocated_gpus: usize,
    pub total_memory_mib: u64,
    pub used_memory_mib: u64,
    pub devices: Vec<GpuDevice>,
    pub active_jobs: usize,
}

struct Ledger {
    devices: BTreeMap<u32, GpuDevice>,
    allocations: HashMap<String, Vec<u32>>,
}

/// Per-host GPU ledger. All state changes go through the single mutex.
pub struct GpuManager {
    provider: GpuProvider,
    nvml: Option<Nvml>,
    inner: Mutex<Ledger>,
}

impl GpuManager {
    /// Probe NVML, then nvidia-smi, then fall back to a mock table.
    pub fn discover() -> Self {
        match Nvml::init() {
            Ok(nvml) => match discover_nvml(&nvml) {
                Ok(devices) if !devices.is_empty() => {
                    info!(count = devices.len(), "discovered GPUs via NVML");
                    return Self::with_provider(GpuProvider::Nvml, Some(nvml), devices);
                }
                Ok(_) => debug!("NVML reported no devices"),
                Err(e) => warn!("NVML device enumeration failed: {}", e),
            },
            Err(e) => warn!("NVML unavailable ({}), falling back to nvidia-smi", e),
        }

        match discover_smi() {
            Ok(devices) if !devices.is_empty() => {
                info!(count = devices.len(), "discovered GPUs via nvidia-smi");
                Self::with_provider(GpuProvider::Smi, None, devices)
            }
            _ => {
                warn!("nvidia-smi unavailable, synthesizing mock GPUs");
                Self::mock()
            }
        }
    }

    /// Mock table with two devices, for hosts without NVIDIA hardware.
    pub fn mock() -> Self {
        let devices = [("NVIDIA GeForce RTX 3080", 10240), ("NVIDIA GeForce RTX 3090", 24576)]
            .into_iter()
            .enumerate()
            .map(|(i, (name, memory))| GpuDevice {
                index: i as u32,
                name: name.to_string(),
                memory_total_mib: memory,
                memory_used_mib: 512,
                utilization_percent: 15.0,
                temperature_c: 65,
                power_watts: 150,
                status: GpuStatus::Available,
                holder: None,
                reserved_mib: 0,
            })
            .collect();

        Self::with_provider(GpuProvider::Mock, None, devices)
    }

    fn with_provider(provider: GpuProvider, nvml: Option<Nvml>, devices: Vec<GpuDevice>) -> Self {
        let devices = devices.into_iter().map(|d| (d.index, d)).collect();
        Self {
            provider,
            nvml,
            inner: Mutex::new(Ledger {
                devices,
                allocations: HashMap::new(),
            }),
        }
    }

    /// Construct from an explicit device table (tests).
    #[cfg(test)]
    pub(crate) fn with_devices(devices: Vec<GpuDevice>) -> Self {
        Self::with_provider(GpuProvider::Mock, None, devices)
    }

    pub fn provider(&self) -> GpuProvider {
        self.provider
    }

    pub fn is_mock(&self) -> bool {
        self.provider == GpuProvider::Mock
    }

    /// Non-mutating fit check.
    pub fn can_allocate(&self, count: u32, memory_floor_mib: u64) -> bool {
        if count == 0 {
            return true;
        }
        let ledger = self.inner.lock();
        let available = ledger
            .devices
            .values()
            .filter(|d| d.status == GpuStatus::Available && d.unreserved_mib() >= memory_floor_mib)
            .count();
        available >= count as usize
    }

    /// Allocate `count` devices with at least `memory_floor_mib` unreserved.
    ///
    /// Selection prefers the largest free memory, then the lowest index.
    /// `count == 0` is a valid no-op.
    pub fn allocate(&self, job_id: &str, count: u32, memory_floor_mib: u64) -> Result<Vec<u32>> {
        if count == 0 {
            return Ok(vec![]);
        }

        let mut ledger = self.inner.lock();

        let mut candidates: Vec<(u64, u32)> = ledger
            .devices
            .values()
            .filter(|d| d.status == GpuStatus::Available && d.unreserved_mib() >= memory_floor_mib)
            .map(|d| (d.free_mib(), d.index))
            .collect();

        if candidates.len() < count as usize {
            return Err(Error::InsufficientGpus {
                requested: count,
                available: candidates.len() as u32,
            });
        }

        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        let indices: Vec<u32> = candidates
            .into_iter()
            .take(count as usize)
            .map(|(_, i)| i)
            .collect();

        for &index in &indices {
            let device = ledger
                .devices
                .get_mut(&index)
                .ok_or_else(|| Error::Device(format!("unknown GPU index {}", index)))?;
            device.status = GpuStatus::Allocated;
            device.holder = Some(job_id.to_string());
            device.reserved_mib = memory_floor_mib;
        }

        ledger.allocations.insert(job_id.to_string(), indices.clone());
        info!(job_id, ?indices, "allocated GPUs");
        Ok(indices)
    }

    /// Free every device held by `job_id`. Idempotent.
    pub fn release(&self, job_id: &str) {
        let mut ledger = self.inner.lock();

        let Some(indices) = ledger.allocations.remove(job_id) else {
            return;
        };

        for index in &indices {
            if let Some(device) = ledger.devices.get_mut(index) {
                device.status = GpuStatus::Available;
                device.holder = None;
                device.reserved_mib = 0;
            }
        }
        info!(job_id, ?indices, "released GPUs");
    }

    pub fn snapshot(&self) -> GpuSnapshot {
        let ledger = self.inner.lock();
        let devices: Vec<GpuDevice> = ledger.devices.values().cloned().collect();

        GpuSnapshot {
            provider: self.provider,
            total_gpus: devices.len(),
            available_gpus: devices
                .iter()
                .filter(|d| d.status == GpuStatus::Available)
                .count(),
            allocated_gpus: devices
                .iter()
                .filter(|d| d.status == GpuStatus::Allocated)
                .count(),
            total_memory_mib: devices.iter().map(|d| d.memory_total_mib).sum(),
            used_memory_mib: devices.iter().map(|d| d.memory_used_mib).sum(),
            devices,
            active_jobs: ledger.allocations.len(),
        }
    }

    /// Refresh dynamic fields and re-derive device status.
    ///
    /// Sampling errors never touch allocation state: a failed probe leaves
    /// the previous metrics in place.
    pub fn sample(&self) {
        let samples = match self.provider {
            GpuProvider::Nvml => match self.nvml.as_ref().map(sample_nvml) {
                Some(Ok(s)) => s,
                Some(Err(e)) => {
                    warn!("NVML sampling failed: {}", e);
                    return;
                }
                None => return,
            },
            GpuProvider::Smi => match sample_smi() {
                Ok(s) => s,
                Err(e) => {
                    warn!("nvidia-smi sampling failed: {}", e);
                    return;
                }
            },
            GpuProvider::Mock => {
                self.sample_mock();
                return;
            }
        };

        let mut ledger = self.inner.lock();
        for (index, used_mib, utilization, temperature, power) in samples {
            if let Some(device) = ledger.devices.get_mut(&index) {
                device.memory_used_mib = used_mib;
                device.utilization_percent = utilization;
                device.temperature_c = temperature;
                device.power_watts = power;
                device.status = derive_status(device);
            }
        }
    }

    fn sample_mock(&self) {
        use rand::Rng;
        let mut rng = rand::rng();
        let mut ledger = self.inner.lock();

        for device in ledger.devices.values_mut() {
            if device.holder.is_some() {
                device.utilization_percent = rng.random_range(70.0..95.0);
                device.memory_used_mib = device.reserved_mib + rng.random_range(100..500);
                device.temperature_c = rng.random_range(75..85);
                device.power_watts = rng.random_range(200..300);
            } else {
                device.utilization_percent = rng.random_range(5.0..20.0);
                device.memory_used_mib = rng.random_range(200..800);
                device.temperature_c = rng.random_range(40..55);
                device.power_watts = rng.random_range(50..100);
            }
            device.status = derive_status(device);
        }
    }
}

fn derive_status(device: &GpuDevice) -> GpuStatus {
    if device.holder.is_some() {
        GpuStatus::Allocated
    } else if device.utilization_percent > BUSY_UTILIZATION_PERCENT {
        GpuStatus::Busy
    } else {
        GpuStatus::Available
    }
}

fn discover_nvml(nvml: &Nvml) -> std::result::Result<Vec<GpuDevice>, nvml_wrapper::error::NvmlError> {
    let count = nvml.device_count()?;
    let mut devices = Vec::with_capacity(count as usize);

    for index in 0..count {
        let device = nvml.device_by_index(index)?;
        let memory = device.memory_info()?;
        let utilization = device.utilization_rates().map(|u| u.gpu).unwrap_or(0);
        let temperature = device.temperature(TemperatureSensor::Gpu).unwrap_or(0);
        let power = device.power_usage().map(|mw| mw / 1000).unwrap_or(0);

        devices.push(GpuDevice {
            index,
            name: device.name()?,
            memory_total_mib: memory.total / (1024 * 1024),
            memory_used_mib: memory.used / (1024 * 1024),
            utilization_percent: utilization as f32,
            temperature_c: temperature as i32,
            power_watts: power,
            status: GpuStatus::Available,
            holder: None,
            reserved_mib: 0,
        });
    }

    Ok(devices)
}

type Sample = (u32, u64, f32, i32, u32);

fn sample_nvml(nvml: &Nvml) -> std::result::Result<Vec<Sample>, nvml_wrapper::error::NvmlError> {
    let count = nvml.device_count()?;
    let mut samples = Vec::with_capacity(count as usize);

    for index in 0..count {
        let device = nvml.device_by_index(index)?;
        let memory = device.memory_info()?;
        samples.push((
            index,
            memory.used / (1024 * 1024),
            device.utilization_rates().map(|u| u.gpu).unwrap_or(0) as f32,
            device.temperature(TemperatureSensor::Gpu).unwrap_or(0) as i32,
            device.power_usage().map(|mw| mw / 1000).unwrap_or(0),
        ));
    }

    Ok(samples)
}

const SMI_QUERY: &str =
    "--query-gpu=index,name,memory.total,memory.used,utilization.gpu,temperature.gpu,power.draw";

fn discover_smi() -> Result<Vec<GpuDevice>> {
    let output = std::process::Command::new("nvidia-smi")
        .args([SMI_QUERY, "--format=csv,noheader,nounits"])
        .output()
        .map_err(|e| Error::Device(format!("failed to run nvidia-smi: {}", e)))?;

    if !output.status.success() {
        return Err(Error::Device("nvidia-smi exited with an error".to_string()));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout.lines().filter_map(parse_smi_line).collect())
}

fn sample_smi() -> Result<Vec<Sample>> {
    discover_smi().map(|devices| {
        devices
            .into_iter()
            .map(|d| {
                (
                    d.index,
                    d.memory_used_mib,
                    d.utilization_percent,
                    d.temperature_c,
                    d.power_watts,
                )
            })
            .collect()
    })
}

fn parse_smi_line(line: &str) -> Option<GpuDevice> {
    let parts: Vec<&str> = line.split(',').map(|s| s.trim()).collect();
    if parts.len() < 7 {
        return None;
    }

    Some(GpuDevice {
        index: parts[0].parse().ok()?,
        name: parts[1].to_string(),
        memory_total_mib: parts[2].parse().unwrap_or(0),
        memory_used_mib: parts[3].parse().unwrap_or(0),
        utilization_percent: parts[4].parse().unwrap_or(0.0),
        temperature_c: parts[5].parse::<f32>().map(|t| t as i32).unwrap_or(0),
        power_watts: parts[6].parse::<f32>().map(|p| p as u32).unwrap_or(0),
        status: GpuStatus::Available,
        holder: None,
        reserved_mib: 0,
    })
}

/// Spawn the background sampling task for a manager.
pub fn spawn_sampler(manager: Arc<GpuManager>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SAMPLE_INTERVAL);
        loop {
            interval.tick().await;
            let m = manager.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || m.sample()).await {
                warn!("GPU sampler task panicked: {}", e);
            }
        }
    });
}
