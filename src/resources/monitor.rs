//! System-wide usage sampling for the resource monitor.
//!
//! Samplers report utilization as a share (0.0 to 1.0) of each resource
//! type. The manager combines the reading with its own allocation level.

use super::types::ResourceType;
use std::collections::HashMap;
use std::sync::RwLock;

/// Source of system-wide utilization readings
pub trait UsageSampler: Send + Sync {
    fn sample(&self) -> HashMap<ResourceType, f64>;
}

/// Reads `/proc/meminfo` and `/proc/loadavg` on Linux; reports nothing
/// elsewhere
#[derive(Debug, Clone)]
pub struct SystemUsageSampler {
    cpu_cores: u32,
}

impl SystemUsageSampler {
    pub fn new() -> Self {
        Self {
            cpu_cores: detect_cpus(),
        }
    }

    #[cfg(target_os = "linux")]
    fn read(&self) -> HashMap<ResourceType, f64> {
        let mut usage = HashMap::new();
        if let Some(memory) = std::fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|contents| parse_meminfo(&contents))
        {
            usage.insert(ResourceType::Memory, memory);
        }
        if let Some(cpu) = std::fs::read_to_string("/proc/loadavg")
            .ok()
            .and_then(|contents| parse_loadavg(&contents, self.cpu_cores))
        {
            usage.insert(ResourceType::Cpu, cpu);
        }
        usage
    }

    #[cfg(not(target_os = "linux"))]
    fn read(&self) -> HashMap<ResourceType, f64> {
        let _ = self.cpu_cores;
        HashMap::new()
    }
}

impl Default for SystemUsageSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl UsageSampler for SystemUsageSampler {
    fn sample(&self) -> HashMap<ResourceType, f64> {
        self.read()
    }
}

fn detect_cpus() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(4)
}

/// Memory utilization from `/proc/meminfo` contents
pub fn parse_meminfo(contents: &str) -> Option<f64> {
    let field = |name: &str| {
        contents
            .lines()
            .find(|line| line.starts_with(name))
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|kb| kb.parse::<f64>().ok())
    };

    let total = field("MemTotal:")?;
    let available = field("MemAvailable:").or_else(|| field("MemFree:"))?;
    if total <= 0.0 {
        return None;
    }
    Some((1.0 - available / total).clamp(0.0, 1.0))
}

/// CPU utilization estimate: 1-minute load average over core count
pub fn parse_loadavg(contents: &str, cpu_cores: u32) -> Option<f64> {
    let load = contents.split_whitespace().next()?.parse::<f64>().ok()?;
    let cores = cpu_cores.max(1) as f64;
    Some((load / cores).clamp(0.0, 1.0))
}

/// Sampler returning values set by the caller
#[derive(Debug, Default)]
pub struct FixedUsageSampler {
    values: RwLock<HashMap<ResourceType, f64>>,
}

impl FixedUsageSampler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, resource_type: ResourceType, utilization: f64) {
        if let Ok(mut values) = self.values.write() {
            values.insert(resource_type, utilization);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut values) = self.values.write() {
            values.clear();
        }
    }
}

impl UsageSampler for FixedUsageSampler {
    fn sample(&self) -> HashMap<ResourceType, f64> {
        self.values
            .read()
            .map(|values| values.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MEMINFO: &str = "MemTotal:       16000000 kB\n\
                           MemFree:         2000000 kB\n\
                           MemAvailable:    4000000 kB\n\
                           Buffers:          100000 kB\n";

    #[test]
    fn test_parse_meminfo_prefers_available() {
        let utilization = parse_meminfo(MEMINFO).unwrap();
        assert!((utilization - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_parse_meminfo_falls_back_to_free() {
        let contents = "MemTotal: 1000 kB\nMemFree: 100 kB\n";
        let utilization = parse_meminfo(contents).unwrap();
        assert!((utilization - 0.9).abs() < 1e-9);
        assert_eq!(parse_meminfo("garbage"), None);
    }

    #[test]
    fn test_parse_loadavg() {
        let contents = "2.00 1.50 1.00 3/512 12345\n";
        assert_eq!(parse_loadavg(contents, 4), Some(0.5));
        assert_eq!(parse_loadavg(contents, 1), Some(1.0));
        assert_eq!(parse_loadavg("", 4), None);
    }

    #[test]
    fn test_fixed_sampler() {
        let sampler = FixedUsageSampler::new();
        assert!(sampler.sample().is_empty());
        sampler.set(ResourceType::Memory, 0.95);
        assert_eq!(sampler.sample().get(&ResourceType::Memory), Some(&0.95));
        sampler.clear();
        assert!(sampler.sample().is_empty());
    }

    #[test]
    fn test_system_sampler_values_in_range() {
        let sampler = SystemUsageSampler::new();
        for value in sampler.sample().values() {
            assert!((0.0..=1.0).contains(value));
        }
    }
}
