//! Process resource sampling for `/health`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sysinfo::{Pid, ProcessRefreshKind, System};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceSample {
    pub sampled_at: DateTime<Utc>,
    pub pid: u32,
    pub rss_bytes: u64,
    pub cpu_percent: f32,
    pub system_used_memory_bytes: u64,
    pub system_total_memory_bytes: u64,
    pub load_average_one: f64,
}

/// Keeps one `System` alive between samples; CPU usage is a delta between
/// consecutive refreshes, so the first sample always reports 0.
pub struct ResourceSampler {
    system: System,
    pid: Option<Pid>,
    latest: Option<ResourceSample>,
}

impl ResourceSampler {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            pid: sysinfo::get_current_pid().ok(),
            latest: None,
        }
    }

    pub fn sample(&mut self, now: DateTime<Utc>) -> Option<&ResourceSample> {
        let pid = self.pid?;
        self.system
            .refresh_process_specifics(pid, ProcessRefreshKind::new().with_cpu().with_memory());
        self.system.refresh_memory();

        let process = self.system.process(pid)?;
        self.latest = Some(ResourceSample {
            sampled_at: now,
            pid: pid.as_u32(),
            rss_bytes: process.memory(),
            cpu_percent: process.cpu_usage(),
            system_used_memory_bytes: self.system.used_memory(),
            system_total_memory_bytes: self.system.total_memory(),
            load_average_one: System::load_average().one,
        });
        self.latest.as_ref()
    }

    pub fn latest(&self) -> Option<&ResourceSample> {
        self.latest.as_ref()
    }
}

impl Default for ResourceSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_current_process() {
        let mut sampler = ResourceSampler::new();
        assert!(sampler.latest().is_none());

        let sample = sampler.sample(Utc::now()).cloned().expect("sample");

        assert_eq!(sample.pid, std::process::id());
        assert!(sample.rss_bytes > 0);
        assert_eq!(sampler.latest(), Some(&sample));
    }
}
