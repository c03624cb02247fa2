use serde::{Deserialize, Serialize};

/// Schedulable capacity along the dimensions the scheduler packs on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Resources {
    /// CPU in MHz
    pub cpu: u64,
    pub memory_mb: u64,
    pub disk_mb: u64,
    pub network_mbits: u64,
}

impl Resources {
    pub fn new(cpu: u64, memory_mb: u64, disk_mb: u64, network_mbits: u64) -> Self {
        Self {
            cpu,
            memory_mb,
            disk_mb,
            network_mbits,
        }
    }

    fn dimensions(&self) -> [(&'static str, u64); 4] {
        [
            ("cpu", self.cpu),
            ("memory", self.memory_mb),
            ("disk", self.disk_mb),
            ("network", self.network_mbits),
        ]
    }

    pub fn is_zero(&self) -> bool {
        self.dimensions().iter().all(|(_, v)| *v == 0)
    }

    pub fn add(&self, other: &Resources) -> Resources {
        Resources {
            cpu: self.cpu.saturating_add(other.cpu),
            memory_mb: self.memory_mb.saturating_add(other.memory_mb),
            disk_mb: self.disk_mb.saturating_add(other.disk_mb),
            network_mbits: self.network_mbits.saturating_add(other.network_mbits),
        }
    }

    pub fn saturating_sub(&self, other: &Resources) -> Resources {
        Resources {
            cpu: self.cpu.saturating_sub(other.cpu),
            memory_mb: self.memory_mb.saturating_sub(other.memory_mb),
            disk_mb: self.disk_mb.saturating_sub(other.disk_mb),
            network_mbits: self.network_mbits.saturating_sub(other.network_mbits),
        }
    }

    /// First dimension in which this request exceeds `available`.
    pub fn exceeded_dimension(&self, available: &Resources) -> Option<&'static str> {
        self.dimensions()
            .into_iter()
            .zip(available.dimensions())
            .find(|((_, want), (_, have))| want > have)
            .map(|((name, _), _)| name)
    }

    pub fn fits_within(&self, available: &Resources) -> bool {
        self.exceeded_dimension(available).is_none()
    }

    /// Mean utilisation of `capacity` across its non-zero dimensions.
    pub fn utilization(used: &Resources, capacity: &Resources) -> f64 {
        let mut total = 0.0;
        let mut counted = 0u32;
        for ((_, u), (_, c)) in used.dimensions().into_iter().zip(capacity.dimensions()) {
            if c > 0 {
                total += u as f64 / c as f64;
                counted += 1;
            }
        }
        if counted == 0 {
            1.0
        } else {
            total / counted as f64
        }
    }
}
