//! In-memory live buffers
//!
//! Each sensor gets a bounded FIFO of its most recent samples so the
//! dashboard can show fresh values without touching the store. Nothing here
//! is persisted; a restart begins with empty buffers.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, RwLock};

use crate::config::LiveConfig;
use crate::sample::{Sample, SensorId};

/// Bounded, oldest-first sequence of samples for one sensor
#[derive(Debug, Clone)]
pub struct LiveBuffer {
    samples: VecDeque<Sample>,
    capacity: usize,
}

impl LiveBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a sample, evicting the oldest one when full
    pub fn push(&mut self, sample: Sample) {
        while self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn latest(&self) -> Option<&Sample> {
        self.samples.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sample> {
        self.samples.iter()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

/// Live buffers for every registered sensor
#[derive(Debug, Clone)]
pub struct LiveCache {
    buffers: BTreeMap<SensorId, LiveBuffer>,
    capacity: usize,
}

/// Live cache shared between acquisition loops and request handlers
pub type SharedLiveCache = Arc<RwLock<LiveCache>>;

impl LiveCache {
    pub fn new(config: &LiveConfig) -> Self {
        Self {
            buffers: BTreeMap::new(),
            capacity: config.capacity.max(1),
        }
    }

    pub fn shared(config: &LiveConfig) -> SharedLiveCache {
        Arc::new(RwLock::new(Self::new(config)))
    }

    /// Allocate an empty buffer for a newly discovered sensor
    pub fn register(&mut self, sensor_id: &SensorId) {
        let capacity = self.capacity;
        self.buffers
            .entry(sensor_id.clone())
            .or_insert_with(|| LiveBuffer::new(capacity));
    }

    /// Record a sample, registering its sensor if needed
    pub fn push(&mut self, sample: Sample) {
        let capacity = self.capacity;
        self.buffers
            .entry(sample.sensor_id.clone())
            .or_insert_with(|| LiveBuffer::new(capacity))
            .push(sample);
    }

    pub fn get(&self, sensor_id: &SensorId) -> Option<&LiveBuffer> {
        self.buffers.get(sensor_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SensorId, &LiveBuffer)> {
        self.buffers.iter()
    }

    /// Latest sample of every sensor that has reported
    pub fn latest(&self) -> BTreeMap<SensorId, Sample> {
        self.buffers
            .iter()
            .filter_map(|(id, buffer)| buffer.latest().map(|s| (id.clone(), s.clone())))
            .collect()
    }

    pub fn sensor_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn total_samples(&self) -> usize {
        self.buffers.values().map(|b| b.len()).sum()
    }

    /// Empty every buffer; registered sensors stay registered
    pub fn clear(&mut self) {
        for buffer in self.buffers.values_mut() {
            buffer.clear();
        }
    }
}

impl Default for LiveCache {
    fn default() -> Self {
        Self::new(&LiveConfig::default())
    }
}
