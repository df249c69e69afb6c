//! Registry configuration

/// Default per-subscriber packet queue capacity
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Stream registry configuration
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Packets buffered per subscriber before new packets are dropped for it
    pub queue_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl RegistryConfig {
    /// Set the per-subscriber queue capacity (minimum 1)
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }
}
