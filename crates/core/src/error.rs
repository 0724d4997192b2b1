use thiserror::Error;

#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("group size {group_size} exceeds per-core capacity of {lanes_per_core} lanes")]
    CapacityExceeded { group_size: u64, lanes_per_core: u64 },

    #[error("invalid device capacity: {0}")]
    InvalidCapacity(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config I/O error: {0}")]
    ConfigIo(#[from] std::io::Error),

    #[error("failed to start {what}: {source}")]
    ThreadStart {
        what: String,
        #[source]
        source: std::io::Error,
    },
}

impl SpawnError {
    /// True for the launch-time rejection; everything else is a setup failure.
    pub fn is_capacity_exceeded(&self) -> bool {
        matches!(self, SpawnError::CapacityExceeded { .. })
    }
}
