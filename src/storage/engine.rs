/// Backend behind the job and file stores.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageEngine {
    Memory,
    Sled,
}

impl StorageEngine {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "memory" => Some(Self::Memory),
            "sled" => Some(Self::Sled),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Sled => "sled",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SledMode {
    LowSpace,
    HighThroughput,
}

impl SledMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "low_space" => Some(Self::LowSpace),
            "high_throughput" => Some(Self::HighThroughput),
            _ => None,
        }
    }

    pub(super) fn into_sled(self) -> sled::Mode {
        match self {
            Self::LowSpace => sled::Mode::LowSpace,
            Self::HighThroughput => sled::Mode::HighThroughput,
        }
    }
}
