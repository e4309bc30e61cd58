use std::{fmt, str::FromStr};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceMap {
    ForceCpu,
    Ordinal(usize),
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::Ordinal(0)
    }
}

impl fmt::Display for DeviceMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ForceCpu => f.write_str("cpu"),
            Self::Ordinal(ordinal) => write!(f, "gpu:{ordinal}"),
        }
    }
}

impl FromStr for DeviceMap {
    type Err = String;

    /// Accepts `cpu`, `gpu`, `gpu:<n>` or a bare ordinal.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "cpu" => Ok(Self::ForceCpu),
            "gpu" | "cuda" | "metal" => Ok(Self::Ordinal(0)),
            other => other
                .strip_prefix("gpu:")
                .unwrap_or(other)
                .parse()
                .map(Self::Ordinal)
                .map_err(|_| format!("invalid device `{s}`, expected cpu, gpu or gpu:<ordinal>")),
        }
    }
}
