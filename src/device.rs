//! Compute device selection and the accelerator backend seam
//!
//! Actions name a device in their scope (`device = "cuda:1"`). The framework
//! never talks to an accelerator runtime directly; it goes through a
//! `DeviceBackend`, which hosts embed for CUDA, Metal, or nothing at all.

use anyhow::Result;
use std::fmt;
use std::str::FromStr;
use tracing::warn;

/// Device an action should run on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Device {
    /// Best accelerator available, else the host CPU
    #[default]
    Auto,
    Cpu,
    Cuda(u32),
    Mps,
}

impl Device {
    /// Parse a device selector, falling back to `Auto` for anything unknown
    pub fn parse(selector: &str) -> Self {
        match selector.parse() {
            Ok(device) => device,
            Err(e) => {
                warn!("{}, using auto", e);
                Self::Auto
            }
        }
    }

    pub fn is_accelerator(&self) -> bool {
        matches!(self, Self::Cuda(_) | Self::Mps)
    }

    /// Concrete device for this selector on `backend`
    pub fn resolve(self, backend: &dyn DeviceBackend) -> Self {
        match self {
            Self::Auto => backend.accelerator().unwrap_or(Self::Cpu),
            other => other,
        }
    }
}

impl FromStr for Device {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "auto" | "" => Ok(Self::Auto),
            "cpu" => Ok(Self::Cpu),
            "cuda" | "gpu" => Ok(Self::Cuda(0)),
            "mps" => Ok(Self::Mps),
            other => {
                if let Some(index) = other.strip_prefix("cuda:") {
                    let index = index
                        .parse()
                        .map_err(|_| anyhow::anyhow!("Invalid CUDA device index in '{}'", s))?;
                    return Ok(Self::Cuda(index));
                }
                anyhow::bail!("Unknown device '{}'", s)
            }
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda(index) => write!(f, "cuda:{}", index),
            Self::Mps => write!(f, "mps"),
        }
    }
}

/// Accelerator runtime hooks used between stages
pub trait DeviceBackend: Send + Sync {
    /// Backend name for diagnostics
    fn name(&self) -> &str;

    /// Accelerator picked for `Device::Auto`, if any
    fn accelerator(&self) -> Option<Device>;

    /// Bytes currently allocated on the accelerator
    fn allocated_bytes(&self) -> Option<u64> {
        None
    }

    /// Return cached, unused device memory to the driver
    fn empty_cache(&self) -> Result<()>;

    /// Wait for outstanding device work to finish
    fn synchronize(&self) -> Result<()>;
}

/// Backend for machines without an accelerator runtime
#[derive(Debug, Clone, Copy, Default)]
pub struct HostBackend;

impl DeviceBackend for HostBackend {
    fn name(&self) -> &str {
        "host"
    }

    fn accelerator(&self) -> Option<Device> {
        None
    }

    fn empty_cache(&self) -> Result<()> {
        Ok(())
    }

    fn synchronize(&self) -> Result<()> {
        Ok(())
    }
}
