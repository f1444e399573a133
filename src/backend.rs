//! Acceleration backends and hardware-driven backend resolution
//!
//! A [`Backend`] names the build of the server binary to run. Ordering is
//! never a property of the backend itself; [`resolve_backends`] derives an
//! ordered candidate list from a [`HardwareProfile`], with CPU always present
//! as the terminal fallback. The resolver is a pure function: identical
//! inputs always produce the identical list, which the pool relies on to
//! derive stable pool keys.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hardware::{GpuVendor, HardwareProfile, OsFamily};

/// GPU/CPU acceleration target for the inference server binary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Backend {
    Cpu,
    Cuda12,
    Cuda13,
    Vulkan,
    Metal,
    Hip,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda12 => write!(f, "cuda12"),
            Self::Cuda13 => write!(f, "cuda13"),
            Self::Vulkan => write!(f, "vulkan"),
            Self::Metal => write!(f, "metal"),
            Self::Hip => write!(f, "hip"),
        }
    }
}

impl Backend {
    /// Check that this backend can run on the given host at all.
    ///
    /// This is a coarse gate used before provisioning; a backend that passes
    /// may still fail at startup (missing driver libraries, exhausted VRAM)
    /// and falls through the normal fallback path.
    pub fn validate(&self, profile: &HardwareProfile) -> Result<()> {
        let unsupported = |reason: &str| {
            Err(Error::UnsupportedBackend {
                backend: *self,
                reason: reason.to_string(),
            })
        };

        match self {
            Backend::Cpu => Ok(()),
            Backend::Metal => {
                if profile.metal {
                    Ok(())
                } else {
                    unsupported("Metal requires Apple Silicon macOS")
                }
            }
            Backend::Cuda12 | Backend::Cuda13 => {
                if profile.gpu != GpuVendor::Nvidia {
                    return unsupported("CUDA requires an NVIDIA GPU");
                }
                let required = if *self == Backend::Cuda13 { 13 } else { 12 };
                match profile.cuda_major {
                    Some(major) if major >= required => Ok(()),
                    Some(major) => unsupported(&format!(
                        "driver supports CUDA {major}, need {required}"
                    )),
                    None => unsupported("no CUDA driver detected"),
                }
            }
            Backend::Vulkan => {
                if profile.vulkan {
                    Ok(())
                } else {
                    unsupported("no Vulkan loader detected")
                }
            }
            Backend::Hip => {
                if profile.gpu == GpuVendor::Amd && profile.hip {
                    Ok(())
                } else {
                    unsupported("HIP requires an AMD GPU with ROCm installed")
                }
            }
        }
    }
}

/// Produce the ordered backend candidate list for a host.
///
/// Priority, highest first: Metal on Apple Silicon; the highest supported
/// CUDA major descending then Vulkan on NVIDIA; HIP (Linux) or Vulkan
/// (Windows) on AMD; Vulkan on Intel or unknown GPUs that expose it. CPU is
/// always the last candidate. A pinned backend yields `[pinned, Cpu]` so a
/// terminal fallback always exists.
pub fn resolve_backends(profile: &HardwareProfile, pinned: Option<Backend>) -> Vec<Backend> {
    if let Some(backend) = pinned {
        return if backend == Backend::Cpu {
            vec![Backend::Cpu]
        } else {
            vec![backend, Backend::Cpu]
        };
    }

    let mut candidates = Vec::new();

    match profile.gpu {
        GpuVendor::Apple => {
            if profile.metal {
                candidates.push(Backend::Metal);
            }
        }
        GpuVendor::Nvidia => {
            match profile.cuda_major {
                Some(major) if major >= 13 => {
                    candidates.push(Backend::Cuda13);
                    candidates.push(Backend::Cuda12);
                }
                Some(major) if major >= 12 => candidates.push(Backend::Cuda12),
                _ => {}
            }
            if profile.vulkan {
                candidates.push(Backend::Vulkan);
            }
        }
        GpuVendor::Amd => {
            if profile.os == OsFamily::Linux && profile.hip {
                candidates.push(Backend::Hip);
            } else if profile.vulkan {
                candidates.push(Backend::Vulkan);
            }
        }
        GpuVendor::Intel => {
            if profile.vulkan {
                candidates.push(Backend::Vulkan);
            }
        }
        GpuVendor::None => {}
    }

    candidates.push(Backend::Cpu);
    candidates
}
