//! Host hardware detection
//!
//! Produces an immutable [`HardwareProfile`] snapshot: OS family, CPU
//! architecture, GPU vendor and the acceleration capabilities the host can
//! actually exercise. Detection shells out to vendor tooling and inspects
//! sysfs, so the result is cached process-wide; [`HardwareProfile::redetect`]
//! forces a fresh probe (hotplug, driver install).

use std::path::Path;
use std::process::Command;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

static PROFILE_CACHE: RwLock<Option<HardwareProfile>> = RwLock::new(None);

/// Operating system family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OsFamily {
    Linux,
    Macos,
    Windows,
}

impl std::fmt::Display for OsFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Linux => write!(f, "linux"),
            Self::Macos => write!(f, "macos"),
            Self::Windows => write!(f, "win"),
        }
    }
}

/// CPU architecture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CpuArch {
    X64,
    Arm64,
}

impl std::fmt::Display for CpuArch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::X64 => write!(f, "x64"),
            Self::Arm64 => write!(f, "arm64"),
        }
    }
}

/// GPU vendor present on the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GpuVendor {
    None,
    Nvidia,
    Amd,
    Intel,
    Apple,
}

/// Immutable snapshot of the host's compute capabilities
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareProfile {
    pub os: OsFamily,
    pub arch: CpuArch,
    pub gpu: GpuVendor,
    /// Total GPU memory in MiB, when the vendor tooling reports it
    pub vram_mb: Option<u64>,
    /// Highest CUDA major version the installed driver supports
    pub cuda_major: Option<u32>,
    /// Metal is available (Apple Silicon macOS)
    pub metal: bool,
    /// A Vulkan loader is installed and a GPU is present
    pub vulkan: bool,
    /// A ROCm/HIP runtime is installed (Linux AMD)
    pub hip: bool,
}

impl HardwareProfile {
    /// Detect the host profile, probing at most once per process.
    pub fn detect() -> Self {
        if let Some(profile) = PROFILE_CACHE.read().clone() {
            return profile;
        }
        let profile = Self::probe();
        *PROFILE_CACHE.write() = Some(profile.clone());
        profile
    }

    /// Discard the cached snapshot and probe again.
    pub fn redetect() -> Self {
        let profile = Self::probe();
        *PROFILE_CACHE.write() = Some(profile.clone());
        profile
    }

    /// Platform identifier used to key the binary cache, e.g. `linux-x64`.
    pub fn platform(&self) -> String {
        format!("{}-{}", self.os, self.arch)
    }

    /// A profile with no GPU at all; CPU inference only.
    pub fn cpu_only(os: OsFamily, arch: CpuArch) -> Self {
        Self {
            os,
            arch,
            gpu: GpuVendor::None,
            vram_mb: None,
            cuda_major: None,
            metal: false,
            vulkan: false,
            hip: false,
        }
    }

    fn probe() -> Self {
        let os = current_os();
        let arch = current_arch();

        let mut profile = Self::cpu_only(os, arch);

        if os == OsFamily::Macos && arch == CpuArch::Arm64 {
            profile.gpu = GpuVendor::Apple;
            profile.metal = true;
            tracing::debug!(profile = ?profile, "detected Apple Silicon host");
            return profile;
        }

        if let Some((vram_mb, cuda_major)) = probe_nvidia() {
            profile.gpu = GpuVendor::Nvidia;
            profile.vram_mb = vram_mb;
            profile.cuda_major = cuda_major;
        } else if os == OsFamily::Linux {
            match probe_drm_vendor() {
                Some(GpuVendor::Amd) => {
                    profile.gpu = GpuVendor::Amd;
                    profile.hip = Path::new("/opt/rocm").exists();
                }
                Some(vendor) => profile.gpu = vendor,
                None => {}
            }
        }

        profile.vulkan = profile.gpu != GpuVendor::None && vulkan_loader_present(os);

        tracing::debug!(
            gpu = ?profile.gpu,
            vram_mb = ?profile.vram_mb,
            cuda_major = ?profile.cuda_major,
            vulkan = profile.vulkan,
            hip = profile.hip,
            "hardware detection complete"
        );
        profile
    }
}

fn current_os() -> OsFamily {
    if cfg!(target_os = "macos") {
        OsFamily::Macos
    } else if cfg!(target_os = "windows") {
        OsFamily::Windows
    } else {
        OsFamily::Linux
    }
}

fn current_arch() -> CpuArch {
    if cfg!(target_arch = "aarch64") {
        CpuArch::Arm64
    } else {
        CpuArch::X64
    }
}

/// Query `nvidia-smi` for VRAM and the driver's CUDA major version.
///
/// Returns `None` when the tool is missing or fails, which is the normal
/// case on hosts without an NVIDIA driver.
fn probe_nvidia() -> Option<(Option<u64>, Option<u32>)> {
    let output = Command::new("nvidia-smi")
        .args(["--query-gpu=memory.total", "--format=csv,noheader,nounits"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let vram_mb = stdout
        .lines()
        .next()
        .and_then(|line| line.trim().parse::<u64>().ok());

    // The summary header carries "CUDA Version: NN.N"
    let cuda_major = Command::new("nvidia-smi")
        .output()
        .ok()
        .filter(|out| out.status.success())
        .and_then(|out| parse_cuda_major(&String::from_utf8_lossy(&out.stdout)));

    Some((vram_mb, cuda_major))
}

fn parse_cuda_major(text: &str) -> Option<u32> {
    let idx = text.find("CUDA Version:")?;
    let rest = text[idx + "CUDA Version:".len()..].trim_start();
    let version: String = rest
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    version.split('.').next()?.parse().ok()
}

/// Scan DRM device vendor ids on Linux (0x1002 AMD, 0x8086 Intel).
fn probe_drm_vendor() -> Option<GpuVendor> {
    let entries = std::fs::read_dir("/sys/class/drm").ok()?;
    for entry in entries.flatten() {
        let vendor_path = entry.path().join("device/vendor");
        let Ok(vendor) = std::fs::read_to_string(&vendor_path) else {
            continue;
        };
        match vendor.trim() {
            "0x1002" => return Some(GpuVendor::Amd),
            "0x8086" => return Some(GpuVendor::Intel),
            "0x10de" => return Some(GpuVendor::Nvidia),
            _ => {}
        }
    }
    None
}

fn vulkan_loader_present(os: OsFamily) -> bool {
    match os {
        OsFamily::Linux => [
            "/usr/lib/x86_64-linux-gnu/libvulkan.so.1",
            "/usr/lib/aarch64-linux-gnu/libvulkan.so.1",
            "/usr/lib64/libvulkan.so.1",
            "/usr/lib/libvulkan.so.1",
        ]
        .iter()
        .any(|p| Path::new(p).exists()),
        // The loader ships with every driver on Windows
        OsFamily::Windows => true,
        // MoltenVK is not a supported target; Metal covers macOS
        OsFamily::Macos => false,
    }
}
