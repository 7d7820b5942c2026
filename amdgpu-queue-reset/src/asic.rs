// ASIC families, PCI addressing and reset capability detection
//
// Copyright 2025 The amdgpu-queue-reset Authors
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{
    fmt, fs,
    os::fd::AsRawFd,
    path::{Path, PathBuf},
    str::FromStr,
};

use bitflags::bitflags;
use log::{debug, warn};
use thiserror::Error as ThisError;

use crate::device::{GpuInfo, IpType};

pub const FAMILY_UNKNOWN: u32 = 0xff;
pub const FAMILY_SI: u32 = 110;
pub const FAMILY_CI: u32 = 120;
pub const FAMILY_KV: u32 = 125;
pub const FAMILY_VI: u32 = 130;
pub const FAMILY_CZ: u32 = 135;
pub const FAMILY_AI: u32 = 141;
pub const FAMILY_RV: u32 = 142;
pub const FAMILY_NV: u32 = 143;
pub const FAMILY_VGH: u32 = 144;
pub const FAMILY_GC_11_0_0: u32 = 145;
pub const FAMILY_YC: u32 = 146;
pub const FAMILY_GC_11_0_1: u32 = 148;
pub const FAMILY_GC_10_3_6: u32 = 149;
pub const FAMILY_GC_11_5_0: u32 = 150;
pub const FAMILY_GC_10_3_7: u32 = 151;
pub const FAMILY_GC_12_0_0: u32 = 152;

pub const SYSFS_PCI_DEVICES: &str = "/sys/bus/pci/devices";

#[derive(Debug, ThisError, PartialEq, Eq)]
pub enum PciAddrError {
    #[error("Malformed PCI address '{0}'")]
    Malformed(String),
    #[error("Could not resolve the PCI address of the render node: {0}")]
    Unresolved(String),
}

/// PCI location of the GPU, used to build sysfs and debugfs paths.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct PciAddr {
    pub domain: u32,
    pub bus: u32,
    pub device: u32,
    pub function: u32,
}

impl PciAddr {
    /// Resolves the address of a DRM device node through
    /// `/sys/dev/char/<major>:<minor>/device`.
    pub fn from_drm_fd(file: &impl AsRawFd) -> Result<Self, PciAddrError> {
        // SAFETY: stat is plain old data, zero is a valid bit pattern.
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        // SAFETY: the descriptor is open for the lifetime of `file` and
        // `st` is a valid out pointer.
        let ret = unsafe { libc::fstat(file.as_raw_fd(), &mut st) };
        if ret == -1 {
            return Err(PciAddrError::Unresolved(
                std::io::Error::last_os_error().to_string(),
            ));
        }

        let link = format!(
            "/sys/dev/char/{}:{}/device",
            libc::major(st.st_rdev),
            libc::minor(st.st_rdev)
        );
        let target =
            fs::read_link(&link).map_err(|e| PciAddrError::Unresolved(format!("{link}: {e}")))?;
        let name = target
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| PciAddrError::Unresolved(link.clone()))?;

        name.parse()
    }
}

impl fmt::Display for PciAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:01x}",
            self.domain, self.bus, self.device, self.function
        )
    }
}

impl FromStr for PciAddr {
    type Err = PciAddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || PciAddrError::Malformed(s.to_string());

        let (domain, rest) = s.split_once(':').ok_or_else(malformed)?;
        let (bus, rest) = rest.split_once(':').ok_or_else(malformed)?;
        let (device, function) = rest.split_once('.').ok_or_else(malformed)?;
        let hex = |v: &str| u32::from_str_radix(v, 16).map_err(|_| malformed());

        let addr = Self {
            domain: hex(domain)?,
            bus: hex(bus)?,
            device: hex(device)?,
            function: hex(function)?,
        };
        if addr.bus > 0xff || addr.device > 0x1f || addr.function > 0x7 {
            return Err(malformed());
        }

        Ok(addr)
    }
}

bitflags! {
    /// Recovery levels the kernel can apply to an engine.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ResetType: u32 {
        const FULL = 1 << 0;
        const SOFT = 1 << 1;
        const PER_QUEUE = 1 << 2;
        const PER_PIPE = 1 << 3;
    }
}

impl ResetType {
    /// Parses the space separated token list of a `*_reset_mask` file.
    pub fn parse_mask(contents: &str) -> Self {
        contents
            .split_whitespace()
            .fold(Self::empty(), |mask, token| match token {
                "full" => mask | Self::FULL,
                "soft" => mask | Self::SOFT,
                "queue" => mask | Self::PER_QUEUE,
                "pipe" => mask | Self::PER_PIPE,
                _ => mask,
            })
    }
}

fn reset_mask_file(ip: IpType) -> Option<&'static str> {
    match ip {
        IpType::Gfx => Some("gfx_reset_mask"),
        IpType::Compute => Some("compute_reset_mask"),
        IpType::Dma => Some("sdma_reset_mask"),
        IpType::VcnDec | IpType::VcnEnc => Some("vcn_reset_mask"),
        IpType::VcnJpeg => Some("jpeg_reset_mask"),
        _ => None,
    }
}

/// Reads the reset types the kernel advertises for `ip`.
///
/// `None` means the kernel exposes no mask for this engine.
pub fn reset_mask_at(root: &Path, ip: IpType, pci: &PciAddr) -> Option<ResetType> {
    let file = reset_mask_file(ip)?;
    let path: PathBuf = root.join(pci.to_string()).join(file);
    match fs::read_to_string(&path) {
        Ok(contents) => {
            let mask = ResetType::parse_mask(&contents);
            debug!("{}: {:?}", path.display(), mask);
            Some(mask)
        }
        Err(e) => {
            debug!("No reset mask at {}: {e}", path.display());
            None
        }
    }
}

pub fn reset_mask(ip: IpType, pci: &PciAddr) -> Option<ResetType> {
    reset_mask_at(Path::new(SYSFS_PCI_DEVICES), ip, pci)
}

/// True when the kernel advertises `reset_type` for `ip`. A missing or
/// unreadable mask means disabled.
pub fn is_reset_enable_at(root: &Path, ip: IpType, reset_type: ResetType, pci: &PciAddr) -> bool {
    match reset_mask_at(root, ip, pci) {
        Some(mask) => mask.contains(reset_type),
        None => {
            warn!("Reset mask for {ip} unavailable, assuming {reset_type:?} is disabled");
            false
        }
    }
}

pub fn is_reset_enable(ip: IpType, reset_type: ResetType, pci: &PciAddr) -> bool {
    is_reset_enable_at(Path::new(SYSFS_PCI_DEVICES), ip, reset_type, pci)
}

pub fn is_renoir(info: &GpuInfo) -> bool {
    info.family_id == FAMILY_RV && (0x91..0xff).contains(&info.chip_external_rev)
}

/// Whether recovery tests make sense on this ASIC at all.
///
/// Southern Islands through Volcanic Islands never recover from a hang,
/// and Raven recovers only from the Renoir stepping onward.
pub fn gpu_reset_supported(info: &GpuInfo) -> bool {
    match info.family_id {
        FAMILY_SI | FAMILY_CI | FAMILY_KV | FAMILY_VI | FAMILY_CZ | FAMILY_UNKNOWN => false,
        FAMILY_RV => is_renoir(info),
        _ => true,
    }
}
