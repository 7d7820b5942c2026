// Fault catalog and outcome classification
//
// Copyright 2025 The amdgpu-queue-reset Authors
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{collections::HashMap, fmt};

use clap::ValueEnum;
use serde::Deserialize;
use thiserror::Error as ThisError;

use crate::device::{GpuInfo, IpType};

/// Faults a job can inject. `CmdStreamExecSuccess` and
/// `ShaderExecSuccess` are the well formed variants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorKind {
    CmdStreamExecSuccess = 0,
    InvalidOpcode = 1,
    InvalidPacketLength = 2,
    InvalidPacketEopQueue = 3,
    BadRegAddress = 4,
    BadMemAddress = 5,
    BadMemAddressBySync = 6,
    ShaderExecSuccess = 7,
    InvalidShader = 8,
    InvalidProgramAddr = 9,
    InvalidProgramSetting = 10,
    InvalidUserData = 11,
    DmaCorruptedHeaderHang = 12,
    DmaSlowLinearCopyHang = 13,
}

impl ErrorKind {
    pub const ALL: [Self; 14] = [
        Self::CmdStreamExecSuccess,
        Self::InvalidOpcode,
        Self::InvalidPacketLength,
        Self::InvalidPacketEopQueue,
        Self::BadRegAddress,
        Self::BadMemAddress,
        Self::BadMemAddressBySync,
        Self::ShaderExecSuccess,
        Self::InvalidShader,
        Self::InvalidProgramAddr,
        Self::InvalidProgramSetting,
        Self::InvalidUserData,
        Self::DmaCorruptedHeaderHang,
        Self::DmaSlowLinearCopyHang,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Self::CmdStreamExecSuccess => "CMD_STREAM_EXEC_SUCCESS",
            Self::InvalidOpcode => "CMD_STREAM_EXEC_INVALID_OPCODE",
            Self::InvalidPacketLength => "CMD_STREAM_EXEC_INVALID_PACKET_LENGTH",
            Self::InvalidPacketEopQueue => "CMD_STREAM_EXEC_INVALID_PACKET_EOP_QUEUE",
            Self::BadRegAddress => "CMD_STREAM_TRANS_BAD_REG_ADDRESS",
            Self::BadMemAddress => "CMD_STREAM_TRANS_BAD_MEM_ADDRESS",
            Self::BadMemAddressBySync => "CMD_STREAM_TRANS_BAD_MEM_ADDRESS_BY_SYNC",
            Self::ShaderExecSuccess => "BACKEND_SE_GC_SHADER_EXEC_SUCCESS",
            Self::InvalidShader => "BACKEND_SE_GC_SHADER_INVALID_SHADER",
            Self::InvalidProgramAddr => "BACKEND_SE_GC_SHADER_INVALID_PROGRAM_ADDR",
            Self::InvalidProgramSetting => "BACKEND_SE_GC_SHADER_INVALID_PROGRAM_SETTING",
            Self::InvalidUserData => "BACKEND_SE_GC_SHADER_INVALID_USER_DATA",
            Self::DmaCorruptedHeaderHang => "DMA_CORRUPTED_HEADER_HANG",
            Self::DmaSlowLinearCopyHang => "DMA_SLOW_LINEARCOPY_HANG",
        }
    }

    pub fn from_raw(raw: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|k| *k as u32 == raw)
    }

    /// Faults raised by the shader engines rather than the command
    /// processor.
    pub const fn is_shader_error(self) -> bool {
        matches!(
            self,
            Self::ShaderExecSuccess
                | Self::InvalidShader
                | Self::InvalidProgramAddr
                | Self::InvalidProgramSetting
                | Self::InvalidUserData
        )
    }

    pub const fn is_success(self) -> bool {
        matches!(self, Self::CmdStreamExecSuccess | Self::ShaderExecSuccess)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Recovery level a fault is expected to trigger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ExpectedResult {
    QueueReset = 1,
    GpuReset = 2,
}

impl ExpectedResult {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::QueueReset),
            2 => Some(Self::GpuReset),
            _ => None,
        }
    }
}

/// Matches a family and a half open range of external revisions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AsicFilter {
    pub family_id: u32,
    pub chip_id_begin: u32,
    pub chip_id_end: u32,
}

impl AsicFilter {
    pub fn matches(&self, info: &GpuInfo) -> bool {
        info.family_id == self.family_id
            && (self.chip_id_begin..self.chip_id_end).contains(&info.chip_external_rev)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExpectedResults {
    pub compute: ExpectedResult,
    pub gfx: ExpectedResult,
    pub sdma: Option<ExpectedResult>,
}

#[derive(Debug)]
pub struct CatalogEntry {
    pub error: ErrorKind,
    pub describe: &'static str,
    pub exclude: &'static [AsicFilter],
    pub expected: ExpectedResults,
}

impl CatalogEntry {
    pub fn name(&self) -> &'static str {
        self.error.name()
    }

    pub fn is_excluded(&self, info: &GpuInfo) -> bool {
        self.exclude.iter().any(|f| f.matches(info))
    }

    pub fn expected_for(&self, ip: IpType) -> Option<ExpectedResult> {
        match ip {
            IpType::Compute => Some(self.expected.compute),
            IpType::Gfx => Some(self.expected.gfx),
            IpType::Dma => self.expected.sdma,
            _ => None,
        }
    }

    pub fn supports(&self, ip: IpType) -> bool {
        self.expected_for(ip).is_some()
    }
}

const NAVI31: AsicFilter = AsicFilter {
    family_id: crate::asic::FAMILY_GC_11_0_0,
    chip_id_begin: 0x01,
    chip_id_end: 0x10,
};

/// Faults exercised by the queue reset suite, in run order.
pub static QUEUE_RESET_CATALOG: &[CatalogEntry] = &[
    CatalogEntry {
        error: ErrorKind::InvalidPacketLength,
        describe: "Packet length field exceeds the indirect buffer",
        exclude: &[],
        expected: ExpectedResults {
            compute: ExpectedResult::QueueReset,
            gfx: ExpectedResult::QueueReset,
            sdma: Some(ExpectedResult::QueueReset),
        },
    },
    CatalogEntry {
        error: ErrorKind::InvalidOpcode,
        describe: "Packet header carries an unassigned opcode",
        exclude: &[],
        expected: ExpectedResults {
            compute: ExpectedResult::QueueReset,
            gfx: ExpectedResult::QueueReset,
            sdma: Some(ExpectedResult::QueueReset),
        },
    },
    CatalogEntry {
        error: ErrorKind::BadMemAddressBySync,
        describe: "Register wait polls an unmapped address",
        exclude: &[NAVI31],
        expected: ExpectedResults {
            compute: ExpectedResult::GpuReset,
            gfx: ExpectedResult::GpuReset,
            sdma: Some(ExpectedResult::GpuReset),
        },
    },
    CatalogEntry {
        error: ErrorKind::BadRegAddress,
        describe: "Register write outside the register aperture",
        exclude: &[NAVI31],
        expected: ExpectedResults {
            compute: ExpectedResult::GpuReset,
            gfx: ExpectedResult::GpuReset,
            sdma: Some(ExpectedResult::GpuReset),
        },
    },
    CatalogEntry {
        error: ErrorKind::InvalidProgramAddr,
        describe: "Dispatch with the program counter in unmapped memory",
        exclude: &[],
        expected: ExpectedResults {
            compute: ExpectedResult::QueueReset,
            gfx: ExpectedResult::QueueReset,
            sdma: None,
        },
    },
    CatalogEntry {
        error: ErrorKind::InvalidProgramSetting,
        describe: "Dispatch with reserved resource bits set",
        exclude: &[NAVI31],
        expected: ExpectedResults {
            compute: ExpectedResult::QueueReset,
            gfx: ExpectedResult::GpuReset,
            sdma: None,
        },
    },
    CatalogEntry {
        error: ErrorKind::InvalidUserData,
        describe: "Dispatch reading user data from unmapped memory",
        exclude: &[],
        expected: ExpectedResults {
            compute: ExpectedResult::QueueReset,
            gfx: ExpectedResult::QueueReset,
            sdma: None,
        },
    },
    CatalogEntry {
        error: ErrorKind::InvalidShader,
        describe: "Shader code without an end of program instruction",
        exclude: &[],
        expected: ExpectedResults {
            compute: ExpectedResult::QueueReset,
            gfx: ExpectedResult::QueueReset,
            sdma: None,
        },
    },
];

pub fn entry(kind: ErrorKind) -> Option<&'static CatalogEntry> {
    QUEUE_RESET_CATALOG.iter().find(|e| e.error == kind)
}

pub fn entry_by_name(name: &str) -> Option<&'static CatalogEntry> {
    QUEUE_RESET_CATALOG.iter().find(|e| e.name() == name)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Classification {
    pub is_shader_error: bool,
    pub expected_outcome_by_ip: HashMap<IpType, ExpectedResult>,
}

pub fn classify(kind: ErrorKind) -> Classification {
    let mut expected_outcome_by_ip = HashMap::new();
    if let Some(entry) = entry(kind) {
        for ip in [IpType::Gfx, IpType::Compute, IpType::Dma] {
            if let Some(expected) = entry.expected_for(ip) {
                expected_outcome_by_ip.insert(ip, expected);
            }
        }
    }

    Classification {
        is_shader_error: kind.is_shader_error(),
        expected_outcome_by_ip,
    }
}

/// A unit of GPU work handed to a role for one round.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Job {
    pub error: ErrorKind,
    pub ip: IpType,
    pub ring_id: u32,
    pub expected: Option<ExpectedResult>,
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {} ring {}", self.error, self.ip, self.ring_id)
    }
}

/// What the monitor does with the error code a faulting job reported
/// while the context shows a reset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MonitorAction {
    /// Queue level recovery finished.
    QueueReset,
    /// Keep watching for a full GPU reset.
    Escalate,
    /// Treat as a failed GPU reset.
    GpuResetFailure,
}

#[derive(Debug, ThisError, PartialEq, Eq)]
pub enum OutcomeMapError {
    #[error("Unknown errno name '{0}'")]
    UnknownErrno(String),
}

/// One configured row of the outcome map.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct OutcomeRule {
    pub errno: String,
    pub action: MonitorAction,
    #[serde(default)]
    pub family: Option<u32>,
}

pub fn errno_from_name(name: &str) -> Result<i32, OutcomeMapError> {
    Ok(match name {
        "ENODATA" => libc::ENODATA,
        "ETIME" => libc::ETIME,
        "ETIMEDOUT" => libc::ETIMEDOUT,
        "ECANCELED" => libc::ECANCELED,
        "EHWPOISON" => libc::EHWPOISON,
        "EIO" => libc::EIO,
        "EINVAL" => libc::EINVAL,
        "ENOMEM" => libc::ENOMEM,
        "EDEADLK" => libc::EDEADLK,
        _ => return Err(OutcomeMapError::UnknownErrno(name.to_string())),
    })
}

/// Maps the errno of a faulting job to the monitor's next move.
///
/// Codes are positive errno values. Rules scoped to a family win over the
/// defaults, anything unmatched escalates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutcomeMap {
    defaults: HashMap<i32, MonitorAction>,
    per_family: HashMap<(u32, i32), MonitorAction>,
    fallback: MonitorAction,
}

impl Default for OutcomeMap {
    fn default() -> Self {
        Self {
            defaults: HashMap::from([(libc::ENODATA, MonitorAction::QueueReset)]),
            per_family: HashMap::new(),
            fallback: MonitorAction::Escalate,
        }
    }
}

impl OutcomeMap {
    pub fn from_rules(rules: &[OutcomeRule]) -> Result<Self, OutcomeMapError> {
        let mut map = Self::default();
        for rule in rules {
            let errno = errno_from_name(&rule.errno)?;
            match rule.family {
                Some(family) => map.per_family.insert((family, errno), rule.action),
                None => map.defaults.insert(errno, rule.action),
            };
        }
        Ok(map)
    }

    /// `code` is the job status, zero or a negative errno.
    pub fn action(&self, family_id: u32, code: i32) -> MonitorAction {
        let errno = code.saturating_abs();
        self.per_family
            .get(&(family_id, errno))
            .or_else(|| self.defaults.get(&errno))
            .copied()
            .unwrap_or(self.fallback)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::asic::{FAMILY_GC_11_0_0, FAMILY_NV};

    #[test]
    fn test_error_kind_raw() {
        for kind in ErrorKind::ALL {
            assert_eq!(ErrorKind::from_raw(kind as u32), Some(kind));
        }
        assert_eq!(ErrorKind::from_raw(14), None);
        assert!(ErrorKind::InvalidShader.is_shader_error());
        assert!(!ErrorKind::InvalidOpcode.is_shader_error());
        assert!(!ErrorKind::DmaSlowLinearCopyHang.is_shader_error());
    }

    #[test]
    fn test_classify() {
        let c = classify(ErrorKind::InvalidProgramSetting);
        assert!(c.is_shader_error);
        assert_eq!(
            c.expected_outcome_by_ip.get(&IpType::Gfx),
            Some(&ExpectedResult::GpuReset)
        );
        assert_eq!(
            c.expected_outcome_by_ip.get(&IpType::Compute),
            Some(&ExpectedResult::QueueReset)
        );
        assert_eq!(c.expected_outcome_by_ip.get(&IpType::Dma), None);

        let c = classify(ErrorKind::CmdStreamExecSuccess);
        assert!(!c.is_shader_error);
        assert!(c.expected_outcome_by_ip.is_empty());
    }

    #[test]
    fn test_exclusion() {
        let navi31 = GpuInfo {
            family_id: FAMILY_GC_11_0_0,
            chip_external_rev: 0x01,
            ..Default::default()
        };
        let navi10 = GpuInfo {
            family_id: FAMILY_NV,
            chip_external_rev: 0x01,
            ..Default::default()
        };

        let sync = entry(ErrorKind::BadMemAddressBySync).unwrap();
        assert!(sync.is_excluded(&navi31));
        assert!(!sync.is_excluded(&navi10));
        assert!(!entry(ErrorKind::InvalidOpcode).unwrap().is_excluded(&navi31));
    }

    #[test]
    fn test_entry_lookup() {
        let e = entry_by_name("BACKEND_SE_GC_SHADER_INVALID_USER_DATA").unwrap();
        assert_eq!(e.error, ErrorKind::InvalidUserData);
        assert!(!e.supports(IpType::Dma));
        assert!(entry_by_name("NOPE").is_none());
    }

    #[test]
    fn test_outcome_map_defaults() {
        let map = OutcomeMap::default();
        assert_eq!(
            map.action(FAMILY_NV, -libc::ENODATA),
            MonitorAction::QueueReset
        );
        assert_eq!(map.action(FAMILY_NV, -libc::ETIME), MonitorAction::Escalate);
        assert_eq!(map.action(FAMILY_NV, 0), MonitorAction::Escalate);
    }

    #[test]
    fn test_outcome_map_rules() {
        let rules = vec![
            OutcomeRule {
                errno: "ETIME".to_string(),
                action: MonitorAction::GpuResetFailure,
                family: Some(FAMILY_GC_11_0_0),
            },
            OutcomeRule {
                errno: "ECANCELED".to_string(),
                action: MonitorAction::QueueReset,
                family: None,
            },
        ];
        let map = OutcomeMap::from_rules(&rules).unwrap();
        assert_eq!(
            map.action(FAMILY_GC_11_0_0, -libc::ETIME),
            MonitorAction::GpuResetFailure
        );
        assert_eq!(map.action(FAMILY_NV, -libc::ETIME), MonitorAction::Escalate);
        assert_eq!(
            map.action(FAMILY_NV, -libc::ECANCELED),
            MonitorAction::QueueReset
        );

        let bad = vec![OutcomeRule {
            errno: "EWHAT".to_string(),
            action: MonitorAction::Escalate,
            family: None,
        }];
        assert_matches!(
            OutcomeMap::from_rules(&bad),
            Err(OutcomeMapError::UnknownErrno(name)) if name == "EWHAT"
        );
    }
}
