// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Error taxonomy of the virtual memory manager
//! OWNERS: @kernel-mm-team
//! PUBLIC API: VmError, VmResult, VmError::status()
//! INVARIANTS: Every failed multi-step operation reports exactly one VmError after rollback

use std::io;

use thiserror::Error;

use crate::mm::page_table::MapError;

/// Errno-style values reported through [`VmError::status`].
pub mod errno {
    pub const EIO: i32 = 5;
    pub const ENOMEM: i32 = 12;
    pub const EACCES: i32 = 13;
    pub const EFAULT: i32 = 14;
    pub const EEXIST: i32 = 17;
    pub const EINVAL: i32 = 22;
}

/// Errors reported by address-space, fault and swap operations.
#[derive(Debug, Error)]
pub enum VmError {
    /// A frame, page-table page or bookkeeping node could not be allocated.
    #[error("out of memory")]
    OutOfMemory,
    /// Fixed placement overlaps an existing mapping.
    #[error("address {addr:#x} already mapped")]
    AddressConflict { addr: usize },
    /// Access is not permitted by the mapping protection.
    #[error("permission denied at {addr:#x}")]
    PermissionDenied { addr: usize },
    /// No mapping covers the address.
    #[error("no mapping at {addr:#x}")]
    Unmapped { addr: usize },
    /// Arguments supplied by the caller were invalid.
    #[error("invalid arguments")]
    InvalidArgs,
    /// Region cannot be shared into another address space.
    #[error("region is not shareable")]
    NotShareable,
    /// Region cannot be resized.
    #[error("region is not growable")]
    NotGrowable,
    /// A configured limit (stack size, swap space) would be exceeded.
    #[error("limit exceeded")]
    LimitExceeded,
    /// The address space has been released from the registry.
    #[error("invalid address-space handle")]
    InvalidHandle,
    /// Underlying page-table operation failed.
    #[error("page table: {0:?}")]
    Mapping(MapError),
    /// File or swap I/O failed.
    #[error("{op} failed: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },
}

impl From<MapError> for VmError {
    fn from(value: MapError) -> Self {
        match value {
            MapError::TableExhausted => Self::OutOfMemory,
            other => Self::Mapping(other),
        }
    }
}

impl VmError {
    pub(crate) fn io(op: &'static str, source: io::Error) -> Self {
        Self::Io { op, source }
    }

    /// Negative status code handed back across the syscall boundary.
    pub fn status(&self) -> i32 {
        let code = match self {
            VmError::OutOfMemory | VmError::LimitExceeded => errno::ENOMEM,
            VmError::AddressConflict { .. } => errno::EEXIST,
            VmError::PermissionDenied { .. } => errno::EACCES,
            VmError::Unmapped { .. } => errno::EFAULT,
            VmError::InvalidArgs
            | VmError::NotShareable
            | VmError::NotGrowable
            | VmError::InvalidHandle => errno::EINVAL,
            VmError::Mapping(MapError::Overlap) => errno::EEXIST,
            VmError::Mapping(_) => errno::EINVAL,
            VmError::Io { .. } => errno::EIO,
        };
        -code
    }
}

/// Result type for VM operations.
pub type VmResult<T> = Result<T, VmError>;
