// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: NEURON per-process virtual memory manager (host-first library)
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Vmm, AddressSpace, MapRequest, Region, CowTable, SwapManager, VmConfig, VmError
//! DEPENDS_ON: bitflags, log, parking_lot, rand, serde/toml, thiserror
//! INVARIANTS: no frame is leaked or freed twice; lock order is address space, region,
//!             page table; every failed multi-step operation is rolled back
//!
//! Tracks which backing regions (anonymous, file-backed or device memory) are mapped
//! at which virtual addresses of which address spaces, and implements copy-on-write
//! fork, demand paging and swapping on top of the collaborator seams in [`hal`].

#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]

pub mod config;
pub mod error;
pub mod hal;
pub mod mm;
pub mod types;
pub mod vm;

pub use config::{ConfigError, VmConfig};
pub use error::{VmError, VmResult};
pub use types::{Access, FrameNo, RegionId, SpaceId, ThreadId, PAGE_SIZE};
pub use vm::address_space::{
    AddressSpace, FrameCounters, MapFlags, MapRequest, Prot, VmRegion, VmRegionInfo,
};
pub use vm::cow::CowTable;
pub use vm::fault::{FaultStatsSnapshot, Resolution};
pub use vm::region::{PageState, Region, RegionFlags};
pub use vm::swap::SwapManager;
pub use vm::{Vmm, VmmBuilder};

static_assertions::assert_impl_all!(Vmm: Send, Sync);
static_assertions::assert_impl_all!(AddressSpace: Send, Sync);
static_assertions::assert_impl_all!(Region: Send, Sync);
