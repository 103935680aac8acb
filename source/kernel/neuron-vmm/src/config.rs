// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Tunables for the virtual memory manager, loadable from TOML
//! OWNERS: @kernel-mm-team
//! PUBLIC API: VmConfig, VmConfig::from_toml_str(), VmConfig::validate(), ConfigError
//! INVARIANTS: user_base < stack_top <= user_top; every address page aligned

use serde::Deserialize;
use thiserror::Error;

use crate::types::{is_page_aligned, PAGE_SIZE};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse vmm config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid vmm config: {0}")]
    Invalid(&'static str),
}

/// Layout and capacity settings shared by every address space of a [`crate::Vmm`].
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VmConfig {
    /// Lowest user virtual address handed out by the free-area allocator.
    pub user_base: usize,
    /// One past the highest user virtual address.
    pub user_top: usize,
    /// Top of the stack area; stacks are carved downward from here.
    pub stack_top: usize,
    /// Maximum size of a single stack, in pages.
    pub max_stack_pages: usize,
    /// Unmapped pages kept below every stack reservation.
    pub stack_guard_pages: usize,
    /// Number of page-sized blocks in the swap file.
    pub swap_blocks: usize,
    /// Maximum number of distinct frames tracked by the copy-on-write table.
    pub cow_capacity: usize,
    /// Page-table pages each address space may allocate (`None` = unbounded).
    pub max_table_pages: Option<usize>,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            user_base: 0x0001_0000,
            user_top: 0x40_0000_0000,
            stack_top: 0x3f_ff00_0000,
            max_stack_pages: 256,
            stack_guard_pages: 1,
            swap_blocks: 4096,
            cow_capacity: 1 << 16,
            max_table_pages: None,
        }
    }
}

impl VmConfig {
    /// Parses and validates a TOML document; missing keys keep their defaults.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: VmConfig = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_page_aligned(self.user_base)
            || !is_page_aligned(self.user_top)
            || !is_page_aligned(self.stack_top)
        {
            return Err(ConfigError::Invalid("addresses must be page aligned"));
        }
        if self.user_base >= self.stack_top || self.stack_top > self.user_top {
            return Err(ConfigError::Invalid("expected user_base < stack_top <= user_top"));
        }
        if self.max_stack_pages == 0 {
            return Err(ConfigError::Invalid("max_stack_pages must be non-zero"));
        }
        let stack_area = (self.max_stack_pages + self.stack_guard_pages)
            .checked_mul(PAGE_SIZE)
            .ok_or(ConfigError::Invalid("stack reservation overflows"))?;
        if stack_area > self.stack_top - self.user_base {
            return Err(ConfigError::Invalid("stack reservation larger than user space"));
        }
        Ok(())
    }

    /// Bytes reserved for one stack including its guard gap.
    pub(crate) fn stack_reservation(&self) -> usize {
        (self.max_stack_pages + self.stack_guard_pages) * PAGE_SIZE
    }
}
