// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Architecture mapping primitives consumed by the VMM.

pub mod page_table;

pub use page_table::{clone_pages, MapError, PageTable, Pte, PteFlags, Sv39Table};
