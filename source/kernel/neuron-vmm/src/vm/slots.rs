// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Growable slot allocator keyed by stable integer ids.
//!
//! Freed ids are recycled lowest-first so ids stay dense. An optional limit bounds the
//! number of live slots (used for swap blocks).

use std::collections::BinaryHeap;
use std::cmp::Reverse;

pub struct SlotTable<T> {
    slots: Vec<Option<T>>,
    free: BinaryHeap<Reverse<usize>>,
    live: usize,
    limit: Option<usize>,
}

impl<T> SlotTable<T> {
    pub fn new() -> Self {
        Self { slots: Vec::new(), free: BinaryHeap::new(), live: 0, limit: None }
    }

    pub fn with_limit(limit: usize) -> Self {
        Self { limit: Some(limit), ..Self::new() }
    }

    /// Stores `value` and returns its id, or hands the value back when full.
    pub fn insert(&mut self, value: T) -> Result<usize, T> {
        if self.limit.is_some_and(|limit| self.live >= limit) {
            return Err(value);
        }
        let index = match self.free.pop() {
            Some(Reverse(index)) => index,
            None => {
                if self.slots.try_reserve(1).is_err() {
                    return Err(value);
                }
                self.slots.push(None);
                self.slots.len() - 1
            }
        };
        self.slots[index] = Some(value);
        self.live += 1;
        Ok(index)
    }

    pub fn remove(&mut self, index: usize) -> Option<T> {
        let value = self.slots.get_mut(index)?.take()?;
        self.free.push(Reverse(index));
        self.live -= 1;
        Some(value)
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.slots.get_mut(index).and_then(Option::as_mut)
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|value| (index, value)))
    }
}

impl<T> Default for SlotTable<T> {
    fn default() -> Self {
        Self::new()
    }
}
