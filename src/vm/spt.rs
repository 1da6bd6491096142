//! The supplemental page table.
//!
//! One per address space. It maps every page-aligned user address that the
//! process may legally touch to its [`Page`], whether or not the page is
//! resident. The hardware page table only ever holds a subset of it.

use super::Page;
use crate::{KernelError, addressing::Va};
use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};

/// Map from page-aligned virtual address to [`Page`].
#[derive(Default)]
pub struct SupplementalPageTable {
    pages: BTreeMap<Va, Arc<Page>>,
}

impl SupplementalPageTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `page` at its address.
    ///
    /// # Returns
    /// - `Err(KernelError::FileExist)` if the address is already taken. The
    ///   table is left unchanged.
    pub fn insert(&mut self, page: Page) -> Result<Arc<Page>, KernelError> {
        let va = page.va();
        if self.pages.contains_key(&va) {
            return Err(KernelError::FileExist);
        }
        let page = Arc::new(page);
        self.pages.insert(va, page.clone());
        Ok(page)
    }

    /// Finds the page that contains `va`.
    pub fn find(&self, va: Va) -> Option<&Arc<Page>> {
        self.pages.get(&va.page_down())
    }

    /// Removes the page that contains `va`.
    pub fn remove(&mut self, va: Va) -> Option<Arc<Page>> {
        self.pages.remove(&va.page_down())
    }

    /// Number of registered pages.
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Whether no page is registered.
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Iterates over the pages in address order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Page>> {
        self.pages.values()
    }

    /// Removes every page, returning them in address order.
    pub fn drain(&mut self) -> Vec<Arc<Page>> {
        core::mem::take(&mut self.pages).into_values().collect()
    }
}
