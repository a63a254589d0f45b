//! Page-permission gate.
//!
//! Under `wrprot` the region's pages stay read-only; every store must be
//! bracketed by an RW window. Two window mechanisms exist:
//!
//! - **PTE**: [`PermissionGate::open_range`] walks the covered pages and
//!   sets their write bits, clearing them again when the window drops.
//!   Cost is O(pages), which is exactly why the write buffer batches
//!   contiguous runs into one window.
//! - **CR0**: [`PermissionGate::store_permit`] models flipping the
//!   processor-wide write-protect enable inside an interrupts-off critical
//!   section. The permit is scoped to a single copy, must not nest, and
//!   must not wrap any blocking operation.
//!
//! A store that reaches the region while neither mechanism is open is a
//! fatal bug; the gate panics with the formatted invariant error.

use parking_lot::{Mutex, MutexGuard};
use pmbd_error::PmbdError;
use pmbd_types::WpMode;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::trace;

const PAGE_SIZE: usize = 4096;

#[derive(Debug)]
pub struct PermissionGate {
    enabled: bool,
    mode: WpMode,
    /// Per-page write bits (PTE mode). All clear while no window is open.
    page_writable: Box<[AtomicBool]>,
    /// Processor-global write-protect override (CR0 mode).
    cr0_open: AtomicBool,
    /// Serialises CR0 critical sections; re-entry from the same thread
    /// deadlocks, which is the nesting prohibition enforced bluntly.
    cr0_lock: Mutex<()>,
}

impl PermissionGate {
    #[must_use]
    pub fn new(len_bytes: usize, enabled: bool, mode: WpMode) -> Self {
        let num_pages = len_bytes.div_ceil(PAGE_SIZE);
        let mut pages = Vec::with_capacity(num_pages);
        pages.resize_with(num_pages, || AtomicBool::new(false));
        Self {
            enabled,
            mode,
            page_writable: pages.into_boxed_slice(),
            cr0_open: AtomicBool::new(false),
            cr0_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    #[must_use]
    pub fn mode(&self) -> WpMode {
        self.mode
    }

    fn page_span(&self, offset: usize, len: usize) -> std::ops::Range<usize> {
        if len == 0 {
            return 0..0;
        }
        let first = offset / PAGE_SIZE;
        let last = (offset + len - 1) / PAGE_SIZE;
        first..last + 1
    }

    /// Open an RW window over `[offset, offset + len)`.
    ///
    /// In PTE mode this walks and flips every covered page; in CR0 mode
    /// (and with protection disabled) it is free, because the actual
    /// permission change happens per copy via [`Self::store_permit`].
    pub fn open_range(&self, offset: usize, len: usize) -> RangeWindow<'_> {
        let pages = self.page_span(offset, len);
        let flips = if self.enabled && self.mode == WpMode::Pte {
            for page in pages.clone() {
                self.page_writable[page].store(true, Ordering::Release);
            }
            trace!(
                target: "pmbd::region",
                event = "setpages_rw",
                first_page = pages.start,
                num_pages = pages.len()
            );
            pages.len()
        } else {
            0
        };
        RangeWindow {
            gate: self,
            pages,
            flips,
        }
    }

    /// Enter the per-copy store critical section.
    ///
    /// In CR0 mode this takes the global write-protect override; in PTE
    /// mode it checks that an enclosing [`RangeWindow`] already made the
    /// destination pages writable.
    pub fn store_permit(&self, offset: usize, len: usize) -> StorePermit<'_> {
        if !self.enabled {
            return StorePermit {
                gate: None,
                cr0: None,
            };
        }
        match self.mode {
            WpMode::Cr0 => {
                let guard = self.cr0_lock.lock();
                self.cr0_open.store(true, Ordering::Release);
                StorePermit {
                    gate: Some(self),
                    cr0: Some(guard),
                }
            }
            WpMode::Pte => {
                self.assert_store_allowed(offset, len);
                StorePermit {
                    gate: None,
                    cr0: None,
                }
            }
        }
    }

    /// Verify a store into `[offset, offset + len)` is inside an RW window.
    ///
    /// Panics otherwise: the region is supposed to be read-only and the
    /// caller just behaved like a wild pointer.
    pub fn assert_store_allowed(&self, offset: usize, len: usize) {
        if !self.enabled || self.cr0_open.load(Ordering::Acquire) {
            return;
        }
        for page in self.page_span(offset, len) {
            if !self.page_writable[page].load(Ordering::Acquire) {
                panic!(
                    "{}",
                    PmbdError::InternalInvariant(format!(
                        "store into read-only page {page} outside an RW window (offset={offset} len={len})"
                    ))
                );
            }
        }
    }

    fn close_range(&self, pages: std::ops::Range<usize>) {
        for page in pages.clone() {
            self.page_writable[page].store(false, Ordering::Release);
        }
        trace!(
            target: "pmbd::region",
            event = "setpages_ro",
            first_page = pages.start,
            num_pages = pages.len()
        );
    }
}

/// PTE-mode RW window; restores the covered pages to read-only on drop.
#[must_use = "dropping the window immediately closes it"]
#[derive(Debug)]
pub struct RangeWindow<'a> {
    gate: &'a PermissionGate,
    pages: std::ops::Range<usize>,
    flips: usize,
}

impl RangeWindow<'_> {
    /// Number of pages this window flipped to RW (0 outside PTE mode).
    #[must_use]
    pub fn pages_flipped(&self) -> usize {
        self.flips
    }
}

impl Drop for RangeWindow<'_> {
    fn drop(&mut self) {
        if self.flips > 0 {
            self.gate.close_range(self.pages.clone());
        }
    }
}

/// CR0-mode store critical section; restores the write-protect enable and
/// "re-enables interrupts" on drop. Must not outlive a single copy.
#[must_use = "dropping the permit re-enables write protection"]
pub struct StorePermit<'a> {
    gate: Option<&'a PermissionGate>,
    cr0: Option<MutexGuard<'a, ()>>,
}

impl Drop for StorePermit<'_> {
    fn drop(&mut self) {
        // Clear the override before the lock is released so the next permit
        // holder never observes a stale open state.
        if let Some(gate) = self.gate {
            gate.cr0_open.store(false, Ordering::Release);
        }
        drop(self.cr0.take());
    }
}

impl std::fmt::Debug for StorePermit<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorePermit")
            .field("cr0", &self.cr0.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_gate_permits_everything() {
        let gate = PermissionGate::new(8192, false, WpMode::Pte);
        gate.assert_store_allowed(0, 8192);
        let _permit = gate.store_permit(0, 64);
    }

    #[test]
    fn pte_window_opens_and_closes_pages() {
        let gate = PermissionGate::new(4096 * 4, true, WpMode::Pte);
        {
            let window = gate.open_range(4096, 8192);
            assert_eq!(window.pages_flipped(), 2);
            gate.assert_store_allowed(4096, 8192);
        }
        // Window dropped: pages are read-only again.
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            gate.assert_store_allowed(4096, 1);
        }));
        assert!(result.is_err());
    }

    #[test]
    #[should_panic(expected = "outside an RW window")]
    fn pte_store_without_window_is_fatal() {
        let gate = PermissionGate::new(4096, true, WpMode::Pte);
        gate.assert_store_allowed(0, 64);
    }

    #[test]
    fn pte_window_spans_only_covered_pages() {
        let gate = PermissionGate::new(4096 * 4, true, WpMode::Pte);
        let _window = gate.open_range(0, 4096);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            gate.assert_store_allowed(4096, 64);
        }));
        assert!(result.is_err());
    }

    #[test]
    fn cr0_permit_allows_stores_while_held_only() {
        let gate = PermissionGate::new(4096, true, WpMode::Cr0);
        {
            let _permit = gate.store_permit(0, 4096);
            gate.assert_store_allowed(0, 4096);
        }
        // Permit dropped: the override is cleared and stores are fatal again.
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            gate.assert_store_allowed(0, 64);
        }));
        assert!(result.is_err());
    }

    #[test]
    fn cr0_open_range_is_free() {
        let gate = PermissionGate::new(4096 * 64, true, WpMode::Cr0);
        let window = gate.open_range(0, 4096 * 64);
        assert_eq!(window.pages_flipped(), 0);
    }
}
