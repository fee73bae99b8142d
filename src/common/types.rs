use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Page size in bytes (4KB)
pub const PAGE_SIZE: usize = 4096;

/// Page ID type
pub type PageId = u32;

/// Buffer pool frame ID type
pub type FrameId = u32;

/// Transaction ID type
pub type TxnId = u32;

/// Sentinel meaning "no page". Page 0 is a real page (the index directory),
/// so the sentinel lives at the top of the id space.
pub const INVALID_PAGE_ID: PageId = PageId::MAX;

/// Page 0 holds the directory of index roots.
pub const HEADER_PAGE_ID: PageId = 0;

/// Record ID: locates a tuple as (page, slot).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct Rid {
    pub page_id: PageId,
    pub slot: u32,
}

impl Rid {
    pub fn new(page_id: PageId, slot: u32) -> Self {
        Self { page_id, slot }
    }
}

impl fmt::Display for Rid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.page_id, self.slot)
    }
}

/// Page structure: a fixed-size byte buffer plus its identity. Pin counts and
/// dirty flags live in the buffer pool's frame metadata; the `RwLock` wrapping
/// a `Page` is the per-page content latch.
pub struct Page {
    pub data: [u8; PAGE_SIZE],
    pub page_id: PageId,
}

impl Page {
    pub fn new(page_id: PageId) -> Self {
        Self {
            data: [0; PAGE_SIZE],
            page_id,
        }
    }

    /// Clear content and identity, as when a frame is rebound.
    pub fn reset(&mut self) {
        self.data.fill(0);
        self.page_id = INVALID_PAGE_ID;
    }
}

/// Smart pointer to a latched page
pub type PagePtr = Arc<RwLock<Page>>;
