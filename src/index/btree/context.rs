use std::sync::Arc;

use log::warn;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::RawRwLock;

use crate::common::types::{Page, PageId, INVALID_PAGE_ID};
use crate::storage::buffer::{BufferPoolError, BufferPoolManager};

pub(crate) type PageReadGuard = ArcRwLockReadGuard<RawRwLock, Page>;
pub(crate) type PageWriteGuard = ArcRwLockWriteGuard<RawRwLock, Page>;
pub(crate) type RootReadGuard = ArcRwLockReadGuard<RawRwLock, PageId>;
pub(crate) type RootWriteGuard = ArcRwLockWriteGuard<RawRwLock, PageId>;

/// An owned latch on a page's contents.
pub(crate) enum PageLatch {
    Read(PageReadGuard),
    Write(PageWriteGuard),
}

/// A page held by an operation: its latch, its pin, and whether its buffer
/// was mutated. Dropping the entry releases the latch; the pin is released
/// by the owning [`LatchContext`].
pub(crate) struct LatchedPage {
    pub page_id: PageId,
    latch: PageLatch,
    dirty: bool,
}

impl LatchedPage {
    pub fn new(page_id: PageId, latch: PageLatch) -> Self {
        Self {
            page_id,
            latch,
            dirty: false,
        }
    }

    pub fn page(&self) -> &Page {
        match &self.latch {
            PageLatch::Read(guard) => guard,
            PageLatch::Write(guard) => guard,
        }
    }

    /// Mutable access to the page buffer; marks the entry dirty. Returns
    /// `None` when the page is only read-latched.
    pub fn page_mut(&mut self) -> Option<&mut Page> {
        match &mut self.latch {
            PageLatch::Read(_) => None,
            PageLatch::Write(guard) => {
                self.dirty = true;
                Some(&mut **guard)
            }
        }
    }

    /// Give up the latch for hand-off to an iterator. The caller takes over
    /// the pin.
    pub fn into_read_guard(self) -> Option<PageReadGuard> {
        match self.latch {
            PageLatch::Read(guard) => Some(guard),
            PageLatch::Write(_) => None,
        }
    }
}

/// The tree-wide latch guarding the root page id.
pub(crate) enum RootLatch {
    Read(RootReadGuard),
    Write(RootWriteGuard),
}

/// Latch stack for one tree operation. Tracks the root latch, every page
/// latched (and pinned) during the descent, and pages scheduled for
/// deletion, so that all of it can be released uniformly on any exit path.
pub(crate) struct LatchContext {
    buffer_pool: Arc<BufferPoolManager>,
    root: Option<RootLatch>,
    pages: Vec<LatchedPage>,
    deleted: Vec<PageId>,
}

impl LatchContext {
    pub fn new(buffer_pool: Arc<BufferPoolManager>, root: RootLatch) -> Self {
        Self {
            buffer_pool,
            root: Some(root),
            pages: Vec::new(),
            deleted: Vec::new(),
        }
    }

    pub fn root_page_id(&self) -> PageId {
        match &self.root {
            Some(RootLatch::Read(guard)) => **guard,
            Some(RootLatch::Write(guard)) => **guard,
            None => INVALID_PAGE_ID,
        }
    }

    /// Redirect the tree's root. Only meaningful while the root latch is
    /// held in write mode, which every path that restructures the root
    /// guarantees.
    pub fn set_root_page_id(&mut self, page_id: PageId) {
        debug_assert!(matches!(self.root, Some(RootLatch::Write(_))));
        if let Some(RootLatch::Write(guard)) = &mut self.root {
            **guard = page_id;
        }
    }

    pub fn push(&mut self, page: LatchedPage) {
        self.pages.push(page);
    }

    pub fn entry_mut(&mut self, page_id: PageId) -> Option<&mut LatchedPage> {
        self.pages.iter_mut().find(|p| p.page_id == page_id)
    }

    pub fn entry(&self, page_id: PageId) -> Option<&LatchedPage> {
        self.pages.iter().find(|p| p.page_id == page_id)
    }

    pub fn contains(&self, page_id: PageId) -> bool {
        self.entry(page_id).is_some()
    }

    /// Detach the most recently latched page, transferring latch and pin to
    /// the caller.
    pub fn take_last(&mut self) -> Option<LatchedPage> {
        self.pages.pop()
    }

    /// Mark a page for deletion once every latch has been released.
    pub fn schedule_delete(&mut self, page_id: PageId) {
        self.deleted.push(page_id);
    }

    /// Drop every held latch (the root latch included) and release the pins,
    /// oldest first. Used both when a safe child lets the descent shed its
    /// ancestors and when an operation completes or unwinds.
    pub fn release_all(&mut self) {
        self.root = None;
        for entry in self.pages.drain(..) {
            let LatchedPage {
                page_id,
                latch,
                dirty,
            } = entry;
            drop(latch);
            if let Err(e) = self.buffer_pool.unpin_page(page_id, dirty) {
                warn!("unpin of page {} during latch release failed: {}", page_id, e);
            }
        }
    }

    /// Release everything, then delete the pages scheduled for removal. A
    /// page still pinned elsewhere is skipped; its delete is refused by the
    /// buffer pool and it simply stays allocated.
    pub fn finish(&mut self) {
        self.release_all();
        for page_id in std::mem::take(&mut self.deleted) {
            match self.buffer_pool.delete_page(page_id) {
                Ok(()) => {}
                Err(BufferPoolError::PagePinned(_)) => {
                    warn!("merged page {} still pinned, leaving it allocated", page_id);
                }
                Err(e) => warn!("delete of merged page {} failed: {}", page_id, e),
            }
        }
    }
}

impl Drop for LatchContext {
    fn drop(&mut self) {
        self.release_all();
    }
}
