use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::common::types::{FrameId, Page, PageId, PagePtr, INVALID_PAGE_ID};
use crate::storage::buffer::error::BufferPoolError;
use crate::storage::buffer::replacer::LruReplacer;
use crate::storage::disk::DiskManager;

#[derive(Clone, Copy)]
struct FrameMeta {
    page_id: PageId,
    pin_count: u32,
    is_dirty: bool,
}

impl FrameMeta {
    fn empty() -> Self {
        Self {
            page_id: INVALID_PAGE_ID,
            pin_count: 0,
            is_dirty: false,
        }
    }
}

struct PoolInner {
    frames: Vec<FrameMeta>,
    page_table: HashMap<PageId, FrameId>,
    free_list: VecDeque<FrameId>,
}

/// Buffer pool manager: maps page ids to in-memory frames, pins and unpins
/// resident pages, and writes dirty pages back on eviction.
///
/// The pool latch guards the page table, the free list and all frame
/// metadata. Page contents are latched per page (`PagePtr`); a frame whose
/// pin count is zero has no latch holders, so eviction I/O under the pool
/// latch never waits on a page latch.
pub struct BufferPoolManager {
    pool_size: usize,
    pages: Vec<PagePtr>,
    inner: Mutex<PoolInner>,
    replacer: LruReplacer,
    disk_manager: Arc<DiskManager>,
}

impl BufferPoolManager {
    pub fn new(pool_size: usize, db_path: impl AsRef<Path>) -> Result<Self, BufferPoolError> {
        let disk_manager = Arc::new(DiskManager::new(db_path)?);
        Ok(Self::with_disk_manager(pool_size, disk_manager))
    }

    pub fn with_disk_manager(pool_size: usize, disk_manager: Arc<DiskManager>) -> Self {
        let pages = (0..pool_size)
            .map(|_| Arc::new(RwLock::new(Page::new(INVALID_PAGE_ID))))
            .collect();
        let free_list = (0..pool_size as FrameId).collect();

        Self {
            pool_size,
            pages,
            inner: Mutex::new(PoolInner {
                frames: vec![FrameMeta::empty(); pool_size],
                page_table: HashMap::new(),
                free_list,
            }),
            replacer: LruReplacer::new(pool_size),
            disk_manager,
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Fetch a page, reading it from disk if it is not resident. The page
    /// comes back pinned; every successful fetch must be paired with exactly
    /// one `unpin_page`.
    pub fn fetch_page(&self, page_id: PageId) -> Result<PagePtr, BufferPoolError> {
        if page_id == INVALID_PAGE_ID {
            return Err(BufferPoolError::InvalidPageId(page_id));
        }

        let mut inner = self.inner.lock();

        if let Some(&frame_id) = inner.page_table.get(&page_id) {
            inner.frames[frame_id as usize].pin_count += 1;
            self.replacer.pin(frame_id);
            return Ok(self.pages[frame_id as usize].clone());
        }

        let frame_id = self.take_victim(&mut inner)?;
        if let Err(e) = self.rebind_frame(&mut inner, frame_id, page_id) {
            self.return_frame(&mut inner, frame_id);
            return Err(e);
        }

        {
            let mut page = self.pages[frame_id as usize].write();
            if let Err(e) = self.disk_manager.read_page(page_id, &mut page) {
                page.reset();
                inner.page_table.remove(&page_id);
                inner.frames[frame_id as usize] = FrameMeta::empty();
                inner.free_list.push_back(frame_id);
                return Err(e.into());
            }
        }

        let meta = &mut inner.frames[frame_id as usize];
        meta.page_id = page_id;
        meta.pin_count = 1;
        meta.is_dirty = false;
        self.replacer.pin(frame_id);

        Ok(self.pages[frame_id as usize].clone())
    }

    /// Allocate a fresh page on disk and install it pinned, with a zeroed
    /// buffer.
    pub fn new_page(&self) -> Result<(PagePtr, PageId), BufferPoolError> {
        let mut inner = self.inner.lock();

        let frame_id = self.take_victim(&mut inner)?;
        let page_id = match self.disk_manager.allocate_page() {
            Ok(id) => id,
            Err(e) => {
                self.return_frame(&mut inner, frame_id);
                return Err(e.into());
            }
        };
        if let Err(e) = self.rebind_frame(&mut inner, frame_id, page_id) {
            self.return_frame(&mut inner, frame_id);
            return Err(e);
        }

        {
            let mut page = self.pages[frame_id as usize].write();
            page.data.fill(0);
            page.page_id = page_id;
        }

        let meta = &mut inner.frames[frame_id as usize];
        meta.page_id = page_id;
        meta.pin_count = 1;
        meta.is_dirty = true;
        self.replacer.pin(frame_id);

        Ok((self.pages[frame_id as usize].clone(), page_id))
    }

    /// Drop one pin on a page, folding in the caller's dirty flag. A page
    /// whose pin count reaches zero becomes an eviction candidate.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> Result<(), BufferPoolError> {
        let mut inner = self.inner.lock();

        let &frame_id = inner
            .page_table
            .get(&page_id)
            .ok_or(BufferPoolError::PageNotFound(page_id))?;
        let meta = &mut inner.frames[frame_id as usize];
        if meta.pin_count == 0 {
            return Err(BufferPoolError::PageNotPinned(page_id));
        }

        meta.pin_count -= 1;
        meta.is_dirty |= is_dirty;
        if meta.pin_count == 0 {
            self.replacer.unpin(frame_id);
        }

        Ok(())
    }

    /// Write a page back to disk and clear its dirty flag, regardless of its
    /// pin count. The frame is held pinned for the duration of the write so
    /// it cannot be rebound underneath the I/O.
    pub fn flush_page(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        let frame_id = {
            let mut inner = self.inner.lock();
            let &frame_id = inner
                .page_table
                .get(&page_id)
                .ok_or(BufferPoolError::PageNotFound(page_id))?;
            let meta = &mut inner.frames[frame_id as usize];
            meta.pin_count += 1;
            if meta.pin_count == 1 {
                self.replacer.pin(frame_id);
            }
            frame_id
        };

        let result = {
            let page = self.pages[frame_id as usize].read();
            self.disk_manager.write_page(&page)
        };

        let mut inner = self.inner.lock();
        let meta = &mut inner.frames[frame_id as usize];
        if result.is_ok() {
            meta.is_dirty = false;
        }
        meta.pin_count -= 1;
        if meta.pin_count == 0 {
            self.replacer.unpin(frame_id);
        }

        result.map_err(Into::into)
    }

    /// Flush every resident dirty page.
    pub fn flush_all_pages(&self) -> Result<(), BufferPoolError> {
        let dirty_pages: Vec<PageId> = {
            let inner = self.inner.lock();
            inner
                .frames
                .iter()
                .filter(|m| m.page_id != INVALID_PAGE_ID && m.is_dirty)
                .map(|m| m.page_id)
                .collect()
        };

        for page_id in dirty_pages {
            match self.flush_page(page_id) {
                // Evicted (and therefore written back) between the scan and
                // the flush.
                Err(BufferPoolError::PageNotFound(_)) => {}
                other => other?,
            }
        }

        Ok(())
    }

    /// Drop a page from the pool and deallocate it on disk. Deleting a page
    /// that is not resident succeeds; deleting a pinned page is refused.
    pub fn delete_page(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        let mut inner = self.inner.lock();

        let Some(&frame_id) = inner.page_table.get(&page_id) else {
            self.disk_manager.deallocate_page(page_id)?;
            return Ok(());
        };

        if inner.frames[frame_id as usize].pin_count > 0 {
            return Err(BufferPoolError::PagePinned(page_id));
        }

        inner.page_table.remove(&page_id);
        inner.frames[frame_id as usize] = FrameMeta::empty();
        self.replacer.pin(frame_id);
        self.pages[frame_id as usize].write().reset();
        inner.free_list.push_back(frame_id);

        self.disk_manager.deallocate_page(page_id)?;
        Ok(())
    }

    /// Hand a frame back after a failed rebind: a frame that still holds a
    /// page goes back to the replacer, an unbound one to the free list.
    fn return_frame(&self, inner: &mut MutexGuard<'_, PoolInner>, frame_id: FrameId) {
        if inner.frames[frame_id as usize].page_id != INVALID_PAGE_ID {
            self.replacer.unpin(frame_id);
        } else {
            inner.free_list.push_back(frame_id);
        }
    }

    /// Pick a frame for a new binding: free list first, then the replacer.
    fn take_victim(&self, inner: &mut MutexGuard<'_, PoolInner>) -> Result<FrameId, BufferPoolError> {
        if let Some(frame_id) = inner.free_list.pop_front() {
            return Ok(frame_id);
        }
        self.replacer
            .victim()
            .ok_or(BufferPoolError::OutOfBuffer(self.pool_size))
    }

    /// Write back the frame's current page if dirty and clear the binding.
    /// On return the frame is unbound and the buffer zeroed.
    fn rebind_frame(
        &self,
        inner: &mut MutexGuard<'_, PoolInner>,
        frame_id: FrameId,
        new_page_id: PageId,
    ) -> Result<(), BufferPoolError> {
        let meta = inner.frames[frame_id as usize];
        if meta.page_id != INVALID_PAGE_ID {
            if meta.is_dirty {
                debug!("evicting dirty page {} for page {}", meta.page_id, new_page_id);
                let page = self.pages[frame_id as usize].read();
                if let Err(e) = self.disk_manager.write_page(&page) {
                    warn!("write-back of page {} failed: {}", meta.page_id, e);
                    return Err(e.into());
                }
            }
            inner.page_table.remove(&meta.page_id);
        }

        self.pages[frame_id as usize].write().reset();
        inner.frames[frame_id as usize] = FrameMeta::empty();
        inner.page_table.insert(new_page_id, frame_id);

        Ok(())
    }
}
