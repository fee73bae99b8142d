use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use parking_lot::Mutex;
use thiserror::Error;

use crate::common::types::{Page, PageId, HEADER_PAGE_ID, INVALID_PAGE_ID, PAGE_SIZE};

#[derive(Error, Debug)]
pub enum DiskManagerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid page ID: {0}")]
    InvalidPageId(PageId),
}

/// DiskManager handles the actual page-granular file I/O. Page `n` lives at
/// byte offset `n * PAGE_SIZE`; page 0 is reserved for the index directory
/// and is never handed out by `allocate_page`.
pub struct DiskManager {
    db_file: Mutex<File>,
    free_pages: Mutex<BTreeSet<PageId>>,
}

impl DiskManager {
    /// Open (or create) the database file. A fresh file is extended to hold
    /// the directory page so that page 0 always exists.
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self, DiskManagerError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(db_path)?;

        if file.metadata()?.len() < PAGE_SIZE as u64 {
            file.set_len(PAGE_SIZE as u64)?;
        }

        Ok(Self {
            db_file: Mutex::new(file),
            free_pages: Mutex::new(BTreeSet::new()),
        })
    }

    /// Read a page from disk. Reading past the end of the file yields a
    /// zeroed page, which lets callers fetch freshly allocated pages before
    /// anything was ever written to them.
    pub fn read_page(&self, page_id: PageId, page: &mut Page) -> Result<(), DiskManagerError> {
        if page_id == INVALID_PAGE_ID {
            return Err(DiskManagerError::InvalidPageId(page_id));
        }

        let offset = page_id as u64 * PAGE_SIZE as u64;
        let mut file = self.db_file.lock();

        let file_size = file.metadata()?.len();
        if offset >= file_size {
            page.data.fill(0);
            page.page_id = page_id;
            return Ok(());
        }

        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut page.data)?;
        page.page_id = page_id;

        Ok(())
    }

    /// Write a page to disk.
    pub fn write_page(&self, page: &Page) -> Result<(), DiskManagerError> {
        if page.page_id == INVALID_PAGE_ID {
            return Err(DiskManagerError::InvalidPageId(page.page_id));
        }

        let offset = page.page_id as u64 * PAGE_SIZE as u64;
        let mut file = self.db_file.lock();

        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&page.data)?;
        file.flush()?;

        Ok(())
    }

    /// Allocate a page id, reusing a deallocated one when available and
    /// extending the file otherwise.
    pub fn allocate_page(&self) -> Result<PageId, DiskManagerError> {
        {
            let mut free = self.free_pages.lock();
            if let Some(&page_id) = free.iter().next() {
                free.remove(&page_id);
                return Ok(page_id);
            }
        }

        let mut file = self.db_file.lock();
        let file_size = file.metadata()?.len();
        let new_page_id = (file_size / PAGE_SIZE as u64) as PageId;

        file.seek(SeekFrom::End(0))?;
        let zeros = [0u8; PAGE_SIZE];
        file.write_all(&zeros)?;
        file.flush()?;

        Ok(new_page_id)
    }

    /// Return a page to the allocator. The directory page cannot be freed.
    pub fn deallocate_page(&self, page_id: PageId) -> Result<(), DiskManagerError> {
        if page_id == INVALID_PAGE_ID || page_id == HEADER_PAGE_ID {
            return Err(DiskManagerError::InvalidPageId(page_id));
        }

        self.free_pages.lock().insert(page_id);
        Ok(())
    }
}
