use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use crate::common::types::{Page, PageId, PAGE_SIZE};

// Directory page layout:
// - record_count: u32 (4 bytes)
// - records: MAX_NAME_LEN name bytes (zero padded) + u32 root page id
const COUNT_SIZE: usize = 4;
const ROOT_ID_SIZE: usize = 4;

pub const MAX_NAME_LEN: usize = 32;
pub const RECORD_SIZE: usize = MAX_NAME_LEN + ROOT_ID_SIZE;
pub const MAX_RECORDS: usize = (PAGE_SIZE - COUNT_SIZE) / RECORD_SIZE;

#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("index name '{0}' is longer than {MAX_NAME_LEN} bytes")]
    NameTooLong(String),
    #[error("index directory is full ({MAX_RECORDS} entries)")]
    DirectoryFull,
    #[error("index '{0}' is not registered")]
    UnknownIndex(String),
}

/// Accessor for the directory page (page 0), which maps index names to their
/// root page ids. Operates directly on the page buffer; callers hold the
/// page latch and are responsible for pinning and dirty marking.
pub struct IndexDirectory;

impl IndexDirectory {
    pub fn record_count(page: &Page) -> usize {
        LittleEndian::read_u32(&page.data[0..COUNT_SIZE]) as usize
    }

    /// Look up the root page id registered under `name`.
    pub fn root_page_id(page: &Page, name: &str) -> Option<PageId> {
        let count = Self::record_count(page);
        (0..count)
            .find(|&i| Self::name_at(page, i) == name.as_bytes())
            .map(|i| Self::root_at(page, i))
    }

    /// Register a new `(name, root)` record. Updates in place if the name is
    /// already present.
    pub fn insert_record(page: &mut Page, name: &str, root: PageId) -> Result<(), DirectoryError> {
        if name.len() > MAX_NAME_LEN {
            return Err(DirectoryError::NameTooLong(name.to_string()));
        }
        if Self::root_page_id(page, name).is_some() {
            return Self::update_record(page, name, root);
        }

        let count = Self::record_count(page);
        if count >= MAX_RECORDS {
            return Err(DirectoryError::DirectoryFull);
        }

        let offset = Self::record_offset(count);
        page.data[offset..offset + MAX_NAME_LEN].fill(0);
        page.data[offset..offset + name.len()].copy_from_slice(name.as_bytes());
        LittleEndian::write_u32(
            &mut page.data[offset + MAX_NAME_LEN..offset + RECORD_SIZE],
            root,
        );
        LittleEndian::write_u32(&mut page.data[0..COUNT_SIZE], (count + 1) as u32);

        Ok(())
    }

    /// Rewrite the root id of an existing record.
    pub fn update_record(page: &mut Page, name: &str, root: PageId) -> Result<(), DirectoryError> {
        let count = Self::record_count(page);
        for i in 0..count {
            if Self::name_at(page, i) == name.as_bytes() {
                let offset = Self::record_offset(i);
                LittleEndian::write_u32(
                    &mut page.data[offset + MAX_NAME_LEN..offset + RECORD_SIZE],
                    root,
                );
                return Ok(());
            }
        }
        Err(DirectoryError::UnknownIndex(name.to_string()))
    }

    fn record_offset(index: usize) -> usize {
        COUNT_SIZE + index * RECORD_SIZE
    }

    fn name_at(page: &Page, index: usize) -> &[u8] {
        let offset = Self::record_offset(index);
        let name = &page.data[offset..offset + MAX_NAME_LEN];
        let len = name.iter().position(|&b| b == 0).unwrap_or(MAX_NAME_LEN);
        &name[..len]
    }

    fn root_at(page: &Page, index: usize) -> PageId {
        let offset = Self::record_offset(index);
        LittleEndian::read_u32(&page.data[offset + MAX_NAME_LEN..offset + RECORD_SIZE])
    }
}
