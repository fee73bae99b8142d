use thiserror::Error;

use crate::common::types::PageId;
use crate::storage::disk::DiskManagerError;

#[derive(Error, Debug)]
pub enum BufferPoolError {
    #[error("page {0} not found in the buffer pool")]
    PageNotFound(PageId),

    #[error("page {0} is pinned")]
    PagePinned(PageId),

    #[error("page {0} is not pinned")]
    PageNotPinned(PageId),

    #[error("invalid page ID: {0}")]
    InvalidPageId(PageId),

    #[error("out of buffer: all {0} frames are pinned")]
    OutOfBuffer(usize),

    #[error("disk manager error: {0}")]
    Disk(#[from] DiskManagerError),
}
