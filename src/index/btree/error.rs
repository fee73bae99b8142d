use thiserror::Error;

use crate::common::types::PageId;
use crate::storage::buffer::BufferPoolError;

#[derive(Error, Debug)]
pub enum BTreeError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("node on page {page_id} does not fit in a page ({size} bytes)")]
    NodeTooLarge { page_id: PageId, size: usize },

    #[error("corrupted tree page {0}")]
    CorruptedPage(PageId),

    #[error("tree structure invariant violated: {0}")]
    CorruptedTree(String),

    #[error("index directory error: {0}")]
    Directory(#[from] crate::storage::page::DirectoryError),

    #[error("buffer pool error: {0}")]
    BufferPool(#[from] BufferPoolError),
}
