use std::sync::Arc;

use anyhow::Result;
use tempfile::NamedTempFile;

use keeldb::index::btree::BPlusTree;
use keeldb::common::types::Rid;
use keeldb::storage::buffer::BufferPoolManager;

// Create a temporary database file for testing
#[allow(dead_code)]
pub fn create_temp_db_file() -> Result<(NamedTempFile, String)> {
    let file = NamedTempFile::new()?;
    let path = file.path().to_str().unwrap().to_string();
    Ok((file, path))
}

// Create a buffer pool manager backed by a temporary database
#[allow(dead_code)]
pub fn create_test_buffer_pool(pool_size: usize) -> Result<(Arc<BufferPoolManager>, NamedTempFile)> {
    let (file, path) = create_temp_db_file()?;
    let buffer_pool = Arc::new(BufferPoolManager::new(pool_size, path)?);
    Ok((buffer_pool, file))
}

// Create an i32 -> Rid tree with small node sizes so structural changes are
// easy to provoke
#[allow(dead_code)]
pub fn create_test_tree(
    pool_size: usize,
    leaf_max_size: usize,
    internal_max_size: usize,
) -> Result<(BPlusTree<i32, Rid>, Arc<BufferPoolManager>, NamedTempFile)> {
    let (buffer_pool, file) = create_test_buffer_pool(pool_size)?;
    let tree = BPlusTree::new("test_index", buffer_pool.clone(), leaf_max_size, internal_max_size)?;
    Ok((tree, buffer_pool, file))
}

#[allow(dead_code)]
pub fn rid(key: i32) -> Rid {
    Rid::new(key as u32, 0)
}
