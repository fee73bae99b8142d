use std::sync::Arc;

use log::warn;
use serde::de::DeserializeOwned;

use crate::common::types::{PageId, INVALID_PAGE_ID};
use crate::index::btree::context::PageReadGuard;
use crate::index::btree::error::BTreeError;
use crate::index::btree::node::{LeafNode, TreeNode};
use crate::index::btree::serialization::deserialize_node;
use crate::storage::buffer::BufferPoolManager;

struct IterState<K, V> {
    page_id: PageId,
    guard: PageReadGuard,
    leaf: LeafNode<K, V>,
    index: usize,
}

/// In-order scan over the leaf chain. Holds the current leaf's read latch
/// and pin; crossing to the next leaf never holds two latches at once, so a
/// scan cannot participate in a latch deadlock.
pub struct TreeIterator<K, V> {
    buffer_pool: Arc<BufferPoolManager>,
    state: Option<IterState<K, V>>,
}

impl<K, V> TreeIterator<K, V> {
    pub(crate) fn empty(buffer_pool: Arc<BufferPoolManager>) -> Self {
        Self {
            buffer_pool,
            state: None,
        }
    }

    pub(crate) fn new(
        buffer_pool: Arc<BufferPoolManager>,
        page_id: PageId,
        guard: PageReadGuard,
        leaf: LeafNode<K, V>,
        index: usize,
    ) -> Self {
        Self {
            buffer_pool,
            state: Some(IterState {
                page_id,
                guard,
                leaf,
                index,
            }),
        }
    }

    fn unpin(&self, page_id: PageId) {
        if let Err(e) = self.buffer_pool.unpin_page(page_id, false) {
            warn!("unpin of scanned page {} failed: {}", page_id, e);
        }
    }
}

impl<K, V> Iterator for TreeIterator<K, V>
where
    K: Clone + DeserializeOwned,
    V: Clone + DeserializeOwned,
{
    type Item = Result<(K, V), BTreeError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let state = self.state.as_mut()?;
            if state.index < state.leaf.keys.len() {
                let key = state.leaf.keys[state.index].clone();
                let value = state.leaf.values[state.index].clone();
                state.index += 1;
                return Some(Ok((key, value)));
            }

            // Leaf exhausted. Pin the next leaf while the current latch is
            // still held: the pin keeps the page from being deleted out from
            // under the scan, and taking a pin never waits on a page latch.
            // The latch itself is acquired only after the current one is
            // released, so a scan holds at most one page latch at a time.
            let next_page_id = state.leaf.next_page_id;
            if next_page_id == INVALID_PAGE_ID {
                let IterState { page_id, guard, .. } = self.state.take()?;
                drop(guard);
                self.unpin(page_id);
                return None;
            }
            let next_ptr = match self.buffer_pool.fetch_page(next_page_id) {
                Ok(ptr) => ptr,
                Err(e) => {
                    let IterState { page_id, guard, .. } = self.state.take()?;
                    drop(guard);
                    self.unpin(page_id);
                    return Some(Err(e.into()));
                }
            };

            let IterState { page_id, guard, .. } = self.state.take()?;
            drop(guard);
            self.unpin(page_id);
            let next_guard = next_ptr.read_arc();

            let leaf = match deserialize_node::<K, V>(&next_guard) {
                Ok(TreeNode::Leaf(leaf)) => leaf,
                Ok(TreeNode::Internal(_)) => {
                    drop(next_guard);
                    self.unpin(next_page_id);
                    return Some(Err(BTreeError::CorruptedPage(next_page_id)));
                }
                Err(e) => {
                    drop(next_guard);
                    self.unpin(next_page_id);
                    return Some(Err(e));
                }
            };

            self.state = Some(IterState {
                page_id: next_page_id,
                guard: next_guard,
                leaf,
                index: 0,
            });
        }
    }
}

impl<K, V> Drop for TreeIterator<K, V> {
    fn drop(&mut self) {
        if let Some(IterState { page_id, guard, .. }) = self.state.take() {
            drop(guard);
            self.unpin(page_id);
        }
    }
}
