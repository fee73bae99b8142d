use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::common::types::{PageId, PagePtr, HEADER_PAGE_ID, INVALID_PAGE_ID};
use crate::index::btree::context::{LatchContext, LatchedPage, PageLatch, RootLatch};
use crate::index::btree::error::BTreeError;
use crate::index::btree::iterator::TreeIterator;
use crate::index::btree::node::{InternalNode, LeafNode, TreeNode};
use crate::index::btree::serialization::{deserialize_node, serialize_node};
use crate::storage::buffer::BufferPoolManager;
use crate::storage::page::IndexDirectory;

#[derive(Clone, Copy, PartialEq, Eq)]
enum TreeOp {
    Find,
    Insert,
    Delete,
}

/// Concurrent B+ tree over buffer pool pages. Unique keys only.
///
/// Descents use latch crabbing: a child is latched before its parent is
/// released, and during writes the ancestors stay latched until the child is
/// known safe (its mutation cannot propagate upward). The tree-wide root
/// latch guards the root page id and follows the same release policy.
pub struct BPlusTree<K, V> {
    index_name: String,
    buffer_pool: Arc<BufferPoolManager>,
    root_page_id: Arc<RwLock<PageId>>,
    leaf_max_size: usize,
    internal_max_size: usize,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> BPlusTree<K, V>
where
    K: Ord + Clone + Default + Serialize + DeserializeOwned,
    V: Clone + Serialize + DeserializeOwned,
{
    /// Open the index named `index_name`, recovering its root from the
    /// directory page, or registering it if this is the first open.
    pub fn new(
        index_name: impl Into<String>,
        buffer_pool: Arc<BufferPoolManager>,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Result<Self, BTreeError> {
        let index_name = index_name.into();

        let header = buffer_pool.fetch_page(HEADER_PAGE_ID)?;
        let (root, dirtied) = {
            let mut page = header.write();
            match IndexDirectory::root_page_id(&page, &index_name) {
                Some(root) => (Ok(root), false),
                None => (
                    IndexDirectory::insert_record(&mut page, &index_name, INVALID_PAGE_ID)
                        .map(|_| INVALID_PAGE_ID),
                    true,
                ),
            }
        };
        let unpin = buffer_pool.unpin_page(HEADER_PAGE_ID, dirtied);
        let root = root?;
        unpin?;

        Ok(Self {
            index_name,
            buffer_pool,
            root_page_id: Arc::new(RwLock::new(root)),
            leaf_max_size,
            internal_max_size,
            _marker: PhantomData,
        })
    }

    pub fn is_empty(&self) -> bool {
        *self.root_page_id.read() == INVALID_PAGE_ID
    }

    pub fn root_page_id(&self) -> PageId {
        *self.root_page_id.read()
    }

    /// Point lookup.
    pub fn get_value(&self, key: &K) -> Result<Option<V>, BTreeError> {
        let mut ctx = LatchContext::new(
            self.buffer_pool.clone(),
            RootLatch::Read(self.root_page_id.read_arc()),
        );
        if ctx.root_page_id() == INVALID_PAGE_ID {
            return Ok(None);
        }

        let node = self.find_leaf(&mut ctx, Some(key), TreeOp::Find)?;
        let TreeNode::Leaf(leaf) = node else {
            return Err(descent_missed_leaf());
        };
        Ok(leaf.lookup(key).cloned())
    }

    /// Insert a key/value pair. Returns `false` if the key already exists.
    pub fn insert(&self, key: K, value: V) -> Result<bool, BTreeError> {
        let mut ctx = LatchContext::new(
            self.buffer_pool.clone(),
            RootLatch::Write(self.root_page_id.write_arc()),
        );
        if ctx.root_page_id() == INVALID_PAGE_ID {
            self.start_new_tree(&mut ctx, key, value)?;
            return Ok(true);
        }

        let node = self.find_leaf(&mut ctx, Some(&key), TreeOp::Insert)?;
        let TreeNode::Leaf(mut leaf) = node else {
            return Err(descent_missed_leaf());
        };
        if leaf.lookup(&key).is_some() {
            return Ok(false);
        }

        let size = leaf.insert(key, value);
        if size < self.leaf_max_size {
            self.write_node(&mut ctx, &TreeNode::Leaf(leaf))?;
            return Ok(true);
        }

        // The leaf filled up: move its upper half into a fresh right sibling
        // and splice the sibling into the leaf chain.
        let (new_page, new_page_id) = self.buffer_pool.new_page()?;
        let mut new_leaf = LeafNode::new(new_page_id, leaf.header.parent_page_id, self.leaf_max_size);
        leaf.move_half_to(&mut new_leaf);
        new_leaf.next_page_id = leaf.next_page_id;
        leaf.next_page_id = new_page_id;
        let separator = new_leaf.keys[0].clone();

        let mut old_node = TreeNode::Leaf(leaf);
        let mut new_node = TreeNode::Leaf(new_leaf);
        let split = self.complete_split(&mut ctx, &mut old_node, separator, &mut new_node, &new_page);
        let unpin = self.buffer_pool.unpin_page(new_page_id, true);
        split?;
        unpin?;
        Ok(true)
    }

    /// Delete a key. Absent keys are a silent no-op.
    pub fn remove(&self, key: &K) -> Result<(), BTreeError> {
        let mut ctx = LatchContext::new(
            self.buffer_pool.clone(),
            RootLatch::Write(self.root_page_id.write_arc()),
        );
        if ctx.root_page_id() == INVALID_PAGE_ID {
            return Ok(());
        }

        let node = self.find_leaf(&mut ctx, Some(key), TreeOp::Delete)?;
        let TreeNode::Leaf(mut leaf) = node else {
            return Err(descent_missed_leaf());
        };
        let Ok(index) = leaf.key_index(key) else {
            return Ok(());
        };
        leaf.remove_at(index);

        let mut node = TreeNode::Leaf(leaf);
        if Self::underflows(&node) {
            self.coalesce_or_redistribute(&mut ctx, &mut node)?;
        } else {
            self.write_node(&mut ctx, &node)?;
        }

        // Pages emptied by merges are deleted only after every latch is
        // released.
        ctx.finish();
        Ok(())
    }

    /// Iterate the whole tree in key order.
    pub fn iter(&self) -> Result<TreeIterator<K, V>, BTreeError> {
        self.make_iterator(None)
    }

    /// Iterate from the first key >= `key`.
    pub fn iter_from(&self, key: &K) -> Result<TreeIterator<K, V>, BTreeError> {
        self.make_iterator(Some(key))
    }

    fn make_iterator(&self, key: Option<&K>) -> Result<TreeIterator<K, V>, BTreeError> {
        let mut ctx = LatchContext::new(
            self.buffer_pool.clone(),
            RootLatch::Read(self.root_page_id.read_arc()),
        );
        if ctx.root_page_id() == INVALID_PAGE_ID {
            return Ok(TreeIterator::empty(self.buffer_pool.clone()));
        }

        let node = self.find_leaf(&mut ctx, key, TreeOp::Find)?;
        let TreeNode::Leaf(leaf) = node else {
            return Err(descent_missed_leaf());
        };
        let index = match key {
            Some(key) => match leaf.key_index(key) {
                Ok(index) | Err(index) => index,
            },
            None => 0,
        };

        // Hand the leaf's read latch and pin over to the iterator.
        let Some(entry) = ctx.take_last() else {
            return Err(BTreeError::CorruptedTree("descent held no leaf latch".into()));
        };
        let page_id = entry.page_id;
        let Some(guard) = entry.into_read_guard() else {
            return Err(BTreeError::CorruptedTree("leaf latched in write mode for a scan".into()));
        };
        Ok(TreeIterator::new(
            self.buffer_pool.clone(),
            page_id,
            guard,
            leaf,
            index,
        ))
    }

    /// Descend from the root to the leaf covering `key` (the leftmost leaf
    /// when `key` is `None`), latching parent before child. Ancestors are
    /// released as soon as the freshly latched child is safe for `op`; the
    /// leaf ends up as the last entry of the latch stack.
    fn find_leaf(
        &self,
        ctx: &mut LatchContext,
        key: Option<&K>,
        op: TreeOp,
    ) -> Result<TreeNode<K, V>, BTreeError> {
        let mut page_id = ctx.root_page_id();
        loop {
            let page_ptr = self.buffer_pool.fetch_page(page_id)?;
            let latch = match op {
                TreeOp::Find => PageLatch::Read(page_ptr.read_arc()),
                TreeOp::Insert | TreeOp::Delete => PageLatch::Write(page_ptr.write_arc()),
            };
            let entry = LatchedPage::new(page_id, latch);
            let node = match deserialize_node::<K, V>(entry.page()) {
                Ok(node) => node,
                Err(e) => {
                    ctx.push(entry);
                    return Err(e);
                }
            };

            if Self::is_safe(&node, op) {
                ctx.release_all();
            }
            ctx.push(entry);

            match &node {
                TreeNode::Leaf(_) => return Ok(node),
                TreeNode::Internal(internal) => {
                    page_id = match key {
                        Some(key) => internal.lookup(key),
                        None => internal.child_at(0),
                    };
                }
            }
        }
    }

    /// A node is safe when the operation cannot propagate past it: reads
    /// always, inserts when a split is impossible, deletes when neither an
    /// underflow nor a root collapse can follow.
    fn is_safe(node: &TreeNode<K, V>, op: TreeOp) -> bool {
        match op {
            TreeOp::Find => true,
            TreeOp::Insert => node.size() < node.max_size() - 1,
            TreeOp::Delete => {
                if node.is_root() {
                    if node.is_leaf() {
                        node.size() > 1
                    } else {
                        node.size() > 2
                    }
                } else {
                    node.size() > node.min_size()
                }
            }
        }
    }

    fn underflows(node: &TreeNode<K, V>) -> bool {
        if node.is_root() {
            match node {
                TreeNode::Leaf(_) => node.size() == 0,
                TreeNode::Internal(_) => node.size() < 2,
            }
        } else {
            node.size() < node.min_size()
        }
    }

    fn start_new_tree(&self, ctx: &mut LatchContext, key: K, value: V) -> Result<(), BTreeError> {
        let (page_ptr, page_id) = self.buffer_pool.new_page()?;
        let mut leaf: LeafNode<K, V> = LeafNode::new(page_id, INVALID_PAGE_ID, self.leaf_max_size);
        leaf.insert(key, value);

        let serialized = {
            let mut page = page_ptr.write();
            serialize_node(&TreeNode::Leaf(leaf), &mut page)
        };
        let unpin = self.buffer_pool.unpin_page(page_id, true);
        serialized?;
        unpin?;

        ctx.set_root_page_id(page_id);
        self.update_root_page_id(page_id)
    }

    fn complete_split(
        &self,
        ctx: &mut LatchContext,
        old_node: &mut TreeNode<K, V>,
        separator: K,
        new_node: &mut TreeNode<K, V>,
        new_page: &PagePtr,
    ) -> Result<(), BTreeError> {
        self.insert_into_parent(ctx, old_node, separator, new_node)?;
        self.write_node(ctx, old_node)?;
        let mut page = new_page.write();
        serialize_node(new_node, &mut page)
    }

    /// Hook a freshly split-off `new_node` into the tree to the right of
    /// `old_node`, growing a new root or splitting the parent as needed.
    /// Parent pointer updates are applied to `old_node`/`new_node` in
    /// memory; both are serialized by the caller afterwards.
    fn insert_into_parent(
        &self,
        ctx: &mut LatchContext,
        old_node: &mut TreeNode<K, V>,
        separator: K,
        new_node: &mut TreeNode<K, V>,
    ) -> Result<(), BTreeError> {
        if old_node.is_root() {
            let (root_page, root_page_id) = self.buffer_pool.new_page()?;
            let mut root: InternalNode<K> =
                InternalNode::new(root_page_id, INVALID_PAGE_ID, self.internal_max_size);
            root.populate_new_root(old_node.page_id(), separator, new_node.page_id());
            old_node.set_parent_page_id(root_page_id);
            new_node.set_parent_page_id(root_page_id);

            let serialized = {
                let mut page = root_page.write();
                serialize_node::<K, V>(&TreeNode::Internal(root), &mut page)
            };
            let unpin = self.buffer_pool.unpin_page(root_page_id, true);
            serialized?;
            unpin?;

            ctx.set_root_page_id(root_page_id);
            return self.update_root_page_id(root_page_id);
        }

        let parent_page_id = old_node.parent_page_id();
        let TreeNode::Internal(mut parent) = self.node_in_ctx(ctx, parent_page_id)? else {
            return Err(BTreeError::CorruptedTree(format!(
                "parent page {} is not an internal page",
                parent_page_id
            )));
        };

        let size = parent.insert_node_after(old_node.page_id(), separator, new_node.page_id());
        if size < self.internal_max_size {
            return self.write_node(ctx, &TreeNode::Internal(parent));
        }

        // The parent overflowed in turn.
        let (new_parent_page, new_parent_id) = self.buffer_pool.new_page()?;
        let split = self.split_internal(ctx, parent, old_node, new_node, new_parent_id, &new_parent_page);
        let unpin = self.buffer_pool.unpin_page(new_parent_id, true);
        split?;
        unpin?;
        Ok(())
    }

    fn split_internal(
        &self,
        ctx: &mut LatchContext,
        mut parent: InternalNode<K>,
        old_node: &mut TreeNode<K, V>,
        new_node: &mut TreeNode<K, V>,
        new_parent_id: PageId,
        new_parent_page: &PagePtr,
    ) -> Result<(), BTreeError> {
        let mut sibling: InternalNode<K> =
            InternalNode::new(new_parent_id, parent.header.parent_page_id, self.internal_max_size);
        let moved = parent.move_half_to(&mut sibling);
        let separator = sibling.key_at(0).clone();

        // Moved children now live under the new page; their parent pointers
        // follow. The in-flight nodes are updated in memory, everything else
        // on its own page.
        for child in moved {
            if child == old_node.page_id() {
                old_node.set_parent_page_id(new_parent_id);
            } else if child == new_node.page_id() {
                new_node.set_parent_page_id(new_parent_id);
            } else {
                self.repoint_parent(ctx, child, new_parent_id)?;
            }
        }

        let mut parent_node = TreeNode::Internal(parent);
        let mut sibling_node = TreeNode::Internal(sibling);
        self.insert_into_parent(ctx, &mut parent_node, separator, &mut sibling_node)?;
        self.write_node(ctx, &parent_node)?;
        let mut page = new_parent_page.write();
        serialize_node(&sibling_node, &mut page)
    }

    /// Fix up an underflowed `node`: steal from a sibling when it can spare
    /// an entry, merge otherwise, recursing when the parent underflows in
    /// turn. On return, every touched page (node included) has been written
    /// or scheduled for deletion.
    fn coalesce_or_redistribute(
        &self,
        ctx: &mut LatchContext,
        node: &mut TreeNode<K, V>,
    ) -> Result<(), BTreeError> {
        if node.is_root() {
            return self.adjust_root(ctx, node);
        }

        let parent_page_id = node.parent_page_id();
        let TreeNode::Internal(parent) = self.node_in_ctx(ctx, parent_page_id)? else {
            return Err(BTreeError::CorruptedTree(format!(
                "parent page {} is not an internal page",
                parent_page_id
            )));
        };
        let Some((sibling_id, separator_index, sibling_on_left)) = parent.sibling_of(node.page_id())
        else {
            return Err(BTreeError::CorruptedTree(format!(
                "page {} has no sibling under parent {}",
                node.page_id(),
                parent_page_id
            )));
        };

        // Latch the sibling for the duration. The parent's write latch keeps
        // every other structural operation out of this pair of subtrees.
        let sibling_ptr = self.buffer_pool.fetch_page(sibling_id)?;
        ctx.push(LatchedPage::new(
            sibling_id,
            PageLatch::Write(sibling_ptr.write_arc()),
        ));
        let mut sibling = self.node_in_ctx(ctx, sibling_id)?;

        if sibling.size() + node.size() < node.max_size() {
            self.coalesce(ctx, parent, node, &mut sibling, separator_index, sibling_on_left)
        } else {
            self.redistribute(ctx, parent, node, &mut sibling, separator_index, sibling_on_left)
        }
    }

    /// Merge the right page of the pair into the left; the right page dies
    /// and its separator leaves the parent.
    fn coalesce(
        &self,
        ctx: &mut LatchContext,
        mut parent: InternalNode<K>,
        node: &mut TreeNode<K, V>,
        sibling: &mut TreeNode<K, V>,
        separator_index: usize,
        sibling_on_left: bool,
    ) -> Result<(), BTreeError> {
        let middle_key = parent.key_at(separator_index).clone();
        let (src, dst) = if sibling_on_left {
            (node, sibling)
        } else {
            (sibling, node)
        };

        match (&mut *dst, &mut *src) {
            (TreeNode::Leaf(dst), TreeNode::Leaf(src)) => {
                src.move_all_to(dst);
            }
            (TreeNode::Internal(dst), TreeNode::Internal(src)) => {
                let dst_id = dst.header.page_id;
                for child in src.move_all_to(dst, middle_key) {
                    self.repoint_parent(ctx, child, dst_id)?;
                }
            }
            _ => {
                return Err(BTreeError::CorruptedTree(
                    "sibling pages of different kinds".into(),
                ))
            }
        }

        parent.remove(separator_index);
        ctx.schedule_delete(src.page_id());
        self.write_node(ctx, dst)?;

        let mut parent_node = TreeNode::Internal(parent);
        if Self::underflows(&parent_node) {
            self.coalesce_or_redistribute(ctx, &mut parent_node)
        } else {
            self.write_node(ctx, &parent_node)
        }
    }

    /// Move one entry across the separator and refresh the separator key in
    /// the parent.
    fn redistribute(
        &self,
        ctx: &mut LatchContext,
        mut parent: InternalNode<K>,
        node: &mut TreeNode<K, V>,
        sibling: &mut TreeNode<K, V>,
        separator_index: usize,
        sibling_on_left: bool,
    ) -> Result<(), BTreeError> {
        match (&mut *node, &mut *sibling) {
            (TreeNode::Leaf(node), TreeNode::Leaf(sibling)) => {
                if sibling_on_left {
                    sibling.move_last_to_front_of(node);
                    parent.set_key_at(separator_index, node.keys[0].clone());
                } else {
                    sibling.move_first_to_end_of(node);
                    parent.set_key_at(separator_index, sibling.keys[0].clone());
                }
            }
            (TreeNode::Internal(node), TreeNode::Internal(sibling)) => {
                let middle_key = parent.key_at(separator_index).clone();
                let node_id = node.header.page_id;
                let moved = if sibling_on_left {
                    let new_separator = sibling.key_at(sibling.size() - 1).clone();
                    let moved = sibling.move_last_to_front_of(node, middle_key);
                    parent.set_key_at(separator_index, new_separator);
                    moved
                } else {
                    let new_separator = sibling.key_at(1).clone();
                    let moved = sibling.move_first_to_end_of(node, middle_key);
                    parent.set_key_at(separator_index, new_separator);
                    moved
                };
                self.repoint_parent(ctx, moved, node_id)?;
            }
            _ => {
                return Err(BTreeError::CorruptedTree(
                    "sibling pages of different kinds".into(),
                ))
            }
        }

        self.write_node(ctx, node)?;
        self.write_node(ctx, sibling)?;
        self.write_node(ctx, &TreeNode::Internal(parent))
    }

    /// Shrink the tree at the top: an internal root left with one child
    /// hands the root role to that child, an emptied leaf root empties the
    /// tree.
    fn adjust_root(&self, ctx: &mut LatchContext, node: &mut TreeNode<K, V>) -> Result<(), BTreeError> {
        match node {
            TreeNode::Leaf(leaf) if leaf.size() == 0 => {
                let page_id = leaf.header.page_id;
                ctx.schedule_delete(page_id);
                ctx.set_root_page_id(INVALID_PAGE_ID);
                self.update_root_page_id(INVALID_PAGE_ID)
            }
            TreeNode::Internal(internal) if internal.size() <= 1 => {
                if internal.size() == 0 {
                    return Err(BTreeError::CorruptedTree(
                        "root internal page has no children".into(),
                    ));
                }
                let page_id = internal.header.page_id;
                let child = internal.remove_and_return_only_child();
                self.repoint_parent(ctx, child, INVALID_PAGE_ID)?;
                ctx.schedule_delete(page_id);
                ctx.set_root_page_id(child);
                self.update_root_page_id(child)
            }
            _ => self.write_node(ctx, node),
        }
    }

    /// Rewrite a child's parent pointer. Children latched by this operation
    /// are updated through the latch stack; anything else is latched here,
    /// which cannot deadlock because every competing latch holder either
    /// descends through the (write-latched) parent or holds no other latch.
    fn repoint_parent(
        &self,
        ctx: &mut LatchContext,
        child: PageId,
        parent: PageId,
    ) -> Result<(), BTreeError> {
        if ctx.contains(child) {
            let mut node = self.node_in_ctx(ctx, child)?;
            node.set_parent_page_id(parent);
            return self.write_node(ctx, &node);
        }

        let page_ptr = self.buffer_pool.fetch_page(child)?;
        let rewritten = {
            let mut page = page_ptr.write();
            deserialize_node::<K, V>(&page).and_then(|mut node| {
                node.set_parent_page_id(parent);
                serialize_node(&node, &mut page)
            })
        };
        let unpin = self.buffer_pool.unpin_page(child, true);
        rewritten?;
        unpin?;
        Ok(())
    }

    /// Persist the root page id under this index's name in the directory
    /// page.
    fn update_root_page_id(&self, root: PageId) -> Result<(), BTreeError> {
        let header = self.buffer_pool.fetch_page(HEADER_PAGE_ID)?;
        let updated = {
            let mut page = header.write();
            IndexDirectory::insert_record(&mut page, &self.index_name, root)
        };
        let unpin = self.buffer_pool.unpin_page(HEADER_PAGE_ID, true);
        updated?;
        unpin?;
        Ok(())
    }

    fn node_in_ctx(&self, ctx: &LatchContext, page_id: PageId) -> Result<TreeNode<K, V>, BTreeError> {
        let entry = ctx.entry(page_id).ok_or_else(|| {
            BTreeError::CorruptedTree(format!("page {} is not latched by this operation", page_id))
        })?;
        deserialize_node(entry.page())
    }

    fn write_node(&self, ctx: &mut LatchContext, node: &TreeNode<K, V>) -> Result<(), BTreeError> {
        let page_id = node.page_id();
        let entry = ctx.entry_mut(page_id).ok_or_else(|| {
            BTreeError::CorruptedTree(format!("page {} is not latched by this operation", page_id))
        })?;
        let page = entry.page_mut().ok_or_else(|| {
            BTreeError::CorruptedTree(format!("page {} is not write latched", page_id))
        })?;
        serialize_node(node, page)
    }
}

fn descent_missed_leaf() -> BTreeError {
    BTreeError::CorruptedTree("descent ended on an internal page".into())
}
