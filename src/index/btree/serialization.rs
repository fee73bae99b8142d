use byteorder::{ByteOrder, LittleEndian};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::common::types::{Page, PAGE_SIZE};
use crate::index::btree::error::BTreeError;
use crate::index::btree::node::{InternalNode, LeafNode, TreeNode};

// Page layout:
// - node type: u8 (1 byte, 1 = leaf, 2 = internal, 0 = uninitialized)
// - body length: u32 (4 bytes)
// - bincode-encoded node body
const TYPE_LEAF: u8 = 1;
const TYPE_INTERNAL: u8 = 2;
const BODY_OFFSET: usize = 5;

/// Serialize a tree node into a page buffer.
pub fn serialize_node<K, V>(node: &TreeNode<K, V>, page: &mut Page) -> Result<(), BTreeError>
where
    K: Serialize,
    V: Serialize,
{
    let (type_byte, body) = match node {
        TreeNode::Leaf(leaf) => (
            TYPE_LEAF,
            bincode::serialize(leaf).map_err(|e| BTreeError::Serialization(e.to_string()))?,
        ),
        TreeNode::Internal(internal) => (
            TYPE_INTERNAL,
            bincode::serialize(internal).map_err(|e| BTreeError::Serialization(e.to_string()))?,
        ),
    };

    if BODY_OFFSET + body.len() > PAGE_SIZE {
        return Err(BTreeError::NodeTooLarge {
            page_id: node.page_id(),
            size: BODY_OFFSET + body.len(),
        });
    }

    page.data[0] = type_byte;
    LittleEndian::write_u32(&mut page.data[1..BODY_OFFSET], body.len() as u32);
    page.data[BODY_OFFSET..BODY_OFFSET + body.len()].copy_from_slice(&body);

    Ok(())
}

/// Deserialize a tree node from a page buffer.
pub fn deserialize_node<K, V>(page: &Page) -> Result<TreeNode<K, V>, BTreeError>
where
    K: DeserializeOwned,
    V: DeserializeOwned,
{
    let type_byte = page.data[0];
    let body_len = LittleEndian::read_u32(&page.data[1..BODY_OFFSET]) as usize;
    if body_len > PAGE_SIZE - BODY_OFFSET {
        return Err(BTreeError::CorruptedPage(page.page_id));
    }
    let body = &page.data[BODY_OFFSET..BODY_OFFSET + body_len];

    match type_byte {
        TYPE_LEAF => bincode::deserialize::<LeafNode<K, V>>(body)
            .map(TreeNode::Leaf)
            .map_err(|e| BTreeError::Deserialization(e.to_string())),
        TYPE_INTERNAL => bincode::deserialize::<InternalNode<K>>(body)
            .map(TreeNode::Internal)
            .map_err(|e| BTreeError::Deserialization(e.to_string())),
        _ => Err(BTreeError::CorruptedPage(page.page_id)),
    }
}

/// Rough upper bound on entries per page for fixed-width keys and values,
/// for callers that do not want to pick an order by hand.
pub fn calculate_order<K, V>() -> usize
where
    K: Serialize + Default,
    V: Serialize + Default,
{
    let key_size = bincode::serialized_size(&K::default()).unwrap_or(8) as usize;
    let value_size = bincode::serialized_size(&V::default()).unwrap_or(8) as usize;
    // Leave headroom for the node header and the vector length prefixes.
    let usable = PAGE_SIZE - 128;
    (usable / (key_size + value_size + 8)).max(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::{Rid, INVALID_PAGE_ID};
    use crate::index::btree::node::InternalNode;

    #[test]
    fn test_leaf_roundtrip() {
        let mut leaf: LeafNode<i32, Rid> = LeafNode::new(3, 9, 64);
        leaf.insert(42, Rid::new(1, 0));
        leaf.insert(7, Rid::new(1, 1));
        leaf.next_page_id = 11;

        let mut page = Page::new(3);
        serialize_node(&TreeNode::Leaf(leaf), &mut page).unwrap();

        let node: TreeNode<i32, Rid> = deserialize_node(&page).unwrap();
        match node {
            TreeNode::Leaf(l) => {
                assert_eq!(l.keys, vec![7, 42]);
                assert_eq!(l.next_page_id, 11);
                assert_eq!(l.header.parent_page_id, 9);
            }
            TreeNode::Internal(_) => panic!("expected leaf"),
        }
    }

    #[test]
    fn test_internal_roundtrip() {
        let mut internal: InternalNode<i32> = InternalNode::new(5, INVALID_PAGE_ID, 64);
        internal.populate_new_root(1, 30, 2);

        let mut page = Page::new(5);
        serialize_node::<i32, Rid>(&TreeNode::Internal(internal), &mut page).unwrap();

        let node: TreeNode<i32, Rid> = deserialize_node(&page).unwrap();
        match node {
            TreeNode::Internal(i) => {
                assert_eq!(i.children, vec![1, 2]);
                assert_eq!(*i.key_at(1), 30);
            }
            TreeNode::Leaf(_) => panic!("expected internal"),
        }
    }

    #[test]
    fn test_uninitialized_page_is_rejected() {
        let page = Page::new(8);
        let result: Result<TreeNode<i32, Rid>, _> = deserialize_node(&page);
        assert!(matches!(result, Err(BTreeError::CorruptedPage(8))));
    }

    #[test]
    fn test_calculate_order_is_reasonable() {
        let order = calculate_order::<i64, Rid>();
        assert!(order >= 4);
        assert!(order < PAGE_SIZE);
    }
}
