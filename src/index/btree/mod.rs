pub(crate) mod context;
pub mod error;
pub mod iterator;
pub mod node;
pub mod serialization;
pub mod tree;

pub use error::BTreeError;
pub use iterator::TreeIterator;
pub use node::{InternalNode, LeafNode, TreeNode};
pub use serialization::{calculate_order, deserialize_node, serialize_node};
pub use tree::BPlusTree;
