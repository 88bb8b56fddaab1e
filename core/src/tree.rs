//! Fixed-capacity binary transaction tree.
//!
//! Transactions live in leaf nodes. The tree starts as a single empty node
//! and grows upward: when every leaf is occupied a new root is added whose
//! second child is a fully expanded empty branch, until [`MAX_DEPTH`] is
//! reached. At depth 8 the tree holds 2^8 = 256 transactions.
//!
//! Traversal is post-order (children first, then the node), which yields
//! leaves in insertion order and makes the root hash deterministic for any
//! two peers that inserted the same transaction sequence.

use serde::{Deserialize, Serialize};

use crate::md5_hex;
use crate::transaction::Transaction;

/// Maximum tree depth.
pub const MAX_DEPTH: u32 = 8;

/// A tree node: either an interior node with up to two children, or a leaf
/// holding a transaction, or still empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TreeNode {
    #[serde(rename = "_child_1")]
    pub child_1: Option<Box<TreeNode>>,
    #[serde(rename = "_child_2")]
    pub child_2: Option<Box<TreeNode>>,
    #[serde(rename = "_data")]
    pub data: Option<Transaction>,
}

impl TreeNode {
    /// Returns true if this node has no children and holds no transaction.
    pub fn is_empty(&self) -> bool {
        self.child_1.is_none() && self.child_2.is_none() && self.data.is_none()
    }

    /// Attaches `child` under this node.
    ///
    /// Returns false if the node already has two children or holds a
    /// transaction.
    pub fn add_child(&mut self, child: TreeNode) -> bool {
        if self.data.is_some() {
            return false;
        }
        if self.child_1.is_none() {
            self.child_1 = Some(Box::new(child));
            true
        } else if self.child_2.is_none() {
            self.child_2 = Some(Box::new(child));
            true
        } else {
            false
        }
    }

    /// Stores `tx` in this node if it is still completely empty.
    pub fn add_transaction(&mut self, tx: &Transaction) -> bool {
        if !self.is_empty() {
            return false;
        }
        self.data = Some(tx.clone());
        true
    }

    /// Returns the hash of this node.
    ///
    /// A leaf hashes the full JSON of its transaction; an interior node
    /// hashes the concatenation of its children's hashes, a missing child
    /// contributing the empty string.
    pub fn hash(&self) -> String {
        if let Some(tx) = &self.data {
            return tx.leaf_hash();
        }
        let mut concat = String::new();
        if let Some(c) = &self.child_1 {
            concat.push_str(&c.hash());
        }
        if let Some(c) = &self.child_2 {
            concat.push_str(&c.hash());
        }
        md5_hex(concat.as_bytes())
    }

    /// Visits the subtree in post-order: children first, then the node.
    fn visit<'a>(&'a self, f: &mut impl FnMut(&'a TreeNode)) {
        if let Some(c) = &self.child_1 {
            c.visit(f);
        }
        if let Some(c) = &self.child_2 {
            c.visit(f);
        }
        f(self);
    }

    /// Offers `tx` to the first node in walk order that can take it.
    fn try_insert(&mut self, tx: &Transaction) -> bool {
        if let Some(c) = &mut self.child_1 {
            if c.try_insert(tx) {
                return true;
            }
        }
        if let Some(c) = &mut self.child_2 {
            if c.try_insert(tx) {
                return true;
            }
        }
        self.add_transaction(tx)
    }
}

/// The transaction tree of a block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tree {
    pub depth: u32,
    pub max_depth: u32,
    pub root: TreeNode,
}

impl Default for Tree {
    fn default() -> Self {
        Self {
            depth: 0,
            max_depth: MAX_DEPTH,
            root: TreeNode::default(),
        }
    }
}

impl Tree {
    /// Creates an empty tree of the default maximum depth.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the given transaction to this tree.
    ///
    /// The first free leaf in walk order takes it; if the tree is full it
    /// grows by one level and retries. Returns false once the maximum
    /// depth is reached and no leaf is free.
    pub fn add_transaction(&mut self, tx: &Transaction) -> bool {
        loop {
            if self.root.try_insert(tx) {
                return true;
            }
            if self.depth < self.max_depth {
                self.grow();
            } else {
                return false;
            }
        }
    }

    /// Adds a new root whose first child is the old root and whose second
    /// child is a fully expanded empty branch of the old depth.
    fn grow(&mut self) {
        let old_root = std::mem::take(&mut self.root);
        let mut new_root = TreeNode::default();
        new_root.add_child(old_root);
        new_root.add_child(Self::branch(self.depth));
        self.root = new_root;
        self.depth += 1;
    }

    /// Builds an empty subtree of the given depth.
    fn branch(depth: u32) -> TreeNode {
        let mut node = TreeNode::default();
        if depth > 0 {
            node.add_child(Self::branch(depth - 1));
            node.add_child(Self::branch(depth - 1));
        }
        node
    }

    /// Returns every node of the tree in walk order.
    pub fn walk(&self) -> Vec<&TreeNode> {
        let mut nodes = Vec::new();
        self.root.visit(&mut |n| nodes.push(n));
        nodes
    }

    /// Returns the transactions of this tree in insertion order.
    pub fn transactions(&self) -> Vec<&Transaction> {
        let mut txs = Vec::new();
        self.root.visit(&mut |n| {
            if let Some(tx) = &n.data {
                txs.push(tx);
            }
        });
        txs
    }

    /// Returns true if a transaction with the same identity hash is part
    /// of this tree.
    pub fn is_present(&self, tx: &Transaction) -> bool {
        let hash = tx.hash();
        self.transactions().iter().any(|t| t.hash() == hash)
    }

    /// Returns the root hash.
    pub fn root_hash(&self) -> String {
        self.root.hash()
    }

    /// Returns the canonical JSON representation of this tree.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("tree serializes")
    }

    /// Loads a tree from its JSON representation.
    pub fn from_json(data: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(data)?)
    }
}
