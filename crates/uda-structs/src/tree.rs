// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reconstructed structure tree.
//!
//! One node per received structure-array element, each pairing a type
//! descriptor with the address of the element's bytes. Nodes live in an
//! arena and refer to each other by [`NodeId`]; children keep field
//! declaration order.

use crate::heap::Address;
use crate::registry::UserDefinedType;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Index of a node in its [`StructTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One structure-array element.
#[derive(Debug, Clone)]
pub struct TreeNode {
    /// Name of the field this element was reached through.
    pub name: String,
    pub udt: Arc<UserDefinedType>,
    pub data: Address,
    children: Vec<NodeId>,
    parent: Option<NodeId>,
}

impl TreeNode {
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn type_name(&self) -> &str {
        &self.udt.name
    }
}

/// Arena of tree nodes.
#[derive(Debug, Clone, Default)]
pub struct StructTree {
    nodes: Vec<TreeNode>,
    root: Option<NodeId>,
}

impl StructTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a detached node.
    pub fn add_node(&mut self, udt: Arc<UserDefinedType>, data: Address) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(TreeNode {
            name: udt.name.clone(),
            udt,
            data,
            children: Vec::new(),
            parent: None,
        });
        id
    }

    /// Append `child` to `parent`'s children.
    pub fn add_child(&mut self, parent: NodeId, child: NodeId) {
        self.nodes[child.0].parent = Some(parent);
        self.nodes[parent.0].children.push(child);
    }

    pub fn set_name(&mut self, id: NodeId, name: &str) {
        self.nodes[id.0].name = name.to_string();
    }

    pub fn set_root(&mut self, id: NodeId) {
        self.root = Some(id);
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &TreeNode {
        &self.nodes[id.0]
    }

    pub fn get(&self, id: NodeId) -> Option<&TreeNode> {
        self.nodes.get(id.0)
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.0].children
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.0].parent
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Current arena length, to be passed to [`StructTree::truncate`].
    pub fn mark(&self) -> usize {
        self.nodes.len()
    }

    /// Drop every node created since `mark`, unlinking them from survivors.
    pub fn truncate(&mut self, mark: usize) {
        if mark >= self.nodes.len() {
            return;
        }
        self.nodes.truncate(mark);
        for node in &mut self.nodes {
            node.children.retain(|c| c.0 < mark);
        }
        if self.root.is_some_and(|r| r.0 >= mark) {
            self.root = None;
        }
    }

    /// First child of `id` named `name`.
    pub fn find_child(&self, id: NodeId, name: &str) -> Option<NodeId> {
        self.children(id)
            .iter()
            .copied()
            .find(|c| self.nodes[c.0].name == name)
    }

    /// Follow a dotted path of child names from `from`.
    pub fn find_path(&self, from: NodeId, path: &str) -> Option<NodeId> {
        path.split(['.', '/'])
            .filter(|s| !s.is_empty())
            .try_fold(from, |node, segment| self.find_child(node, segment))
    }

    /// First node in depth-first order whose type is `type_name`.
    pub fn find_by_type(&self, type_name: &str) -> Option<NodeId> {
        let root = self.root?;
        self.descendants(root)
            .into_iter()
            .find(|&id| self.nodes[id.0].udt.name == type_name)
    }

    /// `id` and every node below it, depth first.
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            out.push(next);
            stack.extend(self.nodes[next.0].children.iter().rev());
        }
        out
    }

    /// Depth of `id` below the root.
    pub fn depth(&self, id: NodeId) -> usize {
        std::iter::successors(self.parent(id), |&p| self.parent(p)).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &TreeNode)> {
        self.nodes.iter().enumerate().map(|(i, n)| (NodeId(i), n))
    }
}
