use crate::attributes::{AttributeHandler, NAME_ATTRIBUTE};
use crate::errors::EngineError;
use crate::instruction::{Category, InstructionBehavior, InstructionRegistry};
use crate::status::ExecutionStatus;

/// Arena index of an instruction node. Stable for the lifetime of the tree.
pub type NodeId = u32;

/// Parsed, not-yet-instantiated description of one instruction and its
/// children. Produced by the procedure parser and consumed by the registry.
#[derive(Clone, Debug, PartialEq)]
pub struct InstructionDescription {
    pub type_name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<InstructionDescription>,
}

impl InstructionDescription {
    pub fn new(type_name: impl Into<String>) -> Self {
        InstructionDescription {
            type_name: type_name.into(),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((name.into(), value.into()));
        self
    }

    pub fn with_child(mut self, child: InstructionDescription) -> Self {
        self.children.push(child);
        self
    }

    /// Name of this instruction: the `name` attribute when present, the type
    /// name otherwise.
    pub fn display_name(&self) -> &str {
        self.attributes
            .iter()
            .find(|(n, _)| n == NAME_ATTRIBUTE)
            .map(|(_, v)| v.as_str())
            .unwrap_or(&self.type_name)
    }

    /// Depth-first search for a (possibly nested) instruction by name.
    pub fn find_named(&self, name: &str) -> Option<&InstructionDescription> {
        if self.display_name() == name {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find_named(name))
    }
}

/// One node of the instruction arena.
pub struct InstructionNode {
    pub(crate) type_name: String,
    pub(crate) name: String,
    pub(crate) category: Category,
    pub(crate) attributes: AttributeHandler,
    pub(crate) children: Vec<NodeId>,
    pub(crate) parent: Option<NodeId>,
    /// Number of nodes in the subtree rooted here (including this node).
    pub(crate) subtree_len: u32,
    pub(crate) status: ExecutionStatus,
    pub(crate) started: bool,
    pub(crate) halted: bool,
    /// Taken out during dispatch so behaviours can tick children through the
    /// arena without aliasing.
    pub(crate) behavior: Option<Box<dyn InstructionBehavior>>,
}

impl InstructionNode {
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn status(&self) -> ExecutionStatus {
        self.status
    }

    pub fn attributes(&self) -> &AttributeHandler {
        &self.attributes
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }
}

/// Instruction arena in depth-first pre-order, so that every subtree occupies
/// a contiguous index range. This makes parent/child links plain indices (no
/// ownership cycles) and lets disjoint subtrees be ticked concurrently by
/// splitting the backing slice.
pub struct InstructionTree {
    pub(crate) nodes: Vec<InstructionNode>,
    roots: Vec<NodeId>,
}

impl std::fmt::Debug for InstructionTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstructionTree")
            .field("node_count", &self.nodes.len())
            .field("roots", &self.roots)
            .finish()
    }
}

impl InstructionTree {
    /// Instantiate a tree from top-level descriptions via the registry.
    pub fn build(
        descriptions: &[InstructionDescription],
        registry: &InstructionRegistry,
    ) -> Result<Self, EngineError> {
        let mut tree = InstructionTree {
            nodes: Vec::new(),
            roots: Vec::new(),
        };
        for description in descriptions {
            let root = tree.append(description, None, registry)?;
            tree.roots.push(root);
        }
        Ok(tree)
    }

    fn append(
        &mut self,
        description: &InstructionDescription,
        parent: Option<NodeId>,
        registry: &InstructionRegistry,
    ) -> Result<NodeId, EngineError> {
        let behavior = registry.create(&description.type_name).ok_or_else(|| {
            EngineError::Parse(format!(
                "unknown instruction type '{}'",
                description.type_name
            ))
        })?;
        let mut attributes = AttributeHandler::new();
        behavior.declare_attributes(&mut attributes);
        for (name, value) in &description.attributes {
            if !attributes.add_string_attribute(name.clone(), value.clone()) {
                return Err(EngineError::Parse(format!(
                    "duplicate attribute '{name}' on instruction '{}'",
                    description.type_name
                )));
            }
        }
        let id = self.nodes.len() as NodeId;
        self.nodes.push(InstructionNode {
            type_name: description.type_name.clone(),
            name: description.display_name().to_string(),
            category: behavior.category(),
            attributes,
            children: Vec::new(),
            parent,
            subtree_len: 1,
            status: ExecutionStatus::NotStarted,
            started: false,
            halted: false,
            behavior: Some(behavior),
        });
        let mut children = Vec::with_capacity(description.children.len());
        for child in &description.children {
            children.push(self.append(child, Some(id), registry)?);
        }
        let end = self.nodes.len() as u32;
        let node = &mut self.nodes[id as usize];
        node.children = children;
        node.subtree_len = end - id;
        Ok(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    /// The root instruction: the first top-level node.
    pub fn root(&self) -> Option<NodeId> {
        self.roots.first().copied()
    }

    pub fn node(&self, id: NodeId) -> &InstructionNode {
        &self.nodes[id as usize]
    }

    pub fn contains(&self, id: NodeId) -> bool {
        (id as usize) < self.nodes.len()
    }

    pub fn status_of(&self, id: NodeId) -> ExecutionStatus {
        self.nodes[id as usize].status
    }

    /// Mutable slice view over the subtree rooted at `root`.
    pub(crate) fn slice(&mut self, root: NodeId) -> SubtreeSlice<'_> {
        let start = root as usize;
        let len = self.nodes[start].subtree_len as usize;
        SubtreeSlice {
            base: root,
            nodes: &mut self.nodes[start..start + len],
        }
    }

    /// Breadth-first order of the subtree rooted at `root`; the basis for the
    /// dense instruction indices exposed to external clients.
    pub fn bfs_order(&self, root: NodeId) -> Vec<NodeId> {
        let mut order = Vec::new();
        let mut queue = std::collections::VecDeque::from([root]);
        while let Some(id) = queue.pop_front() {
            order.push(id);
            queue.extend(self.node(id).children.iter().copied());
        }
        order
    }

    /// The set of leaves the engine would tick next, given current statuses.
    pub fn next_leaves(&self, root: NodeId) -> Vec<NodeId> {
        let mut leaves = Vec::new();
        self.collect_next_leaves(root, &mut leaves);
        leaves
    }

    fn collect_next_leaves(&self, id: NodeId, out: &mut Vec<NodeId>) {
        let node = self.node(id);
        if node.status.is_finished() {
            return;
        }
        if node.children.is_empty() {
            out.push(id);
            return;
        }
        let statuses: Vec<ExecutionStatus> = node
            .children
            .iter()
            .map(|child| self.status_of(*child))
            .collect();
        let Some(behavior) = node.behavior.as_ref() else {
            return;
        };
        for idx in behavior.next_children(&statuses) {
            if let Some(&child) = node.children.get(idx) {
                self.collect_next_leaves(child, out);
            }
        }
    }

    /// Reset all nodes without publishing status updates. Used for subtrees
    /// that are not externally indexed.
    pub(crate) fn reset_silent(&mut self) {
        for node in &mut self.nodes {
            if let Some(behavior) = node.behavior.as_mut() {
                behavior.reset();
            }
            node.status = ExecutionStatus::NotStarted;
            node.started = false;
            node.halted = false;
        }
    }

    /// Set the halt latch on every node and run halt hooks.
    pub(crate) fn halt_all(&mut self) {
        for node in &mut self.nodes {
            node.halted = true;
            if let Some(behavior) = node.behavior.as_mut() {
                behavior.halt();
            }
        }
    }
}

/// Mutable window over one subtree. `nodes[0]` is the subtree root; indices
/// inside are rebased against `base`.
pub(crate) struct SubtreeSlice<'a> {
    pub(crate) base: NodeId,
    pub(crate) nodes: &'a mut [InstructionNode],
}

impl<'a> SubtreeSlice<'a> {
    pub(crate) fn reborrow(&mut self) -> SubtreeSlice<'_> {
        SubtreeSlice {
            base: self.base,
            nodes: &mut *self.nodes,
        }
    }

    pub(crate) fn child_count(&self) -> usize {
        self.nodes[0].children.len()
    }

    pub(crate) fn child_status(&self, idx: usize) -> ExecutionStatus {
        let child = self.nodes[0].children[idx];
        self.nodes[(child - self.base) as usize].status
    }

    pub(crate) fn child_statuses(&self) -> Vec<ExecutionStatus> {
        (0..self.child_count()).map(|i| self.child_status(i)).collect()
    }

    /// Window over one child's subtree.
    pub(crate) fn child_slice(&mut self, idx: usize) -> SubtreeSlice<'_> {
        let child = self.nodes[0].children[idx];
        let start = (child - self.base) as usize;
        let len = self.nodes[start].subtree_len as usize;
        SubtreeSlice {
            base: child,
            nodes: &mut self.nodes[start..start + len],
        }
    }

    /// Disjoint windows over all child subtrees at once, for concurrent
    /// ticking. Relies on children being laid out back to back after the
    /// root in depth-first order.
    pub(crate) fn child_slices(&mut self) -> Vec<SubtreeSlice<'_>> {
        let child_ids = self.nodes[0].children.clone();
        let mut slices = Vec::with_capacity(child_ids.len());
        let (_, mut rest) = self.nodes.split_at_mut(1);
        for child in child_ids {
            let len = rest[0].subtree_len as usize;
            let (head, tail) = rest.split_at_mut(len);
            debug_assert_eq!(head[0].subtree_len as usize, head.len());
            slices.push(SubtreeSlice {
                base: child,
                nodes: head,
            });
            rest = tail;
        }
        slices
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::InstructionRegistry;

    fn sequence_of(n: usize, leaf: &str) -> InstructionDescription {
        let mut desc = InstructionDescription::new("Sequence");
        for _ in 0..n {
            desc = desc.with_child(InstructionDescription::new(leaf));
        }
        desc
    }

    fn build(descs: &[InstructionDescription]) -> InstructionTree {
        InstructionTree::build(descs, &InstructionRegistry::with_defaults()).unwrap()
    }

    #[test]
    fn build_assigns_depth_first_contiguous_subtrees() {
        let desc = InstructionDescription::new("Sequence")
            .with_child(sequence_of(2, "Succeed"))
            .with_child(InstructionDescription::new("Succeed"));
        let tree = build(std::slice::from_ref(&desc));
        assert_eq!(tree.len(), 5);
        let root = tree.root().unwrap();
        assert_eq!(root, 0);
        assert_eq!(tree.node(0).children(), &[1, 4]);
        assert_eq!(tree.node(1).children(), &[2, 3]);
        assert_eq!(tree.node(0).subtree_len, 5);
        assert_eq!(tree.node(1).subtree_len, 3);
        assert_eq!(tree.node(4).parent(), Some(0));
    }

    #[test]
    fn unknown_type_fails_to_build() {
        let desc = InstructionDescription::new("NoSuchInstruction");
        let err = InstructionTree::build(
            std::slice::from_ref(&desc),
            &InstructionRegistry::with_defaults(),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Parse(_)));
    }

    #[test]
    fn bfs_order_is_level_by_level() {
        let desc = InstructionDescription::new("Sequence")
            .with_child(sequence_of(2, "Succeed"))
            .with_child(InstructionDescription::new("Succeed"));
        let tree = build(std::slice::from_ref(&desc));
        assert_eq!(tree.bfs_order(0), vec![0, 1, 4, 2, 3]);
    }

    #[test]
    fn next_leaves_of_fresh_sequence_is_first_child() {
        let desc = sequence_of(3, "Succeed");
        let tree = build(std::slice::from_ref(&desc));
        assert_eq!(tree.next_leaves(0), vec![1]);
    }

    #[test]
    fn child_slices_are_disjoint_and_complete() {
        let desc = InstructionDescription::new("Sequence")
            .with_child(sequence_of(2, "Succeed"))
            .with_child(InstructionDescription::new("Succeed"));
        let mut tree = build(std::slice::from_ref(&desc));
        let mut slice = tree.slice(0);
        let children = slice.child_slices();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].base, 1);
        assert_eq!(children[0].nodes.len(), 3);
        assert_eq!(children[1].base, 4);
        assert_eq!(children[1].nodes.len(), 1);
    }
}
