use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::EngineError;
use crate::instruction::Category;
use crate::procedure::Procedure;
use crate::tree::{InstructionTree, NodeId};
use crate::workspace::Workspace;

// ─── Static index maps ────────────────────────────────────────

/// Dense instruction indices in breadth-first order from the root. These are
/// the only instruction identifiers exposed to external clients, immutable
/// for the lifetime of the job.
pub struct InstructionMap {
    order: Vec<NodeId>,
    indices: HashMap<NodeId, u32>,
}

impl InstructionMap {
    pub fn new(tree: &InstructionTree, root: NodeId) -> Self {
        let order = tree.bfs_order(root);
        let indices = order
            .iter()
            .enumerate()
            .map(|(idx, node)| (*node, idx as u32))
            .collect();
        InstructionMap { order, indices }
    }

    pub fn instruction_count(&self) -> u32 {
        self.order.len() as u32
    }

    pub fn index_of(&self, node: NodeId) -> Result<u32, EngineError> {
        self.indices.get(&node).copied().ok_or_else(|| {
            EngineError::InvalidOperation(format!("unknown instruction node {node}"))
        })
    }

    pub fn node_at(&self, index: u32) -> Option<NodeId> {
        self.order.get(index as usize).copied()
    }

    /// Nodes in index order.
    pub fn ordered_nodes(&self) -> &[NodeId] {
        &self.order
    }
}

/// Dense variable indices in workspace insertion order.
pub struct VariableMap {
    names: Vec<String>,
    indices: HashMap<String, u32>,
}

impl VariableMap {
    pub fn new(workspace: &Workspace) -> Self {
        let names = workspace.variable_names();
        let indices = names
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.clone(), idx as u32))
            .collect();
        VariableMap { names, indices }
    }

    pub fn variable_count(&self) -> u32 {
        self.names.len() as u32
    }

    pub fn index_of(&self, name: &str) -> Result<u32, EngineError> {
        self.indices
            .get(name)
            .copied()
            .ok_or_else(|| EngineError::InvalidOperation(format!("unknown variable '{name}'")))
    }

    pub fn name_at(&self, index: u32) -> Option<&str> {
        self.names.get(index as usize).map(String::as_str)
    }
}

/// Index assignment for one job: instructions by BFS from the root,
/// variables by insertion order.
pub struct JobMap {
    instructions: InstructionMap,
    variables: VariableMap,
}

impl JobMap {
    pub fn new(procedure: &Procedure) -> Result<Self, EngineError> {
        let root = procedure.root_instruction().ok_or_else(|| {
            EngineError::InvalidOperation("procedure has no root instruction".into())
        })?;
        Ok(JobMap {
            instructions: InstructionMap::new(procedure.tree(), root),
            variables: VariableMap::new(procedure.workspace()),
        })
    }

    pub fn instructions(&self) -> &InstructionMap {
        &self.instructions
    }

    pub fn variables(&self) -> &VariableMap {
        &self.variables
    }
}

// ─── Serialisable snapshots ───────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeInfo {
    pub name: String,
    pub value: String,
}

/// Flat, copyable description of one instruction subtree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstructionInfo {
    pub instr_type: String,
    pub name: String,
    pub category: Category,
    pub index: u32,
    pub attributes: Vec<AttributeInfo>,
    pub children: Vec<InstructionInfo>,
}

impl InstructionInfo {
    /// Depth-first flattening of the info tree.
    pub fn flatten(&self) -> Vec<&InstructionInfo> {
        let mut result = vec![self];
        for child in &self.children {
            result.extend(child.flatten());
        }
        result
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VariableInfo {
    pub var_type: String,
    pub index: u32,
    pub attributes: Vec<AttributeInfo>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceInfo {
    /// `(name, info)` pairs in index order.
    pub variables: Vec<(String, VariableInfo)>,
}

/// Serialisable snapshot of a job's static structure.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    pub job_id: Uuid,
    pub full_name: String,
    /// Hex SHA-256 of the procedure source, for cache validation by UIs.
    pub procedure_hash: Option<String>,
    pub workspace: WorkspaceInfo,
    pub root: InstructionInfo,
}

fn instruction_info(
    tree: &InstructionTree,
    map: &InstructionMap,
    node: NodeId,
) -> Result<InstructionInfo, EngineError> {
    let instruction = tree.node(node);
    let children = instruction
        .children()
        .iter()
        .map(|child| instruction_info(tree, map, *child))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(InstructionInfo {
        instr_type: instruction.type_name().to_string(),
        name: instruction.name().to_string(),
        category: instruction.category(),
        index: map.index_of(node)?,
        attributes: instruction
            .attributes()
            .string_attributes()
            .iter()
            .map(|(name, value)| AttributeInfo {
                name: name.clone(),
                value: value.clone(),
            })
            .collect(),
        children,
    })
}

pub fn create_workspace_info(workspace: &Workspace, map: &VariableMap) -> WorkspaceInfo {
    let mut variables = Vec::with_capacity(map.variable_count() as usize);
    for index in 0..map.variable_count() {
        let name = map.name_at(index).unwrap_or_default().to_string();
        let info = VariableInfo {
            var_type: workspace.variable_type(&name).unwrap_or_default(),
            index,
            attributes: workspace
                .variable_attributes(&name)
                .unwrap_or_default()
                .into_iter()
                .map(|(name, value)| AttributeInfo { name, value })
                .collect(),
        };
        variables.push((name, info));
    }
    WorkspaceInfo { variables }
}

/// Snapshot the static structure of a procedure under a job map.
pub fn create_job_info(
    job_id: Uuid,
    procedure: &Procedure,
    map: &JobMap,
) -> Result<JobInfo, EngineError> {
    let root = procedure.root_instruction().ok_or_else(|| {
        EngineError::InvalidOperation("procedure has no root instruction".into())
    })?;
    Ok(JobInfo {
        job_id,
        full_name: procedure.filename().to_string(),
        procedure_hash: procedure.source_hash().map(str::to_string),
        workspace: create_workspace_info(procedure.workspace(), map.variables()),
        root: instruction_info(procedure.tree(), map.instructions(), root)?,
    })
}
