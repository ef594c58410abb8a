//! The parsed graph form of a declarative automation-flow document.
//!
//! A flow document describes a directed graph of typed steps connected by
//! success and fault edges, executed by the automation platform against a
//! batch of records. The analyzer never executes a flow; it only walks
//! this structure.

pub mod parser;
pub mod rules;
pub mod simulate;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The kind of one flow step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ElementKind {
    /// Conditional split with named outcomes.
    Branch,
    /// Per-record loop over a collection variable.
    Iteration,
    /// Record query against a data object.
    DataRead,
    /// Record create/update/delete against a data object.
    DataWrite,
    /// Interactive screen shown to the running user.
    ScreenStep,
    /// Invocation of another flow.
    SubInvocation,
    /// Variable assignment.
    Assignment,
    /// Timed or event pause.
    Wait,
}

impl ElementKind {
    /// Returns `true` for steps that mutate records.
    #[must_use]
    pub fn is_mutation(&self) -> bool {
        matches!(self, ElementKind::DataWrite)
    }

    /// Returns `true` for steps that query records.
    #[must_use]
    pub fn is_query(&self) -> bool {
        matches!(self, ElementKind::DataRead)
    }

    /// Grouping rank used by the canonical element ordering.
    ///
    /// Documents are expected to declare elements grouped by kind in this
    /// order, alphabetically within each group.
    #[must_use]
    pub fn group_rank(&self) -> u8 {
        match self {
            ElementKind::DataRead => 0,
            ElementKind::Branch => 1,
            ElementKind::Iteration => 2,
            ElementKind::Assignment => 3,
            ElementKind::DataWrite => 4,
            ElementKind::ScreenStep => 5,
            ElementKind::SubInvocation => 6,
            ElementKind::Wait => 7,
        }
    }
}

/// The mode a flow runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RunMode {
    /// Record access restricted to the running user's permissions.
    #[default]
    User,
    /// Record access bypasses the running user's permissions.
    Elevated,
}

/// Edge classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeKind {
    /// Followed on normal completion of the source element.
    Success,
    /// Followed when the source element faults.
    Fault,
}

/// One resolved connector between two elements.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
    pub kind: EdgeKind,
}

/// A declared flow variable and whether anything references it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Variable {
    /// Declared type name (opaque to the analyzer).
    pub declared_type: String,
    /// Available as flow input.
    pub is_input: bool,
    /// Exposed as flow output.
    pub is_output: bool,
    /// Some element references this variable.
    pub referenced: bool,
}

/// One typed step of the flow graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ElementNode {
    pub id: String,
    pub kind: ElementKind,
    /// Data object the element reads or writes, when applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_object: Option<String>,
    /// Whether a fault connector leaves this element.
    pub has_fault_edge: bool,
    /// Ancestor iteration ids, outermost first. Empty when the element is
    /// not nested in any iteration.
    pub containing_iterations: Vec<String>,
    /// Success connector targets in traversal order (exit connector first
    /// for iterations, then named outcomes sorted by name).
    #[serde(skip)]
    pub success_targets: Vec<String>,
    /// Body-entry connector target (iterations only).
    #[serde(skip)]
    pub body_target: Option<String>,
    /// Fault connector target.
    #[serde(skip)]
    pub fault_target: Option<String>,
}

/// A fully parsed, immutable flow document.
#[derive(Debug, Clone, Serialize)]
pub struct FlowDocument {
    /// Declared document API version.
    pub api_version: u32,
    /// Optional flow name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Record-access mode the flow declares.
    pub run_mode: RunMode,
    /// Id of the single root element.
    pub root: String,
    /// Elements keyed by id. Keyed storage is ordered for deterministic
    /// analysis; declaration order lives in `declared_order`.
    pub elements: BTreeMap<String, ElementNode>,
    /// All resolved connectors.
    pub edges: Vec<Edge>,
    /// Declared variables keyed by name.
    pub variables: BTreeMap<String, Variable>,
    /// Element ids in the order the document declared them.
    pub declared_order: Vec<String>,
}

impl FlowDocument {
    /// Look up an element by id.
    #[must_use]
    pub fn element(&self, id: &str) -> Option<&ElementNode> {
        self.elements.get(id)
    }

    /// Element ids in canonical order: grouped by kind rank, then
    /// alphabetically within each group.
    #[must_use]
    pub fn canonical_order(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.elements.keys().map(String::as_str).collect();
        ids.sort_by_key(|id| {
            let rank = self.elements[*id].kind.group_rank();
            (rank, *id)
        });
        ids
    }
}
