//! Two-pass parsing of flow documents into [`FlowDocument`] graphs.
//!
//! Pass 1 builds the element and variable tables. Pass 2 resolves every
//! connector (including fault connectors) into edges and rejects dangling
//! references. A final reachability pass computes each element's ancestor
//! iterations from the edge graph.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::Deserialize;
use thiserror::Error;

use crate::flow::{
    Edge, EdgeKind, ElementKind, ElementNode, FlowDocument, RunMode, Variable,
};

/// A malformed flow document.
#[derive(Error, Debug)]
pub enum ParseError {
    /// The document is not valid YAML/JSON or is missing required fields.
    #[error("flow syntax error: {message}")]
    Syntax { message: String },

    /// The document declares no elements at all.
    #[error("flow declares no elements")]
    NoElements,

    /// One element's definition could not be interpreted.
    #[error("element '{id}': {message}")]
    BadElement { id: String, message: String },

    /// A connector points at an element id that does not exist.
    #[error("element '{from}' references unknown element '{to}'")]
    DanglingReference { from: String, to: String },

    /// The designated root element id is not declared.
    #[error("root element '{id}' is not declared")]
    UnknownRoot { id: String },

    /// No element is designated as the root.
    #[error("no root element designated")]
    MissingRoot,

    /// More than one element is designated as the root.
    #[error("multiple root elements designated: '{first}' and '{second}'")]
    MultipleRoots { first: String, second: String },

    /// An element references a variable that is not declared.
    #[error("element '{element}' references unknown variable '{variable}'")]
    UnknownVariable { element: String, variable: String },
}

/// Raw document shape as declared on disk.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFlow {
    #[serde(rename = "apiVersion")]
    api_version: u32,
    #[serde(default)]
    name: Option<String>,
    #[serde(rename = "runMode", default)]
    run_mode: RunMode,
    /// Root designation by reference, alternative to `entry: true`.
    #[serde(default)]
    start: Option<String>,
    #[serde(default)]
    variables: BTreeMap<String, RawVariable>,
    elements: serde_yaml_ng::Mapping,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawVariable {
    #[serde(rename = "type")]
    declared_type: String,
    #[serde(default)]
    input: bool,
    #[serde(default)]
    output: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawElement {
    kind: ElementKind,
    /// Root designation in place, alternative to top-level `start`.
    #[serde(default)]
    entry: bool,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    next: Option<String>,
    #[serde(default)]
    fault: Option<String>,
    /// Body-entry connector (iterations only).
    #[serde(default)]
    body: Option<String>,
    /// Collection variable an iteration walks.
    #[serde(default)]
    collection: Option<String>,
    /// Named branch outcomes.
    #[serde(default)]
    outcomes: BTreeMap<String, String>,
    /// Variables this element reads or writes.
    #[serde(default)]
    uses: Vec<String>,
}

/// Parse a flow document into its graph form.
pub fn parse(text: &str) -> Result<FlowDocument, ParseError> {
    let raw: RawFlow = serde_yaml_ng::from_str(text).map_err(|e| ParseError::Syntax {
        message: e.to_string(),
    })?;

    if raw.elements.is_empty() {
        return Err(ParseError::NoElements);
    }

    // Pass 1: element and variable tables, preserving declaration order.
    let mut declared_order = Vec::with_capacity(raw.elements.len());
    let mut raw_elements: BTreeMap<String, RawElement> = BTreeMap::new();
    for (key, value) in &raw.elements {
        let id = key
            .as_str()
            .ok_or_else(|| ParseError::Syntax {
                message: format!("element key is not a string: {key:?}"),
            })?
            .to_string();
        let element: RawElement =
            serde_yaml_ng::from_value(value.clone()).map_err(|e| ParseError::BadElement {
                id: id.clone(),
                message: e.to_string(),
            })?;
        declared_order.push(id.clone());
        raw_elements.insert(id, element);
    }

    let mut variables: BTreeMap<String, Variable> = raw
        .variables
        .into_iter()
        .map(|(name, v)| {
            (
                name,
                Variable {
                    declared_type: v.declared_type,
                    is_input: v.input,
                    is_output: v.output,
                    referenced: false,
                },
            )
        })
        .collect();

    // Pass 2: resolve every connector into an edge, validating endpoints.
    let exists = |id: &str| raw_elements.contains_key(id);
    let mut edges = Vec::new();
    let mut elements: BTreeMap<String, ElementNode> = BTreeMap::new();

    for id in &declared_order {
        let raw_el = &raw_elements[id];
        let mut success_targets = Vec::new();

        if let Some(next) = &raw_el.next {
            if !exists(next) {
                return Err(ParseError::DanglingReference {
                    from: id.clone(),
                    to: next.clone(),
                });
            }
            edges.push(Edge {
                from: id.clone(),
                to: next.clone(),
                kind: EdgeKind::Success,
            });
            success_targets.push(next.clone());
        }
        for target in raw_el.outcomes.values() {
            if !exists(target) {
                return Err(ParseError::DanglingReference {
                    from: id.clone(),
                    to: target.clone(),
                });
            }
            edges.push(Edge {
                from: id.clone(),
                to: target.clone(),
                kind: EdgeKind::Success,
            });
            success_targets.push(target.clone());
        }
        if let Some(body) = &raw_el.body {
            if !exists(body) {
                return Err(ParseError::DanglingReference {
                    from: id.clone(),
                    to: body.clone(),
                });
            }
            edges.push(Edge {
                from: id.clone(),
                to: body.clone(),
                kind: EdgeKind::Success,
            });
        }
        if let Some(fault) = &raw_el.fault {
            if !exists(fault) {
                return Err(ParseError::DanglingReference {
                    from: id.clone(),
                    to: fault.clone(),
                });
            }
            edges.push(Edge {
                from: id.clone(),
                to: fault.clone(),
                kind: EdgeKind::Fault,
            });
        }

        // Variable references.
        for var in raw_el.collection.iter().chain(raw_el.uses.iter()) {
            match variables.get_mut(var) {
                Some(v) => v.referenced = true,
                None => {
                    return Err(ParseError::UnknownVariable {
                        element: id.clone(),
                        variable: var.clone(),
                    })
                }
            }
        }

        elements.insert(
            id.clone(),
            ElementNode {
                id: id.clone(),
                kind: raw_el.kind,
                target_object: raw_el.target.clone(),
                has_fault_edge: raw_el.fault.is_some(),
                containing_iterations: Vec::new(),
                success_targets,
                body_target: raw_el.body.clone(),
                fault_target: raw_el.fault.clone(),
            },
        );
    }

    let root = resolve_root(&raw.start, &declared_order, &raw_elements)?;
    compute_containing_iterations(&mut elements);

    Ok(FlowDocument {
        api_version: raw.api_version,
        name: raw.name,
        run_mode: raw.run_mode,
        root,
        elements,
        edges,
        variables,
        declared_order,
    })
}

/// Resolve the single root element from `start` and `entry` designations.
fn resolve_root(
    start: &Option<String>,
    declared_order: &[String],
    raw_elements: &BTreeMap<String, RawElement>,
) -> Result<String, ParseError> {
    let mut roots: Vec<String> = Vec::new();
    if let Some(id) = start {
        if !raw_elements.contains_key(id) {
            return Err(ParseError::UnknownRoot { id: id.clone() });
        }
        roots.push(id.clone());
    }
    for id in declared_order {
        if raw_elements[id].entry && !roots.contains(id) {
            roots.push(id.clone());
        }
    }
    match roots.len() {
        0 => Err(ParseError::MissingRoot),
        1 => Ok(roots.remove(0)),
        _ => Err(ParseError::MultipleRoots {
            first: roots[0].clone(),
            second: roots[1].clone(),
        }),
    }
}

/// Compute `containing_iterations` for every element.
///
/// An element is inside an iteration iff it is reachable from that
/// iteration's body-entry edge without crossing the iteration's exit edge.
/// The walk carries a per-iteration visited set so a connector cycle back
/// into its own entry terminates instead of looping.
fn compute_containing_iterations(elements: &mut BTreeMap<String, ElementNode>) {
    let iteration_ids: Vec<String> = elements
        .values()
        .filter(|e| e.kind == ElementKind::Iteration)
        .map(|e| e.id.clone())
        .collect();

    // Membership sets per iteration, via breadth-first walk from the body
    // edge. Reaching the iteration itself (the loop-back connector) stops
    // the walk there, so its exit edge is never crossed.
    let mut members: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for iter_id in &iteration_ids {
        let mut seen: BTreeSet<String> = BTreeSet::new();
        let mut queue: VecDeque<String> = VecDeque::new();
        if let Some(body) = elements[iter_id].body_target.clone() {
            queue.push_back(body);
        }
        while let Some(id) = queue.pop_front() {
            if id == *iter_id || !seen.insert(id.clone()) {
                continue;
            }
            let node = &elements[&id];
            for next in node
                .success_targets
                .iter()
                .chain(node.body_target.iter())
                .chain(node.fault_target.iter())
            {
                queue.push_back(next.clone());
            }
        }
        members.insert(iter_id.clone(), seen);
    }

    for element in elements.values_mut() {
        let mut ancestors: Vec<&String> = iteration_ids
            .iter()
            .filter(|iter_id| members[*iter_id].contains(&element.id))
            .collect();
        // Outermost first: an outer iteration's membership set contains
        // every element the inner one does, so larger sets sort first.
        ancestors.sort_by_key(|iter_id| {
            (std::cmp::Reverse(members[*iter_id].len()), (*iter_id).clone())
        });
        element.containing_iterations = ancestors.into_iter().cloned().collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE: &str = "\
apiVersion: 1
name: enroll-contacts
start: load_contacts
variables:
  contacts:
    type: recordList
    input: true
elements:
  load_contacts:
    kind: dataRead
    target: Contact
    uses: [contacts]
    next: each_contact
  each_contact:
    kind: iteration
    collection: contacts
    body: update_one
    next: finish
  update_one:
    kind: dataWrite
    target: Contact
    next: each_contact
  finish:
    kind: assignment
    uses: [contacts]
";

    #[test]
    fn parses_simple_flow() {
        let doc = parse(SIMPLE).unwrap();
        assert_eq!(doc.api_version, 1);
        assert_eq!(doc.root, "load_contacts");
        assert_eq!(doc.elements.len(), 4);
        assert_eq!(doc.name.as_deref(), Some("enroll-contacts"));
        assert_eq!(doc.run_mode, RunMode::User);
    }

    #[test]
    fn declaration_order_is_preserved() {
        let doc = parse(SIMPLE).unwrap();
        assert_eq!(
            doc.declared_order,
            vec!["load_contacts", "each_contact", "update_one", "finish"]
        );
    }

    #[test]
    fn connectors_become_edges() {
        let doc = parse(SIMPLE).unwrap();
        assert!(doc.edges.contains(&Edge {
            from: "each_contact".into(),
            to: "update_one".into(),
            kind: EdgeKind::Success,
        }));
        assert!(doc.edges.contains(&Edge {
            from: "update_one".into(),
            to: "each_contact".into(),
            kind: EdgeKind::Success,
        }));
    }

    #[test]
    fn loop_body_is_inside_iteration() {
        let doc = parse(SIMPLE).unwrap();
        assert_eq!(
            doc.elements["update_one"].containing_iterations,
            vec!["each_contact"]
        );
        assert!(doc.elements["finish"].containing_iterations.is_empty());
        assert!(doc.elements["load_contacts"]
            .containing_iterations
            .is_empty());
    }

    #[test]
    fn variables_are_marked_referenced() {
        let doc = parse(SIMPLE).unwrap();
        assert!(doc.variables["contacts"].referenced);
    }

    #[test]
    fn nested_iterations_order_outermost_first() {
        let text = "\
apiVersion: 1
start: outer
variables:
  rows: {type: recordList}
  cells: {type: recordList}
elements:
  outer:
    kind: iteration
    collection: rows
    body: inner
    next: done
  inner:
    kind: iteration
    collection: cells
    body: write_cell
    next: outer
  write_cell:
    kind: dataWrite
    target: Cell
    next: inner
  done:
    kind: assignment
";
        let doc = parse(text).unwrap();
        assert_eq!(
            doc.elements["write_cell"].containing_iterations,
            vec!["outer", "inner"]
        );
        assert_eq!(doc.elements["inner"].containing_iterations, vec!["outer"]);
        assert!(doc.elements["outer"].containing_iterations.is_empty());
    }

    #[test]
    fn connector_cycle_in_body_terminates() {
        // a and b point at each other inside the loop body; the walk must
        // stop on revisit instead of looping forever.
        let text = "\
apiVersion: 1
start: loop
variables:
  rows: {type: recordList}
elements:
  loop:
    kind: iteration
    collection: rows
    body: a
    next: out
  a:
    kind: assignment
    next: b
  b:
    kind: assignment
    next: a
  out:
    kind: assignment
";
        let doc = parse(text).unwrap();
        assert_eq!(doc.elements["a"].containing_iterations, vec!["loop"]);
        assert_eq!(doc.elements["b"].containing_iterations, vec!["loop"]);
    }

    #[test]
    fn dangling_next_names_referencing_element() {
        let text = "\
apiVersion: 1
start: a
elements:
  a:
    kind: assignment
    next: nowhere
";
        match parse(text) {
            Err(ParseError::DanglingReference { from, to }) => {
                assert_eq!(from, "a");
                assert_eq!(to, "nowhere");
            }
            other => panic!("expected DanglingReference, got {other:?}"),
        }
    }

    #[test]
    fn dangling_fault_is_rejected() {
        let text = "\
apiVersion: 1
start: w
elements:
  w:
    kind: dataWrite
    target: Contact
    fault: missing_handler
";
        match parse(text) {
            Err(ParseError::DanglingReference { from, to }) => {
                assert_eq!(from, "w");
                assert_eq!(to, "missing_handler");
            }
            other => panic!("expected DanglingReference, got {other:?}"),
        }
    }

    #[test]
    fn unknown_root_reports_dangling_id() {
        let text = "\
apiVersion: 1
start: ghost
elements:
  a:
    kind: assignment
";
        match parse(text) {
            Err(ParseError::UnknownRoot { id }) => assert_eq!(id, "ghost"),
            other => panic!("expected UnknownRoot, got {other:?}"),
        }
    }

    #[test]
    fn missing_root_is_rejected() {
        let text = "\
apiVersion: 1
elements:
  a:
    kind: assignment
";
        assert!(matches!(parse(text), Err(ParseError::MissingRoot)));
    }

    #[test]
    fn entry_marker_designates_root() {
        let text = "\
apiVersion: 1
elements:
  a:
    kind: assignment
    entry: true
";
        let doc = parse(text).unwrap();
        assert_eq!(doc.root, "a");
    }

    #[test]
    fn two_entry_markers_are_rejected() {
        let text = "\
apiVersion: 1
elements:
  a:
    kind: assignment
    entry: true
  b:
    kind: assignment
    entry: true
";
        match parse(text) {
            Err(ParseError::MultipleRoots { first, second }) => {
                assert_eq!(first, "a");
                assert_eq!(second, "b");
            }
            other => panic!("expected MultipleRoots, got {other:?}"),
        }
    }

    #[test]
    fn start_and_matching_entry_are_one_root() {
        let text = "\
apiVersion: 1
start: a
elements:
  a:
    kind: assignment
    entry: true
";
        assert_eq!(parse(text).unwrap().root, "a");
    }

    #[test]
    fn unknown_variable_is_rejected() {
        let text = "\
apiVersion: 1
start: a
elements:
  a:
    kind: assignment
    uses: [undeclared]
";
        match parse(text) {
            Err(ParseError::UnknownVariable { element, variable }) => {
                assert_eq!(element, "a");
                assert_eq!(variable, "undeclared");
            }
            other => panic!("expected UnknownVariable, got {other:?}"),
        }
    }

    #[test]
    fn bad_element_kind_names_element() {
        let text = "\
apiVersion: 1
start: a
elements:
  a:
    kind: teleport
";
        match parse(text) {
            Err(ParseError::BadElement { id, .. }) => assert_eq!(id, "a"),
            other => panic!("expected BadElement, got {other:?}"),
        }
    }

    #[test]
    fn empty_elements_is_rejected() {
        let text = "apiVersion: 1\nelements: {}\n";
        assert!(matches!(parse(text), Err(ParseError::NoElements)));
    }

    #[test]
    fn json_documents_parse_too() {
        let text = r#"{"apiVersion": 1, "start": "a", "elements": {"a": {"kind": "assignment"}}}"#;
        let doc = parse(text).unwrap();
        assert_eq!(doc.root, "a");
    }

    #[test]
    fn branch_outcomes_resolve_and_sort() {
        let text = "\
apiVersion: 1
start: pick
elements:
  pick:
    kind: branch
    outcomes:
      zebra: b
      alpha: a
  a:
    kind: assignment
  b:
    kind: assignment
";
        let doc = parse(text).unwrap();
        // Outcomes are stored sorted by outcome name.
        assert_eq!(doc.elements["pick"].success_targets, vec!["a", "b"]);
    }

    #[test]
    fn parse_is_deterministic() {
        let a = parse(SIMPLE).unwrap();
        let b = parse(SIMPLE).unwrap();
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }
}
