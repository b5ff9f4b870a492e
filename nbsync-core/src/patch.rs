//! Patch engine: structural diff and atomic application over [`Value`] trees.
//!
//! A patch is an ordered list of primitive operations addressed by a path of
//! string keys (array positions are decimal strings, `"-"` appends):
//!
//! ```text
//! Replace { path, value }   overwrite an existing slot
//! Add     { path, value }   insert a map key / array element
//! Remove  { path }          delete a map key / array element
//! ```
//!
//! `diff` only ever descends into maps. Arrays that differ are replaced as a
//! whole, so the cell order is never patched by index: two parties splicing
//! the same list by position would disagree on what the positions mean.
//!
//! `apply` works on a copy and returns it only if every operation succeeded.
//!
//! Reference: RFC 6902 — JavaScript Object Notation (JSON) Patch

use crate::notebook::{fields, Notebook, SchemaError};
use crate::value::{Map, Value};

/// Path from the document root to a slot.
pub type Path = Vec<String>;

fn display_path(path: &[String]) -> String {
    format!("/{}", path.join("/"))
}

/// Patch errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PatchError {
    #[error("Path not found: {}", display_path(.0))]
    PathNotFound(Path),

    #[error("Cannot address into {kind} at {}", display_path(.path))]
    NotAContainer { path: Path, kind: &'static str },

    #[error("Invalid array index '{index}' at {}", display_path(.path))]
    InvalidIndex { path: Path, index: String },

    #[error("Cannot remove the document root")]
    CannotRemoveRoot,

    #[error("Malformed patch: {0}")]
    Malformed(String),

    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("Notebook invariant violated: {0}")]
    Invariant(String),

    #[error("Local edits may not touch server-owned field {}", display_path(.0))]
    ServerOwned(Path),
}

/// One primitive patch operation.
#[derive(Debug, Clone, PartialEq)]
pub enum PatchOp {
    Replace { path: Path, value: Value },
    Add { path: Path, value: Value },
    Remove { path: Path },
}

impl PatchOp {
    pub fn path(&self) -> &[String] {
        match self {
            PatchOp::Replace { path, .. } | PatchOp::Add { path, .. } | PatchOp::Remove { path } => {
                path
            }
        }
    }

    /// Whether the operation addresses something under the top-level `field`.
    pub fn touches(&self, field: &str) -> bool {
        self.path().first().map(String::as_str) == Some(field)
    }

    fn name(&self) -> &'static str {
        match self {
            PatchOp::Replace { .. } => "replace",
            PatchOp::Add { .. } => "add",
            PatchOp::Remove { .. } => "remove",
        }
    }

    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("op".into(), Value::from(self.name()));
        map.insert(
            "path".into(),
            Value::Array(self.path().iter().map(|k| Value::from(k.as_str())).collect()),
        );
        if let PatchOp::Replace { value, .. } | PatchOp::Add { value, .. } = self {
            map.insert("value".into(), value.clone());
        }
        Value::Map(map)
    }

    pub fn from_value(value: &Value) -> Result<Self, PatchError> {
        let map = value
            .as_map()
            .ok_or_else(|| PatchError::Malformed(format!("operation is a {}", value.kind())))?;
        let path = match map.get("path") {
            Some(Value::Array(items)) => items
                .iter()
                .map(|k| match k {
                    Value::Str(s) => Ok(s.clone()),
                    Value::Int(i) => Ok(i.to_string()),
                    other => Err(PatchError::Malformed(format!("path segment is a {}", other.kind()))),
                })
                .collect::<Result<Path, _>>()?,
            _ => return Err(PatchError::Malformed("operation has no path".into())),
        };
        let value = || {
            map.get("value")
                .cloned()
                .ok_or_else(|| PatchError::Malformed("operation has no value".into()))
        };
        match map.get("op").and_then(Value::as_str) {
            Some("replace") => Ok(PatchOp::Replace { path, value: value()? }),
            Some("add") => Ok(PatchOp::Add { path, value: value()? }),
            Some("remove") => Ok(PatchOp::Remove { path }),
            Some(other) => Err(PatchError::Malformed(format!("unknown op '{other}'"))),
            None => Err(PatchError::Malformed("operation has no op".into())),
        }
    }
}

/// Ordered list of operations, applied atomically.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Patch {
    pub ops: Vec<PatchOp>,
}

impl Patch {
    pub fn new(ops: Vec<PatchOp>) -> Self {
        Self { ops }
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PatchOp> {
        self.ops.iter()
    }

    pub fn extend(&mut self, other: Patch) {
        self.ops.extend(other.ops);
    }

    /// Whether any operation addresses the top-level `field`.
    pub fn touches(&self, field: &str) -> bool {
        self.ops.iter().any(|op| op.touches(field))
    }

    /// Split into (matching, rest), preserving relative order in both.
    pub fn partition<F>(self, mut pred: F) -> (Patch, Patch)
    where
        F: FnMut(&PatchOp) -> bool,
    {
        let (yes, no): (Vec<_>, Vec<_>) = self.ops.into_iter().partition(|op| pred(op));
        (Patch::new(yes), Patch::new(no))
    }

    pub fn to_value(&self) -> Value {
        Value::Array(self.ops.iter().map(PatchOp::to_value).collect())
    }

    pub fn from_value(value: &Value) -> Result<Self, PatchError> {
        let items = value
            .as_array()
            .ok_or_else(|| PatchError::Malformed(format!("patch is a {}", value.kind())))?;
        items
            .iter()
            .map(PatchOp::from_value)
            .collect::<Result<Vec<_>, _>>()
            .map(Patch::new)
    }
}

// ───────────────────────────────────────────────────────────────────
// Diff
// ───────────────────────────────────────────────────────────────────

/// Forward patch plus the patch that undoes it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Diff {
    pub patch: Patch,
    pub inverse: Patch,
}

/// Compute the operations turning `before` into `after`.
pub fn diff(before: &Value, after: &Value) -> Diff {
    let mut forward = Vec::new();
    let mut backward = Vec::new();
    diff_into(&mut Vec::new(), before, after, &mut forward, &mut backward);
    backward.reverse();
    Diff {
        patch: Patch::new(forward),
        inverse: Patch::new(backward),
    }
}

fn diff_into(
    path: &mut Path,
    before: &Value,
    after: &Value,
    forward: &mut Vec<PatchOp>,
    backward: &mut Vec<PatchOp>,
) {
    match (before, after) {
        (Value::Map(old), Value::Map(new)) => {
            for (key, old_value) in old {
                path.push(key.clone());
                match new.get(key) {
                    Some(new_value) => diff_into(path, old_value, new_value, forward, backward),
                    None => {
                        forward.push(PatchOp::Remove { path: path.clone() });
                        backward.push(PatchOp::Add {
                            path: path.clone(),
                            value: old_value.clone(),
                        });
                    }
                }
                path.pop();
            }
            for (key, new_value) in new {
                if old.contains_key(key) {
                    continue;
                }
                path.push(key.clone());
                forward.push(PatchOp::Add {
                    path: path.clone(),
                    value: new_value.clone(),
                });
                backward.push(PatchOp::Remove { path: path.clone() });
                path.pop();
            }
        }
        _ if before == after => {}
        _ => {
            forward.push(PatchOp::Replace {
                path: path.clone(),
                value: after.clone(),
            });
            backward.push(PatchOp::Replace {
                path: path.clone(),
                value: before.clone(),
            });
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Apply
// ───────────────────────────────────────────────────────────────────

/// Apply `patch` to a copy of `value`. On any failure the copy is discarded.
pub fn apply(value: &Value, patch: &Patch) -> Result<Value, PatchError> {
    let mut next = value.clone();
    for op in &patch.ops {
        apply_op(&mut next, op)?;
    }
    Ok(next)
}

fn parse_index(key: &str, path: &[String]) -> Result<usize, PatchError> {
    key.parse::<usize>().map_err(|_| PatchError::InvalidIndex {
        path: path.to_vec(),
        index: key.to_string(),
    })
}

fn resolve_mut<'a>(root: &'a mut Value, path: &[String]) -> Result<&'a mut Value, PatchError> {
    let mut current = root;
    for (depth, key) in path.iter().enumerate() {
        current = match current {
            Value::Map(map) => map
                .get_mut(key)
                .ok_or_else(|| PatchError::PathNotFound(path[..=depth].to_vec()))?,
            Value::Array(items) => {
                let index = parse_index(key, &path[..depth])?;
                items
                    .get_mut(index)
                    .ok_or_else(|| PatchError::PathNotFound(path[..=depth].to_vec()))?
            }
            other => {
                return Err(PatchError::NotAContainer {
                    path: path[..depth].to_vec(),
                    kind: other.kind(),
                })
            }
        };
    }
    Ok(current)
}

fn apply_op(root: &mut Value, op: &PatchOp) -> Result<(), PatchError> {
    let path = op.path();
    let Some((last, parent_path)) = path.split_last() else {
        return match op {
            PatchOp::Replace { value, .. } | PatchOp::Add { value, .. } => {
                *root = value.clone();
                Ok(())
            }
            PatchOp::Remove { .. } => Err(PatchError::CannotRemoveRoot),
        };
    };
    let not_found = || PatchError::PathNotFound(path.to_vec());

    match resolve_mut(root, parent_path)? {
        Value::Map(map) => match op {
            PatchOp::Add { value, .. } => {
                map.insert(last.clone(), value.clone());
            }
            PatchOp::Replace { value, .. } => {
                *map.get_mut(last).ok_or_else(not_found)? = value.clone();
            }
            PatchOp::Remove { .. } => {
                map.remove(last).ok_or_else(not_found)?;
            }
        },
        Value::Array(items) => match op {
            PatchOp::Add { value, .. } => {
                let index = if last == "-" {
                    items.len()
                } else {
                    parse_index(last, parent_path)?
                };
                if index > items.len() {
                    return Err(not_found());
                }
                items.insert(index, value.clone());
            }
            PatchOp::Replace { value, .. } => {
                let index = parse_index(last, parent_path)?;
                *items.get_mut(index).ok_or_else(not_found)? = value.clone();
            }
            PatchOp::Remove { .. } => {
                let index = parse_index(last, parent_path)?;
                if index >= items.len() {
                    return Err(not_found());
                }
                items.remove(index);
            }
        },
        other => {
            return Err(PatchError::NotAContainer {
                path: parent_path.to_vec(),
                kind: other.kind(),
            })
        }
    }
    Ok(())
}

// ───────────────────────────────────────────────────────────────────
// Notebook-level helpers
// ───────────────────────────────────────────────────────────────────

/// Result of diffing a notebook against a mutation.
#[derive(Debug, Clone)]
pub struct NotebookDiff {
    pub snapshot: Notebook,
    pub patch: Patch,
    pub inverse: Patch,
}

/// Run `mutate` on a copy of `snapshot` and diff the result against it.
pub fn diff_notebook<F>(snapshot: &Notebook, mutate: F) -> Result<NotebookDiff, PatchError>
where
    F: FnOnce(&mut Notebook),
{
    let mut next = snapshot.clone();
    mutate(&mut next);
    next.validate()?;
    let Diff { patch, inverse } = diff(&snapshot.to_value(), &next.to_value());
    Ok(NotebookDiff {
        snapshot: next,
        patch,
        inverse,
    })
}

/// Apply `patch` to `snapshot`, producing a new validated snapshot.
pub fn apply_notebook(snapshot: &Notebook, patch: &Patch) -> Result<Notebook, PatchError> {
    let value = apply(&snapshot.to_value(), patch)?;
    let next = Notebook::from_value(&value)?;
    next.validate()?;
    Ok(next)
}

/// Refuse patches that write fields only the remote party may write.
pub fn ensure_client_writable(patch: &Patch) -> Result<(), PatchError> {
    match patch.iter().find(|op| op.touches(fields::CELL_RESULTS)) {
        Some(op) => Err(PatchError::ServerOwned(op.path().to_vec())),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notebook::{BondValue, CellResult};
    use serde_json::json;

    fn doc() -> Value {
        Value::from(json!({
            "cell_order": ["A", "B"],
            "cell_inputs": {
                "A": {"code": "1 + 1", "folded": false},
                "B": {"code": "x", "folded": true}
            },
            "bonds": {"x": {"value": 1}}
        }))
    }

    fn path(keys: &[&str]) -> Path {
        keys.iter().map(|k| k.to_string()).collect()
    }

    #[test]
    fn test_diff_identical_is_empty() {
        let d = diff(&doc(), &doc());
        assert!(d.patch.is_empty());
        assert!(d.inverse.is_empty());
    }

    #[test]
    fn test_diff_descends_into_maps() {
        let mut after = doc();
        after.as_map_mut().unwrap().insert(
            "cell_inputs".into(),
            Value::from(json!({
                "A": {"code": "2 + 2", "folded": false},
                "B": {"code": "x", "folded": true}
            })),
        );
        let d = diff(&doc(), &after);
        assert_eq!(
            d.patch.ops,
            vec![PatchOp::Replace {
                path: path(&["cell_inputs", "A", "code"]),
                value: Value::from("2 + 2"),
            }]
        );
    }

    #[test]
    fn test_diff_replaces_arrays_wholesale() {
        let mut after = doc();
        after
            .as_map_mut()
            .unwrap()
            .insert("cell_order".into(), Value::from(json!(["B", "A"])));
        let d = diff(&doc(), &after);
        assert_eq!(d.patch.len(), 1);
        match &d.patch.ops[0] {
            PatchOp::Replace { path: p, value } => {
                assert_eq!(p, &path(&["cell_order"]));
                assert_eq!(value, &Value::from(json!(["B", "A"])));
            }
            other => panic!("expected whole-array replace, got {other:?}"),
        }
    }

    #[test]
    fn test_inverse_law() {
        let before = doc();
        let mut after = doc();
        {
            let m = after.as_map_mut().unwrap();
            m.remove("bonds");
            m.insert("metadata".into(), Value::from(json!({"k": [1, 2]})));
            m.insert("cell_order".into(), Value::from(json!(["B"])));
        }
        let d = diff(&before, &after);
        let forward = apply(&before, &d.patch).unwrap();
        assert_eq!(forward, after);
        let back = apply(&forward, &d.inverse).unwrap();
        assert_eq!(back, before);
    }

    #[test]
    fn test_apply_is_atomic() {
        let before = doc();
        let patch = Patch::new(vec![
            PatchOp::Replace {
                path: path(&["bonds", "x", "value"]),
                value: Value::Int(2),
            },
            PatchOp::Remove {
                path: path(&["bonds", "missing"]),
            },
        ]);
        let err = apply(&before, &patch).unwrap_err();
        assert_eq!(err, PatchError::PathNotFound(path(&["bonds", "missing"])));
        assert_eq!(before, doc());
    }

    #[test]
    fn test_apply_array_ops() {
        let v = Value::from(json!({"list": [1, 2, 3]}));
        let patch = Patch::new(vec![
            PatchOp::Add {
                path: path(&["list", "-"]),
                value: Value::Int(4),
            },
            PatchOp::Remove {
                path: path(&["list", "0"]),
            },
            PatchOp::Replace {
                path: path(&["list", "0"]),
                value: Value::Int(20),
            },
        ]);
        let out = apply(&v, &patch).unwrap();
        assert_eq!(out, Value::from(json!({"list": [20, 3, 4]})));
    }

    #[test]
    fn test_apply_errors() {
        let v = Value::from(json!({"list": [1], "n": 5}));
        let bad_index = Patch::new(vec![PatchOp::Remove {
            path: path(&["list", "x"]),
        }]);
        assert!(matches!(
            apply(&v, &bad_index),
            Err(PatchError::InvalidIndex { .. })
        ));
        let into_scalar = Patch::new(vec![PatchOp::Add {
            path: path(&["n", "k"]),
            value: Value::Nil,
        }]);
        assert!(matches!(
            apply(&v, &into_scalar),
            Err(PatchError::NotAContainer { kind: "int", .. })
        ));
        let root = Patch::new(vec![PatchOp::Remove { path: Vec::new() }]);
        assert_eq!(apply(&v, &root), Err(PatchError::CannotRemoveRoot));
    }

    #[test]
    fn test_root_replace() {
        let patch = Patch::new(vec![PatchOp::Replace {
            path: Vec::new(),
            value: Value::Int(1),
        }]);
        assert_eq!(apply(&doc(), &patch).unwrap(), Value::Int(1));
    }

    #[test]
    fn test_patch_value_conversion() {
        let patch = Patch::new(vec![
            PatchOp::Add {
                path: path(&["bonds", "y"]),
                value: Value::from(json!({"value": "hi"})),
            },
            PatchOp::Remove {
                path: path(&["bonds", "x"]),
            },
        ]);
        let back = Patch::from_value(&patch.to_value()).unwrap();
        assert_eq!(back, patch);
    }

    #[test]
    fn test_patch_from_value_accepts_integer_segments() {
        let v = Value::from(json!([{"op": "remove", "path": ["list", 0]}]));
        let patch = Patch::from_value(&v).unwrap();
        assert_eq!(patch.ops[0].path(), &path(&["list", "0"])[..]);
    }

    #[test]
    fn test_malformed_patch() {
        let v = Value::from(json!([{"op": "move", "path": ["a"]}]));
        assert!(matches!(Patch::from_value(&v), Err(PatchError::Malformed(_))));
        let v = Value::from(json!([{"op": "add", "path": ["a"]}]));
        assert!(matches!(Patch::from_value(&v), Err(PatchError::Malformed(_))));
    }

    #[test]
    fn test_partition_keeps_order() {
        let patch = Patch::new(vec![
            PatchOp::Remove { path: path(&["bonds", "a"]) },
            PatchOp::Remove { path: path(&["cell_inputs", "A"]) },
            PatchOp::Remove { path: path(&["bonds", "b"]) },
        ]);
        let (bonds, rest) = patch.partition(|op| op.touches("bonds"));
        assert_eq!(bonds.len(), 2);
        assert_eq!(bonds.ops[1].path(), &path(&["bonds", "b"])[..]);
        assert_eq!(rest.len(), 1);
    }

    #[test]
    fn test_notebook_diff_and_apply() {
        let mut nb = Notebook::new("nb");
        nb.insert_cell(0, "A", "1 + 1");
        let d = diff_notebook(&nb, |n| {
            n.cell_inputs.get_mut("A").unwrap().code = "2 + 2".into();
            n.bonds.insert("x".into(), BondValue::new(5));
        })
        .unwrap();
        assert_eq!(d.patch.len(), 2);
        let applied = apply_notebook(&nb, &d.patch).unwrap();
        assert_eq!(applied, d.snapshot);
        let undone = apply_notebook(&applied, &d.inverse).unwrap();
        assert_eq!(undone, nb);
    }

    #[test]
    fn test_notebook_noop_mutation_is_empty() {
        let mut nb = Notebook::new("nb");
        nb.insert_cell(0, "A", "1");
        let d = diff_notebook(&nb, |_| {}).unwrap();
        assert!(d.patch.is_empty());
    }

    #[test]
    fn test_notebook_mutation_must_keep_invariants() {
        let nb = Notebook::new("nb");
        let err = diff_notebook(&nb, |n| n.cell_order.push("ghost".into())).unwrap_err();
        assert!(matches!(err, PatchError::Invariant(_)));
    }

    #[test]
    fn test_apply_notebook_rejects_invariant_break() {
        let mut nb = Notebook::new("nb");
        nb.insert_cell(0, "A", "1");
        let patch = Patch::new(vec![PatchOp::Remove {
            path: path(&["cell_inputs", "A"]),
        }]);
        assert!(matches!(
            apply_notebook(&nb, &patch),
            Err(PatchError::Invariant(_))
        ));
    }

    #[test]
    fn test_server_owned_fields() {
        let mut nb = Notebook::new("nb");
        nb.insert_cell(0, "A", "1");
        let d = diff_notebook(&nb, |n| {
            n.cell_results.insert("A".into(), CellResult::default());
        })
        .unwrap();
        assert!(matches!(
            ensure_client_writable(&d.patch),
            Err(PatchError::ServerOwned(_))
        ));
        let ok = diff_notebook(&nb, |n| n.path = "/x.jl".into()).unwrap();
        assert!(ensure_client_writable(&ok.patch).is_ok());
    }
}
