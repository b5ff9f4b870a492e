//! Mirrored notebook document and the client-only overlay of staged edits.
//!
//! ```text
//! Notebook
//! ├── notebook_id, path
//! ├── cell_order    [id, id, …]          replaced wholesale, never spliced
//! ├── cell_inputs   id → CellInput       code, folded flag, metadata
//! ├── cell_results  id → CellResult      written only by the remote party
//! ├── bonds         name → BondValue     reactive variables
//! ├── metadata      free-form map
//! └── extra         unknown top-level fields, carried through untouched
//! ```
//!
//! Conversions to and from [`Value`] are explicit so that the patch engine can
//! work on a single generic tree while the rest of the code stays typed.

use std::collections::{BTreeMap, BTreeSet};

use uuid::Uuid;

use crate::patch::PatchError;
use crate::value::{Map, Value};

/// Top-level field names, as they appear in patch paths.
pub mod fields {
    pub const NOTEBOOK_ID: &str = "notebook_id";
    pub const PATH: &str = "path";
    pub const CELL_ORDER: &str = "cell_order";
    pub const CELL_INPUTS: &str = "cell_inputs";
    pub const CELL_RESULTS: &str = "cell_results";
    pub const BONDS: &str = "bonds";
    pub const METADATA: &str = "metadata";

    pub(crate) const KNOWN: [&str; 7] = [
        NOTEBOOK_ID,
        PATH,
        CELL_ORDER,
        CELL_INPUTS,
        CELL_RESULTS,
        BONDS,
        METADATA,
    ];
}

/// Error converting a [`Value`] into a typed model struct.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    #[error("Missing field '{0}'")]
    Missing(String),

    #[error("Field '{field}' should be {expected}, found {found}")]
    WrongType {
        field: String,
        expected: &'static str,
        found: &'static str,
    },
}

// ───────────────────────────────────────────────────────────────────
// Field access helpers
// ───────────────────────────────────────────────────────────────────

fn expect_map<'a>(value: &'a Value, field: &str) -> Result<&'a Map, SchemaError> {
    value.as_map().ok_or_else(|| SchemaError::WrongType {
        field: field.to_string(),
        expected: "map",
        found: value.kind(),
    })
}

fn required_str(map: &Map, key: &str, ctx: &str) -> Result<String, SchemaError> {
    match map.get(key) {
        Some(Value::Str(s)) => Ok(s.clone()),
        Some(other) => Err(SchemaError::WrongType {
            field: format!("{ctx}.{key}"),
            expected: "string",
            found: other.kind(),
        }),
        None => Err(SchemaError::Missing(format!("{ctx}.{key}"))),
    }
}

fn optional_str(map: &Map, key: &str, ctx: &str) -> Result<String, SchemaError> {
    match map.get(key) {
        None | Some(Value::Nil) => Ok(String::new()),
        Some(_) => required_str(map, key, ctx),
    }
}

fn flag(map: &Map, key: &str, ctx: &str) -> Result<bool, SchemaError> {
    match map.get(key) {
        None | Some(Value::Nil) => Ok(false),
        Some(Value::Bool(b)) => Ok(*b),
        Some(other) => Err(SchemaError::WrongType {
            field: format!("{ctx}.{key}"),
            expected: "bool",
            found: other.kind(),
        }),
    }
}

fn sub_map(map: &Map, key: &str, ctx: &str) -> Result<Map, SchemaError> {
    match map.get(key) {
        None | Some(Value::Nil) => Ok(Map::new()),
        Some(v) => expect_map(v, &format!("{ctx}.{key}")).cloned(),
    }
}

/// Entries of `map` whose keys are not in `known`.
fn unknown(map: &Map, known: &[&str]) -> Map {
    map.iter()
        .filter(|(k, _)| !known.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn entries<T>(
    map: &Map,
    key: &str,
    parse: fn(&Value, &str) -> Result<T, SchemaError>,
) -> Result<BTreeMap<String, T>, SchemaError> {
    match map.get(key) {
        None | Some(Value::Nil) => Ok(BTreeMap::new()),
        Some(v) => expect_map(v, &format!("notebook.{key}"))?
            .iter()
            .map(|(id, item)| parse(item, &format!("{key}.{id}")).map(|t| (id.clone(), t)))
            .collect(),
    }
}

// ───────────────────────────────────────────────────────────────────
// Cells and bonds
// ───────────────────────────────────────────────────────────────────
//
// Each struct keeps the keys it does not model in `extra`, so a field the
// remote party adds survives the round trip through the typed form and later
// patches can address it.

const CELL_INPUT_KEYS: [&str; 4] = ["cell_id", "code", "code_folded", "metadata"];
const CELL_RESULT_KEYS: [&str; 6] = ["cell_id", "queued", "running", "errored", "runtime", "output"];
const BOND_KEYS: [&str; 1] = ["value"];

/// Source of one cell.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CellInput {
    pub cell_id: String,
    pub code: String,
    pub code_folded: bool,
    pub metadata: Map,
    pub extra: Map,
}

impl CellInput {
    pub fn new(cell_id: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            cell_id: cell_id.into(),
            code: code.into(),
            ..Self::default()
        }
    }

    pub fn to_value(&self) -> Value {
        let mut map = self.extra.clone();
        map.insert("cell_id".into(), Value::from(self.cell_id.as_str()));
        map.insert("code".into(), Value::from(self.code.as_str()));
        map.insert("code_folded".into(), Value::Bool(self.code_folded));
        map.insert("metadata".into(), Value::Map(self.metadata.clone()));
        Value::Map(map)
    }

    pub fn from_value(value: &Value, ctx: &str) -> Result<Self, SchemaError> {
        let map = expect_map(value, ctx)?;
        Ok(Self {
            cell_id: required_str(map, "cell_id", ctx)?,
            code: optional_str(map, "code", ctx)?,
            code_folded: flag(map, "code_folded", ctx)?,
            metadata: sub_map(map, "metadata", ctx)?,
            extra: unknown(map, &CELL_INPUT_KEYS),
        })
    }
}

/// Execution state and output of one cell, as reported by the remote party.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CellResult {
    pub cell_id: String,
    pub queued: bool,
    pub running: bool,
    pub errored: bool,
    /// Last run time in nanoseconds.
    pub runtime: Option<u64>,
    pub output: Value,
    pub extra: Map,
}

impl CellResult {
    /// Whether the cell is waiting for or undergoing evaluation.
    pub fn is_busy(&self) -> bool {
        self.queued || self.running
    }

    pub fn to_value(&self) -> Value {
        let runtime = self
            .runtime
            .map_or(Value::Nil, |ns| Value::Int(i64::try_from(ns).unwrap_or(i64::MAX)));
        let mut map = self.extra.clone();
        map.insert("cell_id".into(), Value::from(self.cell_id.as_str()));
        map.insert("queued".into(), Value::Bool(self.queued));
        map.insert("running".into(), Value::Bool(self.running));
        map.insert("errored".into(), Value::Bool(self.errored));
        map.insert("runtime".into(), runtime);
        map.insert("output".into(), self.output.clone());
        Value::Map(map)
    }

    pub fn from_value(value: &Value, ctx: &str) -> Result<Self, SchemaError> {
        let map = expect_map(value, ctx)?;
        let runtime = match map.get("runtime") {
            None | Some(Value::Nil) => None,
            Some(v) => Some(v.as_u64().ok_or_else(|| SchemaError::WrongType {
                field: format!("{ctx}.runtime"),
                expected: "non-negative integer",
                found: v.kind(),
            })?),
        };
        Ok(Self {
            cell_id: required_str(map, "cell_id", ctx)?,
            queued: flag(map, "queued", ctx)?,
            running: flag(map, "running", ctx)?,
            errored: flag(map, "errored", ctx)?,
            runtime,
            output: map.get("output").cloned().unwrap_or_default(),
            extra: unknown(map, &CELL_RESULT_KEYS),
        })
    }
}

/// Current value of a reactive variable.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BondValue {
    pub value: Value,
    pub extra: Map,
}

impl BondValue {
    pub fn new(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            extra: Map::new(),
        }
    }

    pub fn to_value(&self) -> Value {
        let mut map = self.extra.clone();
        map.insert("value".into(), self.value.clone());
        Value::Map(map)
    }

    pub fn from_value(value: &Value, ctx: &str) -> Result<Self, SchemaError> {
        let map = expect_map(value, ctx)?;
        Ok(Self {
            value: map.get("value").cloned().unwrap_or_default(),
            extra: unknown(map, &BOND_KEYS),
        })
    }
}

// ───────────────────────────────────────────────────────────────────
// Notebook
// ───────────────────────────────────────────────────────────────────

/// Immutable-by-convention document snapshot.
///
/// Snapshots are replaced, not edited in place: a mutation clones the current
/// snapshot, changes the clone and diffs the two.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Notebook {
    pub notebook_id: String,
    pub path: String,
    pub cell_order: Vec<String>,
    pub cell_inputs: BTreeMap<String, CellInput>,
    pub cell_results: BTreeMap<String, CellResult>,
    pub bonds: BTreeMap<String, BondValue>,
    pub metadata: Map,
    /// Top-level fields this client does not model.
    pub extra: Map,
}

impl Notebook {
    pub fn new(notebook_id: impl Into<String>) -> Self {
        Self {
            notebook_id: notebook_id.into(),
            ..Self::default()
        }
    }

    /// Append a new cell with a fresh id and return the id.
    pub fn add_cell(&mut self, code: impl Into<String>) -> String {
        let cell_id = Uuid::new_v4().to_string();
        self.insert_cell(self.cell_order.len(), cell_id.clone(), code);
        cell_id
    }

    /// Insert a cell at `index` (clamped to the end of the order).
    pub fn insert_cell(&mut self, index: usize, cell_id: impl Into<String>, code: impl Into<String>) {
        let cell_id = cell_id.into();
        let index = index.min(self.cell_order.len());
        self.cell_order.insert(index, cell_id.clone());
        self.cell_inputs
            .insert(cell_id.clone(), CellInput::new(cell_id, code));
    }

    /// Remove a cell's input and its place in the order.
    ///
    /// The result entry is left alone; the remote party removes it.
    pub fn delete_cell(&mut self, cell_id: &str) -> Option<CellInput> {
        self.cell_order.retain(|id| id != cell_id);
        self.cell_inputs.remove(cell_id)
    }

    /// Move a cell to `index` (clamped). Returns false if the cell is unknown.
    pub fn move_cell(&mut self, cell_id: &str, index: usize) -> bool {
        let Some(from) = self.cell_order.iter().position(|id| id == cell_id) else {
            return false;
        };
        let id = self.cell_order.remove(from);
        let index = index.min(self.cell_order.len());
        self.cell_order.insert(index, id);
        true
    }

    /// Code of a cell, if it exists.
    pub fn code(&self, cell_id: &str) -> Option<&str> {
        self.cell_inputs.get(cell_id).map(|c| c.code.as_str())
    }

    /// Whether any cell is queued or running.
    pub fn has_busy_cells(&self) -> bool {
        self.cell_results.values().any(CellResult::is_busy)
    }

    /// Check the structural invariants of the document.
    pub fn validate(&self) -> Result<(), PatchError> {
        let mut seen = BTreeSet::new();
        for id in &self.cell_order {
            if !seen.insert(id.as_str()) {
                return Err(PatchError::Invariant(format!(
                    "cell {id} appears twice in cell_order"
                )));
            }
            if !self.cell_inputs.contains_key(id) {
                return Err(PatchError::Invariant(format!(
                    "cell {id} is ordered but has no input"
                )));
            }
        }
        Ok(())
    }

    pub fn to_value(&self) -> Value {
        let mut map = self.extra.clone();
        map.insert(
            fields::NOTEBOOK_ID.into(),
            Value::from(self.notebook_id.as_str()),
        );
        map.insert(fields::PATH.into(), Value::from(self.path.as_str()));
        map.insert(
            fields::CELL_ORDER.into(),
            Value::Array(
                self.cell_order
                    .iter()
                    .map(|id| Value::from(id.as_str()))
                    .collect(),
            ),
        );
        map.insert(
            fields::CELL_INPUTS.into(),
            Value::Map(
                self.cell_inputs
                    .iter()
                    .map(|(id, c)| (id.clone(), c.to_value()))
                    .collect(),
            ),
        );
        map.insert(
            fields::CELL_RESULTS.into(),
            Value::Map(
                self.cell_results
                    .iter()
                    .map(|(id, r)| (id.clone(), r.to_value()))
                    .collect(),
            ),
        );
        map.insert(
            fields::BONDS.into(),
            Value::Map(
                self.bonds
                    .iter()
                    .map(|(name, b)| (name.clone(), b.to_value()))
                    .collect(),
            ),
        );
        map.insert(fields::METADATA.into(), Value::Map(self.metadata.clone()));
        Value::Map(map)
    }

    pub fn from_value(value: &Value) -> Result<Self, SchemaError> {
        let map = expect_map(value, "notebook")?;

        let cell_order = match map.get(fields::CELL_ORDER) {
            None | Some(Value::Nil) => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .enumerate()
                .map(|(i, v)| {
                    v.as_str().map(str::to_string).ok_or(SchemaError::WrongType {
                        field: format!("notebook.cell_order.{i}"),
                        expected: "string",
                        found: v.kind(),
                    })
                })
                .collect::<Result<_, _>>()?,
            Some(other) => {
                return Err(SchemaError::WrongType {
                    field: "notebook.cell_order".into(),
                    expected: "array",
                    found: other.kind(),
                })
            }
        };

        let cell_inputs = entries(map, fields::CELL_INPUTS, CellInput::from_value)?;
        let cell_results = entries(map, fields::CELL_RESULTS, CellResult::from_value)?;
        let bonds = entries(map, fields::BONDS, BondValue::from_value)?;

        let extra = unknown(map, &fields::KNOWN);

        Ok(Self {
            notebook_id: required_str(map, fields::NOTEBOOK_ID, "notebook")?,
            path: optional_str(map, fields::PATH, "notebook")?,
            cell_order,
            cell_inputs,
            cell_results,
            bonds,
            metadata: sub_map(map, fields::METADATA, "notebook")?,
            extra,
        })
    }
}

// ───────────────────────────────────────────────────────────────────
// Local overlay
// ───────────────────────────────────────────────────────────────────

/// Client-only staged code edits, not yet submitted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalOverlay {
    staged: BTreeMap<String, String>,
}

impl LocalOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage code for a cell, replacing any earlier staged code.
    pub fn stage(&mut self, cell_id: impl Into<String>, code: impl Into<String>) {
        self.staged.insert(cell_id.into(), code.into());
    }

    pub fn get(&self, cell_id: &str) -> Option<&str> {
        self.staged.get(cell_id).map(String::as_str)
    }

    pub fn discard(&mut self, cell_id: &str) -> Option<String> {
        self.staged.remove(cell_id)
    }

    /// Drop the staged entry once `submitted` has been acknowledged, unless the
    /// cell was re-staged with different code in the meantime.
    pub fn clear_if_unchanged(&mut self, cell_id: &str, submitted: &str) -> bool {
        if self.get(cell_id) == Some(submitted) {
            self.staged.remove(cell_id);
            true
        } else {
            false
        }
    }

    /// Copy staged code for `cell_ids` into `notebook`. Returns the
    /// `(cell_id, code)` pairs that were merged; unknown cells are skipped.
    pub fn merge_into(&self, notebook: &mut Notebook, cell_ids: &[String]) -> Vec<(String, String)> {
        let mut merged = Vec::new();
        for id in cell_ids {
            let (Some(code), Some(input)) = (self.staged.get(id), notebook.cell_inputs.get_mut(id))
            else {
                continue;
            };
            input.code = code.clone();
            merged.push((id.clone(), code.clone()));
        }
        merged
    }

    pub fn cells(&self) -> impl Iterator<Item = &str> {
        self.staged.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.staged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }
}
