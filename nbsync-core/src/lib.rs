//! # nbsync-core — Document model, patch engine and wire codec
//!
//! Synchronous building blocks for mirroring a notebook between an
//! authoritative remote party and a local copy. Nothing in this crate does
//! I/O or depends on an async runtime.
//!
//! ## Architecture
//!
//! ```text
//!   mutate(&mut Notebook)            inbound Patch
//!          │                              │
//!          ▼                              ▼
//!   diff_notebook(snapshot) ──Patch──▸ apply_notebook(snapshot)
//!          │                              │
//!          ▼                              ▼
//!   Value tree ◂──── to_value / from_value ────▸ Notebook
//!          │
//!          ▼
//!   codec::encode_frame ──▸ bytes ++ FRAME_DELIMITER
//! ```
//!
//! ## Modules
//!
//! - [`value`] — dynamic `Value` tree (JSON plus bytes, typed arrays, dates)
//! - [`codec`] — bincode framing with a trailing delimiter
//! - [`notebook`] — `Notebook`, cells, bonds, `LocalOverlay`
//! - [`patch`] — `PatchOp`, `diff`, `apply`, notebook-level helpers

pub mod codec;
pub mod notebook;
pub mod patch;
pub mod value;

pub use codec::{decode, decode_frame, encode, encode_frame, CodecError, FRAME_DELIMITER};
pub use notebook::{fields, BondValue, CellInput, CellResult, LocalOverlay, Notebook, SchemaError};
pub use patch::{
    apply, apply_notebook, diff, diff_notebook, ensure_client_writable, Diff, NotebookDiff, Patch,
    PatchError, PatchOp, Path,
};
pub use value::{Map, TypedArray, Value};
