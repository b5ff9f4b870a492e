//! Laws the patch engine and codec must satisfy for every kind of edit a
//! client or the remote party can make.

use nbsync_core::{
    apply_notebook, decode_frame, diff_notebook, encode_frame, BondValue, CellResult, Notebook,
    TypedArray, Value,
};
use serde_json::json;

fn base() -> Notebook {
    let mut nb = Notebook::new("law-nb");
    nb.path = "/home/user/law.jl".into();
    nb.insert_cell(0, "A", "a = 1");
    nb.insert_cell(1, "B", "b = a + 1");
    nb.insert_cell(2, "C", "@bind x Slider(1:10)");
    nb.cell_results.insert(
        "A".into(),
        CellResult {
            cell_id: "A".into(),
            output: Value::from("1"),
            runtime: Some(42),
            ..CellResult::default()
        },
    );
    nb.bonds.insert("x".into(), BondValue::new(3));
    nb.metadata
        .insert("frontmatter".into(), Value::from(json!({"title": "Laws"})));
    nb
}

type Mutator = fn(&mut Notebook);

fn mutators() -> [(&'static str, Mutator); 11] {
    let list: [(&'static str, Mutator); 11] = [
        ("noop", |_| {}),
        ("edit code", |nb| {
            nb.cell_inputs.get_mut("A").unwrap().code = "a = 2".into();
        }),
        ("fold", |nb| {
            nb.cell_inputs.get_mut("B").unwrap().code_folded = true;
        }),
        ("reorder", |nb| {
            nb.move_cell("C", 0);
        }),
        ("add cell", |nb| {
            nb.add_cell("d = 4");
        }),
        ("delete cell", |nb| {
            nb.delete_cell("B");
        }),
        ("bond change", |nb| {
            nb.bonds.insert("x".into(), BondValue::new(7));
        }),
        ("bond removal", |nb| {
            nb.bonds.clear();
        }),
        ("binary output", |nb| {
            nb.cell_results.get_mut("A").unwrap().output =
                Value::Typed(TypedArray::F32(vec![0.5, 1.5]));
        }),
        ("metadata", |nb| {
            nb.metadata.remove("frontmatter");
            nb.metadata.insert("disabled".into(), Value::Bool(true));
        }),
        ("everything", |nb| {
            nb.path = "/elsewhere.jl".into();
            nb.cell_order.reverse();
            nb.bonds.insert("y".into(), BondValue::new("on"));
            nb.extra.insert("nbpkg".into(), Value::from(json!({"enabled": true})));
        }),
    ];
    list
}

#[test]
fn test_inverse_law_for_every_mutator() {
    let s = base();
    for (name, f) in mutators() {
        let d = diff_notebook(&s, f).unwrap();
        let forward = apply_notebook(&s, &d.patch).unwrap();
        assert_eq!(forward, d.snapshot, "forward mismatch for {name}");
        let back = apply_notebook(&forward, &d.inverse).unwrap();
        assert_eq!(back, s, "inverse law broken for {name}");
    }
}

#[test]
fn test_noop_mutator_yields_empty_patch() {
    let d = diff_notebook(&base(), |_| {}).unwrap();
    assert!(d.patch.is_empty());
    assert!(d.inverse.is_empty());
}

#[test]
fn test_reorder_is_a_single_whole_value_replace() {
    let d = diff_notebook(&base(), |nb| {
        nb.move_cell("A", 2);
    })
    .unwrap();
    assert_eq!(d.patch.len(), 1);
    assert_eq!(d.patch.ops[0].path(), ["cell_order".to_string()]);
}

#[test]
fn test_patches_survive_the_wire() {
    let s = base();
    for (name, f) in mutators() {
        let d = diff_notebook(&s, f).unwrap();
        let frame = encode_frame(&d.patch.to_value()).unwrap();
        let decoded: Value = decode_frame(&frame).unwrap();
        let patch = nbsync_core::Patch::from_value(&decoded).unwrap();
        assert_eq!(patch, d.patch, "wire roundtrip changed patch for {name}");
    }
}

#[test]
fn test_notebook_value_roundtrips_through_codec() {
    let v = base().to_value();
    let frame = encode_frame(&v).unwrap();
    let back: Value = decode_frame(&frame).unwrap();
    assert_eq!(Notebook::from_value(&back).unwrap(), base());
}
