use criterion::{black_box, criterion_group, criterion_main, Criterion};
use nbsync_core::{
    apply_notebook, decode_frame, diff_notebook, encode_frame, BondValue, CellResult, Notebook,
    Value,
};

/// Notebook with `cells` cells, each with a small result.
fn notebook(cells: usize) -> Notebook {
    let mut nb = Notebook::new("bench");
    for i in 0..cells {
        let id = format!("cell-{i}");
        nb.insert_cell(i, id.clone(), format!("x{i} = {i} + 1"));
        nb.cell_results.insert(
            id.clone(),
            CellResult {
                cell_id: id,
                output: Value::from(format!("{}", i + 1)),
                runtime: Some(1_000),
                ..CellResult::default()
            },
        );
    }
    nb.bonds.insert("slider".into(), BondValue::new(1));
    nb
}

fn bench_diff_single_edit(c: &mut Criterion) {
    let nb = notebook(200);
    c.bench_function("diff_single_code_edit_200_cells", |b| {
        b.iter(|| {
            let d = diff_notebook(black_box(&nb), |n| {
                if let Some(input) = n.cell_inputs.get_mut("cell-100") {
                    input.code = "x100 = 0".into();
                }
            })
            .unwrap();
            black_box(d.patch);
        })
    });
}

fn bench_apply_bond_patch(c: &mut Criterion) {
    let nb = notebook(200);
    let d = diff_notebook(&nb, |n| {
        n.bonds.insert("slider".into(), BondValue::new(2));
    })
    .unwrap();
    c.bench_function("apply_bond_patch_200_cells", |b| {
        b.iter(|| black_box(apply_notebook(black_box(&nb), black_box(&d.patch)).unwrap()))
    });
}

fn bench_frame_roundtrip(c: &mut Criterion) {
    let v = notebook(200).to_value();
    c.bench_function("frame_roundtrip_200_cells", |b| {
        b.iter(|| {
            let frame = encode_frame(black_box(&v)).unwrap();
            black_box(decode_frame::<Value>(&frame).unwrap());
        })
    });
}

criterion_group!(
    benches,
    bench_diff_single_edit,
    bench_apply_bond_patch,
    bench_frame_roundtrip
);
criterion_main!(benches);
