use branch_fixer::apply::{ChangeApplier, FsChangeApplier};
use branch_fixer::discovery::parse_pytest_output;
use branch_fixer::model::CodeChange;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::fmt::Write;

fn synthetic_output(failures: usize) -> String {
    let mut out = String::from(
        "============================= test session starts ==============================\n\
         collected 4000 items\n\n",
    );
    out.push_str("=================================== FAILURES ===================================\n");
    for i in 0..failures {
        let _ = write!(
            out,
            "____________________________ test_case_{i:04} ____________________________\n\
             \n    def test_case_{i:04}():\n>       assert compute({i}) == {}\n\
             E       assert {i} == {}\n\n\
             tests/test_mod_{m:02}.py:{line}: AssertionError\n",
            i + 1,
            i + 1,
            m = i % 40,
            line = 10 + i % 200,
        );
    }
    out.push_str("=========================== short test summary info ============================\n");
    for i in 0..failures {
        let _ = writeln!(
            out,
            "FAILED tests/test_mod_{:02}.py::test_case_{:04} - assert {} == {}",
            i % 40,
            i,
            i,
            i + 1
        );
    }
    let _ = writeln!(out, "======================= {failures} failed, 3000 passed in 12.34s =======================");
    out
}

fn bench_parse_output(c: &mut Criterion) {
    let small = synthetic_output(10);
    let large = synthetic_output(1_000);

    c.bench_function("parse_pytest_output_10", |b| {
        b.iter(|| black_box(parse_pytest_output(black_box(&small)).len()));
    });
    c.bench_function("parse_pytest_output_1000", |b| {
        b.iter(|| black_box(parse_pytest_output(black_box(&large)).len()));
    });
}

fn bench_apply_restore(c: &mut Criterion) {
    let temp = tempfile::tempdir().expect("tempdir");
    let original: String = (0..2_000).map(|i| format!("x_{i} = {i}\n")).collect();
    let modified = original.replace("x_1000 = 1000", "x_1000 = 1001");
    std::fs::write(temp.path().join("module.py"), &original).expect("write synthetic module");

    let applier = FsChangeApplier::new(temp.path());
    let change = CodeChange::new(original, modified, "bench");

    c.bench_function("apply_then_restore", |b| {
        b.iter(|| {
            let backup = applier
                .apply(&change, std::path::Path::new("module.py"))
                .expect("apply should succeed");
            applier.restore(&backup).expect("restore should succeed");
        });
    });
}

criterion_group!(parse_output, bench_parse_output, bench_apply_restore);
criterion_main!(parse_output);
