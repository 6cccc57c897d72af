//! Benchmarks for `.reg` export parsing and serialization.
//!
//! Run with: cargo bench --bench regfile_parse

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use unireg::regfile;

/// Export text with `keys` sections of mixed value types.
fn build_export(keys: usize) -> String {
    let mut text = String::from("Windows Registry Editor Version 5.00\r\n\r\n");
    for i in 0..keys {
        text.push_str(&format!("[HKEY_LOCAL_MACHINE\\SOFTWARE\\Bench\\Key{:05}]\r\n", i));
        text.push_str(&format!("@=\"default {}\"\r\n", i));
        text.push_str(&format!("\"Counter\"=dword:{:08x}\r\n", i));
        text.push_str("\"Path\"=hex(2):25,00,53,00,79,00,73,00,74,00,65,00,6d,00,52,00,6f,00,6f,00,\\\r\n");
        text.push_str("  74,00,25,00,00,00\r\n");
        text.push_str("\"Blob\"=hex:00,01,02,03,04,05,06,07,08,09,0a,0b,0c,0d,0e,0f\r\n\r\n");
    }
    text
}

fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("regfile_parse");

    for keys in [100, 1_000, 10_000] {
        let text = build_export(keys);
        group.bench_with_input(BenchmarkId::new("parse", keys), &text, |b, text| {
            b.iter(|| {
                let parsed = regfile::parse(black_box(text));
                black_box(parsed.root.child_count())
            });
        });

        let parsed = regfile::parse(&text);
        group.bench_with_input(BenchmarkId::new("export", keys), &parsed.root, |b, root| {
            b.iter(|| black_box(regfile::export(black_box(root)).len()));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_parse);
criterion_main!(benches);
