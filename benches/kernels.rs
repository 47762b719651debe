//! Criterion benches for the hot numeric primitives.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use nibble_engine::kernels::{Kernels, NibblePolicy};
use nibble_engine::quant::{quantize_matrix, QuantizeConfig, WeightDType};

fn bench_vec_dot(c: &mut Criterion) {
    let kern = Kernels::get();
    let a: Vec<f32> = (0..4096).map(|i| (i as f32 * 0.001).sin()).collect();
    let b: Vec<f32> = (0..4096).map(|i| (i as f32 * 0.002).cos()).collect();
    c.bench_function("vec_dot_4096", |bench| {
        bench.iter(|| (kern.vec_dot)(black_box(&a), black_box(&b)))
    });
}

fn bench_unpack_i4(c: &mut Criterion) {
    let kern = Kernels::get();
    let src: Vec<u8> = (0..2048).map(|i| (i * 37 % 256) as u8).collect();
    let mut dst = vec![0i8; 4096];
    c.bench_function("unpack_i4_4096", |bench| {
        bench.iter(|| (kern.unpack_i4)(black_box(&src), black_box(&mut dst), NibblePolicy::Clip))
    });
}

fn bench_int4_matvec(c: &mut Criterion) {
    let kern = Kernels::get();
    let rows = 1024;
    let cols = 1024;
    let src: Vec<f32> = (0..rows * cols).map(|i| (i as f32 * 0.0001).sin()).collect();
    let qm = quantize_matrix(
        &src,
        rows,
        cols,
        &QuantizeConfig {
            weight_dtype: WeightDType::Int4,
            group_size: 32,
            ..Default::default()
        },
    )
    .unwrap();
    let x: Vec<f32> = (0..rows).map(|i| (i as f32 * 0.01).cos()).collect();
    let mut y = vec![0.0f32; cols];
    let mut scratch = Vec::new();
    c.bench_function("int4_matvec_1024x1024", |bench| {
        bench.iter(|| {
            y.fill(0.0);
            qm.matvec(kern, black_box(&x), &mut y, &mut scratch).unwrap()
        })
    });
}

fn bench_dequant_tile(c: &mut Criterion) {
    let rows = 1024;
    let cols = 256;
    let src: Vec<f32> = (0..rows * cols).map(|i| (i as f32 * 0.0003).sin()).collect();
    let qm = quantize_matrix(
        &src,
        rows,
        cols,
        &QuantizeConfig {
            weight_dtype: WeightDType::Nf4,
            group_size: 32,
            ..Default::default()
        },
    )
    .unwrap();
    let mut tile = vec![0.0f32; 32 * cols];
    c.bench_function("nf4_dequant_tile_32x256", |bench| {
        bench.iter(|| qm.dequant_tile(black_box(0), 32, &mut tile).unwrap())
    });
}

criterion_group!(
    benches,
    bench_vec_dot,
    bench_unpack_i4,
    bench_int4_matvec,
    bench_dequant_tile
);
criterion_main!(benches);
