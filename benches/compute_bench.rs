//! Criterion benchmarks for the host/device transfer paths and dispatch.
//!
//! To run the benchmarks use `cargo bench`.  A single context, set of
//! buffers and compiled kernel are created up front so that device and
//! pipeline creation is not part of the measurement.  The write and
//! read benches show the cost of one transfer in each direction; the
//! dispatch bench includes submission and the blocking wait.

use criterion::{criterion_group, criterion_main, Criterion};
use rand::Rng;

use minigpu::{Buffer, ComputeShader, Context};

const SHADER: &str = r#"
@group(0) @binding(0)
var<storage, read> a: array<f32>;
@group(0) @binding(1)
var<storage, read> b: array<f32>;
@group(0) @binding(2)
var<storage, read_write> out: array<f32>;

@compute @workgroup_size(64)
fn add(@builtin(global_invocation_id) global_id: vec3<u32>) {
    let i = global_id.y * 4194240u + global_id.x;
    if (i >= arrayLength(&a)) {
        return;
    }
    out[i] = a[i] + b[i];
}
"#;

fn transfer_and_dispatch_benchmark(c: &mut Criterion) {
    let context = match Context::initialize() {
        Ok(context) => context,
        Err(e) => {
            eprintln!("skipping GPU benchmarks: {e}");
            return;
        }
    };
    let n: usize = 1 << 20;
    let mut rng = rand::thread_rng();
    let a: Vec<f32> = (0..n).map(|_| rng.gen()).collect();
    let b: Vec<f32> = (0..n).map(|_| rng.gen()).collect();

    let buf_a = Buffer::from_slice(&context, &a).expect("upload a");
    let buf_b = Buffer::from_slice(&context, &b).expect("upload b");
    let mut out = Buffer::with_elements::<f32>(&context, n).expect("allocate out");

    let mut shader = ComputeShader::new(&context);
    shader.load_kernel(SHADER);
    shader.set_buffer("a", &buf_a).expect("bind a");
    shader.set_buffer("b", &buf_b).expect("bind b");
    shader.set_buffer("out", &out).expect("bind out");
    let (x, y, z) = shader.workgroups_for(n as u32);
    // Warm the pipeline cache.
    shader.dispatch(x, y, z).expect("dispatch");

    c.bench_function("write 4 MiB", |bencher| {
        bencher.iter(|| out.write_slice(&a).expect("write"));
    });
    let mut host = vec![0.0f32; n];
    c.bench_function("read_sync 4 MiB", |bencher| {
        bencher.iter(|| out.read_slice(&mut host, 0).expect("read"));
    });
    c.bench_function("dispatch vector add", |bencher| {
        bencher.iter(|| shader.dispatch(x, y, z).expect("dispatch"));
    });
    c.bench_function("cpu vector add", |bencher| {
        bencher.iter(|| {
            let mut out = vec![0.0f32; n];
            for i in 0..n {
                out[i] = a[i] + b[i];
            }
            out
        });
    });
}

criterion_group!(benches, transfer_and_dispatch_benchmark);
criterion_main!(benches);
