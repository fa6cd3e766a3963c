//! Element‑wise vector addition through buffers bound by name.
//!
//! Run this demo with:
//!
//! ```sh
//! cargo run --example vector_add
//! ```
//!
//! The program uploads two vectors of 32‑bit floats, binds them to the
//! `a` and `b` variables of a WGSL kernel, dispatches enough work groups
//! to cover every element, and reads the sum back twice: once blocking
//! and once through an asynchronous read whose handle is awaited.

use minigpu::{Buffer, ComputeShader, Context, ContextConfig};

const SHADER: &str = r#"
@group(0) @binding(0)
var<storage, read> a: array<f32>;
@group(0) @binding(1)
var<storage, read> b: array<f32>;
@group(0) @binding(2)
var<storage, read_write> out: array<f32>;

@compute @workgroup_size(64)
fn add(@builtin(global_invocation_id) global_id: vec3<u32>) {
    let i = global_id.x;
    // Guard against the final, partially filled work group.
    if (i >= arrayLength(&a)) {
        return;
    }
    out[i] = a[i] + b[i];
}
"#;

fn main() -> minigpu::Result<()> {
    // RUST_LOG=debug shows allocations and dispatches.
    env_logger::init();
    let context = Context::with_config(&ContextConfig::from_env())?;
    println!("adapter: {}", context.adapter_info().name);

    let a: Vec<f32> = (0..1_000).map(|i| i as f32).collect();
    let b: Vec<f32> = (0..1_000).map(|i| (i * 2) as f32).collect();
    let inp_a = Buffer::from_slice(&context, &a)?;
    let inp_b = Buffer::from_slice(&context, &b)?;
    let out = Buffer::with_elements::<f32>(&context, a.len())?;

    let mut shader = ComputeShader::new(&context);
    shader.load_kernel(SHADER);
    for (tag, buffer) in [("a", &inp_a), ("b", &inp_b), ("out", &out)] {
        let slot = shader.set_buffer(tag, buffer)?;
        println!("bound '{tag}' to slot {slot}");
    }

    let (x, y, z) = shader.workgroups_for(a.len() as u32);
    shader.dispatch(x, y, z)?;

    let result: Vec<f32> = out.to_vec()?;
    println!("first results: {:?}", &result[..8]);

    // The same read without blocking the main thread until `wait`.
    let pending = out.read_async(out.len(), 0)?;
    let bytes = pending.wait()?;
    let again: Vec<f32> = bytes.chunks_exact(4).map(bytemuck::pod_read_unaligned).collect();
    assert_eq!(again, result);
    println!("asynchronous read matches ({} floats)", again.len());

    out.release();
    inp_b.release();
    inp_a.release();
    drop(shader);
    context.destroy();
    Ok(())
}
