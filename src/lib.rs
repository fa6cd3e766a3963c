//! A minimal compute-shader API over
//! [wgpu](https://github.com/gfx-rs/wgpu).  The crate covers the
//! orchestration around a GPU kernel and nothing else: create a
//! [`Context`], allocate [`Buffer`]s against it, load a WGSL kernel into
//! a [`ComputeShader`], bind buffers to the kernel's declared slots,
//! dispatch a grid of work groups and read the results back.
//!
//! Blocking and non-blocking forms exist for the operations that wait on
//! the device.  The non-blocking forms submit their work on the calling
//! thread, so queue order always matches call order, and finish on a
//! worker thread.  They return a [`Completion`] that can be waited on,
//! polled or awaited, or take a callback that runs on the worker.
//!
//! ```no_run
//! use minigpu::{Buffer, ComputeShader, Context};
//!
//! # fn main() -> minigpu::Result<()> {
//! let context = Context::initialize()?;
//! let input: Vec<f32> = (0..100).map(|i| i as f32).collect();
//! let inp = Buffer::from_slice(&context, &input)?;
//! let out = Buffer::with_elements::<f32>(&context, input.len())?;
//!
//! let mut shader = ComputeShader::new(&context);
//! shader.load_kernel(r#"
//! @group(0) @binding(0) var<storage, read_write> inp: array<f32>;
//! @group(0) @binding(1) var<storage, read_write> out: array<f32>;
//! @compute @workgroup_size(256)
//! fn main(@builtin(global_invocation_id) id: vec3<u32>) {
//!     if (id.x < 100u) { out[id.x] = inp[id.x] + 0.2; }
//! }
//! "#);
//! shader.set_buffer("inp", &inp)?;
//! shader.set_buffer("out", &out)?;
//! shader.dispatch(1, 1, 1)?;
//!
//! let mut result = vec![0.0f32; input.len()];
//! out.read_slice(&mut result, 0)?;
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod completion;
pub mod compute;
pub mod context;
pub mod error;
pub mod kernel;

// Re‑export the most common types at the crate root so that users can
// simply `use minigpu::*;`.
pub use buffer::{Buffer, BUFFER_USAGE};
pub use completion::Completion;
pub use compute::ComputeShader;
pub use context::{Context, ContextConfig, LimitsProfile};
pub use error::{Error, Result};
pub use kernel::{BindingDecl, BindingKind, KernelSource, WorkgroupSize};
