//! Compute shaders: kernel loading, buffer binding and dispatch.
//!
//! A [`ComputeShader`] holds one WGSL kernel and a table of bound
//! buffers indexed by binding slot.  Slots are resolved by the variable
//! name a kernel declares them under ([`ComputeShader::set_buffer`]) or
//! addressed directly by number ([`ComputeShader::set_buffer_at`]);
//! both forms are checked against the declaration table scanned when
//! the kernel was loaded.  Only group 0 is addressable.
//!
//! Dispatch encapsulates the wgpu boilerplate of creating shader
//! modules, bind group layouts, pipelines, bind groups and command
//! buffers.  The module, layout and pipeline are built on first use and
//! cached per entry point until a new kernel is loaded; the bind group
//! is rebuilt on every dispatch so rebinding a slot takes effect on the
//! next dispatch.  Every declared slot must be bound before any work is
//! submitted.

use std::collections::HashMap;
use std::path::Path;

use parking_lot::Mutex;
use wgpu::{ShaderModuleDescriptor, ShaderSource, SubmissionIndex};

use crate::buffer::{Buffer, SharedAllocation};
use crate::completion::{self, Completion};
use crate::error::{Error, Result};
use crate::kernel::{KernelSource, WorkgroupSize};
use crate::Context;

/// Calculate an (x, y) workgroup grid that covers `total_groups`
/// workgroups without exceeding the per-dimension limit.
fn split_workgroups(total_groups: u32, limit: u32) -> (u32, u32) {
    if total_groups <= limit {
        (total_groups, 1)
    } else {
        (limit, total_groups.div_ceil(limit))
    }
}

#[derive(Clone)]
struct CompiledKernel {
    layout: wgpu::BindGroupLayout,
    pipeline: wgpu::ComputePipeline,
}

/// A kernel plus the buffers bound to its slots.
pub struct ComputeShader<'ctx> {
    context: &'ctx Context,
    kernel: Option<KernelSource>,
    bindings: Vec<Option<SharedAllocation>>,
    compiled: Mutex<HashMap<String, CompiledKernel>>,
}

impl<'ctx> ComputeShader<'ctx> {
    pub fn new(context: &'ctx Context) -> Self {
        Self {
            context,
            kernel: None,
            bindings: Vec::new(),
            compiled: Mutex::new(HashMap::new()),
        }
    }

    /// Stores `source` as the kernel and scans it for bindings, the
    /// workgroup size and entry points.  Existing bindings and any
    /// compiled pipeline are discarded.  The kernel is not validated
    /// here; invalid WGSL is reported by the first dispatch.
    pub fn load_kernel(&mut self, source: &str) {
        let kernel = KernelSource::parse(source);
        log::debug!(
            "loaded kernel: {} binding(s), workgroup size {}, entry points {:?}",
            kernel.bindings().len(),
            kernel.workgroup_size(),
            kernel.entry_points()
        );
        self.kernel = Some(kernel);
        self.bindings.clear();
        self.compiled.get_mut().clear();
    }

    /// Reads a WGSL file and loads it with [`ComputeShader::load_kernel`].
    pub fn load_kernel_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|source| Error::Io { path: path.to_path_buf(), source })
            .inspect_err(|e| log::error!("{e}"))?;
        self.load_kernel(&source);
        Ok(())
    }

    /// True once a non-empty kernel has been loaded.
    pub fn has_kernel(&self) -> bool {
        self.kernel.as_ref().is_some_and(|k| !k.is_empty())
    }

    pub fn kernel(&self) -> Option<&KernelSource> {
        self.kernel.as_ref()
    }

    /// The declared workgroup size, or the default when no kernel is
    /// loaded.
    pub fn workgroup_size(&self) -> WorkgroupSize {
        self.kernel.as_ref().map(KernelSource::workgroup_size).unwrap_or_default()
    }

    /// Binds `buffer` to the slot of the variable named `tag` and
    /// returns that slot.
    pub fn set_buffer(&mut self, tag: &str, buffer: &Buffer<'_>) -> Result<u32> {
        self.resolve_tag(tag)
            .map(|slot| {
                self.bind(slot, buffer);
                slot
            })
            .inspect_err(|e| log::error!("set_buffer('{tag}') failed: {e}"))
    }

    /// Binds `buffer` to `slot`, which must be declared in group 0.
    pub fn set_buffer_at(&mut self, slot: u32, buffer: &Buffer<'_>) -> Result<()> {
        self.resolve_slot(slot)
            .map(|()| self.bind(slot, buffer))
            .inspect_err(|e| log::error!("set_buffer_at({slot}) failed: {e}"))
    }

    fn resolve_tag(&self, tag: &str) -> Result<u32> {
        let kernel = self.kernel.as_ref().ok_or(Error::NoKernel)?;
        let decl = kernel.find(tag).ok_or_else(|| Error::BindingNotFound { tag: tag.to_string() })?;
        if decl.group != 0 {
            return Err(Error::UnsupportedGroup { group: decl.group, name: decl.name.clone() });
        }
        Ok(decl.binding)
    }

    fn resolve_slot(&self, slot: u32) -> Result<()> {
        let kernel = self.kernel.as_ref().ok_or(Error::NoKernel)?;
        kernel.slot(slot).map(|_| ()).ok_or(Error::SlotNotDeclared { slot })
    }

    fn bind(&mut self, slot: u32, buffer: &Buffer<'_>) {
        let index = slot as usize;
        if index >= self.bindings.len() {
            self.bindings.resize(index + 1, None);
        }
        self.bindings[index] = Some(buffer.shared());
    }

    /// Slot of the binding declared under `tag`.
    pub fn binding_slot(&self, tag: &str) -> Option<u32> {
        self.kernel.as_ref()?.find(tag).map(|d| d.binding)
    }

    pub fn is_bound(&self, slot: u32) -> bool {
        matches!(self.bindings.get(slot as usize), Some(Some(_)))
    }

    /// True when `buffer` is the one bound at `slot`.
    pub fn is_bound_to(&self, slot: u32, buffer: &Buffer<'_>) -> bool {
        match self.bindings.get(slot as usize) {
            Some(Some(bound)) => std::sync::Arc::ptr_eq(bound, &buffer.shared()),
            _ => false,
        }
    }

    /// Slots that currently hold a buffer, in ascending order.
    pub fn bound_slots(&self) -> Vec<u32> {
        self.bindings
            .iter()
            .enumerate()
            .filter(|(_, b)| b.is_some())
            .map(|(i, _)| i as u32)
            .collect()
    }

    /// An (x, y, 1) grid of work groups covering `invocations`
    /// invocations of a one-dimensional kernel, split across two
    /// dimensions when one would exceed the device limit.
    pub fn workgroups_for(&self, invocations: u32) -> (u32, u32, u32) {
        let per_group = self.workgroup_size().invocations().clamp(1, u64::from(u32::MAX)) as u32;
        let total_groups = invocations.div_ceil(per_group);
        let limit = self.context.limits().max_compute_workgroups_per_dimension;
        let (x, y) = split_workgroups(total_groups, limit);
        (x, y, 1)
    }

    /// Runs the kernel's first entry point over a grid of work groups and
    /// blocks until the device has finished.
    pub fn dispatch(&self, groups_x: u32, groups_y: u32, groups_z: u32) -> Result<()> {
        self.dispatch_blocking(None, groups_x, groups_y, groups_z)
    }

    /// Like [`ComputeShader::dispatch`] for a named entry point.
    pub fn dispatch_entry(&self, entry_point: &str, groups_x: u32, groups_y: u32, groups_z: u32) -> Result<()> {
        self.dispatch_blocking(Some(entry_point), groups_x, groups_y, groups_z)
    }

    fn dispatch_blocking(&self, entry_point: Option<&str>, x: u32, y: u32, z: u32) -> Result<()> {
        let index = self.submit(entry_point, x, y, z)?;
        self.context
            .device()
            .poll(wgpu::PollType::WaitForSubmissionIndex(index))
            .map(|_| ())
            .map_err(Error::from)
            .inspect_err(|e| log::error!("dispatch failed: {e}"))
    }

    /// Submits the dispatch and returns at once.  The handle resolves
    /// after the device has finished the work.
    pub fn dispatch_async(&self, groups_x: u32, groups_y: u32, groups_z: u32) -> Result<Completion<()>> {
        let index = self.submit(None, groups_x, groups_y, groups_z)?;
        let device = self.context.device().clone();
        completion::spawn("dispatch", move || wait_for(&device, index))
    }

    /// Submits the dispatch and calls `on_complete` on a worker thread
    /// once the device has finished it.
    pub fn dispatch_with<F>(&self, groups_x: u32, groups_y: u32, groups_z: u32, on_complete: F) -> Result<()>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let index = self.submit(None, groups_x, groups_y, groups_z)?;
        let device = self.context.device().clone();
        completion::spawn_with("dispatch", move || wait_for(&device, index), on_complete)
    }

    fn submit(&self, entry_point: Option<&str>, x: u32, y: u32, z: u32) -> Result<SubmissionIndex> {
        self.try_submit(entry_point, x, y, z)
            .inspect_err(|e| log::error!("dispatch failed: {e}"))
    }

    fn try_submit(&self, entry_point: Option<&str>, x: u32, y: u32, z: u32) -> Result<SubmissionIndex> {
        let kernel = self.kernel.as_ref().filter(|k| !k.is_empty()).ok_or(Error::NoKernel)?;

        let limit = self.context.limits().max_compute_workgroups_per_dimension;
        if x > limit || y > limit || z > limit {
            return Err(Error::WorkgroupLimit { x, y, z, limit });
        }

        let entry = match entry_point {
            Some(name) if !kernel.entry_points().iter().any(|e| e == name) => {
                return Err(Error::UnknownEntryPoint(name.to_string()));
            }
            Some(name) => Some(name),
            None => kernel.entry_points().first().map(String::as_str),
        };

        // Resolve every binding before touching the device so a missing
        // one never leaves partial work on the queue.
        let mut bound = Vec::with_capacity(kernel.bindings().len());
        for decl in kernel.required() {
            if decl.group != 0 {
                return Err(Error::UnsupportedGroup { group: decl.group, name: decl.name.clone() });
            }
            let allocation = self
                .bindings
                .get(decl.binding as usize)
                .and_then(Option::as_ref)
                .ok_or_else(|| Error::UnboundSlot { slot: decl.binding, name: decl.name.clone() })?;
            let buffer = allocation.lock().clone().ok_or(Error::Released { slot: decl.binding })?;
            bound.push((decl.binding, buffer));
        }

        let compiled = self.compiled(kernel, entry)?;

        let (index, error) = self.context.scoped(|device| {
            let entries: Vec<_> = bound
                .iter()
                .map(|(slot, buffer)| wgpu::BindGroupEntry {
                    binding: *slot,
                    resource: buffer.as_entire_binding(),
                })
                .collect();
            let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("minigpu_bind_group"),
                layout: &compiled.layout,
                entries: &entries,
            });
            let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("minigpu_compute_encoder"),
            });
            {
                let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("minigpu_compute_pass"),
                    timestamp_writes: None,
                });
                cpass.set_pipeline(&compiled.pipeline);
                cpass.set_bind_group(0, &bind_group, &[]);
                cpass.dispatch_workgroups(x, y, z);
            }
            self.context.queue().submit([encoder.finish()])
        });
        if let Some(error) = error {
            return Err(Error::Submission(error.to_string()));
        }
        log::debug!("dispatched ({x}, {y}, {z}) work groups over {} binding(s)", bound.len());
        Ok(index)
    }

    /// Returns the cached pipeline for `entry`, building it on first use.
    fn compiled(&self, kernel: &KernelSource, entry: Option<&str>) -> Result<CompiledKernel> {
        let key = entry.unwrap_or_default().to_string();
        if let Some(compiled) = self.compiled.lock().get(&key) {
            return Ok(compiled.clone());
        }

        let (compiled, error) = self.context.scoped(|device| {
            let module = device.create_shader_module(ShaderModuleDescriptor {
                label: Some("minigpu_kernel"),
                source: ShaderSource::Wgsl(kernel.text().into()),
            });
            let layout_entries: Vec<_> = kernel
                .bindings()
                .iter()
                .map(|decl| wgpu::BindGroupLayoutEntry {
                    binding: decl.binding,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: decl.kind.buffer_binding_type(),
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                })
                .collect();
            let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("minigpu_bind_group_layout"),
                entries: &layout_entries,
            });
            let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("minigpu_pipeline_layout"),
                bind_group_layouts: &[&layout],
                push_constant_ranges: &[],
            });
            let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("minigpu_pipeline"),
                layout: Some(&pipeline_layout),
                module: &module,
                entry_point: entry,
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            });
            CompiledKernel { layout, pipeline }
        });
        if let Some(error) = error {
            return Err(Error::Submission(error.to_string()));
        }
        self.compiled.lock().insert(key, compiled.clone());
        Ok(compiled)
    }
}

fn wait_for(device: &wgpu::Device, index: SubmissionIndex) -> Result<()> {
    device.poll(wgpu::PollType::WaitForSubmissionIndex(index))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_within_limit_is_one_dimensional() {
        assert_eq!(split_workgroups(10, 65_535), (10, 1));
        assert_eq!(split_workgroups(65_535, 65_535), (65_535, 1));
    }

    #[test]
    fn split_beyond_limit_spills_into_y() {
        assert_eq!(split_workgroups(65_536, 65_535), (65_535, 2));
        assert_eq!(split_workgroups(200_000, 65_535), (65_535, 4));
    }
}
