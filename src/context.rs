//! GPU context initialization.
//!
//! This module provides a thin wrapper around wgpu's instance, adapter,
//! device and queue objects.  A [`Context`] is created once by the
//! caller and borrowed by every [`crate::Buffer`] and
//! [`crate::ComputeShader`] made from it, so the borrow checker rules
//! out using either after the context has been destroyed.  The blocking
//! constructors hide the asynchronous nature of requesting an adapter
//! and device by using the [`pollster`] crate.

use std::env;

use wgpu::{Adapter, Device, Instance, Queue};

use crate::completion::{self, Completion};
use crate::error::{Error, Result};

/// Which limits to request from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LimitsProfile {
    /// `wgpu::Limits::downlevel_defaults()`; runs nearly everywhere.
    #[default]
    Downlevel,
    /// Everything the selected adapter supports.
    Adapter,
}

/// Options used when acquiring a device.
#[derive(Debug, Clone)]
pub struct ContextConfig {
    pub power_preference: wgpu::PowerPreference,
    pub force_fallback_adapter: bool,
    pub limits: LimitsProfile,
    pub label: String,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            limits: LimitsProfile::Downlevel,
            label: "minigpu_device".to_string(),
        }
    }
}

impl ContextConfig {
    /// Defaults overlaid with `MINIGPU_POWER` (`low`, `high` or `none`)
    /// and `MINIGPU_FALLBACK` (`1` or `true`).  Unrecognised values are
    /// logged and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(power) = env::var("MINIGPU_POWER") {
            match parse_power(&power) {
                Some(p) => config.power_preference = p,
                None => log::warn!("ignoring unrecognised MINIGPU_POWER={power:?}"),
            }
        }
        if let Ok(fallback) = env::var("MINIGPU_FALLBACK") {
            config.force_fallback_adapter = matches!(fallback.trim().to_ascii_lowercase().as_str(), "1" | "true");
        }
        config
    }
}

fn parse_power(value: &str) -> Option<wgpu::PowerPreference> {
    match value.trim().to_ascii_lowercase().as_str() {
        "low" | "low_power" => Some(wgpu::PowerPreference::LowPower),
        "high" | "high_performance" => Some(wgpu::PowerPreference::HighPerformance),
        "none" => Some(wgpu::PowerPreference::None),
        _ => None,
    }
}

/// Owns the device and the queue every command is submitted to.
///
/// Buffers and compute shaders hold a shared reference to their
/// context and never own it.  `Device` and `Queue` are internally
/// reference counted, so worker threads clone them rather than
/// borrowing the context.
pub struct Context {
    /// Kept alive for the lifetime of the adapter.
    #[allow(dead_code)]
    instance: Instance,
    adapter: Adapter,
    device: Device,
    queue: Queue,
}

impl Context {
    /// Acquires a device with the default [`ContextConfig`], blocking the
    /// current thread until it is ready.
    pub fn initialize() -> Result<Self> {
        Self::with_config(&ContextConfig::default())
    }

    /// Blocking acquisition with explicit options.
    pub fn with_config(config: &ContextConfig) -> Result<Self> {
        pollster::block_on(Self::initialize_async(config.clone()))
            .inspect_err(|e| log::error!("context initialization failed: {e}"))
    }

    /// Acquires a device asynchronously.  The returned future can be
    /// awaited inside any executor.
    pub async fn initialize_async(config: ContextConfig) -> Result<Self> {
        let instance = Instance::new(&wgpu::InstanceDescriptor::from_env_or_default());
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: config.power_preference,
                force_fallback_adapter: config.force_fallback_adapter,
                compatible_surface: None,
            })
            .await?;
        let info = adapter.get_info();
        // Downlevel devices may not support compute on all backends;
        // abort early if unsupported.
        let capabilities = adapter.get_downlevel_capabilities();
        if !capabilities.flags.contains(wgpu::DownlevelFlags::COMPUTE_SHADERS) {
            return Err(Error::ComputeUnsupported(info.name));
        }
        let required_limits = match config.limits {
            LimitsProfile::Downlevel => wgpu::Limits::downlevel_defaults(),
            LimitsProfile::Adapter => adapter.limits(),
        };
        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some(&config.label),
                required_features: wgpu::Features::empty(),
                required_limits,
                memory_hints: wgpu::MemoryHints::MemoryUsage,
                trace: wgpu::Trace::Off,
            })
            .await?;
        // Validation errors that escape an error scope would otherwise
        // panic inside wgpu.
        device.on_uncaptured_error(Box::new(|e: wgpu::Error| log::error!("uncaptured GPU error: {e}")));
        log::info!("using GPU adapter {} ({:?})", info.name, info.backend);
        Ok(Self { instance, adapter, device, queue })
    }

    /// Acquires a device on a worker thread.  The context must not be
    /// used before the returned handle resolves.
    pub fn spawn_initialize(config: ContextConfig) -> Result<Completion<Self>> {
        completion::spawn("context-init", move || pollster::block_on(Self::initialize_async(config)))
    }

    /// Acquires a device on a worker thread and calls `on_ready` there
    /// once it is ready (or has failed).
    pub fn initialize_with_callback<F>(config: ContextConfig, on_ready: F) -> Result<()>
    where
        F: FnOnce(Result<Self>) + Send + 'static,
    {
        completion::spawn_with(
            "context-init",
            move || pollster::block_on(Self::initialize_async(config)),
            on_ready,
        )
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub fn adapter_info(&self) -> wgpu::AdapterInfo {
        self.adapter.get_info()
    }

    /// Limits the device was created with.
    pub fn limits(&self) -> wgpu::Limits {
        self.device.limits()
    }

    /// Blocks until every command submitted so far has completed.
    pub fn wait_idle(&self) -> Result<()> {
        self.device.poll(wgpu::PollType::Wait)?;
        Ok(())
    }

    /// Destroys the device.  Consuming `self` ends every borrow held by
    /// buffers and shaders, so none can outlive this call.
    pub fn destroy(self) {
        log::debug!("destroying GPU context");
        self.device.destroy();
    }

    /// Runs `f` inside validation and out-of-memory error scopes and
    /// returns the first captured error, if any.
    pub(crate) fn scoped<T>(&self, f: impl FnOnce(&Device) -> T) -> (T, Option<wgpu::Error>) {
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f(&self.device);
        let validation = pollster::block_on(self.device.pop_error_scope());
        let oom = pollster::block_on(self.device.pop_error_scope());
        (value, validation.or(oom))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_preference_parsing() {
        assert_eq!(parse_power("LOW"), Some(wgpu::PowerPreference::LowPower));
        assert_eq!(parse_power(" high_performance "), Some(wgpu::PowerPreference::HighPerformance));
        assert_eq!(parse_power("none"), Some(wgpu::PowerPreference::None));
        assert_eq!(parse_power("fastest"), None);
    }

    #[test]
    fn default_config_targets_downlevel_limits() {
        let config = ContextConfig::default();
        assert_eq!(config.limits, LimitsProfile::Downlevel);
        assert!(!config.force_fallback_adapter);
        assert_eq!(config.power_preference, wgpu::PowerPreference::HighPerformance);
    }
}
