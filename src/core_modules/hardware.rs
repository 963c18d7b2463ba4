// THEORY:
// The fieldbus master is an external collaborator. The decision core only
// needs three things from it: the list of output modules discovered at connect
// time, read/write access to the digital output image, and a cyclic
// process-data `exchange` that pushes that image to the wire.
//
// `IoMaster` captures exactly that seam. Real drivers implement it outside this
// crate; `SimulatedMaster` implements it in memory for offline runs and tests,
// with a shared handle for counting exchanges and injecting faults.

use crate::error::HardwareError;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

/// One output module as enumerated from the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub name: String,
    /// Digital outputs on this module.
    pub output_channels: usize,
}

/// Downstream hardware: an output image plus a cyclic exchange.
pub trait IoMaster: Send + 'static {
    /// Output modules in bus order.
    fn topology(&self) -> Vec<ModuleInfo>;

    /// Sets one bit of the output image. Takes effect on the next exchange.
    fn write_output(&mut self, module: usize, channel: usize, on: bool) -> Result<(), HardwareError>;

    /// Reads one bit of the output image.
    fn read_output(&self, module: usize, channel: usize) -> Result<bool, HardwareError>;

    /// Performs one process-data exchange cycle.
    fn exchange(&mut self, timestamp: Instant) -> Result<(), HardwareError>;
}

/// Test and simulation controls for a `SimulatedMaster` that has been moved
/// into a scheduler.
#[derive(Debug, Clone, Default)]
pub struct SimulatedHandle {
    failing: Arc<AtomicBool>,
    exchanges: Arc<AtomicU64>,
}

impl SimulatedHandle {
    /// Makes every subsequent exchange fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Successful exchanges so far.
    pub fn exchange_count(&self) -> u64 {
        self.exchanges.load(Ordering::SeqCst)
    }
}

/// In-memory fieldbus master.
#[derive(Debug)]
pub struct SimulatedMaster {
    modules: Vec<ModuleInfo>,
    /// Output image, one bit vector per module.
    outputs: Vec<Vec<bool>>,
    /// Image as of the last successful exchange.
    published: Vec<Vec<bool>>,
    last_exchange: Option<Instant>,
    handle: SimulatedHandle,
}

impl SimulatedMaster {
    /// Builds a master with one module per entry, each with that many outputs.
    pub fn new(channels_per_module: &[usize]) -> (Self, SimulatedHandle) {
        let modules: Vec<ModuleInfo> = channels_per_module
            .iter()
            .enumerate()
            .map(|(i, &output_channels)| ModuleInfo {
                name: format!("sim-do-{i}"),
                output_channels,
            })
            .collect();
        let outputs: Vec<Vec<bool>> = channels_per_module.iter().map(|&n| vec![false; n]).collect();
        let handle = SimulatedHandle::default();
        let master = Self {
            modules,
            published: outputs.clone(),
            outputs,
            last_exchange: None,
            handle: handle.clone(),
        };
        (master, handle)
    }

    pub fn last_exchange(&self) -> Option<Instant> {
        self.last_exchange
    }

    /// The image as the wire last saw it.
    pub fn published(&self, module: usize, channel: usize) -> Option<bool> {
        self.published.get(module)?.get(channel).copied()
    }
}

impl IoMaster for SimulatedMaster {
    fn topology(&self) -> Vec<ModuleInfo> {
        self.modules.clone()
    }

    fn write_output(&mut self, module: usize, channel: usize, on: bool) -> Result<(), HardwareError> {
        let bit = self
            .outputs
            .get_mut(module)
            .and_then(|m| m.get_mut(channel))
            .ok_or(HardwareError::UnknownOutput { module, channel })?;
        *bit = on;
        Ok(())
    }

    fn read_output(&self, module: usize, channel: usize) -> Result<bool, HardwareError> {
        self.outputs
            .get(module)
            .and_then(|m| m.get(channel))
            .copied()
            .ok_or(HardwareError::UnknownOutput { module, channel })
    }

    fn exchange(&mut self, timestamp: Instant) -> Result<(), HardwareError> {
        if self.handle.failing.load(Ordering::SeqCst) {
            return Err(HardwareError::Exchange("simulated bus fault".to_string()));
        }
        self.published.clone_from(&self.outputs);
        self.last_exchange = Some(timestamp);
        self.handle.exchanges.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
