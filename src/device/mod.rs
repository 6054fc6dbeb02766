//! Compute device abstraction.
//!
//! A device owns typed, partitioned buffers and compiled kernels. Kernels are
//! dispatched in batches: every launch of one [`Device::enqueue`] call may run
//! concurrently, and [`Device::finish`] blocks until all enqueued work is done.

use crate::error::{CompileError, DeviceError};
use crate::expr::NumericType;
use crate::program::Program;

pub mod cpu;
mod exec;
mod worker;

pub use cpu::CpuDevice;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KernelId(pub(crate) usize);

/// Element arrangement of a buffer across device partitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Layout {
    /// One element per group instance, split into contiguous ranges.
    Instances { count: usize },
    /// One element per edge. An edge lives in the partition owning its target
    /// instance, in global edge order.
    Edges {
        targets: Vec<usize>,
        target_count: usize,
    },
}

impl Layout {
    pub fn len(&self) -> usize {
        match self {
            Layout::Instances { count } => *count,
            Layout::Edges { targets, .. } => targets.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Buffer bound to one program slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelArg {
    Single(BufferId),
    /// Delay ring, starting at the slot consumed on the current step.
    Ring(Vec<BufferId>),
}

impl KernelArg {
    pub fn buffers(&self) -> &[BufferId] {
        match self {
            KernelArg::Single(buffer) => std::slice::from_ref(buffer),
            KernelArg::Ring(buffers) => buffers,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Launch {
    pub kernel: KernelId,
    pub args: Vec<KernelArg>,
    pub uniforms: Vec<f64>,
}

pub trait Device {
    fn num_partitions(&self) -> usize;

    fn allocate(&self, element: NumericType, layout: Layout) -> Result<BufferId, DeviceError>;

    fn release(&self, buffer: BufferId) -> Result<(), DeviceError>;

    fn upload(&self, buffer: BufferId, data: &[f64]) -> Result<(), DeviceError>;

    fn download(&self, buffer: BufferId) -> Result<Vec<f64>, DeviceError>;

    fn read_element(&self, buffer: BufferId, index: usize) -> Result<f64, DeviceError>;

    fn write_element(&self, buffer: BufferId, index: usize, value: f64) -> Result<(), DeviceError>;

    fn fill(&self, buffer: BufferId, value: f64) -> Result<(), DeviceError>;

    fn compile(&self, program: &Program, name: &str) -> Result<KernelId, CompileError>;

    fn release_kernel(&self, kernel: KernelId) -> Result<(), DeviceError>;

    /// Submits one dispatch. Its launches must not read a buffer another launch writes.
    fn enqueue(&self, launches: Vec<Launch>) -> Result<(), DeviceError>;

    fn finish(&self) -> Result<(), DeviceError>;
}
