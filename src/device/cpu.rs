use std::sync::mpsc::channel as mpsc_channel;
use std::sync::mpsc::Receiver as MpscReceiver;
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::thread::JoinHandle;

use bus::Bus;
use core_affinity::CoreId;
use log::{debug, warn};
use simple_error::{try_with, SimpleError};

use super::worker::{Command, Report, ResolvedArg, ResolvedLaunch, Worker};
use super::{BufferId, Device, KernelArg, KernelId, Launch, Layout};
use crate::error::{CompileError, DeviceError, DeviceErrorKind};
use crate::expr::NumericType;
use crate::params::{self, DeviceParams};
use crate::program::{Access, IndexSpace, Instr, Program, ProgramKind};
use crate::types::HashSet;
use crate::util;

const QUEUE_CAPACITY: usize = 16;

#[derive(Debug)]
pub(crate) enum Partitioning {
    /// Chunk `k` holds `starts[k]..starts[k + 1]`.
    Ranges { starts: Vec<usize> },
    /// Chunk `k` holds the listed global indices, in order.
    Gather {
        members: Vec<Vec<usize>>,
        positions: Vec<(usize, usize)>,
    },
}

#[derive(Debug)]
pub(crate) struct DeviceBuffer {
    pub element: NumericType,
    pub len: usize,
    pub partitioning: Partitioning,
    pub chunks: Vec<RwLock<Vec<f64>>>,
}

impl DeviceBuffer {
    fn new(element: NumericType, layout: Layout, num_partitions: usize) -> Result<Self, DeviceError> {
        let len = layout.len();

        let partitioning = match layout {
            Layout::Instances { count } => {
                let mut starts: Vec<usize> = (0..num_partitions)
                    .map(|partition| util::get_partition_range(num_partitions, partition, count).start)
                    .collect();
                starts.push(count);
                Partitioning::Ranges { starts }
            }
            Layout::Edges {
                targets,
                target_count,
            } => {
                let owners: Vec<_> = (0..num_partitions)
                    .map(|partition| util::get_partition_range(num_partitions, partition, target_count))
                    .collect();

                let mut members = vec![Vec::new(); num_partitions];
                let mut positions = Vec::with_capacity(targets.len());

                for (edge, target) in targets.iter().enumerate() {
                    let owner = owners
                        .iter()
                        .position(|range| range.contains(target))
                        .ok_or_else(|| {
                            DeviceError::new(
                                DeviceErrorKind::Allocation,
                                format!(
                                    "edge {} targets instance {} outside of 0..{}",
                                    edge, target, target_count
                                ),
                            )
                        })?;
                    positions.push((owner, members[owner].len()));
                    members[owner].push(edge);
                }

                Partitioning::Gather { members, positions }
            }
        };

        let chunks = (0..num_partitions)
            .map(|partition| {
                let chunk_len = match &partitioning {
                    Partitioning::Ranges { starts } => starts[partition + 1] - starts[partition],
                    Partitioning::Gather { members, .. } => members[partition].len(),
                };
                RwLock::new(vec![0.0; chunk_len])
            })
            .collect();

        Ok(Self {
            element,
            len,
            partitioning,
            chunks,
        })
    }

    /// Chunk and offset of a global element index.
    pub fn locate(&self, index: usize) -> Option<(usize, usize)> {
        if index >= self.len {
            return None;
        }

        match &self.partitioning {
            Partitioning::Ranges { starts } => {
                let chunk = starts[..starts.len() - 1].partition_point(|start| *start <= index) - 1;
                Some((chunk, index - starts[chunk]))
            }
            Partitioning::Gather { positions, .. } => Some(positions[index]),
        }
    }

    /// Global index of the first element of a `Ranges` chunk.
    pub fn chunk_start(&self, partition: usize) -> usize {
        match &self.partitioning {
            Partitioning::Ranges { starts } => starts[partition],
            Partitioning::Gather { .. } => 0,
        }
    }

    fn global_indices(&self, partition: usize) -> Vec<usize> {
        match &self.partitioning {
            Partitioning::Ranges { starts } => (starts[partition]..starts[partition + 1]).collect(),
            Partitioning::Gather { members, .. } => members[partition].clone(),
        }
    }

    fn upload(&self, data: &[f64]) -> Result<(), DeviceError> {
        if data.len() != self.len {
            return Err(DeviceError::new(
                DeviceErrorKind::InvalidBuffer,
                format!("upload of {} elements into a buffer of {}", data.len(), self.len),
            ));
        }

        for (partition, chunk) in self.chunks.iter().enumerate() {
            let mut chunk = chunk.write().map_err(|_| DeviceError::poisoned("buffer"))?;
            for (slot, index) in chunk.iter_mut().zip(self.global_indices(partition)) {
                *slot = self.element.cast(data[index]);
            }
        }

        Ok(())
    }

    fn download(&self) -> Result<Vec<f64>, DeviceError> {
        let mut data = vec![0.0; self.len];

        for (partition, chunk) in self.chunks.iter().enumerate() {
            let chunk = chunk.read().map_err(|_| DeviceError::poisoned("buffer"))?;
            for (value, index) in chunk.iter().zip(self.global_indices(partition)) {
                data[index] = *value;
            }
        }

        Ok(data)
    }

    fn locate_or_err(&self, index: usize) -> Result<(usize, usize), DeviceError> {
        self.locate(index).ok_or_else(|| {
            DeviceError::new(
                DeviceErrorKind::InvalidBuffer,
                format!("index {} out of range for buffer of {}", index, self.len),
            )
        })
    }
}

#[derive(Debug)]
pub(crate) struct CompiledKernel {
    pub name: String,
    pub program: Program,
}

#[derive(Default)]
struct Memory {
    buffers: Vec<Option<Arc<DeviceBuffer>>>,
    kernels: Vec<Option<Arc<CompiledKernel>>>,
}

impl Memory {
    fn buffer(&self, id: BufferId) -> Result<Arc<DeviceBuffer>, DeviceError> {
        self.buffers
            .get(id.0)
            .and_then(Option::clone)
            .ok_or_else(|| {
                DeviceError::new(
                    DeviceErrorKind::InvalidBuffer,
                    format!("unknown buffer {}", id.0),
                )
            })
    }

    fn kernel(&self, id: KernelId) -> Result<Arc<CompiledKernel>, DeviceError> {
        self.kernels
            .get(id.0)
            .and_then(Option::clone)
            .ok_or_else(|| {
                DeviceError::new(DeviceErrorKind::Dispatch, format!("unknown kernel {}", id.0))
            })
    }
}

/// Data-parallel CPU device: one worker thread per partition.
pub struct CpuDevice {
    num_partitions: usize,
    max_registers: usize,
    memory: RwLock<Memory>,
    broadcast_tx: Mutex<Option<Bus<Command>>>,
    report_rx: Mutex<MpscReceiver<Report>>,
    pending: Mutex<usize>,
    join_handles: Vec<JoinHandle<()>>,
}

fn get_num_threads(params: &DeviceParams) -> usize {
    params.num_threads.unwrap_or_else(num_cpus::get)
}

impl CpuDevice {
    pub fn init(params: DeviceParams) -> Result<CpuDevice, SimpleError> {
        try_with!(
            params::validate_device_params(&params),
            "invalid device parameters"
        );

        let mut broadcast_tx = Bus::new(QUEUE_CAPACITY);
        let (report_tx, report_rx) = mpsc_channel();

        let num_threads = get_num_threads(&params);
        let mut join_handles = Vec::new();

        for thread_id in 0..num_threads {
            let broadcast_rx = broadcast_tx.add_rx();
            let report_tx = report_tx.clone();
            let pin_threads = params.pin_threads;

            join_handles.push(thread::spawn(move || {
                if pin_threads {
                    let core_id = CoreId {
                        id: thread_id % num_cpus::get(),
                    };
                    core_affinity::set_for_current(core_id);
                }

                Worker::new(thread_id).run(broadcast_rx, report_tx);
            }));
        }

        debug!("cpu device started with {} worker threads", num_threads);

        Ok(CpuDevice {
            num_partitions: num_threads,
            max_registers: params.max_registers,
            memory: RwLock::new(Memory::default()),
            broadcast_tx: Mutex::new(Some(broadcast_tx)),
            report_rx: Mutex::new(report_rx),
            pending: Mutex::new(0),
            join_handles,
        })
    }

    pub fn shutdown(self) {
        drop(self);
    }

    fn buffer(&self, id: BufferId) -> Result<Arc<DeviceBuffer>, DeviceError> {
        self.memory
            .read()
            .map_err(|_| DeviceError::poisoned("memory"))?
            .buffer(id)
    }

    fn resolve(&self, launches: Vec<Launch>) -> Result<Vec<ResolvedLaunch>, DeviceError> {
        let memory = self.memory.read().map_err(|_| DeviceError::poisoned("memory"))?;

        let mut written = HashSet::default();
        let mut read = HashSet::default();
        let mut resolved = Vec::with_capacity(launches.len());

        for launch in launches {
            let kernel = memory.kernel(launch.kernel)?;
            let program = &kernel.program;

            if launch.args.len() != program.bindings.len() {
                return Err(DeviceError::new(
                    DeviceErrorKind::Dispatch,
                    format!(
                        "kernel {} expects {} arguments, got {}",
                        kernel.name,
                        program.bindings.len(),
                        launch.args.len()
                    ),
                ));
            }

            if launch.uniforms.len() != program.uniforms.len() {
                return Err(DeviceError::new(
                    DeviceErrorKind::Dispatch,
                    format!(
                        "kernel {} expects {} uniforms, got {}",
                        kernel.name,
                        program.uniforms.len(),
                        launch.uniforms.len()
                    ),
                ));
            }

            let mut args = Vec::with_capacity(launch.args.len());

            for (binding, arg) in program.bindings.iter().zip(&launch.args) {
                let is_ring = matches!(arg, KernelArg::Ring(_));
                if is_ring != (binding.access == Access::Accumulate) || arg.buffers().is_empty() {
                    return Err(DeviceError::new(
                        DeviceErrorKind::Dispatch,
                        format!("kernel {}: argument kind mismatch for '{}'", kernel.name, binding.name),
                    ));
                }

                let buffers = arg
                    .buffers()
                    .iter()
                    .map(|id| memory.buffer(*id))
                    .collect::<Result<Vec<_>, _>>()?;

                if buffers.iter().any(|buffer| buffer.element != binding.element) {
                    return Err(DeviceError::new(
                        DeviceErrorKind::InvalidBuffer,
                        format!(
                            "kernel {}: '{}' expects {} elements",
                            kernel.name, binding.name, binding.element
                        ),
                    ));
                }

                if binding.access.writes() {
                    written.extend(arg.buffers().iter().copied());
                } else {
                    read.extend(arg.buffers().iter().copied());
                }

                args.push(match arg {
                    KernelArg::Single(_) => ResolvedArg::Single(buffers[0].clone()),
                    KernelArg::Ring(_) => ResolvedArg::Ring(buffers),
                });
            }

            resolved.push(ResolvedLaunch {
                kernel,
                args,
                uniforms: launch.uniforms,
            });
        }

        if let Some(buffer) = written.intersection(&read).min() {
            return Err(DeviceError::new(
                DeviceErrorKind::Dispatch,
                format!("buffer {} is both read and written within one dispatch", buffer.0),
            ));
        }

        Ok(resolved)
    }

    fn await_pending(&self) -> Result<(), DeviceError> {
        let mut pending = self.pending.lock().map_err(|_| DeviceError::poisoned("queue"))?;
        let report_rx = self.report_rx.lock().map_err(|_| DeviceError::poisoned("queue"))?;

        let mut first_error = None;

        for _ in 0..(*pending * self.num_partitions) {
            let report = report_rx.recv().map_err(|_| {
                DeviceError::new(
                    DeviceErrorKind::Synchronization,
                    "a worker thread terminated unexpectedly",
                )
            })?;

            if let Err(err) = report.result {
                first_error.get_or_insert_with(|| {
                    DeviceError::new(err.kind, format!("partition {}: {}", report.partition, err.message))
                });
            }
        }

        *pending = 0;

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn try_submit(bus: &mut Bus<Command>, command: Command) -> Result<(), (DeviceError, Command)> {
    bus.try_broadcast(command).map_err(|command| {
        (
            DeviceError::new(DeviceErrorKind::QueueFull, "device queue is full"),
            command,
        )
    })
}

impl Drop for CpuDevice {
    fn drop(&mut self) {
        if let Ok(mut broadcast_tx) = self.broadcast_tx.lock() {
            drop(broadcast_tx.take()); // signals the worker threads to exit the loop
        }

        self.join_handles.drain(..).for_each(|join_handle| {
            join_handle.join().ok();
        });
    }
}

pub(crate) fn validate_program(program: &Program, max_registers: usize) -> Result<(), CompileError> {
    let fail = |diagnostic: String| Err(CompileError { diagnostic });

    if program.num_registers > max_registers {
        return fail(format!(
            "program needs {} registers, device provides {}",
            program.num_registers, max_registers
        ));
    }

    for binding in &program.bindings {
        let space_allowed = match program.kind {
            ProgramKind::Group { .. } => binding.space == IndexSpace::Instance,
            ProgramKind::Connector { .. } => binding.space != IndexSpace::Instance,
        };

        let access_allowed = match binding.access {
            Access::Read => true,
            Access::Write | Access::Consume => binding.space == IndexSpace::Instance,
            Access::Accumulate => binding.space == IndexSpace::Target,
        };

        if !space_allowed || !access_allowed {
            return fail(format!(
                "binding '{}' cannot be accessed as {:?} in {:?} space",
                binding.name, binding.access, binding.space
            ));
        }
    }

    if let ProgramKind::Connector {
        source_index,
        target_index,
        ..
    } = program.kind
    {
        for slot in [source_index, target_index] {
            match program.bindings.get(slot) {
                Some(binding) if binding.space == IndexSpace::Edge && binding.access == Access::Read => {}
                _ => return fail(format!("slot {} does not hold edge indices", slot)),
            }
        }
    }

    for (position, instr) in program.instrs.iter().enumerate() {
        let mut registers = instr.srcs().into_iter().chain(instr.dst());
        if let Some(reg) = registers.find(|reg| *reg >= program.num_registers) {
            return fail(format!("instruction {} uses undeclared register r{}", position, reg));
        }

        if let Some((slot, access)) = instr.slot_access() {
            match program.bindings.get(slot) {
                Some(binding) if binding.access == access => {}
                _ => {
                    return fail(format!(
                        "instruction {} needs {:?} access to slot {}",
                        position, access, slot
                    ))
                }
            }
        }

        if let Instr::Uniform { index, .. } = instr {
            if *index >= program.uniforms.len() {
                return fail(format!("instruction {} reads undeclared uniform u{}", position, index));
            }
        }
    }

    Ok(())
}

impl Device for CpuDevice {
    fn num_partitions(&self) -> usize {
        self.num_partitions
    }

    fn allocate(&self, element: NumericType, layout: Layout) -> Result<BufferId, DeviceError> {
        let buffer = DeviceBuffer::new(element, layout, self.num_partitions)?;
        let mut memory = self.memory.write().map_err(|_| DeviceError::poisoned("memory"))?;
        memory.buffers.push(Some(Arc::new(buffer)));
        Ok(BufferId(memory.buffers.len() - 1))
    }

    fn release(&self, buffer: BufferId) -> Result<(), DeviceError> {
        let mut memory = self.memory.write().map_err(|_| DeviceError::poisoned("memory"))?;
        match memory.buffers.get_mut(buffer.0) {
            Some(slot @ Some(_)) => {
                *slot = None;
                Ok(())
            }
            _ => Err(DeviceError::new(
                DeviceErrorKind::InvalidBuffer,
                format!("unknown buffer {}", buffer.0),
            )),
        }
    }

    fn upload(&self, buffer: BufferId, data: &[f64]) -> Result<(), DeviceError> {
        self.buffer(buffer)?.upload(data)
    }

    fn download(&self, buffer: BufferId) -> Result<Vec<f64>, DeviceError> {
        self.buffer(buffer)?.download()
    }

    fn read_element(&self, buffer: BufferId, index: usize) -> Result<f64, DeviceError> {
        let buffer = self.buffer(buffer)?;
        let (chunk, offset) = buffer.locate_or_err(index)?;
        let chunk = buffer.chunks[chunk]
            .read()
            .map_err(|_| DeviceError::poisoned("buffer"))?;
        Ok(chunk[offset])
    }

    fn write_element(&self, buffer: BufferId, index: usize, value: f64) -> Result<(), DeviceError> {
        let buffer = self.buffer(buffer)?;
        let (chunk, offset) = buffer.locate_or_err(index)?;
        let mut chunk = buffer.chunks[chunk]
            .write()
            .map_err(|_| DeviceError::poisoned("buffer"))?;
        chunk[offset] = buffer.element.cast(value);
        Ok(())
    }

    fn fill(&self, buffer: BufferId, value: f64) -> Result<(), DeviceError> {
        let buffer = self.buffer(buffer)?;
        let value = buffer.element.cast(value);
        for chunk in &buffer.chunks {
            chunk
                .write()
                .map_err(|_| DeviceError::poisoned("buffer"))?
                .fill(value);
        }
        Ok(())
    }

    fn compile(&self, program: &Program, name: &str) -> Result<KernelId, CompileError> {
        validate_program(program, self.max_registers)?;

        let mut memory = self.memory.write().map_err(|_| CompileError {
            diagnostic: "device memory lock poisoned".to_string(),
        })?;
        memory.kernels.push(Some(Arc::new(CompiledKernel {
            name: name.to_string(),
            program: program.clone(),
        })));
        Ok(KernelId(memory.kernels.len() - 1))
    }

    fn release_kernel(&self, kernel: KernelId) -> Result<(), DeviceError> {
        let mut memory = self.memory.write().map_err(|_| DeviceError::poisoned("memory"))?;
        match memory.kernels.get_mut(kernel.0) {
            Some(slot @ Some(_)) => {
                *slot = None;
                Ok(())
            }
            _ => Err(DeviceError::new(
                DeviceErrorKind::Dispatch,
                format!("unknown kernel {}", kernel.0),
            )),
        }
    }

    fn enqueue(&self, launches: Vec<Launch>) -> Result<(), DeviceError> {
        let command = Command::Dispatch(Arc::new(self.resolve(launches)?));

        let mut broadcast_tx = self
            .broadcast_tx
            .lock()
            .map_err(|_| DeviceError::poisoned("queue"))?;
        let bus = broadcast_tx.as_mut().ok_or_else(|| {
            DeviceError::new(DeviceErrorKind::Dispatch, "device is shut down")
        })?;

        match try_submit(bus, command) {
            Ok(()) => {}
            Err((err, command)) if err.is_transient() => {
                warn!("{}, draining and resubmitting once", err.message);
                self.await_pending()?;
                try_submit(bus, command).map_err(|(err, _)| err)?;
            }
            Err((err, _)) => return Err(err),
        }

        *self.pending.lock().map_err(|_| DeviceError::poisoned("queue"))? += 1;
        Ok(())
    }

    fn finish(&self) -> Result<(), DeviceError> {
        self.await_pending()
    }
}
