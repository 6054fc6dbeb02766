use std::sync::mpsc::Sender as MpscSender;
use std::sync::{Arc, RwLockReadGuard, RwLockWriteGuard};

use bus::BusReader;

use super::cpu::{CompiledKernel, DeviceBuffer};
use super::exec::{self, Items, View};
use crate::error::{DeviceError, DeviceErrorKind};
use crate::program::{Access, IndexSpace, ProgramKind};

#[derive(Debug, Clone)]
pub(crate) enum ResolvedArg {
    Single(Arc<DeviceBuffer>),
    Ring(Vec<Arc<DeviceBuffer>>),
}

#[derive(Debug, Clone)]
pub(crate) struct ResolvedLaunch {
    pub kernel: Arc<CompiledKernel>,
    pub args: Vec<ResolvedArg>,
    pub uniforms: Vec<f64>,
}

#[derive(Debug, Clone)]
pub(crate) enum Command {
    Dispatch(Arc<Vec<ResolvedLaunch>>),
}

pub(crate) struct Report {
    pub partition: usize,
    pub result: Result<(), DeviceError>,
}

pub(crate) struct Worker {
    partition: usize,
}

fn single(arg: &ResolvedArg) -> Result<&DeviceBuffer, DeviceError> {
    match arg {
        ResolvedArg::Single(buffer) => Ok(buffer),
        ResolvedArg::Ring(_) => Err(DeviceError::new(
            DeviceErrorKind::Dispatch,
            "delay ring bound to a plain slot",
        )),
    }
}

fn read_chunk(buffer: &DeviceBuffer, partition: usize) -> Result<RwLockReadGuard<'_, Vec<f64>>, DeviceError> {
    buffer.chunks[partition]
        .read()
        .map_err(|_| DeviceError::poisoned("buffer"))
}

fn write_chunk(buffer: &DeviceBuffer, partition: usize) -> Result<RwLockWriteGuard<'_, Vec<f64>>, DeviceError> {
    buffer.chunks[partition]
        .write()
        .map_err(|_| DeviceError::poisoned("buffer"))
}

impl Worker {
    pub fn new(partition: usize) -> Self {
        Self { partition }
    }

    pub fn run(self, mut rx: BusReader<Command>, report_tx: MpscSender<Report>) {
        while let Ok(command) = rx.recv() {
            match command {
                Command::Dispatch(launches) => {
                    let result = launches
                        .iter()
                        .try_for_each(|launch| self.execute(launch));

                    let report = Report {
                        partition: self.partition,
                        result,
                    };

                    if report_tx.send(report).is_err() {
                        break;
                    }
                }
            }
        }
    }

    /// Locks the partition's share of every bound buffer and runs the program over it.
    fn execute(&self, launch: &ResolvedLaunch) -> Result<(), DeviceError> {
        let program = &launch.kernel.program;
        let partition = self.partition;
        let mut views = Vec::with_capacity(program.bindings.len());

        for (binding, arg) in program.bindings.iter().zip(&launch.args) {
            let view = match (binding.access, binding.space) {
                (Access::Read, IndexSpace::Instance | IndexSpace::Edge) => {
                    View::Local(read_chunk(single(arg)?, partition)?)
                }
                (Access::Read, IndexSpace::Source | IndexSpace::Target) => {
                    let buffer = single(arg)?;
                    let chunks = (0..buffer.chunks.len())
                        .map(|chunk| read_chunk(buffer, chunk))
                        .collect::<Result<Vec<_>, _>>()?;
                    View::Shared { buffer, chunks }
                }
                (Access::Write | Access::Consume, _) => {
                    let buffer = single(arg)?;
                    View::Owned {
                        element: buffer.element,
                        chunk: write_chunk(buffer, partition)?,
                    }
                }
                (Access::Accumulate, _) => {
                    let buffers = match arg {
                        ResolvedArg::Ring(buffers) => buffers,
                        ResolvedArg::Single(_) => {
                            return Err(DeviceError::new(
                                DeviceErrorKind::Dispatch,
                                "plain buffer bound to a delay ring slot",
                            ))
                        }
                    };
                    let start = buffers[0].chunk_start(partition);
                    let chunks = buffers
                        .iter()
                        .map(|buffer| write_chunk(buffer, partition))
                        .collect::<Result<Vec<_>, _>>()?;
                    View::Ring { start, chunks }
                }
            };
            views.push(view);
        }

        let items = match program.kind {
            ProgramKind::Group { .. } => match views.first() {
                Some(view) => Items::Instances {
                    count: view.local_len(),
                },
                None => return Ok(()),
            },
            ProgramKind::Connector {
                source_index,
                target_index,
                ..
            } => Items::Edges {
                count: views[source_index].local_len(),
                source_slot: source_index,
                target_slot: target_index,
            },
        };

        exec::run(program, &mut views, &launch.uniforms, items)
    }
}
