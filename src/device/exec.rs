//! Lane-blocked program interpreter.
//!
//! Items (instances or edges) are processed in blocks of [`LANES`]; every
//! instruction is applied to the whole block before the next one runs, so the
//! register file holds one column per lane.

use std::sync::{RwLockReadGuard, RwLockWriteGuard};

use super::cpu::DeviceBuffer;
use crate::error::{DeviceError, DeviceErrorKind};
use crate::expr::{BinaryOp, NumericType, UnaryOp};
use crate::program::{IndexSpace, Instr, Program};

pub(crate) const LANES: usize = 64;

/// A partition's access to one bound buffer.
pub(crate) enum View<'a> {
    /// The partition's own chunk, indexed locally.
    Local(RwLockReadGuard<'a, Vec<f64>>),
    /// Every chunk, indexed globally.
    Shared {
        buffer: &'a DeviceBuffer,
        chunks: Vec<RwLockReadGuard<'a, Vec<f64>>>,
    },
    /// The partition's own chunk, indexed locally, writable.
    Owned {
        element: NumericType,
        chunk: RwLockWriteGuard<'a, Vec<f64>>,
    },
    /// The partition's chunk of every ring slot; `start` is the first instance it holds.
    Ring {
        start: usize,
        chunks: Vec<RwLockWriteGuard<'a, Vec<f64>>>,
    },
}

pub(crate) enum Items {
    Instances {
        count: usize,
    },
    Edges {
        count: usize,
        source_slot: usize,
        target_slot: usize,
    },
}

fn out_of_range(index: usize) -> DeviceError {
    DeviceError::new(
        DeviceErrorKind::Dispatch,
        format!("element index {} out of range", index),
    )
}

impl<'a> View<'a> {
    pub fn local_len(&self) -> usize {
        match self {
            View::Local(chunk) => chunk.len(),
            View::Shared { chunks, .. } => chunks.iter().map(|chunk| chunk.len()).sum(),
            View::Owned { chunk, .. } => chunk.len(),
            View::Ring { chunks, .. } => chunks.first().map_or(0, |chunk| chunk.len()),
        }
    }

    fn read(&self, index: usize) -> Result<f64, DeviceError> {
        match self {
            View::Local(chunk) => chunk.get(index).copied(),
            View::Shared { buffer, chunks } => buffer
                .locate(index)
                .map(|(chunk, offset)| chunks[chunk][offset]),
            View::Owned { chunk, .. } => chunk.get(index).copied(),
            View::Ring { .. } => None,
        }
        .ok_or_else(|| out_of_range(index))
    }

    fn consume(&mut self, index: usize) -> Result<f64, DeviceError> {
        match self {
            View::Owned { chunk, .. } => chunk
                .get_mut(index)
                .map(|slot| std::mem::replace(slot, 0.0))
                .ok_or_else(|| out_of_range(index)),
            _ => Err(out_of_range(index)),
        }
    }

    fn store(&mut self, index: usize, value: f64) -> Result<(), DeviceError> {
        match self {
            View::Owned { element, chunk } => {
                let slot = chunk.get_mut(index).ok_or_else(|| out_of_range(index))?;
                *slot = element.cast(value);
                Ok(())
            }
            _ => Err(out_of_range(index)),
        }
    }

    fn accumulate(&mut self, target: usize, delay: usize, value: f64) -> Result<(), DeviceError> {
        match self {
            View::Ring { start, chunks } => {
                let depth = chunks.len();
                let chunk = chunks.get_mut(delay).ok_or_else(|| {
                    DeviceError::new(
                        DeviceErrorKind::Dispatch,
                        format!("delay {} exceeds ring depth {}", delay, depth),
                    )
                })?;
                let slot = target
                    .checked_sub(*start)
                    .and_then(|offset| chunk.get_mut(offset))
                    .ok_or_else(|| out_of_range(target))?;
                *slot += value;
                Ok(())
            }
            _ => Err(out_of_range(target)),
        }
    }
}

fn truth(value: f64) -> bool {
    value != 0.0
}

fn from_bool(value: bool) -> f64 {
    if value {
        1.0
    } else {
        0.0
    }
}

fn apply_binary(op: BinaryOp, lhs: f64, rhs: f64) -> f64 {
    match op {
        BinaryOp::Add => lhs + rhs,
        BinaryOp::Sub => lhs - rhs,
        BinaryOp::Mul => lhs * rhs,
        BinaryOp::Div => lhs / rhs,
        BinaryOp::Pow => lhs.powf(rhs),
        BinaryOp::Lt => from_bool(lhs < rhs),
        BinaryOp::Le => from_bool(lhs <= rhs),
        BinaryOp::Gt => from_bool(lhs > rhs),
        BinaryOp::Ge => from_bool(lhs >= rhs),
        BinaryOp::Eq => from_bool(lhs == rhs),
        BinaryOp::Ne => from_bool(lhs != rhs),
        BinaryOp::And => from_bool(truth(lhs) && truth(rhs)),
        BinaryOp::Or => from_bool(truth(lhs) || truth(rhs)),
    }
}

struct Registers {
    values: Vec<f64>,
}

impl Registers {
    fn new(num_registers: usize) -> Self {
        Self {
            values: vec![0.0; num_registers * LANES],
        }
    }

    fn get(&self, reg: usize, lane: usize) -> f64 {
        self.values[reg * LANES + lane]
    }

    fn set(&mut self, reg: usize, lane: usize, value: f64) {
        self.values[reg * LANES + lane] = value;
    }
}

pub(crate) fn run(
    program: &Program,
    views: &mut [View<'_>],
    uniforms: &[f64],
    items: Items,
) -> Result<(), DeviceError> {
    let count = match items {
        Items::Instances { count } | Items::Edges { count, .. } => count,
    };

    let mut regs = Registers::new(program.num_registers);
    let mut sources = [0usize; LANES];
    let mut targets = [0usize; LANES];

    for block_start in (0..count).step_by(LANES) {
        let lanes = LANES.min(count - block_start);

        if let Items::Edges {
            source_slot,
            target_slot,
            ..
        } = items
        {
            for lane in 0..lanes {
                sources[lane] = views[source_slot].read(block_start + lane)? as usize;
                targets[lane] = views[target_slot].read(block_start + lane)? as usize;
            }
        }

        let address = |space: IndexSpace, lane: usize| match space {
            IndexSpace::Instance | IndexSpace::Edge => block_start + lane,
            IndexSpace::Source => sources[lane],
            IndexSpace::Target => targets[lane],
        };

        for instr in &program.instrs {
            match instr {
                Instr::Const { dst, value } => {
                    for lane in 0..lanes {
                        regs.set(*dst, lane, *value);
                    }
                }
                Instr::Uniform { dst, index } => {
                    for lane in 0..lanes {
                        regs.set(*dst, lane, uniforms[*index]);
                    }
                }
                Instr::Load { dst, slot } => {
                    let space = program.bindings[*slot].space;
                    for lane in 0..lanes {
                        let value = views[*slot].read(address(space, lane))?;
                        regs.set(*dst, lane, value);
                    }
                }
                Instr::Consume { dst, slot } => {
                    for lane in 0..lanes {
                        let value = views[*slot].consume(block_start + lane)?;
                        regs.set(*dst, lane, value);
                    }
                }
                Instr::Unary { dst, op, src } => {
                    for lane in 0..lanes {
                        let value = regs.get(*src, lane);
                        let result = match op {
                            UnaryOp::Neg => -value,
                            UnaryOp::Not => from_bool(!truth(value)),
                        };
                        regs.set(*dst, lane, result);
                    }
                }
                Instr::Binary { dst, op, lhs, rhs } => {
                    for lane in 0..lanes {
                        let result = apply_binary(*op, regs.get(*lhs, lane), regs.get(*rhs, lane));
                        regs.set(*dst, lane, result);
                    }
                }
                Instr::Call { dst, func, args } => {
                    for lane in 0..lanes {
                        let result = match args.as_slice() {
                            [x] => func.apply1(regs.get(*x, lane)),
                            [x, y] => func.apply2(regs.get(*x, lane), regs.get(*y, lane)),
                            _ => f64::NAN,
                        };
                        regs.set(*dst, lane, result);
                    }
                }
                Instr::Select {
                    dst,
                    cond,
                    then,
                    otherwise,
                } => {
                    for lane in 0..lanes {
                        let chosen = if truth(regs.get(*cond, lane)) {
                            *then
                        } else {
                            *otherwise
                        };
                        let value = regs.get(chosen, lane);
                        regs.set(*dst, lane, value);
                    }
                }
                Instr::Cast { dst, to, src } => {
                    for lane in 0..lanes {
                        let value = to.cast(regs.get(*src, lane));
                        regs.set(*dst, lane, value);
                    }
                }
                Instr::Store { slot, src } => {
                    for lane in 0..lanes {
                        views[*slot].store(block_start + lane, regs.get(*src, lane))?;
                    }
                }
                Instr::Accumulate { slot, src, delay } => {
                    for lane in 0..lanes {
                        let delay = regs.get(*delay, lane) as usize;
                        views[*slot].accumulate(targets[lane], delay, regs.get(*src, lane))?;
                    }
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::RwLock;

    #[test]
    fn binary_semantics() {
        assert_eq!(apply_binary(BinaryOp::Pow, 2.0, 3.0), 8.0);
        assert_eq!(apply_binary(BinaryOp::Ge, 30.0, 30.0), 1.0);
        assert_eq!(apply_binary(BinaryOp::And, 1.0, 0.0), 0.0);
        assert_eq!(apply_binary(BinaryOp::Or, 1.0, 0.0), 1.0);
        assert_eq!(apply_binary(BinaryOp::Ne, 1.0, 1.0), 0.0);
    }

    #[test]
    fn ring_accumulation() {
        let slots: Vec<_> = (0..3).map(|_| RwLock::new(vec![0.0; 4])).collect();
        let mut view = View::Ring {
            start: 10,
            chunks: slots.iter().map(|slot| slot.write().unwrap()).collect(),
        };

        view.accumulate(12, 2, 1.5).unwrap();
        view.accumulate(12, 2, 1.0).unwrap();
        assert!(view.accumulate(12, 3, 1.0).is_err());
        assert!(view.accumulate(9, 0, 1.0).is_err());
        drop(view);

        assert_eq!(*slots[2].read().unwrap(), [0.0, 0.0, 2.5, 0.0]);
    }

    #[test]
    fn consume_zeroes() {
        let chunk = RwLock::new(vec![3.0, 4.0]);
        let mut view = View::Owned {
            element: NumericType::Double,
            chunk: chunk.write().unwrap(),
        };

        assert_eq!(view.consume(1).unwrap(), 4.0);
        assert_eq!(view.consume(1).unwrap(), 0.0);
        view.store(0, 7.9).unwrap();
        drop(view);

        assert_eq!(*chunk.read().unwrap(), [7.9, 0.0]);
    }
}
