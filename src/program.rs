use std::fmt;

use crate::expr::{BinaryOp, Func, NumericType, UnaryOp};

pub type Reg = usize;

/// What a bound buffer holds. Indices refer to positions in the model description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferRole {
    State {
        group: usize,
        var: usize,
        /// `true` for the step-n buffer of the pair, `false` for step n+1.
        front: bool,
    },
    Input {
        group: usize,
        input: usize,
    },
    Event {
        group: usize,
        threshold: usize,
    },
    Synapse(SynapseField),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SynapseField {
    SourceIndex,
    TargetIndex,
    Weight,
    Delay,
}

/// How a binding is indexed by a kernel invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexSpace {
    /// The group instance being updated.
    Instance,
    /// The source instance of the edge being processed.
    Source,
    /// The target instance of the edge being processed.
    Target,
    Edge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    Read,
    Write,
    /// Read, then reset to zero.
    Consume,
    /// Add into a delay ring slot selected per invocation.
    Accumulate,
}

impl Access {
    pub fn writes(self) -> bool {
        !matches!(self, Access::Read)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub name: String,
    pub role: BufferRole,
    pub space: IndexSpace,
    pub access: Access,
    pub element: NumericType,
}

/// Host-side value passed to a kernel on every launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UniformSource {
    Time,
    TimestepSize,
    Constant { group: usize, constant: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    Const {
        dst: Reg,
        value: f64,
    },
    Uniform {
        dst: Reg,
        index: usize,
    },
    Load {
        dst: Reg,
        slot: usize,
    },
    Consume {
        dst: Reg,
        slot: usize,
    },
    Unary {
        dst: Reg,
        op: UnaryOp,
        src: Reg,
    },
    Binary {
        dst: Reg,
        op: BinaryOp,
        lhs: Reg,
        rhs: Reg,
    },
    Call {
        dst: Reg,
        func: Func,
        args: Vec<Reg>,
    },
    Select {
        dst: Reg,
        cond: Reg,
        then: Reg,
        otherwise: Reg,
    },
    Cast {
        dst: Reg,
        to: NumericType,
        src: Reg,
    },
    Store {
        slot: usize,
        src: Reg,
    },
    Accumulate {
        slot: usize,
        src: Reg,
        delay: Reg,
    },
}

impl Instr {
    pub fn dst(&self) -> Option<Reg> {
        match self {
            Instr::Const { dst, .. }
            | Instr::Uniform { dst, .. }
            | Instr::Load { dst, .. }
            | Instr::Consume { dst, .. }
            | Instr::Unary { dst, .. }
            | Instr::Binary { dst, .. }
            | Instr::Call { dst, .. }
            | Instr::Select { dst, .. }
            | Instr::Cast { dst, .. } => Some(*dst),
            Instr::Store { .. } | Instr::Accumulate { .. } => None,
        }
    }

    pub fn srcs(&self) -> Vec<Reg> {
        match self {
            Instr::Const { .. } | Instr::Uniform { .. } | Instr::Load { .. } | Instr::Consume { .. } => {
                Vec::new()
            }
            Instr::Unary { src, .. } | Instr::Cast { src, .. } | Instr::Store { src, .. } => {
                vec![*src]
            }
            Instr::Binary { lhs, rhs, .. } => vec![*lhs, *rhs],
            Instr::Call { args, .. } => args.clone(),
            Instr::Select {
                cond,
                then,
                otherwise,
                ..
            } => vec![*cond, *then, *otherwise],
            Instr::Accumulate { src, delay, .. } => vec![*src, *delay],
        }
    }

    /// Binding slot touched by this instruction together with the access it needs.
    pub fn slot_access(&self) -> Option<(usize, Access)> {
        match self {
            Instr::Load { slot, .. } => Some((*slot, Access::Read)),
            Instr::Consume { slot, .. } => Some((*slot, Access::Consume)),
            Instr::Store { slot, .. } => Some((*slot, Access::Write)),
            Instr::Accumulate { slot, .. } => Some((*slot, Access::Accumulate)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramKind {
    /// One invocation per group instance.
    Group { instances: usize },
    /// One invocation per edge; the slots hold the edge's source and target indices.
    Connector {
        edges: usize,
        source_index: usize,
        target_index: usize,
    },
}

/// Register program executed once per instance or edge.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub kind: ProgramKind,
    pub bindings: Vec<Binding>,
    pub uniforms: Vec<UniformSource>,
    pub num_registers: usize,
    pub instrs: Vec<Instr>,
}

impl Program {
    pub fn slots_with_access(&self, access: Access) -> impl Iterator<Item = usize> + '_ {
        self.bindings
            .iter()
            .enumerate()
            .filter(move |(_, binding)| binding.access == access)
            .map(|(slot, _)| slot)
    }
}

fn role_label(role: &BufferRole) -> String {
    match role {
        BufferRole::State { group, var, front } => format!(
            "state g{}.v{}.{}",
            group,
            var,
            if *front { "front" } else { "back" }
        ),
        BufferRole::Input { group, input } => format!("input g{}.i{}", group, input),
        BufferRole::Event { group, threshold } => format!("event g{}.e{}", group, threshold),
        BufferRole::Synapse(field) => format!("synapse {:?}", field).to_lowercase(),
    }
}

fn format_args(args: &[Reg]) -> String {
    args.iter()
        .map(|reg| format!("r{}", reg))
        .collect::<Vec<_>>()
        .join(", ")
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ProgramKind::Group { instances } => writeln!(f, "group kernel, {} instances", instances)?,
            ProgramKind::Connector { edges, .. } => writeln!(f, "connector kernel, {} edges", edges)?,
        }

        for (slot, binding) in self.bindings.iter().enumerate() {
            writeln!(
                f,
                "  @{} {} : {} {:?} {:?} {}",
                slot,
                binding.name,
                role_label(&binding.role),
                binding.space,
                binding.access,
                binding.element
            )?;
        }

        for (index, uniform) in self.uniforms.iter().enumerate() {
            writeln!(f, "  u{} : {:?}", index, uniform)?;
        }

        writeln!(f, "  registers: {}", self.num_registers)?;

        for instr in &self.instrs {
            match instr {
                Instr::Const { dst, value } => writeln!(f, "  r{} = {:?}", dst, value)?,
                Instr::Uniform { dst, index } => writeln!(f, "  r{} = u{}", dst, index)?,
                Instr::Load { dst, slot } => writeln!(f, "  r{} = load @{}", dst, slot)?,
                Instr::Consume { dst, slot } => writeln!(f, "  r{} = consume @{}", dst, slot)?,
                Instr::Unary { dst, op, src } => {
                    let symbol = match op {
                        UnaryOp::Neg => "-",
                        UnaryOp::Not => "!",
                    };
                    writeln!(f, "  r{} = {}r{}", dst, symbol, src)?
                }
                Instr::Binary { dst, op, lhs, rhs } => {
                    writeln!(f, "  r{} = r{} {} r{}", dst, lhs, op.symbol(), rhs)?
                }
                Instr::Call { dst, func, args } => {
                    writeln!(f, "  r{} = {}({})", dst, func.name(), format_args(args))?
                }
                Instr::Select {
                    dst,
                    cond,
                    then,
                    otherwise,
                } => writeln!(f, "  r{} = r{} ? r{} : r{}", dst, cond, then, otherwise)?,
                Instr::Cast { dst, to, src } => writeln!(f, "  r{} = ({})r{}", dst, to, src)?,
                Instr::Store { slot, src } => writeln!(f, "  store @{} <- r{}", slot, src)?,
                Instr::Accumulate { slot, src, delay } => {
                    writeln!(f, "  accumulate @{}[+r{}] <- r{}", slot, delay, src)?
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_listing() {
        let program = Program {
            kind: ProgramKind::Group { instances: 3 },
            bindings: vec![
                Binding {
                    name: "V".to_string(),
                    role: BufferRole::State {
                        group: 0,
                        var: 0,
                        front: true,
                    },
                    space: IndexSpace::Instance,
                    access: Access::Read,
                    element: NumericType::Double,
                },
                Binding {
                    name: "V".to_string(),
                    role: BufferRole::State {
                        group: 0,
                        var: 0,
                        front: false,
                    },
                    space: IndexSpace::Instance,
                    access: Access::Write,
                    element: NumericType::Double,
                },
            ],
            uniforms: vec![UniformSource::TimestepSize],
            num_registers: 3,
            instrs: vec![
                Instr::Load { dst: 0, slot: 0 },
                Instr::Uniform { dst: 1, index: 0 },
                Instr::Binary {
                    dst: 2,
                    op: BinaryOp::Add,
                    lhs: 0,
                    rhs: 1,
                },
                Instr::Store { slot: 1, src: 2 },
            ],
        };

        let expected = "group kernel, 3 instances
  @0 V : state g0.v0.front Instance Read double
  @1 V : state g0.v0.back Instance Write double
  u0 : TimestepSize
  registers: 3
  r0 = load @0
  r1 = u0
  r2 = r0 + r1
  store @1 <- r2
";
        assert_eq!(program.to_string(), expected);
        assert_eq!(program.slots_with_access(Access::Write).collect::<Vec<_>>(), [1]);
    }

    #[test]
    fn instruction_operands() {
        let select = Instr::Select {
            dst: 4,
            cond: 1,
            then: 2,
            otherwise: 3,
        };
        assert_eq!(select.dst(), Some(4));
        assert_eq!(select.srcs(), [1, 2, 3]);
        assert_eq!(select.slot_access(), None);

        let accumulate = Instr::Accumulate {
            slot: 5,
            src: 0,
            delay: 1,
        };
        assert_eq!(accumulate.dst(), None);
        assert_eq!(accumulate.slot_access(), Some((5, Access::Accumulate)));
    }
}
