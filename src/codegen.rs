//! Lowers group equations and connector transmission rules into register programs.
//!
//! Lowering type-checks every expression on the way. A group program reads all
//! step-n values first, computes the step-n+1 values, applies thresholds as
//! masked selects and stores into the back half of each state pair. A connector
//! program computes one contribution per edge and accumulates it into the target
//! input ring at the edge's delay.

use crate::device::{Device, KernelId};
use crate::error::GenerationError;
use crate::expr::{AssignOp, BinaryOp, Expr, Func, NumericType, Scope, Statement, Type, UnaryOp, VarRef};
use crate::params::{ConnectorParams, GroupParams, Integrator, NeuronTypeParams, Transmission};
use crate::parser;
use crate::program::{
    Access, Binding, BufferRole, IndexSpace, Instr, Program, ProgramKind, Reg, SynapseField,
    UniformSource,
};
use crate::types::HashMap;

/// Slots every connector program binds first, in this order.
pub const SOURCE_INDEX_SLOT: usize = 0;
pub const TARGET_INDEX_SLOT: usize = 1;
pub const WEIGHT_SLOT: usize = 2;
pub const DELAY_SLOT: usize = 3;
pub const RING_SLOT: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelTarget {
    Group(usize),
    Connector(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedKernel {
    pub name: String,
    pub target: KernelTarget,
    /// Instance or edge count the program was generated for.
    pub count: usize,
    pub program: Program,
    pub source: String,
    pub kernel_id: Option<KernelId>,
}

impl GeneratedKernel {
    fn new(name: String, target: KernelTarget, count: usize, program: Program) -> Self {
        let source = format!("kernel {}\n{}", name, program);
        Self {
            name,
            target,
            count,
            program,
            source,
            kernel_id: None,
        }
    }
}

/// Hands the program to the device and records the resulting kernel id.
pub fn compile<D: Device>(device: &D, kernel: &mut GeneratedKernel) -> Result<KernelId, GenerationError> {
    let kernel_id = device
        .compile(&kernel.program, &kernel.name)
        .map_err(|err| GenerationError::Compile {
            kernel: kernel.name.clone(),
            diagnostic: err.diagnostic,
        })?;
    kernel.kernel_id = Some(kernel_id);
    Ok(kernel_id)
}

#[derive(Debug, Clone, Copy)]
struct Value {
    reg: Reg,
    ty: Type,
}

trait Env {
    fn lookup(&mut self, builder: &mut ProgramBuilder, var: &VarRef) -> Result<Value, GenerationError>;
}

struct ProgramBuilder {
    context: String,
    bindings: Vec<Binding>,
    uniforms: Vec<UniformSource>,
    uniform_regs: HashMap<UniformSource, Reg>,
    instrs: Vec<Instr>,
    num_registers: usize,
}

impl ProgramBuilder {
    fn new(context: String) -> Self {
        Self {
            context,
            bindings: Vec::new(),
            uniforms: Vec::new(),
            uniform_regs: HashMap::default(),
            instrs: Vec::new(),
            num_registers: 0,
        }
    }

    fn reg(&mut self) -> Reg {
        self.num_registers += 1;
        self.num_registers - 1
    }

    fn bind(&mut self, binding: Binding) -> usize {
        if let Some(slot) = self.bindings.iter().position(|existing| {
            existing.role == binding.role
                && existing.space == binding.space
                && existing.access == binding.access
        }) {
            return slot;
        }

        self.bindings.push(binding);
        self.bindings.len() - 1
    }

    fn load(&mut self, slot: usize) -> Reg {
        let dst = self.reg();
        self.instrs.push(Instr::Load { dst, slot });
        dst
    }

    fn uniform(&mut self, source: UniformSource) -> Value {
        let reg = match self.uniform_regs.get(&source) {
            Some(reg) => *reg,
            None => {
                let index = self.uniforms.len();
                self.uniforms.push(source);
                let dst = self.reg();
                self.instrs.push(Instr::Uniform { dst, index });
                self.uniform_regs.insert(source, dst);
                dst
            }
        };

        Value {
            reg,
            ty: Type::Num(NumericType::Double),
        }
    }

    fn constant(&mut self, value: f64) -> Reg {
        let dst = self.reg();
        self.instrs.push(Instr::Const { dst, value });
        dst
    }

    fn binary(&mut self, op: BinaryOp, lhs: Reg, rhs: Reg) -> Reg {
        let dst = self.reg();
        self.instrs.push(Instr::Binary { dst, op, lhs, rhs });
        dst
    }

    fn select(&mut self, cond: Reg, then: Reg, otherwise: Reg) -> Reg {
        let dst = self.reg();
        self.instrs.push(Instr::Select {
            dst,
            cond,
            then,
            otherwise,
        });
        dst
    }

    fn cast(&mut self, value: Value, to: NumericType) -> Reg {
        if value.ty == Type::Num(to) {
            return value.reg;
        }

        let dst = self.reg();
        self.instrs.push(Instr::Cast {
            dst,
            to,
            src: value.reg,
        });
        dst
    }

    fn mismatch(&self, expected: impl ToString, found: Type) -> GenerationError {
        GenerationError::TypeMismatch {
            context: self.context.clone(),
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }

    fn expect_num(&self, ty: Type) -> Result<NumericType, GenerationError> {
        match ty {
            Type::Num(numeric_type) => Ok(numeric_type),
            Type::Bool => Err(self.mismatch("number", ty)),
        }
    }

    fn expect_bool(&self, ty: Type) -> Result<(), GenerationError> {
        match ty {
            Type::Bool => Ok(()),
            Type::Num(_) => Err(self.mismatch("bool", ty)),
        }
    }

    fn check_assignment(&self, var_type: NumericType, value: Value) -> Result<(), GenerationError> {
        let value_type = self.expect_num(value.ty).map_err(|_| self.mismatch(var_type, value.ty))?;

        if var_type.accepts(value_type) {
            Ok(())
        } else {
            Err(self.mismatch(var_type, value.ty))
        }
    }

    fn lower(&mut self, expr: &Expr, env: &mut dyn Env) -> Result<Value, GenerationError> {
        match expr {
            Expr::Number { value, integral } => {
                let reg = self.constant(*value);
                let numeric_type = if *integral {
                    NumericType::Int
                } else {
                    NumericType::Double
                };
                Ok(Value {
                    reg,
                    ty: Type::Num(numeric_type),
                })
            }
            Expr::Var(var) => env.lookup(self, var),
            Expr::Unary { op, operand } => {
                let operand = self.lower(operand, env)?;
                let ty = match op {
                    UnaryOp::Neg => Type::Num(self.expect_num(operand.ty)?),
                    UnaryOp::Not => {
                        self.expect_bool(operand.ty)?;
                        Type::Bool
                    }
                };
                let dst = self.reg();
                self.instrs.push(Instr::Unary {
                    dst,
                    op: *op,
                    src: operand.reg,
                });
                Ok(Value { reg: dst, ty })
            }
            Expr::Binary { op, lhs, rhs } => {
                let lhs = self.lower(lhs, env)?;
                let rhs = self.lower(rhs, env)?;

                if op.is_logical() {
                    self.expect_bool(lhs.ty)?;
                    self.expect_bool(rhs.ty)?;
                    let reg = self.binary(*op, lhs.reg, rhs.reg);
                    return Ok(Value { reg, ty: Type::Bool });
                }

                let lhs_type = self.expect_num(lhs.ty)?;
                let rhs_type = self.expect_num(rhs.ty)?;

                if op.is_comparison() {
                    let reg = self.binary(*op, lhs.reg, rhs.reg);
                    return Ok(Value { reg, ty: Type::Bool });
                }

                let numeric_type = match op {
                    BinaryOp::Pow => NumericType::Double,
                    _ => lhs_type.promote(rhs_type),
                };

                let mut reg = self.binary(*op, lhs.reg, rhs.reg);

                if *op == BinaryOp::Div && numeric_type == NumericType::Int {
                    reg = self.cast(
                        Value {
                            reg,
                            ty: Type::Num(NumericType::Double),
                        },
                        NumericType::Int,
                    );
                }

                Ok(Value {
                    reg,
                    ty: Type::Num(numeric_type),
                })
            }
            Expr::Call { func, args } => {
                let mut lowered = Vec::with_capacity(args.len());
                for arg in args {
                    lowered.push(self.lower(arg, env)?);
                }
                let args = lowered;

                if *func == Func::Select {
                    self.expect_bool(args[0].ty)?;
                    let numeric_type = self
                        .expect_num(args[1].ty)?
                        .promote(self.expect_num(args[2].ty)?);
                    let reg = self.select(args[0].reg, args[1].reg, args[2].reg);
                    return Ok(Value {
                        reg,
                        ty: Type::Num(numeric_type),
                    });
                }

                let mut promoted = NumericType::Int;
                for arg in &args {
                    promoted = promoted.promote(self.expect_num(arg.ty)?);
                }

                let numeric_type = match func {
                    Func::Abs | Func::Floor | Func::Min | Func::Max => promoted,
                    _ => NumericType::Double,
                };

                let dst = self.reg();
                self.instrs.push(Instr::Call {
                    dst,
                    func: *func,
                    args: args.iter().map(|arg| arg.reg).collect(),
                });
                Ok(Value {
                    reg: dst,
                    ty: Type::Num(numeric_type),
                })
            }
        }
    }

    /// `current + dt * rate` for one rate, `current + dt * mean(rates)` for several.
    fn integrate(&mut self, current: Value, rates: &[Value]) -> Result<Value, GenerationError> {
        let mut sum = None;
        for rate in rates {
            self.expect_num(rate.ty)?;
            sum = Some(match sum {
                Some(acc) => self.binary(BinaryOp::Add, acc, rate.reg),
                None => rate.reg,
            });
        }

        let sum = match sum {
            Some(sum) => sum,
            None => return Ok(current),
        };

        let mut step = self.uniform(UniformSource::TimestepSize).reg;
        if rates.len() > 1 {
            let scale = self.constant(1.0 / rates.len() as f64);
            step = self.binary(BinaryOp::Mul, step, scale);
        }

        let increment = self.binary(BinaryOp::Mul, step, sum);
        let reg = self.binary(BinaryOp::Add, current.reg, increment);
        Ok(Value {
            reg,
            ty: Type::Num(NumericType::Double),
        })
    }

    /// Lowers one update statement; `current` is the value `+=`, `-=` and `'` build on.
    /// Also returns the rate of a derivative statement.
    fn lower_update(
        &mut self,
        statement: &Statement,
        current: Value,
        var_type: NumericType,
        env: &mut dyn Env,
    ) -> Result<(Value, Option<Value>), GenerationError> {
        let (value, rate) = match statement {
            Statement::Derivative { expr, .. } => {
                let rate = self.lower(expr, env)?;
                (self.integrate(current, &[rate])?, Some(rate))
            }
            Statement::Assign { op, expr, .. } => {
                let value = self.lower(expr, env)?;
                let value = match op {
                    AssignOp::Set => value,
                    AssignOp::Add | AssignOp::Sub => {
                        let value_type = self.expect_num(value.ty)?;
                        let op = if *op == AssignOp::Add {
                            BinaryOp::Add
                        } else {
                            BinaryOp::Sub
                        };
                        let reg = self.binary(op, current.reg, value.reg);
                        Value {
                            reg,
                            ty: Type::Num(var_type.promote(value_type)),
                        }
                    }
                };
                (value, None)
            }
        };

        self.check_assignment(var_type, value)?;
        Ok((value, rate))
    }

    fn finish(self, kind: ProgramKind) -> Program {
        Program {
            kind,
            bindings: self.bindings,
            uniforms: self.uniforms,
            num_registers: self.num_registers,
            instrs: self.instrs,
        }
    }
}

struct GroupEnv<'a> {
    group_index: usize,
    neuron_type: &'a NeuronTypeParams,
    state: Vec<Value>,
    inputs: Vec<Value>,
}

impl<'a> GroupEnv<'a> {
    fn assignable(&self, name: &str, context: &str) -> Result<usize, GenerationError> {
        if let Some(var_index) = self.neuron_type.state_variable_index(name) {
            return Ok(var_index);
        }

        let is_readonly = name == "t"
            || name == "dt"
            || self.neuron_type.constant_index(name).is_some()
            || self.neuron_type.input_index(name).is_some();

        if is_readonly {
            Err(GenerationError::NotAssignable {
                context: context.to_string(),
                name: name.to_string(),
            })
        } else {
            Err(GenerationError::UndeclaredVariable {
                context: context.to_string(),
                name: name.to_string(),
            })
        }
    }
}

impl<'a> Env for GroupEnv<'a> {
    fn lookup(&mut self, builder: &mut ProgramBuilder, var: &VarRef) -> Result<Value, GenerationError> {
        if var.scope == Scope::Local {
            let name = var.name.as_str();

            if name == "t" {
                return Ok(builder.uniform(UniformSource::Time));
            }

            if name == "dt" {
                return Ok(builder.uniform(UniformSource::TimestepSize));
            }

            if let Some(var_index) = self.neuron_type.state_variable_index(name) {
                return Ok(self.state[var_index]);
            }

            if let Some(constant) = self.neuron_type.constant_index(name) {
                return Ok(builder.uniform(UniformSource::Constant {
                    group: self.group_index,
                    constant,
                }));
            }

            if let Some(input_index) = self.neuron_type.input_index(name) {
                return Ok(self.inputs[input_index]);
            }
        }

        Err(undeclared(builder, var))
    }
}

fn undeclared(builder: &ProgramBuilder, var: &VarRef) -> GenerationError {
    GenerationError::UndeclaredVariable {
        context: builder.context.clone(),
        name: var.to_string(),
    }
}

pub fn group_kernel_name(group: &GroupParams) -> String {
    format!("group_update_{}", group.name)
}

pub fn connector_kernel_name(connector: &ConnectorParams) -> String {
    format!("connector_update_{}", connector.name)
}

pub fn generate_group_kernel(
    group_index: usize,
    group: &GroupParams,
) -> Result<GeneratedKernel, GenerationError> {
    let context = format!("group '{}'", group.name);
    let neuron_type = &group.neuron_type;

    let statements = parser::parse_statements(&neuron_type.equations, &context)?;

    let thresholds = neuron_type
        .thresholds
        .iter()
        .enumerate()
        .map(|(threshold_index, threshold)| {
            let context = format!("group '{}' threshold {}", group.name, threshold_index);
            Ok((
                context.clone(),
                parser::parse_expression(&threshold.condition, &context)?,
                parser::parse_statements(&threshold.reset, &context)?,
            ))
        })
        .collect::<Result<Vec<_>, GenerationError>>()?;

    let mut builder = ProgramBuilder::new(context.clone());

    let mut old_values = Vec::new();
    let mut store_slots = Vec::new();

    for (var_index, var) in neuron_type.state_variables.iter().enumerate() {
        let read_slot = builder.bind(Binding {
            name: var.name.clone(),
            role: BufferRole::State {
                group: group_index,
                var: var_index,
                front: true,
            },
            space: IndexSpace::Instance,
            access: Access::Read,
            element: var.numeric_type,
        });
        store_slots.push(builder.bind(Binding {
            name: var.name.clone(),
            role: BufferRole::State {
                group: group_index,
                var: var_index,
                front: false,
            },
            space: IndexSpace::Instance,
            access: Access::Write,
            element: var.numeric_type,
        }));
        let reg = builder.load(read_slot);
        old_values.push(Value {
            reg,
            ty: Type::Num(var.numeric_type),
        });
    }

    // Inputs are consumed even when no equation reads them, so delivered input never lingers.
    let mut inputs = Vec::new();
    for (input_index, input) in neuron_type.inputs.iter().enumerate() {
        let slot = builder.bind(Binding {
            name: input.clone(),
            role: BufferRole::Input {
                group: group_index,
                input: input_index,
            },
            space: IndexSpace::Instance,
            access: Access::Consume,
            element: NumericType::Double,
        });
        let dst = builder.reg();
        builder.instrs.push(Instr::Consume { dst, slot });
        inputs.push(Value {
            reg: dst,
            ty: Type::Num(NumericType::Double),
        });
    }

    let mut env = GroupEnv {
        group_index,
        neuron_type,
        state: old_values.clone(),
        inputs,
    };

    let mut new_values = old_values.clone();
    let mut assigned = vec![false; neuron_type.state_variables.len()];
    let mut rates = Vec::new();

    for statement in &statements {
        let var_index = env.assignable(statement.var(), &context)?;

        if assigned[var_index] {
            return Err(GenerationError::InvalidModel(format!(
                "{}: '{}' is assigned more than once",
                context,
                statement.var()
            )));
        }
        assigned[var_index] = true;

        let var_type = neuron_type.state_variables[var_index].numeric_type;
        let (value, rate) =
            builder.lower_update(statement, old_values[var_index], var_type, &mut env)?;
        new_values[var_index] = value;

        if let (Statement::Derivative { expr, .. }, Some(rate)) = (statement, rate) {
            rates.push((var_index, expr, rate));
        }
    }

    if neuron_type.integrator == Integrator::Heun && !rates.is_empty() {
        // corrector: rates re-evaluated on the Euler prediction, same step-n inputs
        env.state = new_values.clone();

        for (var_index, expr, rate) in rates {
            let predicted_rate = builder.lower(expr, &mut env)?;
            let value = builder.integrate(old_values[var_index], &[rate, predicted_rate])?;
            builder.check_assignment(neuron_type.state_variables[var_index].numeric_type, value)?;
            new_values[var_index] = value;
        }
    }

    env.state = new_values;

    for (threshold_index, (threshold_context, condition, reset)) in thresholds.iter().enumerate() {
        builder.context = threshold_context.clone();

        let fired = builder.lower(condition, &mut env)?;
        builder.expect_bool(fired.ty)?;

        let entry_values = env.state.clone();
        let mut reset_values = entry_values.clone();
        let mut reset_assigned = vec![false; neuron_type.state_variables.len()];

        for statement in reset {
            if let Statement::Derivative { var, .. } = statement {
                return Err(GenerationError::InvalidModel(format!(
                    "{}: derivative of '{}' in a threshold reset",
                    threshold_context, var
                )));
            }

            let var_index = env.assignable(statement.var(), threshold_context)?;

            if reset_assigned[var_index] {
                return Err(GenerationError::InvalidModel(format!(
                    "{}: '{}' is assigned more than once",
                    threshold_context,
                    statement.var()
                )));
            }
            reset_assigned[var_index] = true;

            let var_type = neuron_type.state_variables[var_index].numeric_type;
            let (value, _) =
                builder.lower_update(statement, entry_values[var_index], var_type, &mut env)?;

            let entry_type = builder.expect_num(entry_values[var_index].ty)?;
            let value_type = builder.expect_num(value.ty)?;
            let reg = builder.select(fired.reg, value.reg, entry_values[var_index].reg);
            reset_values[var_index] = Value {
                reg,
                ty: Type::Num(entry_type.promote(value_type)),
            };
        }

        let event_slot = builder.bind(Binding {
            name: format!("event{}", threshold_index),
            role: BufferRole::Event {
                group: group_index,
                threshold: threshold_index,
            },
            space: IndexSpace::Instance,
            access: Access::Write,
            element: NumericType::Int,
        });
        builder.instrs.push(Instr::Store {
            slot: event_slot,
            src: fired.reg,
        });

        env.state = reset_values;
    }

    for (var_index, var) in neuron_type.state_variables.iter().enumerate() {
        let src = builder.cast(env.state[var_index], var.numeric_type);
        builder.instrs.push(Instr::Store {
            slot: store_slots[var_index],
            src,
        });
    }

    let program = builder.finish(ProgramKind::Group {
        instances: group.num_neurons,
    });

    Ok(GeneratedKernel::new(
        group_kernel_name(group),
        KernelTarget::Group(group_index),
        group.num_neurons,
        program,
    ))
}

struct ConnectorEnv<'a> {
    source_group: usize,
    target_group: usize,
    groups: &'a [GroupParams],
    loaded: HashMap<VarRef, Value>,
}

impl<'a> Env for ConnectorEnv<'a> {
    fn lookup(&mut self, builder: &mut ProgramBuilder, var: &VarRef) -> Result<Value, GenerationError> {
        if let Some(value) = self.loaded.get(var) {
            return Ok(*value);
        }

        let (group_index, space) = match var.scope {
            Scope::Local => {
                return match var.name.as_str() {
                    "t" => Ok(builder.uniform(UniformSource::Time)),
                    "dt" => Ok(builder.uniform(UniformSource::TimestepSize)),
                    "weight" => {
                        let value = Value {
                            reg: builder.load(WEIGHT_SLOT),
                            ty: Type::Num(NumericType::Double),
                        };
                        self.loaded.insert(var.clone(), value);
                        Ok(value)
                    }
                    _ => Err(undeclared(builder, var)),
                };
            }
            Scope::Pre => (self.source_group, IndexSpace::Source),
            Scope::Post => (self.target_group, IndexSpace::Target),
        };

        let neuron_type = &self.groups[group_index].neuron_type;

        if let Some(constant) = neuron_type.constant_index(&var.name) {
            return Ok(builder.uniform(UniformSource::Constant {
                group: group_index,
                constant,
            }));
        }

        let var_index = match neuron_type.state_variable_index(&var.name) {
            Some(var_index) => var_index,
            None => return Err(undeclared(builder, var)),
        };
        let numeric_type = neuron_type.state_variables[var_index].numeric_type;

        let slot = builder.bind(Binding {
            name: var.to_string(),
            role: BufferRole::State {
                group: group_index,
                var: var_index,
                front: true,
            },
            space,
            access: Access::Read,
            element: numeric_type,
        });

        let value = Value {
            reg: builder.load(slot),
            ty: Type::Num(numeric_type),
        };
        self.loaded.insert(var.clone(), value);
        Ok(value)
    }
}

fn synapse_binding(name: &str, field: SynapseField, element: NumericType) -> Binding {
    Binding {
        name: name.to_string(),
        role: BufferRole::Synapse(field),
        space: IndexSpace::Edge,
        access: Access::Read,
        element,
    }
}

pub fn generate_connector_kernel(
    connector_index: usize,
    connector: &ConnectorParams,
    groups: &[GroupParams],
    edges: usize,
) -> Result<GeneratedKernel, GenerationError> {
    let context = format!("connector '{}'", connector.name);

    let group_index = |name: &str| {
        groups
            .iter()
            .position(|group| group.name == name)
            .ok_or_else(|| {
                GenerationError::InvalidModel(format!("{}: unknown group '{}'", context, name))
            })
    };

    let source_group = group_index(&connector.source.group)?;
    let target_group = group_index(&connector.target.group)?;

    let target_input = groups[target_group]
        .neuron_type
        .input_index(&connector.target_input)
        .ok_or_else(|| GenerationError::UndeclaredVariable {
            context: context.clone(),
            name: connector.target_input.clone(),
        })?;

    let mut builder = ProgramBuilder::new(context.clone());

    builder.bind(synapse_binding("source_index", SynapseField::SourceIndex, NumericType::Int));
    builder.bind(synapse_binding("target_index", SynapseField::TargetIndex, NumericType::Int));
    builder.bind(synapse_binding("weight", SynapseField::Weight, NumericType::Double));
    builder.bind(synapse_binding("delay", SynapseField::Delay, NumericType::Int));
    builder.bind(Binding {
        name: connector.target_input.clone(),
        role: BufferRole::Input {
            group: target_group,
            input: target_input,
        },
        space: IndexSpace::Target,
        access: Access::Accumulate,
        element: NumericType::Double,
    });

    let mut env = ConnectorEnv {
        source_group,
        target_group,
        groups,
        loaded: HashMap::default(),
    };

    let (expression, threshold) = match &connector.transmission {
        Transmission::Graded { expression } => (expression, None),
        Transmission::Event {
            threshold,
            expression,
        } => (expression, Some(*threshold)),
    };

    let parsed = parser::parse_expression(expression, &context)?;
    let contribution = builder.lower(&parsed, &mut env)?;
    builder.expect_num(contribution.ty)?;

    let mut src = contribution.reg;

    if let Some(threshold) = threshold {
        if threshold >= groups[source_group].neuron_type.thresholds.len() {
            return Err(GenerationError::InvalidModel(format!(
                "{}: group '{}' has no threshold {}",
                context, connector.source.group, threshold
            )));
        }

        let event_slot = builder.bind(Binding {
            name: format!("pre.event{}", threshold),
            role: BufferRole::Event {
                group: source_group,
                threshold,
            },
            space: IndexSpace::Source,
            access: Access::Read,
            element: NumericType::Int,
        });
        let fired = builder.load(event_slot);
        let zero = builder.constant(0.0);
        src = builder.select(fired, src, zero);
    }

    let delay = builder.load(DELAY_SLOT);
    builder.instrs.push(Instr::Accumulate {
        slot: RING_SLOT,
        src,
        delay,
    });

    let program = builder.finish(ProgramKind::Connector {
        edges,
        source_index: SOURCE_INDEX_SLOT,
        target_index: TARGET_INDEX_SLOT,
    });

    Ok(GeneratedKernel::new(
        connector_kernel_name(connector),
        KernelTarget::Connector(connector_index),
        edges,
        program,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{GroupRange, StateVariableParams, ThresholdParams};
    use crate::util::test_util;

    fn regular_group() -> GroupParams {
        test_util::get_template_model_params().groups.remove(0)
    }

    fn with_equations(equations: &str) -> GroupParams {
        let mut group = regular_group();
        group.neuron_type.equations = equations.to_string();
        group
    }

    #[test]
    fn deterministic_source() {
        let first = generate_group_kernel(0, &regular_group()).unwrap();
        let second = generate_group_kernel(0, &regular_group()).unwrap();

        assert_eq!(first.source, second.source);
        assert_eq!(first.name, "group_update_Regular");
        assert_eq!(first.count, 10);
        assert!(first.source.starts_with("kernel group_update_Regular\n"));
    }

    #[test]
    fn group_binding_layout() {
        let kernel = generate_group_kernel(0, &regular_group()).unwrap();
        let roles: Vec<_> = kernel
            .program
            .bindings
            .iter()
            .map(|binding| (binding.role, binding.access))
            .collect();

        assert_eq!(
            roles,
            [
                (
                    BufferRole::State {
                        group: 0,
                        var: 0,
                        front: true
                    },
                    Access::Read
                ),
                (
                    BufferRole::State {
                        group: 0,
                        var: 0,
                        front: false
                    },
                    Access::Write
                ),
                (
                    BufferRole::State {
                        group: 0,
                        var: 1,
                        front: true
                    },
                    Access::Read
                ),
                (
                    BufferRole::State {
                        group: 0,
                        var: 1,
                        front: false
                    },
                    Access::Write
                ),
                (BufferRole::Input { group: 0, input: 0 }, Access::Consume),
                (
                    BufferRole::Event {
                        group: 0,
                        threshold: 0
                    },
                    Access::Write
                ),
            ]
        );

        assert!(kernel.program.uniforms.contains(&UniformSource::TimestepSize));
        assert!(kernel.program.uniforms.contains(&UniformSource::Constant {
            group: 0,
            constant: 4
        }));
    }

    #[test]
    fn undeclared_variable() {
        let result = generate_group_kernel(0, &with_equations("V' = -V + w"));
        assert_eq!(
            result.unwrap_err(),
            GenerationError::UndeclaredVariable {
                context: "group 'Regular'".to_string(),
                name: "w".to_string()
            }
        );
    }

    #[test]
    fn assignment_to_constant() {
        let result = generate_group_kernel(0, &with_equations("a = 1.0"));
        assert!(matches!(
            result,
            Err(GenerationError::NotAssignable { name, .. }) if name == "a"
        ));
    }

    #[test]
    fn double_assigned_to_int() {
        let mut group = with_equations("n = n + 0.5");
        group.neuron_type.state_variables.push(StateVariableParams {
            name: "n".to_string(),
            numeric_type: NumericType::Int,
            initial_value: Default::default(),
        });

        assert_eq!(
            generate_group_kernel(0, &group).unwrap_err(),
            GenerationError::TypeMismatch {
                context: "group 'Regular'".to_string(),
                expected: "int".to_string(),
                found: "double".to_string()
            }
        );
    }

    #[test]
    fn int_counter_accepted() {
        let mut group = with_equations("n += 1; m = n / 2");
        for name in ["n", "m"] {
            group.neuron_type.state_variables.push(StateVariableParams {
                name: name.to_string(),
                numeric_type: NumericType::Int,
                initial_value: Default::default(),
            });
        }

        let kernel = generate_group_kernel(0, &group).unwrap();
        assert!(kernel
            .program
            .instrs
            .iter()
            .any(|instr| matches!(instr, Instr::Cast { to: NumericType::Int, .. })));
    }

    #[test]
    fn bool_arithmetic_rejected() {
        let result = generate_group_kernel(0, &with_equations("V = (V > 0) + 1"));
        assert!(matches!(
            result,
            Err(GenerationError::TypeMismatch { expected, found, .. })
                if expected == "number" && found == "bool"
        ));
    }

    #[test]
    fn numeric_threshold_condition_rejected() {
        let mut group = regular_group();
        group.neuron_type.thresholds = vec![ThresholdParams {
            condition: "V - 30".to_string(),
            reset: "V = c".to_string(),
        }];

        assert_eq!(
            generate_group_kernel(0, &group).unwrap_err(),
            GenerationError::TypeMismatch {
                context: "group 'Regular' threshold 0".to_string(),
                expected: "bool".to_string(),
                found: "double".to_string()
            }
        );
    }

    #[test]
    fn variable_assigned_twice() {
        let result = generate_group_kernel(0, &with_equations("V = 1.0; V = 2.0"));
        assert!(matches!(result, Err(GenerationError::InvalidModel(_))));
    }

    #[test]
    fn connector_program() {
        let params = test_util::get_template_model_params();
        let mut connector = params.connectors[0].clone();
        connector.transmission = Transmission::Graded {
            expression: "weight * (pre.V - post.V) * post.d".to_string(),
        };

        let kernel = generate_connector_kernel(0, &connector, &params.groups, 7).unwrap();

        assert_eq!(kernel.count, 7);
        assert_eq!(kernel.name, "connector_update_RandConn");
        assert_eq!(
            kernel.program.kind,
            ProgramKind::Connector {
                edges: 7,
                source_index: SOURCE_INDEX_SLOT,
                target_index: TARGET_INDEX_SLOT
            }
        );

        let spaces: Vec<_> = kernel
            .program
            .bindings
            .iter()
            .map(|binding| binding.space)
            .collect();
        assert_eq!(
            spaces,
            [
                IndexSpace::Edge,
                IndexSpace::Edge,
                IndexSpace::Edge,
                IndexSpace::Edge,
                IndexSpace::Target,
                IndexSpace::Source,
                IndexSpace::Target,
            ]
        );
        assert!(matches!(
            kernel.program.instrs.last(),
            Some(Instr::Accumulate { slot: RING_SLOT, .. })
        ));
    }

    #[test]
    fn connector_errors() {
        let params = test_util::get_template_model_params();

        let mut connector = params.connectors[0].clone();
        connector.target_input = "J".to_string();
        assert!(matches!(
            generate_connector_kernel(0, &connector, &params.groups, 0),
            Err(GenerationError::UndeclaredVariable { name, .. }) if name == "J"
        ));

        let mut connector = params.connectors[0].clone();
        connector.transmission = Transmission::Graded {
            expression: "pre.x".to_string(),
        };
        assert!(matches!(
            generate_connector_kernel(0, &connector, &params.groups, 0),
            Err(GenerationError::UndeclaredVariable { name, .. }) if name == "pre.x"
        ));

        let mut connector = params.connectors[0].clone();
        connector.transmission = Transmission::Event {
            threshold: 3,
            expression: "weight".to_string(),
        };
        assert!(matches!(
            generate_connector_kernel(0, &connector, &params.groups, 0),
            Err(GenerationError::InvalidModel(_))
        ));

        let mut connector = params.connectors[0].clone();
        connector.source = GroupRange::new("Missing", 0, 1);
        assert!(matches!(
            generate_connector_kernel(0, &connector, &params.groups, 0),
            Err(GenerationError::InvalidModel(_))
        ));
    }
}
