//! Simulation state machine and the per-step dispatch.
//!
//! Every step runs in two phases. Phase one dispatches all connector kernels,
//! which read step-n source state and accumulate into the target input rings.
//! Phase two dispatches all group kernels, which consume the current ring slot
//! and write step n+1 into the back half of every state pair. The host awaits
//! the device after each phase, then swaps the pairs, advances the rings and
//! the clock, and samples the active recordings.

use log::{debug, info, warn};
use rand::{distributions::Uniform, prelude::Distribution, rngs::StdRng, SeedableRng};
use statrs::distribution::Normal;

use crate::clock::SimulationClock;
use crate::codegen::{self, GeneratedKernel};
use crate::connectivity::{self, Synapse};
use crate::delay_ring::DelayRing;
use crate::device::{BufferId, Device, KernelArg, KernelId, Launch, Layout};
use crate::error::{DeviceError, DeviceErrorKind, GenerationError, SimError, SimResult};
use crate::expr::NumericType;
use crate::params::{
    self, ConnectorParams, GroupParams, GroupRange, InitialValue, ModelParams, Topology,
    Transmission, WeightRule,
};
use crate::program::{Access, BufferRole, SynapseField, UniformSource};
use crate::recorder::{Probe, Recorder, Recording, RecordingHandle, Selection};
use crate::state_snapshot::{ConnectorState, GroupState, StateSnapshot, VariableState};
use crate::types::{StepIndex, Time};
use crate::util;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Unconfigured,
    Generated,
    Initialized,
    Running,
    Paused,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GenerateFlags {
    /// Run `init_run` right after a successful generation.
    pub initialize: bool,
}

#[derive(Debug)]
struct GroupBuffers {
    /// Both halves of every state variable; `front` selects the current one.
    state: Vec<[BufferId; 2]>,
    inputs: Vec<DelayRing<BufferId>>,
    events: Vec<BufferId>,
}

#[derive(Debug)]
struct ConnectorBuffers {
    source_index: BufferId,
    target_index: BufferId,
    weight: BufferId,
    delay: BufferId,
}

#[derive(Debug)]
struct MaterializedConnector {
    kernel: GeneratedKernel,
    synapses: Vec<Synapse>,
    buffers: ConnectorBuffers,
}

#[derive(Debug, Default)]
struct Materialized {
    group_kernels: Vec<GeneratedKernel>,
    groups: Vec<GroupBuffers>,
    connectors: Vec<MaterializedConnector>,
}

impl Materialized {
    fn buffer_ids(&self) -> Vec<BufferId> {
        let group_buffers = self.groups.iter().flat_map(|group| {
            group
                .state
                .iter()
                .flatten()
                .copied()
                .chain(group.inputs.iter().flat_map(|ring| ring.slots().to_vec()))
                .chain(group.events.iter().copied())
        });

        group_buffers
            .chain(self.connectors.iter().flat_map(|connector| connector.buffers.ids()))
            .collect()
    }

    fn kernel_ids(&self) -> Vec<KernelId> {
        self.group_kernels
            .iter()
            .chain(self.connectors.iter().map(|connector| &connector.kernel))
            .filter_map(|kernel| kernel.kernel_id)
            .collect()
    }
}

impl ConnectorBuffers {
    fn ids(&self) -> [BufferId; 4] {
        [self.source_index, self.target_index, self.weight, self.delay]
    }
}

/// Device resources of a generation step that has not been committed yet.
struct Staging<'d, D: Device> {
    device: &'d D,
    buffers: Vec<BufferId>,
    kernels: Vec<KernelId>,
}

impl<'d, D: Device> Staging<'d, D> {
    fn new(device: &'d D) -> Self {
        Self {
            device,
            buffers: Vec::new(),
            kernels: Vec::new(),
        }
    }

    fn allocate(&mut self, element: NumericType, layout: Layout) -> Result<BufferId, DeviceError> {
        let buffer = self.device.allocate(element, layout)?;
        self.buffers.push(buffer);
        Ok(buffer)
    }

    fn compile(&mut self, kernel: &mut GeneratedKernel) -> Result<(), GenerationError> {
        let kernel_id = codegen::compile(self.device, kernel)?;
        self.kernels.push(kernel_id);
        Ok(())
    }

    fn rollback(self) {
        release_all(self.device, &self.buffers, &self.kernels);
    }
}

fn release_all<D: Device>(device: &D, buffers: &[BufferId], kernels: &[KernelId]) {
    for buffer in buffers {
        if let Err(err) = device.release(*buffer) {
            warn!("failed to release buffer {:?}: {}", buffer, err);
        }
    }

    for kernel in kernels {
        if let Err(err) = device.release_kernel(*kernel) {
            warn!("failed to release kernel {:?}: {}", kernel, err);
        }
    }
}

fn group_index_of(groups: &[GroupParams], name: &str) -> Option<usize> {
    groups.iter().position(|group| group.name == name)
}

/// Ring depth every group input needs to deliver the given synapse lists.
fn ring_depths(
    groups: &[GroupParams],
    connectors: &[ConnectorParams],
    synapses: &[Vec<Synapse>],
) -> Vec<Vec<usize>> {
    let mut depths: Vec<Vec<usize>> = groups
        .iter()
        .map(|group| vec![1; group.neuron_type.inputs.len()])
        .collect();

    for (connector, synapses) in connectors.iter().zip(synapses) {
        let target = group_index_of(groups, &connector.target.group);
        let input = target.and_then(|target| {
            groups[target]
                .neuron_type
                .input_index(&connector.target_input)
        });

        if let (Some(target), Some(input)) = (target, input) {
            let depth = &mut depths[target][input];
            *depth = (*depth).max(connectivity::required_ring_depth(synapses));
        }
    }

    depths
}

fn build_group<D: Device>(
    staging: &mut Staging<'_, D>,
    group: &GroupParams,
    ring_depths: &[usize],
) -> Result<GroupBuffers, DeviceError> {
    let layout = Layout::Instances {
        count: group.num_neurons,
    };
    let neuron_type = &group.neuron_type;

    let mut state = Vec::with_capacity(neuron_type.state_variables.len());
    for var in &neuron_type.state_variables {
        state.push([
            staging.allocate(var.numeric_type, layout.clone())?,
            staging.allocate(var.numeric_type, layout.clone())?,
        ]);
    }

    let mut inputs = Vec::with_capacity(neuron_type.inputs.len());
    for depth in ring_depths {
        let slots = (0..*depth)
            .map(|_| staging.allocate(NumericType::Double, layout.clone()))
            .collect::<Result<Vec<_>, _>>()?;
        inputs.push(DelayRing::new(slots));
    }

    let events = neuron_type
        .thresholds
        .iter()
        .map(|_| staging.allocate(NumericType::Int, layout.clone()))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(GroupBuffers {
        state,
        inputs,
        events,
    })
}

fn build_connector<D: Device>(
    staging: &mut Staging<'_, D>,
    connector_index: usize,
    connector: &ConnectorParams,
    groups: &[GroupParams],
    synapses: Vec<Synapse>,
) -> Result<MaterializedConnector, SimError> {
    let mut kernel =
        codegen::generate_connector_kernel(connector_index, connector, groups, synapses.len())?;
    staging.compile(&mut kernel)?;

    let target_count = group_index_of(groups, &connector.target.group)
        .map(|target| groups[target].num_neurons)
        .unwrap_or(0);

    let layout = Layout::Edges {
        targets: synapses.iter().map(|synapse| synapse.target_index).collect(),
        target_count,
    };

    let mut upload = |element: NumericType, field: &dyn Fn(&Synapse) -> f64| {
        let buffer = staging.allocate(element, layout.clone())?;
        let data: Vec<f64> = synapses.iter().map(field).collect();
        staging.device.upload(buffer, &data)?;
        Ok::<_, DeviceError>(buffer)
    };

    let buffers = ConnectorBuffers {
        source_index: upload(NumericType::Int, &|synapse| synapse.source_index as f64)?,
        target_index: upload(NumericType::Int, &|synapse| synapse.target_index as f64)?,
        weight: upload(NumericType::Double, &|synapse| synapse.weight)?,
        delay: upload(NumericType::Int, &|synapse| synapse.delay as f64)?,
    };

    Ok(MaterializedConnector {
        kernel,
        synapses,
        buffers,
    })
}

fn initial_values(seed: u64, group_index: usize, group: &GroupParams) -> SimResult<Vec<Vec<f64>>> {
    let mut rng = StdRng::seed_from_u64(util::calculate_hash(&(seed, "initial", group_index as u64)));
    let count = group.num_neurons;
    let mut values = Vec::with_capacity(group.neuron_type.state_variables.len());

    for var in &group.neuron_type.state_variables {
        values.push(match var.initial_value {
            InitialValue::Constant(value) => vec![value; count],
            InitialValue::Uniform { low, high } => {
                let dist = Uniform::new_inclusive(low, high);
                (0..count).map(|_| dist.sample(&mut rng)).collect()
            }
            InitialValue::Normal { mean, std_dev } => {
                let dist = Normal::new(mean, std_dev).map_err(|err| {
                    GenerationError::InvalidModel(format!(
                        "group {}, variable {}: {}",
                        group.name, var.name, err
                    ))
                })?;
                (0..count).map(|_| dist.sample(&mut rng)).collect()
            }
        });
    }

    Ok(values)
}

fn invalid_buffer(what: impl std::fmt::Display) -> DeviceError {
    DeviceError::new(DeviceErrorKind::InvalidBuffer, format!("no buffer for {}", what))
}

pub struct Scheduler<D: Device> {
    device: D,
    params: ModelParams,
    state: SchedulerState,
    clock: SimulationClock,
    materialized: Materialized,
    /// Index of the current half of every state pair.
    front: usize,
    recorder: Recorder,
}

impl<D: Device> Scheduler<D> {
    pub fn new(params: ModelParams, device: D) -> Self {
        Self {
            device,
            clock: SimulationClock::new(params.timestep_size),
            params,
            state: SchedulerState::Unconfigured,
            materialized: Materialized::default(),
            front: 0,
            recorder: Recorder::default(),
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn params(&self) -> &ModelParams {
        &self.params
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn time(&self) -> Time {
        self.clock.time()
    }

    pub fn step_index(&self) -> StepIndex {
        self.clock.step()
    }

    pub fn timestep_size(&self) -> Time {
        self.clock.timestep_size()
    }

    fn require(&self, operation: &'static str, allowed: &[SchedulerState]) -> SimResult<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(SimError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    fn group_index(&self, name: &str) -> SimResult<usize> {
        self.params
            .group_index(name)
            .ok_or_else(|| SimError::InvalidArgument(format!("unknown group '{}'", name)))
    }

    pub fn set_timestep_size(&mut self, timestep_size: Time) -> SimResult<()> {
        self.require(
            "set_timestep_size",
            &[SchedulerState::Unconfigured, SchedulerState::Generated],
        )?;

        if !(timestep_size > 0.0 && timestep_size.is_finite()) {
            return Err(SimError::InvalidArgument(
                "timestep_size must be strictly positive".to_string(),
            ));
        }

        self.params.timestep_size = timestep_size;
        self.clock = SimulationClock::new(timestep_size);
        Ok(())
    }

    pub fn add_group(&mut self, group: GroupParams) -> SimResult<()> {
        self.require("add_group", &[SchedulerState::Unconfigured])?;

        if self.params.group_index(&group.name).is_some() {
            return Err(SimError::InvalidArgument(format!(
                "duplicate group name: {}",
                group.name
            )));
        }

        params::validate_group_params(&group).map_err(GenerationError::from)?;
        self.params.groups.push(group);
        Ok(())
    }

    /// Registers a connector. After generation the connector is materialized
    /// on the spot; a failure leaves the model unchanged.
    pub fn add_connector(&mut self, connector: ConnectorParams) -> SimResult<()> {
        if self.params.connector_index(&connector.name).is_some() {
            return Err(SimError::InvalidArgument(format!(
                "duplicate connector name: {}",
                connector.name
            )));
        }

        self.install_connector(None, connector)
    }

    /// Adds one synapse from an event source of one instance to an input of
    /// another. Synapses between the same group pair, event source and input
    /// share one explicit connector.
    pub fn connect(
        &mut self,
        source: &str,
        source_index: usize,
        event_source: usize,
        target: &str,
        target_index: usize,
        target_input: &str,
    ) -> SimResult<()> {
        let name = format!("{}[{}]->{}.{}", source, event_source, target, target_input);

        let index = self.params.connector_index(&name);

        let mut connector = match index {
            Some(index) => self.params.connectors[index].clone(),
            None => {
                let group_range = |name: &str| {
                    let size = self
                        .params
                        .group_index(name)
                        .map_or(0, |index| self.params.groups[index].num_neurons);
                    GroupRange::new(name, 0, size)
                };

                ConnectorParams {
                    topology: Topology::Explicit(Vec::new()),
                    transmission: Transmission::Event {
                        threshold: event_source,
                        expression: "weight".to_string(),
                    },
                    weight: WeightRule::Constant(1.0),
                    ..ConnectorParams::defaults_for(
                        &name,
                        group_range(source),
                        group_range(target),
                        target_input,
                    )
                }
            }
        };

        if let Topology::Explicit(pairs) = &mut connector.topology {
            pairs.push((source_index, target_index));
        }

        self.install_connector(index, connector)
    }

    fn install_connector(&mut self, index: Option<usize>, connector: ConnectorParams) -> SimResult<()> {
        match self.state {
            SchedulerState::Unconfigured => {}
            SchedulerState::Generated => {
                let connector_index = index.unwrap_or(self.params.connectors.len());
                self.materialize_connector(connector_index, &connector)?;
            }
            state => {
                return Err(SimError::InvalidState {
                    operation: "add_connector",
                    state,
                })
            }
        }

        match index {
            Some(index) => self.params.connectors[index] = connector,
            None => self.params.connectors.push(connector),
        }

        Ok(())
    }

    fn materialize_connector(&mut self, connector_index: usize, connector: &ConnectorParams) -> SimResult<()> {
        let groups = &self.params.groups;
        let synapses =
            connectivity::generate_synapses(connector_index, connector, groups, self.params.seed())?;

        let mut staging = Staging::new(&self.device);

        let staged = (|| {
            let materialized =
                build_connector(&mut staging, connector_index, connector, groups, synapses)?;

            let depths = ring_depths(
                groups,
                std::slice::from_ref(connector),
                std::slice::from_ref(&materialized.synapses),
            );

            let mut growth = Vec::new();
            for (group_index, group_depths) in depths.iter().enumerate() {
                for (input, depth) in group_depths.iter().enumerate() {
                    let current = self.materialized.groups[group_index].inputs[input].depth();
                    if *depth > current {
                        let layout = Layout::Instances {
                            count: groups[group_index].num_neurons,
                        };
                        let extra = (current..*depth)
                            .map(|_| staging.allocate(NumericType::Double, layout.clone()))
                            .collect::<Result<Vec<_>, _>>()?;
                        growth.push((group_index, input, extra));
                    }
                }
            }

            Ok::<_, SimError>((materialized, growth))
        })();

        let (materialized, growth) = match staged {
            Ok(staged) => staged,
            Err(err) => {
                staging.rollback();
                return Err(err);
            }
        };

        for (group_index, input, extra) in growth {
            let ring = &mut self.materialized.groups[group_index].inputs[input];
            ring.grow(extra);
            ring.rewind();
        }

        info!(
            "materialized connector {} with {} synapses",
            connector.name,
            materialized.synapses.len()
        );

        if connector_index < self.materialized.connectors.len() {
            let replaced = std::mem::replace(&mut self.materialized.connectors[connector_index], materialized);
            release_all(
                &self.device,
                &replaced.buffers.ids(),
                &replaced.kernel.kernel_id.into_iter().collect::<Vec<_>>(),
            );
        } else {
            self.materialized.connectors.push(materialized);
        }

        Ok(())
    }

    pub fn generate(&mut self, flags: GenerateFlags) -> SimResult<()> {
        self.require("generate", &[SchedulerState::Unconfigured])?;
        self.build_all(flags)
    }

    /// Discards and rebuilds every kernel, synapse list and buffer.
    pub fn regenerate(&mut self, flags: GenerateFlags) -> SimResult<()> {
        self.require(
            "regenerate",
            &[SchedulerState::Unconfigured, SchedulerState::Generated],
        )?;
        self.build_all(flags)
    }

    fn build_all(&mut self, flags: GenerateFlags) -> SimResult<()> {
        params::validate_model_params(&self.params).map_err(GenerationError::from)?;

        let groups = &self.params.groups;
        let connectors = &self.params.connectors;
        let seed = self.params.seed();

        let synapses = connectors
            .iter()
            .enumerate()
            .map(|(index, connector)| connectivity::generate_synapses(index, connector, groups, seed))
            .collect::<Result<Vec<_>, _>>()?;

        let depths = ring_depths(groups, connectors, &synapses);

        let mut staging = Staging::new(&self.device);

        let staged = (|| {
            let mut materialized = Materialized::default();

            for (group_index, group) in groups.iter().enumerate() {
                let mut kernel = codegen::generate_group_kernel(group_index, group)?;
                staging.compile(&mut kernel)?;
                materialized.group_kernels.push(kernel);
                materialized
                    .groups
                    .push(build_group(&mut staging, group, &depths[group_index])?);
            }

            for (connector_index, (connector, synapses)) in connectors.iter().zip(synapses).enumerate() {
                materialized.connectors.push(build_connector(
                    &mut staging,
                    connector_index,
                    connector,
                    groups,
                    synapses,
                )?);
            }

            Ok::<_, SimError>(materialized)
        })();

        let materialized = match staged {
            Ok(materialized) => materialized,
            Err(err) => {
                staging.rollback();
                return Err(err);
            }
        };

        let previous = std::mem::replace(&mut self.materialized, materialized);
        release_all(&self.device, &previous.buffer_ids(), &previous.kernel_ids());

        self.front = 0;
        self.clock = SimulationClock::new(self.params.timestep_size);
        self.recorder.clear();
        self.state = SchedulerState::Generated;

        info!(
            "generated {} group kernels and {} connector kernels, {} synapses",
            self.materialized.group_kernels.len(),
            self.materialized.connectors.len(),
            self.materialized
                .connectors
                .iter()
                .map(|connector| connector.synapses.len())
                .sum::<usize>()
        );

        if flags.initialize {
            self.init_run()?;
        }

        Ok(())
    }

    /// Uploads initial state, clears inputs and events, and resets the clock.
    pub fn init_run(&mut self) -> SimResult<()> {
        self.require(
            "init_run",
            &[
                SchedulerState::Generated,
                SchedulerState::Initialized,
                SchedulerState::Paused,
            ],
        )?;

        self.front = 0;
        let seed = self.params.seed();

        for (group_index, group) in self.params.groups.iter().enumerate() {
            let buffers = &mut self.materialized.groups[group_index];
            let values = initial_values(seed, group_index, group)?;

            for (pair, values) in buffers.state.iter().zip(&values) {
                for buffer in pair {
                    self.device.upload(*buffer, values)?;
                }
            }

            for ring in &mut buffers.inputs {
                for slot in ring.slots() {
                    self.device.fill(*slot, 0.0)?;
                }
                ring.rewind();
            }

            for buffer in &buffers.events {
                self.device.fill(*buffer, 0.0)?;
            }
        }

        self.clock.reset();
        self.recorder.clear();
        self.state = SchedulerState::Initialized;

        info!("initialized run, timestep size {}", self.clock.timestep_size());

        Ok(())
    }

    /// Drops the clock and every recorded sample; kernels and synapses stay.
    pub fn reset_run(&mut self) -> SimResult<()> {
        self.require(
            "reset_run",
            &[
                SchedulerState::Generated,
                SchedulerState::Initialized,
                SchedulerState::Paused,
            ],
        )?;

        self.clock.reset();
        self.recorder.clear();
        self.state = SchedulerState::Generated;
        Ok(())
    }

    pub fn run(&mut self, num_steps: u64) -> SimResult<()> {
        self.require("run", &[SchedulerState::Initialized, SchedulerState::Paused])?;

        debug!(
            "running {} steps from step {}",
            num_steps,
            self.clock.step()
        );

        self.state = SchedulerState::Running;

        for _ in 0..num_steps {
            if let Err(source) = self.step() {
                let step = self.clock.step();
                self.state = SchedulerState::Generated;
                return Err(SimError::Device {
                    step: Some(step),
                    source,
                });
            }
        }

        self.state = SchedulerState::Paused;
        Ok(())
    }

    /// Steps until the clock reaches the first step at or after `time`.
    pub fn run_until(&mut self, time: Time) -> SimResult<()> {
        self.require(
            "run_until",
            &[SchedulerState::Initialized, SchedulerState::Paused],
        )?;

        if !time.is_finite() {
            return Err(SimError::InvalidArgument(format!(
                "run_until target time must be finite, got {}",
                time
            )));
        }

        let target = self.clock.step_at_or_after(time);
        let current = self.clock.step();

        self.run(target.saturating_sub(current))
    }

    fn step(&mut self) -> Result<(), DeviceError> {
        let time = self.clock.time();

        let mut connector_launches = Vec::new();
        for connector in &self.materialized.connectors {
            if connector.synapses.is_empty() {
                continue;
            }
            connector_launches.push(self.launch(&connector.kernel, Some(&connector.buffers), time)?);
        }

        if !connector_launches.is_empty() {
            self.device.enqueue(connector_launches)?;
            self.device.finish()?;
        }

        let group_launches = self
            .materialized
            .group_kernels
            .iter()
            .map(|kernel| self.launch(kernel, None, time))
            .collect::<Result<Vec<_>, _>>()?;

        if !group_launches.is_empty() {
            self.device.enqueue(group_launches)?;
            self.device.finish()?;
        }

        self.front = 1 - self.front;
        for group in &mut self.materialized.groups {
            for ring in &mut group.inputs {
                ring.advance();
            }
        }
        self.clock.advance();

        if self.recorder.has_active() {
            let Self {
                device,
                materialized,
                front,
                recorder,
                clock,
                ..
            } = self;

            recorder.sample(clock.step(), clock.time(), |selection| {
                let buffer = selection_buffer(materialized, *front, selection)?;
                device.read_element(buffer, selection.instance)
            })?;
        }

        Ok(())
    }

    fn launch(
        &self,
        kernel: &GeneratedKernel,
        connector: Option<&ConnectorBuffers>,
        time: Time,
    ) -> Result<Launch, DeviceError> {
        let kernel_id = kernel.kernel_id.ok_or_else(|| {
            DeviceError::new(
                DeviceErrorKind::Dispatch,
                format!("kernel {} was never compiled", kernel.name),
            )
        })?;

        let program = &kernel.program;
        let mut args = Vec::with_capacity(program.bindings.len());

        for binding in &program.bindings {
            let arg = match binding.role {
                BufferRole::State { group, var, front } => {
                    let half = if front { self.front } else { 1 - self.front };
                    let pair = self
                        .materialized
                        .groups
                        .get(group)
                        .and_then(|group| group.state.get(var))
                        .ok_or_else(|| invalid_buffer(&binding.name))?;
                    KernelArg::Single(pair[half])
                }
                BufferRole::Input { group, input } => {
                    let ring = self
                        .materialized
                        .groups
                        .get(group)
                        .and_then(|group| group.inputs.get(input))
                        .ok_or_else(|| invalid_buffer(&binding.name))?;

                    if binding.access == Access::Accumulate {
                        KernelArg::Ring(ring.from_current())
                    } else {
                        KernelArg::Single(*ring.current().ok_or_else(|| invalid_buffer(&binding.name))?)
                    }
                }
                BufferRole::Event { group, threshold } => KernelArg::Single(
                    *self
                        .materialized
                        .groups
                        .get(group)
                        .and_then(|group| group.events.get(threshold))
                        .ok_or_else(|| invalid_buffer(&binding.name))?,
                ),
                BufferRole::Synapse(field) => {
                    let buffers = connector.ok_or_else(|| invalid_buffer(&binding.name))?;
                    KernelArg::Single(match field {
                        SynapseField::SourceIndex => buffers.source_index,
                        SynapseField::TargetIndex => buffers.target_index,
                        SynapseField::Weight => buffers.weight,
                        SynapseField::Delay => buffers.delay,
                    })
                }
            };
            args.push(arg);
        }

        let uniforms = program
            .uniforms
            .iter()
            .map(|uniform| match *uniform {
                UniformSource::Time => Ok(time),
                UniformSource::TimestepSize => Ok(self.clock.timestep_size()),
                UniformSource::Constant { group, constant } => self
                    .params
                    .groups
                    .get(group)
                    .and_then(|group| group.neuron_type.constants.get(constant))
                    .map(|constant| constant.value)
                    .ok_or_else(|| {
                        DeviceError::new(
                            DeviceErrorKind::Dispatch,
                            format!("kernel {}: unknown constant", kernel.name),
                        )
                    }),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Launch {
            kernel: kernel_id,
            args,
            uniforms,
        })
    }

    fn check_instance(&self, group: usize, instance: usize) -> SimResult<()> {
        let count = self.params.groups[group].num_neurons;
        if instance >= count {
            return Err(SimError::InvalidArgument(format!(
                "instance {} out of range for group '{}' of size {}",
                instance, self.params.groups[group].name, count
            )));
        }
        Ok(())
    }

    fn variable_index(&self, group: usize, variable: &str) -> SimResult<usize> {
        self.params.groups[group]
            .neuron_type
            .state_variable_index(variable)
            .ok_or_else(|| {
                SimError::InvalidArgument(format!(
                    "group '{}' has no state variable '{}'",
                    self.params.groups[group].name, variable
                ))
            })
    }

    fn current_buffer(&self, group: usize, variable: &str) -> SimResult<BufferId> {
        let var = self.variable_index(group, variable)?;
        Ok(self.materialized.groups[group].state[var][self.front])
    }

    pub fn read_variable(&self, group: &str, variable: &str, instance: usize) -> SimResult<f64> {
        self.require(
            "read_variable",
            &[SchedulerState::Initialized, SchedulerState::Paused],
        )?;
        let group = self.group_index(group)?;
        self.check_instance(group, instance)?;
        let buffer = self.current_buffer(group, variable)?;
        Ok(self.device.read_element(buffer, instance)?)
    }

    pub fn write_variable(&mut self, group: &str, variable: &str, instance: usize, value: f64) -> SimResult<()> {
        self.require(
            "write_variable",
            &[SchedulerState::Initialized, SchedulerState::Paused],
        )?;
        let group = self.group_index(group)?;
        self.check_instance(group, instance)?;
        let buffer = self.current_buffer(group, variable)?;
        Ok(self.device.write_element(buffer, instance, value)?)
    }

    pub fn read_constant(&self, group: &str, constant: &str) -> SimResult<f64> {
        let group = self.group_index(group)?;
        let neuron_type = &self.params.groups[group].neuron_type;
        neuron_type
            .constant_index(constant)
            .map(|index| neuron_type.constants[index].value)
            .ok_or_else(|| SimError::InvalidArgument(format!("unknown constant '{}'", constant)))
    }

    /// Constants reach kernels as uniforms, so a change applies from the next step on.
    pub fn write_constant(&mut self, group: &str, constant: &str, value: f64) -> SimResult<()> {
        let group = self.group_index(group)?;
        let neuron_type = &mut self.params.groups[group].neuron_type;
        let index = neuron_type
            .constant_index(constant)
            .ok_or_else(|| SimError::InvalidArgument(format!("unknown constant '{}'", constant)))?;
        neuron_type.constants[index].value = value;
        Ok(())
    }

    pub fn record(&mut self, group: &str, instance: usize, variable: &str) -> SimResult<RecordingHandle> {
        self.require_generated("record")?;
        let group = self.group_index(group)?;
        self.check_instance(group, instance)?;
        let var = self.variable_index(group, variable)?;
        let name = format!("{}[{}].{}", self.params.groups[group].name, instance, variable);

        Ok(self.recorder.register(
            name,
            Selection {
                group,
                instance,
                probe: Probe::Variable(var),
            },
            self.clock.step(),
        ))
    }

    pub fn record_events(&mut self, group: &str, instance: usize, threshold: usize) -> SimResult<RecordingHandle> {
        self.require_generated("record_events")?;
        let group = self.group_index(group)?;
        self.check_instance(group, instance)?;

        if threshold >= self.params.groups[group].neuron_type.thresholds.len() {
            return Err(SimError::InvalidArgument(format!(
                "group '{}' has no threshold {}",
                self.params.groups[group].name, threshold
            )));
        }

        let name = format!(
            "{}[{}].event{}",
            self.params.groups[group].name, instance, threshold
        );

        Ok(self.recorder.register(
            name,
            Selection {
                group,
                instance,
                probe: Probe::Events(threshold),
            },
            self.clock.step(),
        ))
    }

    pub fn stop_recording(&mut self, handle: RecordingHandle) -> SimResult<()> {
        if self.recorder.stop(handle) {
            Ok(())
        } else {
            Err(SimError::InvalidArgument("unknown recording".to_string()))
        }
    }

    pub fn recording(&self, handle: RecordingHandle) -> Option<&Recording> {
        self.recorder.get(handle)
    }

    fn require_generated(&self, operation: &'static str) -> SimResult<()> {
        self.require(
            operation,
            &[
                SchedulerState::Generated,
                SchedulerState::Initialized,
                SchedulerState::Paused,
            ],
        )
    }

    pub fn synapses(&self, connector: &str) -> Option<&[Synapse]> {
        let index = self.params.connector_index(connector)?;
        self.materialized
            .connectors
            .get(index)
            .map(|connector| connector.synapses.as_slice())
    }

    pub fn kernel_source(&self, name: &str) -> Option<&str> {
        self.materialized
            .group_kernels
            .iter()
            .chain(self.materialized.connectors.iter().map(|connector| &connector.kernel))
            .find(|kernel| kernel.name == name)
            .map(|kernel| kernel.source.as_str())
    }

    pub fn snapshot(&self) -> SimResult<StateSnapshot> {
        self.require_generated("snapshot")?;

        let mut group_states = Vec::with_capacity(self.params.groups.len());
        for (group, buffers) in self.params.groups.iter().zip(&self.materialized.groups) {
            let variables = group
                .neuron_type
                .state_variables
                .iter()
                .zip(&buffers.state)
                .map(|(var, pair)| {
                    Ok(VariableState {
                        name: var.name.clone(),
                        values: self.device.download(pair[self.front])?,
                    })
                })
                .collect::<Result<Vec<_>, DeviceError>>()?;

            group_states.push(GroupState {
                name: group.name.clone(),
                variables,
            });
        }

        let connector_states = self
            .params
            .connectors
            .iter()
            .zip(&self.materialized.connectors)
            .map(|(connector, materialized)| ConnectorState {
                name: connector.name.clone(),
                synapses: materialized.synapses.clone(),
            })
            .collect();

        Ok(StateSnapshot {
            step: self.clock.step(),
            time: self.clock.time(),
            group_states,
            connector_states,
        })
    }
}

impl<D: Device> Drop for Scheduler<D> {
    fn drop(&mut self) {
        release_all(
            &self.device,
            &self.materialized.buffer_ids(),
            &self.materialized.kernel_ids(),
        );
    }
}

fn selection_buffer(materialized: &Materialized, front: usize, selection: &Selection) -> Result<BufferId, DeviceError> {
    let group = materialized
        .groups
        .get(selection.group)
        .ok_or_else(|| invalid_buffer("recording"))?;

    match selection.probe {
        Probe::Variable(var) => group
            .state
            .get(var)
            .map(|pair| pair[front])
            .ok_or_else(|| invalid_buffer("recording")),
        Probe::Events(threshold) => group
            .events
            .get(threshold)
            .copied()
            .ok_or_else(|| invalid_buffer("recording")),
    }
}
