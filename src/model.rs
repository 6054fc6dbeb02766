//! User-facing model: registration, generation, runs and recordings by name.

use crate::connectivity::Synapse;
use crate::device::{CpuDevice, Device};
use crate::error::{SimError, SimResult, TopologyError};
use crate::params::{ConnectorParams, GroupParams, GroupRange, ModelParams, Topology, Transmission};
use crate::recorder::{Recording, RecordingHandle};
use crate::scheduler::{GenerateFlags, Scheduler, SchedulerState};
use crate::state_snapshot::StateSnapshot;
use crate::types::{HashMap, StepIndex, Time};

pub struct Model<D: Device = CpuDevice> {
    scheduler: Scheduler<D>,
}

/// Per-instance access to one group of a model.
pub struct GroupHandle<'m, D: Device> {
    scheduler: &'m mut Scheduler<D>,
    name: String,
    count: usize,
}

impl<D: Device> Model<D> {
    pub fn new(device: D) -> Self {
        Self::from_params(ModelParams::default(), device)
    }

    pub fn from_params(params: ModelParams, device: D) -> Self {
        Self {
            scheduler: Scheduler::new(params, device),
        }
    }

    pub fn params(&self) -> &ModelParams {
        self.scheduler.params()
    }

    pub fn state(&self) -> SchedulerState {
        self.scheduler.state()
    }

    pub fn add_group(&mut self, group: GroupParams) -> SimResult<()> {
        self.scheduler.add_group(group)
    }

    pub fn add_connector(&mut self, connector: ConnectorParams) -> SimResult<()> {
        self.scheduler.add_connector(connector)
    }

    /// Adds a connector from a rule name and its keyed arguments, e.g.
    /// `("RandConn", {"P": 0.05})`. Returns the name given to the connector.
    pub fn apply_connector(
        &mut self,
        rule: &str,
        source: GroupRange,
        event_source: usize,
        target: GroupRange,
        target_input: &str,
        args: &HashMap<String, f64>,
    ) -> SimResult<String> {
        let existing = |name: &str| self.scheduler.params().connector_index(name).is_some();

        let name = (0..)
            .map(|k| match k {
                0 => rule.to_string(),
                k => format!("{}_{}", rule, k),
            })
            .find(|name| !existing(name))
            .unwrap_or_else(|| rule.to_string());

        let topology = Topology::from_rule(rule, args).map_err(|err| TopologyError::InvalidRule {
            connector: name.clone(),
            message: err.as_str().to_string(),
        })?;

        let mut connector = ConnectorParams::defaults_for(&name, source, target, target_input);
        connector.topology = topology;
        connector.transmission = Transmission::Event {
            threshold: event_source,
            expression: "weight".to_string(),
        };

        self.scheduler.add_connector(connector)?;
        Ok(name)
    }

    /// Adds one synapse from `source[source_index]` to `target[target_index]`.
    pub fn connect(
        &mut self,
        source: &str,
        source_index: usize,
        event_source: usize,
        target: &str,
        target_index: usize,
        target_input: &str,
    ) -> SimResult<()> {
        self.scheduler.connect(
            source,
            source_index,
            event_source,
            target,
            target_index,
            target_input,
        )
    }

    pub fn generate(&mut self, flags: GenerateFlags) -> SimResult<()> {
        self.scheduler.generate(flags)
    }

    pub fn regenerate(&mut self, flags: GenerateFlags) -> SimResult<()> {
        self.scheduler.regenerate(flags)
    }

    pub fn init_run(&mut self) -> SimResult<()> {
        self.scheduler.init_run()
    }

    pub fn reset_run(&mut self) -> SimResult<()> {
        self.scheduler.reset_run()
    }

    pub fn run(&mut self, num_steps: u64) -> SimResult<()> {
        self.scheduler.run(num_steps)
    }

    pub fn run_until(&mut self, time: Time) -> SimResult<()> {
        self.scheduler.run_until(time)
    }

    pub fn record(&mut self, group: &str, instance: usize, variable: &str) -> SimResult<RecordingHandle> {
        self.scheduler.record(group, instance, variable)
    }

    pub fn record_events(&mut self, group: &str, instance: usize, threshold: usize) -> SimResult<RecordingHandle> {
        self.scheduler.record_events(group, instance, threshold)
    }

    pub fn stop_recording(&mut self, handle: RecordingHandle) -> SimResult<()> {
        self.scheduler.stop_recording(handle)
    }

    pub fn recording(&self, handle: RecordingHandle) -> Option<&Recording> {
        self.scheduler.recording(handle)
    }

    pub fn group(&mut self, name: &str) -> SimResult<GroupHandle<'_, D>> {
        let count = self
            .scheduler
            .params()
            .group_index(name)
            .map(|index| self.scheduler.params().groups[index].num_neurons)
            .ok_or_else(|| SimError::InvalidArgument(format!("unknown group '{}'", name)))?;

        Ok(GroupHandle {
            scheduler: &mut self.scheduler,
            name: name.to_string(),
            count,
        })
    }

    pub fn synapses(&self, connector: &str) -> Option<&[Synapse]> {
        self.scheduler.synapses(connector)
    }

    pub fn kernel_source(&self, kernel: &str) -> Option<&str> {
        self.scheduler.kernel_source(kernel)
    }

    pub fn snapshot(&self) -> SimResult<StateSnapshot> {
        self.scheduler.snapshot()
    }

    pub fn time(&self) -> Time {
        self.scheduler.time()
    }

    pub fn step_index(&self) -> StepIndex {
        self.scheduler.step_index()
    }

    pub fn timestep_size(&self) -> Time {
        self.scheduler.timestep_size()
    }

    pub fn set_timestep_size(&mut self, timestep_size: Time) -> SimResult<()> {
        self.scheduler.set_timestep_size(timestep_size)
    }
}

impl<'m, D: Device> GroupHandle<'m, D> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn get(&self, variable: &str, instance: usize) -> SimResult<f64> {
        self.scheduler.read_variable(&self.name, variable, instance)
    }

    pub fn set(&mut self, variable: &str, instance: usize, value: f64) -> SimResult<()> {
        self.scheduler
            .write_variable(&self.name, variable, instance, value)
    }

    pub fn get_constant(&self, constant: &str) -> SimResult<f64> {
        self.scheduler.read_constant(&self.name, constant)
    }

    pub fn set_constant(&mut self, constant: &str, value: f64) -> SimResult<()> {
        self.scheduler.write_constant(&self.name, constant, value)
    }
}
