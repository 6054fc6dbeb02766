use serde::{Deserialize, Serialize};
use simple_error::SimpleError;

use crate::expr::NumericType;
use crate::types::{HashMap, HashSet};

/// Names every kernel can see without declaring them.
pub const RESERVED_NAMES: [&str; 5] = ["t", "dt", "weight", "pre", "post"];

/// Largest synaptic delay, in steps. Every target input keeps `delay + 1` ring slots.
pub const MAX_DELAY: usize = 1 << 14;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelParams {
    pub timestep_size: f64,
    pub groups: Vec<GroupParams>,
    pub connectors: Vec<ConnectorParams>,
    pub technical_params: TechnicalParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupParams {
    pub name: String,
    pub num_neurons: usize,
    pub neuron_type: NeuronTypeParams,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NeuronTypeParams {
    pub state_variables: Vec<StateVariableParams>,
    pub constants: Vec<ConstantParams>,
    /// Synaptic input accumulators, readable in `equations`, written by connectors.
    pub inputs: Vec<String>,
    pub equations: String,
    pub thresholds: Vec<ThresholdParams>,
    #[serde(default)]
    pub integrator: Integrator,
}

/// Fixed-step scheme applied to every `x' = f` equation of a neuron type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Integrator {
    #[default]
    Euler,
    /// Euler predictor, then the trapezoidal corrector `x + dt/2 * (f(x) + f(x_pred))`.
    Heun,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateVariableParams {
    pub name: String,
    pub numeric_type: NumericType,
    pub initial_value: InitialValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstantParams {
    pub name: String,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdParams {
    pub condition: String,
    pub reset: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InitialValue {
    Constant(f64),
    Uniform { low: f64, high: f64 },
    Normal { mean: f64, std_dev: f64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRange {
    pub group: String,
    pub start: usize,
    pub end: usize,
}

impl GroupRange {
    pub fn new(group: &str, start: usize, end: usize) -> Self {
        Self {
            group: group.to_string(),
            start,
            end,
        }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, index: usize) -> bool {
        (self.start..self.end).contains(&index)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Topology {
    Probabilistic { p: f64 },
    OneToOne,
    AllToAll,
    /// Group-relative `(source_index, target_index)` pairs.
    Explicit(Vec<(usize, usize)>),
}

impl Topology {
    /// Resolves a rule name plus keyed arguments, e.g. `("RandConn", {"P": 0.05})`.
    pub fn from_rule(rule: &str, args: &HashMap<String, f64>) -> Result<Topology, SimpleError> {
        let check_unused = |allowed: &[&str]| -> Result<(), SimpleError> {
            match args.keys().find(|key| !allowed.contains(&key.as_str())) {
                Some(key) => Err(SimpleError::new(format!(
                    "unexpected argument '{}' for rule '{}'",
                    key, rule
                ))),
                None => Ok(()),
            }
        };

        match rule {
            "RandConn" | "Probabilistic" => {
                check_unused(&["P"])?;
                let p = args.get("P").copied().ok_or_else(|| {
                    SimpleError::new(format!("rule '{}' requires argument 'P'", rule))
                })?;
                Ok(Topology::Probabilistic { p })
            }
            "OneToOne" => {
                check_unused(&[])?;
                Ok(Topology::OneToOne)
            }
            "AllToAll" => {
                check_unused(&[])?;
                Ok(Topology::AllToAll)
            }
            _ => Err(SimpleError::new(format!("unknown connector rule '{}'", rule))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WeightRule {
    Constant(f64),
    Uniform { low: f64, high: f64 },
    Normal { mean: f64, std_dev: f64 },
}

/// Delays are counted in steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DelayRule {
    Constant(usize),
    Uniform { min: usize, max: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Transmission {
    /// Delivers `expression` on every step.
    Graded { expression: String },
    /// Delivers `expression` only for sources whose threshold fired on the previous step.
    Event { threshold: usize, expression: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorParams {
    pub name: String,
    pub source: GroupRange,
    pub target: GroupRange,
    pub topology: Topology,
    pub weight: WeightRule,
    pub delay: DelayRule,
    pub target_input: String,
    pub transmission: Transmission,
    pub allow_self_connections: bool,
}

impl ConnectorParams {
    pub fn defaults_for(
        name: &str,
        source: GroupRange,
        target: GroupRange,
        target_input: &str,
    ) -> Self {
        Self {
            name: name.to_string(),
            source,
            target,
            topology: Topology::AllToAll,
            weight: WeightRule::Constant(1.0),
            delay: DelayRule::Constant(1),
            target_input: target_input.to_string(),
            transmission: Transmission::Event {
                threshold: 0,
                expression: "weight".to_string(),
            },
            allow_self_connections: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TechnicalParams {
    pub seed_override: Option<u64>,
}

/// Configuration of the CPU compute device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceParams {
    pub num_threads: Option<usize>,
    pub pin_threads: bool,
    /// Programs needing more registers than this are rejected at compile time.
    pub max_registers: usize,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            timestep_size: 1.0,
            groups: Vec::new(),
            connectors: Vec::new(),
            technical_params: TechnicalParams::default(),
        }
    }
}

impl Default for TechnicalParams {
    fn default() -> Self {
        Self {
            seed_override: None,
        }
    }
}

impl Default for DeviceParams {
    fn default() -> Self {
        Self {
            num_threads: Some(1),
            pin_threads: false,
            max_registers: 256,
        }
    }
}

impl Default for InitialValue {
    fn default() -> Self {
        InitialValue::Constant(0.0)
    }
}

impl ModelParams {
    pub fn group_index(&self, name: &str) -> Option<usize> {
        self.groups.iter().position(|group| group.name == name)
    }

    pub fn connector_index(&self, name: &str) -> Option<usize> {
        self.connectors
            .iter()
            .position(|connector| connector.name == name)
    }

    pub fn seed(&self) -> u64 {
        self.technical_params.seed_override.unwrap_or(0)
    }
}

impl NeuronTypeParams {
    pub fn state_variable_index(&self, name: &str) -> Option<usize> {
        self.state_variables.iter().position(|var| var.name == name)
    }

    pub fn constant_index(&self, name: &str) -> Option<usize> {
        self.constants.iter().position(|constant| constant.name == name)
    }

    pub fn input_index(&self, name: &str) -> Option<usize> {
        self.inputs.iter().position(|input| input == name)
    }
}

/// Checks everything about a model that does not need the equation parser or
/// the connectivity generator.
pub fn validate_model_params(params: &ModelParams) -> Result<(), SimpleError> {
    if !(params.timestep_size > 0.0 && params.timestep_size.is_finite()) {
        return Err(SimpleError::new("timestep_size must be strictly positive"));
    }

    let mut seen_group_names = HashSet::default();

    for group_params in &params.groups {
        if !seen_group_names.insert(group_params.name.as_str()) {
            return Err(SimpleError::new(format!(
                "duplicate group name: {}",
                group_params.name
            )));
        }

        validate_group_params(group_params)?;
    }

    let mut seen_connector_names = HashSet::default();

    for connector_params in &params.connectors {
        if !seen_connector_names.insert(connector_params.name.as_str()) {
            return Err(SimpleError::new(format!(
                "duplicate connector name: {}",
                connector_params.name
            )));
        }
    }

    Ok(())
}

pub fn validate_group_params(group_params: &GroupParams) -> Result<(), SimpleError> {
    if group_params.name.is_empty() {
        return Err(SimpleError::new("group name must not be empty"));
    }

    if group_params.num_neurons == 0 {
        return Err(SimpleError::new(format!(
            "group {}: num_neurons must be strictly positive",
            group_params.name
        )));
    }

    let neuron_type = &group_params.neuron_type;
    let mut seen_names = HashSet::default();

    let declared_names = neuron_type
        .state_variables
        .iter()
        .map(|var| var.name.as_str())
        .chain(
            neuron_type
                .constants
                .iter()
                .map(|constant| constant.name.as_str()),
        )
        .chain(neuron_type.inputs.iter().map(String::as_str));

    for name in declared_names {
        if RESERVED_NAMES.contains(&name) {
            return Err(SimpleError::new(format!(
                "group {}: '{}' is a reserved name",
                group_params.name, name
            )));
        }

        if !seen_names.insert(name) {
            return Err(SimpleError::new(format!(
                "group {}: '{}' is declared more than once",
                group_params.name, name
            )));
        }
    }

    for var in &neuron_type.state_variables {
        validate_initial_value(&var.initial_value).map_err(|err| {
            SimpleError::new(format!(
                "group {}, variable {}: {}",
                group_params.name,
                var.name,
                err.as_str()
            ))
        })?;
    }

    Ok(())
}

fn validate_initial_value(initial_value: &InitialValue) -> Result<(), SimpleError> {
    match *initial_value {
        InitialValue::Constant(value) => {
            if !value.is_finite() {
                return Err(SimpleError::new("initial value must be finite"));
            }
        }
        InitialValue::Uniform { low, high } => {
            let finite_span = low.is_finite() && high.is_finite() && (high - low).is_finite();
            if !(finite_span && low <= high) {
                return Err(SimpleError::new(
                    "uniform initial value requires finite bounds with low <= high",
                ));
            }
        }
        InitialValue::Normal { mean, std_dev } => {
            if !(mean.is_finite() && std_dev.is_finite() && std_dev > 0.0) {
                return Err(SimpleError::new(
                    "normal initial value requires a finite mean and a strictly positive std_dev",
                ));
            }
        }
    }

    Ok(())
}

pub fn validate_device_params(device_params: &DeviceParams) -> Result<(), SimpleError> {
    if device_params.num_threads == Some(0) {
        return Err(SimpleError::new("num_threads must be strictly positive"));
    }

    if device_params.max_registers == 0 {
        return Err(SimpleError::new("max_registers must be strictly positive"));
    }

    Ok(())
}
