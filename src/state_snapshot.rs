use serde::{Deserialize, Serialize};

use crate::connectivity::Synapse;
use crate::types::{StepIndex, Time};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub step: StepIndex,
    pub time: Time,
    pub group_states: Vec<GroupState>,
    pub connector_states: Vec<ConnectorState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupState {
    pub name: String,
    pub variables: Vec<VariableState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableState {
    pub name: String,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorState {
    pub name: String,
    pub synapses: Vec<Synapse>,
}

impl StateSnapshot {
    pub fn variable(&self, group: &str, variable: &str) -> Option<&[f64]> {
        self.group_states
            .iter()
            .find(|group_state| group_state.name == group)?
            .variables
            .iter()
            .find(|variable_state| variable_state.name == variable)
            .map(|variable_state| variable_state.values.as_slice())
    }
}
