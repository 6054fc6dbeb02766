use rand::distributions::{Bernoulli, Uniform};
use rand::{prelude::Distribution, rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};
use statrs::distribution::Normal;

use crate::error::TopologyError;
use crate::params::{
    ConnectorParams, DelayRule, GroupParams, GroupRange, Topology, WeightRule, MAX_DELAY,
};
use crate::util;

/// One resolved edge. Indices are relative to the start of their group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Synapse {
    pub source_group: usize,
    pub source_index: usize,
    pub target_group: usize,
    pub target_index: usize,
    pub weight: f64,
    pub delay: usize,
}

enum WeightSampler {
    Constant(f64),
    Uniform(Uniform<f64>),
    Normal(Normal),
}

impl WeightSampler {
    fn sample(&self, rng: &mut StdRng) -> f64 {
        match self {
            WeightSampler::Constant(weight) => *weight,
            WeightSampler::Uniform(dist) => dist.sample(rng),
            WeightSampler::Normal(dist) => dist.sample(rng),
        }
    }
}

enum DelaySampler {
    Constant(usize),
    Uniform(Uniform<usize>),
}

impl DelaySampler {
    fn sample(&self, rng: &mut StdRng) -> usize {
        match self {
            DelaySampler::Constant(delay) => *delay,
            DelaySampler::Uniform(dist) => dist.sample(rng),
        }
    }
}

struct Resolver<'a> {
    connector: &'a ConnectorParams,
}

impl<'a> Resolver<'a> {
    fn invalid_rule(&self, message: impl Into<String>) -> TopologyError {
        TopologyError::InvalidRule {
            connector: self.connector.name.clone(),
            message: message.into(),
        }
    }

    fn group(&self, range: &GroupRange, groups: &[GroupParams]) -> Result<usize, TopologyError> {
        let group_index = groups
            .iter()
            .position(|group| group.name == range.group)
            .ok_or_else(|| TopologyError::UnknownGroup {
                connector: self.connector.name.clone(),
                group: range.group.clone(),
            })?;

        let size = groups[group_index].num_neurons;

        if range.start >= range.end || range.end > size {
            return Err(TopologyError::InvalidRange {
                connector: self.connector.name.clone(),
                group: range.group.clone(),
                start: range.start,
                end: range.end,
                size,
            });
        }

        Ok(group_index)
    }

    fn weight_sampler(&self) -> Result<WeightSampler, TopologyError> {
        match self.connector.weight {
            WeightRule::Constant(weight) if weight.is_finite() => Ok(WeightSampler::Constant(weight)),
            WeightRule::Uniform { low, high }
                if low.is_finite() && high.is_finite() && low <= high && (high - low).is_finite() =>
            {
                Ok(WeightSampler::Uniform(Uniform::new_inclusive(low, high)))
            }
            WeightRule::Normal { mean, std_dev } if mean.is_finite() && std_dev > 0.0 => {
                Normal::new(mean, std_dev)
                    .map(WeightSampler::Normal)
                    .map_err(|err| self.invalid_rule(format!("weight: {}", err)))
            }
            ref rule => Err(self.invalid_rule(format!("invalid weight rule {:?}", rule))),
        }
    }

    fn delay_sampler(&self) -> Result<DelaySampler, TopologyError> {
        match self.connector.delay {
            DelayRule::Constant(delay) if delay <= MAX_DELAY => Ok(DelaySampler::Constant(delay)),
            DelayRule::Uniform { min, max } if min <= max && max <= MAX_DELAY => {
                Ok(DelaySampler::Uniform(Uniform::new_inclusive(min, max)))
            }
            ref rule => Err(self.invalid_rule(format!("invalid delay rule {:?}", rule))),
        }
    }
}

/// Expands a connector into its synapse list.
///
/// The random stream of a connector depends only on the model seed and the
/// connector's position, and is consumed row-major over source then target index:
/// one Bernoulli draw per candidate pair, then the weight and the delay draw of
/// each included edge. Self-pairs excluded by policy are skipped without a draw.
pub fn generate_synapses(
    connector_index: usize,
    connector: &ConnectorParams,
    groups: &[GroupParams],
    seed: u64,
) -> Result<Vec<Synapse>, TopologyError> {
    let resolver = Resolver { connector };

    let source_group = resolver.group(&connector.source, groups)?;
    let target_group = resolver.group(&connector.target, groups)?;
    let weight_sampler = resolver.weight_sampler()?;
    let delay_sampler = resolver.delay_sampler()?;

    let mut rng = StdRng::seed_from_u64(util::calculate_hash(&(seed, connector_index as u64)));

    let is_excluded = |source_index: usize, target_index: usize| {
        !connector.allow_self_connections
            && source_group == target_group
            && source_index == target_index
    };

    let mut synapses = Vec::new();

    let mut emit = |source_index: usize, target_index: usize, rng: &mut StdRng| {
        let weight = weight_sampler.sample(rng);
        let delay = delay_sampler.sample(rng);
        synapses.push(Synapse {
            source_group,
            source_index,
            target_group,
            target_index,
            weight,
            delay,
        });
    };

    let source_range = connector.source.start..connector.source.end;
    let target_range = connector.target.start..connector.target.end;

    match &connector.topology {
        Topology::Probabilistic { p } => {
            let is_connection = Bernoulli::new(*p).map_err(|_| TopologyError::InvalidProbability {
                connector: connector.name.clone(),
                p: *p,
            })?;

            for source_index in source_range {
                for target_index in target_range.clone() {
                    if is_excluded(source_index, target_index) {
                        continue;
                    }

                    if is_connection.sample(&mut rng) {
                        emit(source_index, target_index, &mut rng);
                    }
                }
            }
        }
        Topology::OneToOne => {
            if connector.source.len() != connector.target.len() {
                return Err(TopologyError::LengthMismatch {
                    connector: connector.name.clone(),
                    source_len: connector.source.len(),
                    target_len: connector.target.len(),
                });
            }

            for (source_index, target_index) in source_range.zip(target_range) {
                if !is_excluded(source_index, target_index) {
                    emit(source_index, target_index, &mut rng);
                }
            }
        }
        Topology::AllToAll => {
            for source_index in source_range {
                for target_index in target_range.clone() {
                    if !is_excluded(source_index, target_index) {
                        emit(source_index, target_index, &mut rng);
                    }
                }
            }
        }
        Topology::Explicit(pairs) => {
            for &(source_index, target_index) in pairs {
                if !connector.source.contains(source_index) || !connector.target.contains(target_index) {
                    return Err(TopologyError::IndexOutOfRange {
                        connector: connector.name.clone(),
                        source_index,
                        target_index,
                    });
                }

                if !is_excluded(source_index, target_index) {
                    emit(source_index, target_index, &mut rng);
                }
            }
        }
    }

    Ok(synapses)
}

/// Ring depth needed to deliver every synapse: one more than the largest delay.
pub fn required_ring_depth<'a>(synapses: impl IntoIterator<Item = &'a Synapse>) -> usize {
    synapses
        .into_iter()
        .map(|synapse| synapse.delay)
        .max()
        .unwrap_or(0)
        .saturating_add(1)
}
