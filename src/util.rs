use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::ops::Range;

pub fn get_partition_range(
    num_partitions: usize,
    partition_id: usize,
    num_elements: usize,
) -> Range<usize> {
    let min_partition_size = num_elements / num_partitions;
    let remainder = num_elements % num_partitions;

    if partition_id < remainder {
        let partition_size = min_partition_size + 1;
        let start = partition_size * partition_id;
        let end = start + partition_size;
        Range { start, end }
    } else {
        let start = (min_partition_size + 1) * remainder
            + min_partition_size * (partition_id - remainder);
        let end = start + min_partition_size;
        Range { start, end }
    }
}

/// Derives a stream seed from the model seed and a stream key.
///
/// Keys hold fixed-width integers only, so seeds agree across targets. They are
/// stable for one toolchain; `DefaultHasher` may change between Rust releases.
pub fn calculate_hash<T: Hash>(t: &T) -> u64 {
    let mut s = DefaultHasher::new();
    t.hash(&mut s);
    s.finish()
}

#[cfg(test)]
pub mod test_util {
    use float_cmp::{assert_approx_eq, ApproxEq};
    use std::fmt::Debug;

    use crate::expr::NumericType;
    use crate::params::{
        ConnectorParams, ConstantParams, DelayRule, GroupParams, GroupRange, InitialValue, Integrator,
        ModelParams, NeuronTypeParams, StateVariableParams, TechnicalParams, ThresholdParams,
        Topology, WeightRule,
    };

    pub fn assert_approx_eq_slice<T>(left: &[T], right: &[T])
    where
        T: ApproxEq + Debug + Copy,
    {
        assert_eq!(left.len(), right.len());

        for item in left.iter().zip(right) {
            assert_approx_eq!(T, *item.0, *item.1);
        }
    }

    pub fn izhikevich_neuron_type() -> NeuronTypeParams {
        let constant = |name: &str, value| ConstantParams {
            name: name.to_string(),
            value,
        };

        NeuronTypeParams {
            state_variables: vec![
                StateVariableParams {
                    name: "V".to_string(),
                    numeric_type: NumericType::Double,
                    initial_value: InitialValue::Constant(-65.0),
                },
                StateVariableParams {
                    name: "u".to_string(),
                    numeric_type: NumericType::Double,
                    initial_value: InitialValue::Constant(-13.0),
                },
            ],
            constants: vec![
                constant("a", 0.02),
                constant("b", 0.2),
                constant("c", -65.0),
                constant("d", 8.0),
                constant("I_ext", 10.0),
            ],
            inputs: vec!["I".to_string()],
            equations: "V' = 0.04 * V * V + 5 * V + 140 - u + I + I_ext\nu' = a * (b * V - u)"
                .to_string(),
            thresholds: vec![ThresholdParams {
                condition: "V >= 30".to_string(),
                reset: "V = c; u = u + d".to_string(),
            }],
            integrator: Integrator::Euler,
        }
    }

    pub fn get_template_model_params() -> ModelParams {
        let mut connector = ConnectorParams::defaults_for(
            "RandConn",
            GroupRange::new("Regular", 0, 10),
            GroupRange::new("Regular", 0, 10),
            "I",
        );
        connector.topology = Topology::Probabilistic { p: 0.05 };
        connector.weight = WeightRule::Uniform {
            low: 0.0,
            high: 5.0,
        };
        connector.delay = DelayRule::Uniform { min: 1, max: 3 };

        ModelParams {
            timestep_size: 0.5,
            groups: vec![GroupParams {
                name: "Regular".to_string(),
                num_neurons: 10,
                neuron_type: izhikevich_neuron_type(),
            }],
            connectors: vec![connector],
            technical_params: TechnicalParams {
                seed_override: Some(0),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_range() {
        assert_eq!(get_partition_range(1, 0, 11), Range { start: 0, end: 11 });

        assert_eq!(get_partition_range(2, 0, 11), Range { start: 0, end: 6 });
        assert_eq!(get_partition_range(2, 1, 11), Range { start: 6, end: 11 });

        assert_eq!(get_partition_range(3, 0, 11), Range { start: 0, end: 4 });
        assert_eq!(get_partition_range(3, 1, 11), Range { start: 4, end: 8 });
        assert_eq!(get_partition_range(3, 2, 11), Range { start: 8, end: 11 });

        for i in 0..11 {
            assert_eq!(
                get_partition_range(11, i, 11),
                Range {
                    start: i,
                    end: i + 1
                }
            );
        }

        assert_eq!(get_partition_range(4, 0, 13), Range { start: 0, end: 4 });
        assert_eq!(get_partition_range(4, 1, 13), Range { start: 4, end: 7 });
        assert_eq!(get_partition_range(4, 2, 13), Range { start: 7, end: 10 });
        assert_eq!(get_partition_range(4, 3, 13), Range { start: 10, end: 13 });
    }

    #[test]
    fn more_partitions_than_elements() {
        assert_eq!(get_partition_range(4, 0, 2), Range { start: 0, end: 1 });
        assert_eq!(get_partition_range(4, 1, 2), Range { start: 1, end: 2 });
        assert_eq!(get_partition_range(4, 2, 2), Range { start: 2, end: 2 });
        assert_eq!(get_partition_range(4, 3, 2), Range { start: 2, end: 2 });
    }

    #[test]
    fn hash_is_stable_per_key() {
        assert_eq!(calculate_hash(&(7u64, 3u64)), calculate_hash(&(7u64, 3u64)));
        assert_ne!(calculate_hash(&(7u64, 3u64)), calculate_hash(&(7u64, 4u64)));
    }
}
