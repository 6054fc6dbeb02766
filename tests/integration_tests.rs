use celeme::{
    device::CpuDevice,
    error::{GenerationError, SimError, TopologyError},
    expr::NumericType,
    params::{
        ConnectorParams, ConstantParams, DelayRule, DeviceParams, GroupParams, GroupRange,
        InitialValue, Integrator, ModelParams, NeuronTypeParams, StateVariableParams, TechnicalParams,
        ThresholdParams, Topology, WeightRule,
    },
    GenerateFlags, Model, SchedulerState,
};
use float_cmp::assert_approx_eq;
use itertools::{assert_equal, Itertools};

fn device(num_threads: usize) -> CpuDevice {
    CpuDevice::init(DeviceParams {
        num_threads: Some(num_threads),
        ..DeviceParams::default()
    })
    .unwrap()
}

fn izhikevich_group(name: &str, num_neurons: usize) -> GroupParams {
    let constant = |name: &str, value| ConstantParams {
        name: name.to_string(),
        value,
    };

    GroupParams {
        name: name.to_string(),
        num_neurons,
        neuron_type: NeuronTypeParams {
            state_variables: vec![
                StateVariableParams {
                    name: "V".to_string(),
                    numeric_type: NumericType::Double,
                    initial_value: InitialValue::Uniform {
                        low: -70.0,
                        high: -50.0,
                    },
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
        },
    }
}

fn regular_connector(name: &str, topology: Topology) -> ConnectorParams {
    let mut connector = ConnectorParams::defaults_for(
        name,
        GroupRange::new("Regular", 0, 10),
        GroupRange::new("Regular", 0, 10),
        "I",
    );
    connector.topology = topology;
    connector.weight = WeightRule::Uniform {
        low: 0.0,
        high: 5.0,
    };
    connector.delay = DelayRule::Uniform { min: 1, max: 3 };
    connector.allow_self_connections = false;
    connector
}

fn make_params(timestep_size: f64, topology: Topology) -> ModelParams {
    ModelParams {
        timestep_size,
        groups: vec![izhikevich_group("Regular", 10)],
        connectors: vec![regular_connector("RandConn", topology)],
        technical_params: TechnicalParams {
            seed_override: Some(0),
        },
    }
}

fn make_model(timestep_size: f64, topology: Topology) -> Model {
    let mut model = Model::from_params(make_params(timestep_size, topology), device(1));
    model.generate(GenerateFlags { initialize: true }).unwrap();
    model
}

#[test]
fn empty_model() {
    let mut model = Model::new(device(1));
    model.generate(GenerateFlags { initialize: true }).unwrap();
    model.run(3).unwrap();
    assert_eq!(model.step_index(), 3);

    let snapshot = model.snapshot().unwrap();
    assert!(snapshot.group_states.is_empty());
    assert!(snapshot.connector_states.is_empty());
}

#[test]
fn zero_probability_yields_no_synapses() {
    let mut model = make_model(0.5, Topology::Probabilistic { p: 0.0 });
    assert!(model.synapses("RandConn").unwrap().is_empty());
    model.run(10).unwrap();
    assert_eq!(model.state(), SchedulerState::Paused);
}

#[test]
fn full_probability_without_self_connections() {
    let model = make_model(0.5, Topology::Probabilistic { p: 1.0 });
    let synapses = model.synapses("RandConn").unwrap();

    assert_eq!(synapses.len(), 90);
    assert!(synapses
        .iter()
        .all(|synapse| synapse.source_index != synapse.target_index));
    assert_eq!(
        synapses
            .iter()
            .map(|synapse| (synapse.source_index, synapse.target_index))
            .unique()
            .count(),
        90
    );
    assert!(synapses
        .iter()
        .all(|synapse| (0.0..=5.0).contains(&synapse.weight) && (1..=3).contains(&synapse.delay)));
}

#[test]
fn one_to_one() {
    let mut params = make_params(0.5, Topology::OneToOne);
    params.connectors[0].allow_self_connections = true;
    let mut model = Model::from_params(params, device(1));
    model.generate(GenerateFlags::default()).unwrap();

    assert_equal(
        model
            .synapses("RandConn")
            .unwrap()
            .iter()
            .map(|synapse| (synapse.source_index, synapse.target_index)),
        (0..10).map(|index| (index, index)),
    );
}

#[test]
fn synapses_and_trajectories_are_deterministic() {
    let run = || {
        let mut model = make_model(0.5, Topology::Probabilistic { p: 0.3 });
        let handle = model.record("Regular", 4, "V").unwrap();
        model.run(200).unwrap();
        (
            model.snapshot().unwrap(),
            model.recording(handle).unwrap().series.clone(),
        )
    };

    let (first_snapshot, first_series) = run();
    let (second_snapshot, second_series) = run();

    assert!(!first_snapshot.connector_states[0].synapses.is_empty());
    assert_eq!(first_snapshot, second_snapshot);
    assert_eq!(first_series, second_series);
}

#[test]
fn seed_changes_synapses() {
    let synapses_for = |seed| {
        let mut params = make_params(0.5, Topology::Probabilistic { p: 0.3 });
        params.technical_params.seed_override = Some(seed);
        let mut model = Model::from_params(params, device(1));
        model.generate(GenerateFlags::default()).unwrap();
        model.synapses("RandConn").unwrap().to_vec()
    };

    assert_eq!(synapses_for(3), synapses_for(3));
    assert_ne!(synapses_for(3), synapses_for(4));
}

#[test]
fn reset_run_is_idempotent() {
    let mut model = make_model(0.5, Topology::Probabilistic { p: 0.3 });
    model.run(100).unwrap();
    let first = model.snapshot().unwrap();

    model.reset_run().unwrap();
    assert_eq!(model.state(), SchedulerState::Generated);
    model.init_run().unwrap();
    model.run(100).unwrap();
    let second = model.snapshot().unwrap();

    model.reset_run().unwrap();
    model.reset_run().unwrap();
    model.init_run().unwrap();
    model.run(100).unwrap();
    let third = model.snapshot().unwrap();

    assert_eq!(first, second);
    assert_eq!(second, third);
}

#[test]
fn clock_is_monotonic() {
    let mut model = make_model(0.5, Topology::Probabilistic { p: 0.05 });
    let mut last_time = model.time();
    assert_eq!(last_time, 0.0);

    for _ in 0..20 {
        model.run(1).unwrap();
        assert!(model.time() > last_time);
        last_time = model.time();
    }

    assert_eq!(model.step_index(), 20);
    assert_approx_eq!(f64, model.time(), 10.0);
}

#[test]
fn run_until_reaches_first_step_at_or_after() {
    let mut model = make_model(0.5, Topology::Probabilistic { p: 0.05 });

    model.run_until(10.2).unwrap();
    assert_eq!(model.step_index(), 21);
    assert_approx_eq!(f64, model.time(), 10.5);

    model.run_until(12.0).unwrap();
    assert_eq!(model.step_index(), 24);

    // already past
    model.run_until(5.0).unwrap();
    assert_eq!(model.step_index(), 24);
    assert_eq!(model.state(), SchedulerState::Paused);
}

#[test]
fn recording_covers_every_executed_step() {
    let mut model = make_model(1.0, Topology::Probabilistic { p: 0.05 });
    let handle = model.record("Regular", 1, "V").unwrap();

    model.run_until(1000.0).unwrap();
    let last_value = model.group("Regular").unwrap().get("V", 1).unwrap();

    let recording = model.recording(handle).unwrap();
    assert_eq!(recording.name, "Regular[1].V");
    assert_eq!(model.step_index(), 1000);
    assert_eq!(recording.series.len(), 1000);
    assert!(recording.times().tuple_windows().all(|(a, b)| a < b));
    assert_approx_eq!(f64, recording.times().last().unwrap(), 1000.0);
    assert!(recording.values().all(f64::is_finite));
    assert_eq!(recording.values().last().unwrap(), last_value);
}

#[test]
fn stopped_recording_stays_frozen() {
    let mut model = make_model(0.5, Topology::Probabilistic { p: 0.05 });
    let handle = model.record("Regular", 0, "u").unwrap();
    model.run(5).unwrap();
    model.stop_recording(handle).unwrap();
    model.run(5).unwrap();

    assert_eq!(model.recording(handle).unwrap().series.len(), 5);
    assert!(!model.recording(handle).unwrap().active);
}

#[test]
fn results_do_not_depend_on_worker_count() {
    let run = |num_threads| {
        let mut model = Model::from_params(
            make_params(0.5, Topology::Probabilistic { p: 0.4 }),
            device(num_threads),
        );
        model.generate(GenerateFlags { initialize: true }).unwrap();
        let handles = (0..10)
            .map(|instance| model.record_events("Regular", instance, 0).unwrap())
            .collect_vec();
        model.run(300).unwrap();

        let events = handles
            .into_iter()
            .map(|handle| model.recording(handle).unwrap().series.clone())
            .collect_vec();
        (model.snapshot().unwrap(), events)
    };

    let (single_snapshot, single_events) = run(1);
    let (multi_snapshot, multi_events) = run(3);

    assert!(single_events.iter().any(|series| !series.is_empty()));
    assert_eq!(single_snapshot, multi_snapshot);
    assert_eq!(single_events, multi_events);
}

#[test]
fn storage_follows_numeric_type() {
    let variable = |name: &str, numeric_type| StateVariableParams {
        name: name.to_string(),
        numeric_type,
        initial_value: InitialValue::Constant(0.0),
    };

    let group = GroupParams {
        name: "Typed".to_string(),
        num_neurons: 2,
        neuron_type: NeuronTypeParams {
            state_variables: vec![
                variable("n", NumericType::Int),
                variable("x", NumericType::Float),
                variable("y", NumericType::Double),
            ],
            equations: "n = n + 1; x = x + 0.1; y = y + 0.1".to_string(),
            ..NeuronTypeParams::default()
        },
    };

    let mut model = Model::new(device(1));
    model.add_group(group).unwrap();
    model.generate(GenerateFlags { initialize: true }).unwrap();
    model.run(1).unwrap();

    let mut typed = model.group("Typed").unwrap();
    assert_eq!(typed.get("n", 0).unwrap(), 1.0);
    assert_eq!(typed.get("x", 0).unwrap(), 0.1f32 as f64);
    assert_eq!(typed.get("y", 0).unwrap(), 0.1);

    typed.set("n", 1, 2.7).unwrap();
    assert_eq!(typed.get("n", 1).unwrap(), 2.0);
}

#[test]
fn kernel_source_is_deterministic() {
    let first = make_model(0.5, Topology::Probabilistic { p: 0.05 });
    let second = make_model(0.5, Topology::Probabilistic { p: 0.05 });

    for kernel in ["group_update_Regular", "connector_update_RandConn"] {
        let source = first.kernel_source(kernel).unwrap();
        assert!(!source.is_empty());
        assert_eq!(source, second.kernel_source(kernel).unwrap());
    }

    assert!(first.kernel_source("group_update_Fast").is_none());
}

#[test]
fn undeclared_variable_is_rejected() {
    let mut params = make_params(0.5, Topology::OneToOne);
    params.groups[0].neuron_type.equations = "V' = -V + W".to_string();
    let mut model = Model::from_params(params, device(1));

    assert!(matches!(
        model.generate(GenerateFlags::default()),
        Err(SimError::Generation(GenerationError::UndeclaredVariable { name, .. })) if name == "W"
    ));
    assert_eq!(model.state(), SchedulerState::Unconfigured);
}

#[test]
fn type_mismatch_is_rejected() {
    let mut params = make_params(0.5, Topology::OneToOne);
    params.groups[0].neuron_type.state_variables[1].numeric_type = NumericType::Int;
    let mut model = Model::from_params(params, device(1));

    assert!(matches!(
        model.generate(GenerateFlags::default()),
        Err(SimError::Generation(GenerationError::TypeMismatch { .. }))
    ));
}

#[test]
fn device_compile_error_is_reported() {
    let device = CpuDevice::init(DeviceParams {
        max_registers: 2,
        ..DeviceParams::default()
    })
    .unwrap();
    let mut model = Model::from_params(make_params(0.5, Topology::OneToOne), device);

    assert!(matches!(
        model.generate(GenerateFlags::default()),
        Err(SimError::Generation(GenerationError::Compile { kernel, .. })) if kernel == "group_update_Regular"
    ));
}

#[test]
fn failed_generation_keeps_nothing() {
    let mut params = make_params(0.5, Topology::Probabilistic { p: 0.5 });
    params.connectors.push(regular_connector("Broken", Topology::OneToOne));
    params.connectors[1].target = GroupRange::new("Regular", 0, 5);
    let mut model = Model::from_params(params, device(1));

    assert!(matches!(
        model.generate(GenerateFlags::default()),
        Err(SimError::Topology(TopologyError::LengthMismatch { .. }))
    ));
    assert_eq!(model.state(), SchedulerState::Unconfigured);
    assert!(model.synapses("RandConn").is_none());
    assert!(model.kernel_source("group_update_Regular").is_none());
}

#[test]
fn explicit_connection_delivers_events() {
    let mut model = Model::new(device(1));
    model.add_group(izhikevich_group("Regular", 2)).unwrap();
    model.connect("Regular", 0, 0, "Regular", 1, "I").unwrap();
    model.connect("Regular", 1, 0, "Regular", 0, "I").unwrap();
    model.generate(GenerateFlags { initialize: true }).unwrap();

    assert_equal(
        model
            .synapses("Regular[0]->Regular.I")
            .unwrap()
            .iter()
            .map(|synapse| (synapse.source_index, synapse.target_index, synapse.weight, synapse.delay)),
        [(0, 1, 1.0, 1), (1, 0, 1.0, 1)],
    );

    let handle = model.record_events("Regular", 0, 0).unwrap();
    model.run(200).unwrap();
    assert!(!model.recording(handle).unwrap().series.is_empty());
}

#[test]
fn operations_respect_lifecycle() {
    let mut model = Model::from_params(make_params(0.5, Topology::OneToOne), device(1));

    assert!(matches!(
        model.run(1),
        Err(SimError::InvalidState {
            state: SchedulerState::Unconfigured,
            ..
        })
    ));
    assert!(model.snapshot().is_err());

    model.generate(GenerateFlags::default()).unwrap();
    assert!(matches!(
        model.add_group(izhikevich_group("Fast", 2)),
        Err(SimError::InvalidState { .. })
    ));
    assert!(model.group("Regular").unwrap().get("V", 0).is_err());

    model.init_run().unwrap();
    assert!(model.set_timestep_size(0.1).is_err());
    model.reset_run().unwrap();
    model.set_timestep_size(0.25).unwrap();
    model.init_run().unwrap();
    model.run(4).unwrap();
    assert_approx_eq!(f64, model.time(), 1.0);
}

fn decay_model(integrator: Integrator) -> Model {
    let group = GroupParams {
        name: "Decay".to_string(),
        num_neurons: 1,
        neuron_type: NeuronTypeParams {
            state_variables: vec![StateVariableParams {
                name: "x".to_string(),
                numeric_type: NumericType::Double,
                initial_value: InitialValue::Constant(1.0),
            }],
            equations: "x' = -x".to_string(),
            integrator,
            ..NeuronTypeParams::default()
        },
    };

    let mut model = Model::new(device(1));
    model.set_timestep_size(0.1).unwrap();
    model.add_group(group).unwrap();
    model.generate(GenerateFlags { initialize: true }).unwrap();
    model
}

#[test]
fn heun_integrates_exponential_decay() {
    let mut heun = decay_model(Integrator::Heun);
    let mut euler = decay_model(Integrator::Euler);
    heun.run(10).unwrap();
    euler.run(10).unwrap();

    let heun_x = heun.group("Decay").unwrap().get("x", 0).unwrap();
    let euler_x = euler.group("Decay").unwrap().get("x", 0).unwrap();

    assert_approx_eq!(f64, heun_x, 0.905f64.powi(10), epsilon = 1e-12);
    assert_approx_eq!(f64, euler_x, 0.9f64.powi(10), epsilon = 1e-12);

    let exact = (-1.0f64).exp();
    assert!((heun_x - exact).abs() < 1e-3);
    assert!((heun_x - exact).abs() < (euler_x - exact).abs());
}

#[test]
fn overflowing_uniform_bounds_are_rejected() {
    let mut params = make_params(0.5, Topology::OneToOne);
    params.connectors[0].weight = WeightRule::Uniform {
        low: -f64::MAX,
        high: f64::MAX,
    };
    let mut model = Model::from_params(params, device(1));
    assert!(matches!(
        model.generate(GenerateFlags::default()),
        Err(SimError::Topology(TopologyError::InvalidRule { .. }))
    ));

    let mut params = make_params(0.5, Topology::OneToOne);
    params.groups[0].neuron_type.state_variables[0].initial_value = InitialValue::Uniform {
        low: -f64::MAX,
        high: f64::MAX,
    };
    let mut model = Model::from_params(params, device(1));
    assert!(matches!(
        model.generate(GenerateFlags { initialize: true }),
        Err(SimError::Generation(GenerationError::InvalidModel(_)))
    ));
    assert_eq!(model.state(), SchedulerState::Unconfigured);
}

#[test]
fn huge_delay_is_rejected() {
    let mut params = make_params(0.5, Topology::AllToAll);
    params.connectors[0].delay = DelayRule::Constant(usize::MAX);
    let mut model = Model::from_params(params, device(1));

    assert!(matches!(
        model.generate(GenerateFlags::default()),
        Err(SimError::Topology(TopologyError::InvalidRule { .. }))
    ));
    assert_eq!(model.state(), SchedulerState::Unconfigured);
}

#[test]
fn run_until_rejects_non_finite_time() {
    let mut model = make_model(0.5, Topology::OneToOne);

    for time in [f64::INFINITY, f64::NAN] {
        assert!(matches!(
            model.run_until(time),
            Err(SimError::InvalidArgument(_))
        ));
    }
    assert_eq!(model.step_index(), 0);
    assert_eq!(model.state(), SchedulerState::Initialized);
}
