use std::time::Instant;

use celeme::device::CpuDevice;
use celeme::params::DeviceParams;
use celeme::{GenerateFlags, Model};

#[path = "../scenario_params.rs"]
mod scenario_params;

fn main() {
    let device = CpuDevice::init(DeviceParams {
        num_threads: None,
        pin_threads: true,
        ..DeviceParams::default()
    })
    .unwrap();

    let mut model = Model::from_params(scenario_params::get_scenario_params(), device);
    model.generate(GenerateFlags { initialize: true }).unwrap();

    let num_synapses: usize = model
        .params()
        .connectors
        .iter()
        .map(|connector| model.synapses(&connector.name).unwrap().len())
        .sum();

    let t_stop = 5000.0;

    let wall_start = Instant::now();
    model.run_until(t_stop).unwrap();
    let wall_time = wall_start.elapsed();

    let num_steps = model.step_index();

    let synapse_update_throughput =
        (num_synapses as f64 * num_steps as f64) / wall_time.as_secs_f64();

    eprintln!("Steps: {}", num_steps);
    eprintln!("Wall time: {:.3} s", wall_time.as_secs_f64());
    eprintln!("Steps per second: {:.1}", num_steps as f64 / wall_time.as_secs_f64());
    eprintln!(
        "Synapse update throughput: {:.3e} ({:.3} ns per synapse update)",
        synapse_update_throughput,
        1e9 / synapse_update_throughput
    );
}
