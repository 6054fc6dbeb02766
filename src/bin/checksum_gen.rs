use celeme::device::CpuDevice;
use celeme::params::DeviceParams;
use celeme::{GenerateFlags, Model};
use serde_json::json;

#[path = "../scenario_params.rs"]
mod scenario_params;

fn main() {
    let device = CpuDevice::init(DeviceParams::default()).unwrap();
    let mut model = Model::from_params(scenario_params::get_scenario_params(), device);
    model.generate(GenerateFlags { initialize: true }).unwrap();

    let voltage_recording = model.record("Regular", 1, "V").unwrap();
    let event_recordings: Vec<_> = (0..200)
        .map(|instance| model.record_events("Fast", instance, 0).unwrap())
        .collect();

    model.run(1000).unwrap();

    let voltage_trace_checksum: f64 = model
        .recording(voltage_recording)
        .unwrap()
        .values()
        .sum();

    let mut event_checksum = 0.0;
    for (instance, handle) in event_recordings.iter().enumerate() {
        for time in model.recording(*handle).unwrap().times() {
            event_checksum += time * instance as f64;
        }
    }

    let snapshot = model.snapshot().unwrap();

    let voltage_checksum: f64 = snapshot
        .group_states
        .iter()
        .map(|group_state| group_state.variables[0].values.iter().sum::<f64>())
        .sum();

    let mut synapse_checksum = 0.0;
    for connector_state in &snapshot.connector_states {
        for synapse in &connector_state.synapses {
            synapse_checksum += synapse.source_index as f64
                * synapse.target_index as f64
                * synapse.delay as f64
                * synapse.weight;
        }
    }

    let result = json!({
        "step": snapshot.step,
        "voltage_trace_checksum": voltage_trace_checksum,
        "event_checksum": event_checksum,
        "voltage_checksum": voltage_checksum,
        "synapse_checksum": synapse_checksum,
    });

    println!("{}", serde_json::to_string_pretty(&result).unwrap());
}
