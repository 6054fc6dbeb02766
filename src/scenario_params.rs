use celeme::params::ModelParams;

pub fn get_scenario_params() -> ModelParams {
    let params_yaml_str = r#"
timestep_size: 0.5
groups:
- name: Regular
  num_neurons: 800
  neuron_type:
    state_variables:
    - name: V
      numeric_type: Double
      initial_value: !Uniform
        low: -70.0
        high: -50.0
    - name: u
      numeric_type: Double
      initial_value: !Constant -13.0
    constants:
    - name: a
      value: 0.02
    - name: b
      value: 0.2
    - name: c
      value: -65.0
    - name: d
      value: 8.0
    - name: I_ext
      value: 10.0
    inputs:
    - I
    equations: |
      V' = 0.04 * V * V + 5 * V + 140 - u + I + I_ext
      u' = a * (b * V - u)
    thresholds:
    - condition: V >= 30
      reset: V = c; u = u + d
- name: Fast
  num_neurons: 200
  neuron_type:
    state_variables:
    - name: V
      numeric_type: Double
      initial_value: !Uniform
        low: -70.0
        high: -50.0
    - name: u
      numeric_type: Double
      initial_value: !Constant -13.0
    constants:
    - name: a
      value: 0.1
    - name: b
      value: 0.2
    - name: c
      value: -65.0
    - name: d
      value: 2.0
    - name: I_ext
      value: 6.0
    inputs:
    - I
    equations: |
      V' = 0.04 * V * V + 5 * V + 140 - u + I + I_ext
      u' = a * (b * V - u)
    thresholds:
    - condition: V >= 30
      reset: V = c; u = u + d
connectors:
- name: RegularToRegular
  source:
    group: Regular
    start: 0
    end: 800
  target:
    group: Regular
    start: 0
    end: 800
  topology: !Probabilistic
    p: 0.1
  weight: !Uniform
    low: 0.0
    high: 0.5
  delay: !Uniform
    min: 1
    max: 20
  target_input: I
  transmission: !Event
    threshold: 0
    expression: weight
  allow_self_connections: false
- name: RegularToFast
  source:
    group: Regular
    start: 0
    end: 800
  target:
    group: Fast
    start: 0
    end: 200
  topology: !Probabilistic
    p: 0.25
  weight: !Uniform
    low: 0.0
    high: 0.5
  delay: !Uniform
    min: 1
    max: 20
  target_input: I
  transmission: !Event
    threshold: 0
    expression: weight
  allow_self_connections: false
- name: FastToRegular
  source:
    group: Fast
    start: 0
    end: 200
  target:
    group: Regular
    start: 0
    end: 800
  topology: !Probabilistic
    p: 0.25
  weight: !Constant 0.85
  delay: !Constant 1
  target_input: I
  transmission: !Event
    threshold: 0
    expression: -weight
  allow_self_connections: false
- name: FastToFast
  source:
    group: Fast
    start: 0
    end: 200
  target:
    group: Fast
    start: 0
    end: 200
  topology: !Probabilistic
    p: 0.25
  weight: !Constant 0.85
  delay: !Constant 1
  target_input: I
  transmission: !Event
    threshold: 0
    expression: -weight
  allow_self_connections: false
technical_params:
  seed_override: 0
"#;

    serde_yaml::from_str(params_yaml_str).unwrap()
}
