use rustc_hash::{FxHashMap, FxHashSet};

pub type HashMap<K, V> = FxHashMap<K, V>;

pub type HashSet<K> = FxHashSet<K>;

/// Simulated time, in the same unit as the model's timestep size.
pub type Time = f64;

/// Number of steps executed since the last `init_run`.
pub type StepIndex = u64;
