pub mod codegen;
pub mod connectivity;
pub mod device;
pub mod error;
pub mod expr;
pub mod model;
pub mod params;
pub mod parser;
pub mod program;
pub mod recorder;
pub mod scheduler;
pub mod state_snapshot;
pub mod types;

mod clock;
mod delay_ring;
mod util;

pub use model::{GroupHandle, Model};
pub use scheduler::{GenerateFlags, SchedulerState};
