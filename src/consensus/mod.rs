pub mod committee;
pub mod container;
pub mod fork;
pub mod instance;
pub mod leader;
pub mod message;
pub mod pipeline;
pub mod qc;
pub mod state;
pub mod store;
pub mod timer;

pub use committee::*;
pub use container::MessageContainer;
pub use fork::{Fork, PipelineContext};
pub use instance::{Instance, InstanceEvent, InstanceOptions};
pub use leader::*;
pub use message::*;
pub use pipeline::{BoxedPipeline, Pipeline};
pub use qc::*;
pub use state::{Stage, State};
pub use store::*;
pub use timer::RoundTimer;
