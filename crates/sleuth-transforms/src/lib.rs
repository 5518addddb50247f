pub mod builtin;
pub mod params;
pub mod pipeline;
pub mod registry;

pub use pipeline::{Invocation, StepOutcome, TransformPipeline};
pub use registry::TransformRegistry;
