mod compiler;

pub use compiler::compile;
