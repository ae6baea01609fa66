// lowattr — default lowering attributes for loop-nest dataflow programs
//
// Library root. Leaves first: mapping algebra and program representation,
// then the analyses, then the passes and the pipeline that runs them.

pub mod defaults;
pub mod diag;
pub mod id;
pub mod iteration_space;
pub mod loop_fusion;
pub mod mapping;
pub mod pass;
pub mod pipeline;
pub mod program;
pub mod program_query;
pub mod sequence;
pub mod storage;

pub use pipeline::infer_default_attributes;
