//! The suboperator algebra: IUs, pipelines, code generation, relational
//! operators and their decay.

pub mod compilation;
pub mod iu;
pub mod ops;
pub mod pipeline;
pub mod subop;
