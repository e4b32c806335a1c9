//! Analysis algorithms and the whole-binary driver.
//!
//! `cfg` turns a method body into a control-flow graph using any
//! `Disassembler`; `session` ties image, instruction set, key functions and
//! configuration together and analyses methods in bulk.

pub mod cfg;
pub mod session;

pub use cfg::build_cfg;
pub use session::{AnalysisReport, AnalysisSession, MethodAnalysis, MethodFailure};
