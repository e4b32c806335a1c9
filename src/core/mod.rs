//! Core data types for method-level binary analysis.
//!
//! Addresses and architectures, the loaded-image interface, per-method
//! context, decoded instructions, and the basic-block graph built from them.

pub mod address;
pub mod basic_block;
pub mod binary;
pub mod control_flow_graph;
pub mod disassembler;
pub mod image;
pub mod instruction;
pub mod method;
