//! The instruction-set-independent IR and the shared lowering driver.

pub mod builder;
pub mod lower;
pub mod node;
pub mod opcode;
pub mod operand;

pub use builder::IsilBuilder;
pub use lower::{lower_graph, InstructionLowering, LoweringContext};
pub use node::{InstructionSetIndependentNode, IsilNode};
pub use opcode::{IsilCondition, IsilOpcode};
pub use operand::{IsilMemoryOperand, IsilOperand, IsilOperandKind};
