//! Bytecode emission for the Vela virtual machine.
//!
//! The compiler crate owns the wire format of compiled functions: the
//! 32-bit instruction word, the opcode space with its constant-operand sign
//! convention, the per-class register file model, and the streaming
//! [`FunctionBuilder`] that higher-level translation drives one instruction
//! at a time.

pub mod bytecode;

pub use bytecode::builder::FunctionBuilder;
pub use bytecode::function::{Constants, Function, NativeFunction, Variable};
pub use bytecode::instruction::{
    decode_addr, encode_addr, BitOperation, ChannelDir, Condition, Instruction, Label, MoveKind,
    Opcode, StackShift,
};
