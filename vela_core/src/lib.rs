//! Core types for the Vela template engine.
//!
//! This crate holds the vocabulary shared by the parser and the bytecode
//! compiler: source positions, template contexts, the error taxonomy, boxed
//! constant values and the compile-time type model used for register-class
//! lowering.

pub mod context;
pub mod error;
pub mod position;
pub mod types;
pub mod value;

pub use context::Context;
pub use error::{VelaError, VelaResult};
pub use position::Position;
pub use types::{Kind, RegisterClass, Type};
pub use value::Value;
