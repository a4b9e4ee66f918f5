//! Compiled function objects.
//!
//! A [`Function`] is the serialization unit of the bytecode format. It owns
//! its instruction body, the four per-class register high-water marks, the
//! four typed constant pools, the deduplicated type table, and the tables of
//! referenced variables and nested function definitions.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use vela_core::{Type, Value};

use super::instruction::Instruction;

/// A package-level variable referenced by a function.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    /// Package the variable belongs to.
    pub pkg: String,
    /// Variable name.
    pub name: String,
    /// Initial value.
    pub value: Value,
}

impl Variable {
    /// Create a new variable.
    #[must_use]
    pub fn new(pkg: impl Into<String>, name: impl Into<String>, value: Value) -> Self {
        Self {
            pkg: pkg.into(),
            name: name.into(),
            value,
        }
    }
}

/// A native function referenced by compiled code.
///
/// The implementation lives in the host; compiled functions only carry the
/// identity needed to resolve it at link time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeFunction {
    /// Package the function belongs to.
    pub pkg: String,
    /// Function name.
    pub name: String,
}

impl NativeFunction {
    /// Create a new native function reference.
    #[must_use]
    pub fn new(pkg: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            pkg: pkg.into(),
            name: name.into(),
        }
    }
}

/// The four typed constant pools of a function.
///
/// Each pool holds at most 256 entries. The general pool additionally hosts
/// the interface-typed subspace addressed by negative indices.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Constants {
    /// Signed 64-bit integer constants.
    pub int: Vec<i64>,
    /// 64-bit float constants.
    pub float: Vec<f64>,
    /// String constants.
    pub string: Vec<String>,
    /// Boxed constants of every other type.
    pub general: Vec<Value>,
}

/// A compiled function.
#[derive(Debug, Clone, Default)]
pub struct Function {
    /// Package the function was declared in.
    pub pkg: String,
    /// Function name; empty for function literals.
    pub name: String,
    /// Source file of the declaration.
    pub file: String,
    /// Source line of the declaration.
    pub line: u32,
    /// The function type.
    pub typ: Option<Type>,
    /// Enclosing function, for closures.
    pub parent: Option<Arc<Function>>,
    /// The instruction body.
    pub body: Vec<Instruction>,
    /// Per-class register counts, indexed by `RegisterClass::index()`.
    /// Committed by the builder on finalization.
    pub reg_num: [u8; 4],
    /// The constant pools.
    pub constants: Constants,
    /// Deduplicated type table.
    pub types: Vec<Type>,
    /// Referenced package-level variables.
    pub variables: Vec<Variable>,
    /// Referenced native functions.
    pub native_functions: Vec<Arc<NativeFunction>>,
    /// Nested compiled functions (function literals).
    pub functions: Vec<Arc<Function>>,
    /// Sparse map from instruction address to source line; only
    /// instructions that can fault carry an entry.
    pub lines: FxHashMap<u32, u32>,
    /// Captured closure references.
    pub closure_refs: Vec<i16>,
}

impl Function {
    /// Create a new, empty function with the given package, name and type.
    #[must_use]
    pub fn new(pkg: impl Into<String>, name: impl Into<String>, typ: Type) -> Self {
        Self {
            pkg: pkg.into(),
            name: name.into(),
            typ: Some(typ),
            ..Self::default()
        }
    }
}
