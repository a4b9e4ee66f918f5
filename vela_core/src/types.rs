//! The compile-time type model.
//!
//! The bytecode compiler does not need full structural typing; it needs two
//! things from a type: which register class its values live in, and identity
//! for the deduplicated per-function type table. `Kind` is the scalar-kind
//! classifier, `Type` the structural representation, and `RegisterClass` the
//! four-way partition of the register file.

use std::fmt;

/// The four register classes.
///
/// Register operands are 8-bit, so the register file is partitioned by
/// class; each class has its own counters, high-water mark and constant
/// pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterClass {
    /// All integer widths, including unsigned, and booleans.
    Int,
    /// 32- and 64-bit floating point.
    Float,
    /// Strings.
    String,
    /// Everything else: interfaces, slices, maps, channels, structs,
    /// pointers, functions.
    General,
}

impl RegisterClass {
    /// The index of this class in per-class arrays (`[_; 4]`).
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            RegisterClass::Int => 0,
            RegisterClass::Float => 1,
            RegisterClass::String => 2,
            RegisterClass::General => 3,
        }
    }
}

/// The scalar kind of a type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Bool,
    Int,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Float32,
    Float64,
    String,
    Interface,
    Slice,
    Map,
    Chan,
    Struct,
    Ptr,
    Func,
}

impl Kind {
    /// Lower this kind to its register class.
    ///
    /// All integer widths collapse to `Int` (booleans ride in integer
    /// registers), both float widths to `Float`, and every composite or
    /// boxed kind to `General`.
    #[must_use]
    pub const fn class(self) -> RegisterClass {
        match self {
            Kind::Bool
            | Kind::Int
            | Kind::Int8
            | Kind::Int16
            | Kind::Int32
            | Kind::Int64
            | Kind::Uint
            | Kind::Uint8
            | Kind::Uint16
            | Kind::Uint32
            | Kind::Uint64 => RegisterClass::Int,
            Kind::Float32 | Kind::Float64 => RegisterClass::Float,
            Kind::String => RegisterClass::String,
            Kind::Interface
            | Kind::Slice
            | Kind::Map
            | Kind::Chan
            | Kind::Struct
            | Kind::Ptr
            | Kind::Func => RegisterClass::General,
        }
    }

    /// Whether this is an unsigned integer kind.
    #[inline]
    #[must_use]
    pub const fn is_unsigned(self) -> bool {
        matches!(
            self,
            Kind::Uint | Kind::Uint8 | Kind::Uint16 | Kind::Uint32 | Kind::Uint64
        )
    }
}

/// A structural compile-time type.
///
/// Equality is structural and is what the deduplicated type table uses.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Bool,
    Int,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Float32,
    Float64,
    Str,
    /// The empty interface.
    Interface,
    /// A slice with the given element type.
    Slice(Box<Type>),
    /// A map from key to value type.
    Map(Box<Type>, Box<Type>),
    /// A channel of the given element type.
    Chan(Box<Type>),
    /// A pointer to the given type.
    Ptr(Box<Type>),
    /// A named struct type.
    Struct(String),
    /// A function type.
    Func {
        params: Vec<Type>,
        results: Vec<Type>,
    },
}

impl Type {
    /// The scalar kind of this type.
    #[must_use]
    pub const fn kind(&self) -> Kind {
        match self {
            Type::Bool => Kind::Bool,
            Type::Int => Kind::Int,
            Type::Int8 => Kind::Int8,
            Type::Int16 => Kind::Int16,
            Type::Int32 => Kind::Int32,
            Type::Int64 => Kind::Int64,
            Type::Uint => Kind::Uint,
            Type::Uint8 => Kind::Uint8,
            Type::Uint16 => Kind::Uint16,
            Type::Uint32 => Kind::Uint32,
            Type::Uint64 => Kind::Uint64,
            Type::Float32 => Kind::Float32,
            Type::Float64 => Kind::Float64,
            Type::Str => Kind::String,
            Type::Interface => Kind::Interface,
            Type::Slice(_) => Kind::Slice,
            Type::Map(_, _) => Kind::Map,
            Type::Chan(_) => Kind::Chan,
            Type::Ptr(_) => Kind::Ptr,
            Type::Struct(_) => Kind::Struct,
            Type::Func { .. } => Kind::Func,
        }
    }

    /// The register class values of this type live in.
    #[inline]
    #[must_use]
    pub const fn class(&self) -> RegisterClass {
        self.kind().class()
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Bool => f.write_str("bool"),
            Type::Int => f.write_str("int"),
            Type::Int8 => f.write_str("int8"),
            Type::Int16 => f.write_str("int16"),
            Type::Int32 => f.write_str("int32"),
            Type::Int64 => f.write_str("int64"),
            Type::Uint => f.write_str("uint"),
            Type::Uint8 => f.write_str("uint8"),
            Type::Uint16 => f.write_str("uint16"),
            Type::Uint32 => f.write_str("uint32"),
            Type::Uint64 => f.write_str("uint64"),
            Type::Float32 => f.write_str("float32"),
            Type::Float64 => f.write_str("float64"),
            Type::Str => f.write_str("string"),
            Type::Interface => f.write_str("interface{}"),
            Type::Slice(elem) => write!(f, "[]{elem}"),
            Type::Map(k, v) => write!(f, "map[{k}]{v}"),
            Type::Chan(elem) => write!(f, "chan {elem}"),
            Type::Ptr(t) => write!(f, "*{t}"),
            Type::Struct(name) => f.write_str(name),
            Type::Func { params, results } => {
                f.write_str("func(")?;
                for (i, p) in params.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{p}")?;
                }
                f.write_str(")")?;
                match results.len() {
                    0 => Ok(()),
                    1 => write!(f, " {}", results[0]),
                    _ => {
                        f.write_str(" (")?;
                        for (i, r) in results.iter().enumerate() {
                            if i > 0 {
                                f.write_str(", ")?;
                            }
                            write!(f, "{r}")?;
                        }
                        f.write_str(")")
                    }
                }
            }
        }
    }
}
