//! # Primitive Value Types
//!
//! Dtype tags for array elements and the literal constants that appear in
//! scalar expressions. Multi-operand array constructors agree on a common
//! dtype through the promotion lattice implemented here.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Element type of an array expression.
///
/// There is no implicit default: every constructor requires the caller to
/// state a dtype, and promotion only happens where two operands meet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DType {
    Bool,
    Int32,
    Int64,
    Float32,
    Float64,
}

impl DType {
    /// Whether values of this dtype are integers (valid as subscript indices).
    pub fn is_integral(self) -> bool {
        matches!(self, DType::Bool | DType::Int32 | DType::Int64)
    }

    pub fn is_float(self) -> bool {
        matches!(self, DType::Float32 | DType::Float64)
    }

    /// Common type of a binary operation between `self` and `other`.
    ///
    /// The lattice is Bool < Int32 < Int64 < Float32 < Float64; promotion
    /// picks the join.
    pub fn promote(self, other: DType) -> DType {
        self.max(other)
    }

    /// Zero literal of this dtype.
    pub fn zero(self) -> Lit {
        match self {
            DType::Bool => Lit::Bool(false),
            DType::Int32 | DType::Int64 => Lit::Int(0),
            DType::Float32 | DType::Float64 => Lit::Float(0.0),
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::Bool => "bool",
            DType::Int32 => "int32",
            DType::Int64 => "int64",
            DType::Float32 => "float32",
            DType::Float64 => "float64",
        };
        write!(f, "{name}")
    }
}

/// A literal constant inside a scalar expression.
///
/// Floats hash and compare by bit pattern so that expression trees stay
/// hashable; NaN payloads are preserved rather than collapsed.
#[derive(Debug, Clone, Copy)]
pub enum Lit {
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl Lit {
    pub fn is_zero(self) -> bool {
        match self {
            Lit::Bool(b) => !b,
            Lit::Int(i) => i == 0,
            Lit::Float(x) => x == 0.0,
        }
    }

    pub fn as_int(self) -> Option<i64> {
        match self {
            Lit::Int(i) => Some(i),
            _ => None,
        }
    }
}

impl PartialEq for Lit {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Lit::Bool(a), Lit::Bool(b)) => a == b,
            (Lit::Int(a), Lit::Int(b)) => a == b,
            (Lit::Float(a), Lit::Float(b)) => a.to_bits() == b.to_bits(),
            _ => false,
        }
    }
}

impl Eq for Lit {}

impl Hash for Lit {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Lit::Bool(b) => {
                0u8.hash(state);
                b.hash(state);
            }
            Lit::Int(i) => {
                1u8.hash(state);
                i.hash(state);
            }
            Lit::Float(x) => {
                2u8.hash(state);
                x.to_bits().hash(state);
            }
        }
    }
}

impl fmt::Display for Lit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lit::Bool(b) => write!(f, "{b}"),
            Lit::Int(i) => write!(f, "{i}"),
            Lit::Float(x) => write!(f, "{x}"),
        }
    }
}
