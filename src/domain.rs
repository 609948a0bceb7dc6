//! # Iteration Domains
//!
//! Half-open integer box domains bounding the valid index tuples of a
//! store or reduction. A domain has *set dimensions* (the inames),
//! *parameter dimensions* (free size-parameter names), and one
//! `lower <= iname < upper` constraint per set dimension, with bounds
//! affine in the parameters.

use crate::scalar::{self, ScalarRef};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("bound expression is not affine in its parameters: {0}")]
    NonAffineBound(String),
    #[error("domain has {dims} set dimensions but {constraints} constraints")]
    ConstraintMismatch { dims: usize, constraints: usize },
    #[error("unknown set dimension '{0}'")]
    UnknownDim(String),
}

/// A half-open bound pair for one set dimension.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DimBounds {
    pub dim: String,
    pub lower: ScalarRef,
    pub upper: ScalarRef,
}

/// A box-shaped polyhedral set: `{ [dims] : params -> lower_i <= dim_i <
/// upper_i }`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IterationDomain {
    set_dims: Vec<String>,
    params: Vec<String>,
    bounds: Vec<DimBounds>,
}

impl IterationDomain {
    /// The unconstrained zero-dimensional domain.
    pub fn universe() -> Self {
        IterationDomain {
            set_dims: Vec::new(),
            params: Vec::new(),
            bounds: Vec::new(),
        }
    }

    /// Build a domain from per-dimension half-open bounds. Parameter
    /// dimensions are the free variables of the bound expressions; bounds
    /// must be affine in them.
    pub fn from_bounds(bounds: Vec<DimBounds>) -> Result<Self, DomainError> {
        let mut params: BTreeSet<String> = BTreeSet::new();
        let dims: Vec<String> = bounds.iter().map(|b| b.dim.clone()).collect();
        for bound in &bounds {
            for expr in [&bound.lower, &bound.upper] {
                let free = scalar::free_variables(expr);
                if !scalar::is_affine(expr, &free) {
                    return Err(DomainError::NonAffineBound(expr.to_string()));
                }
                params.extend(free);
            }
        }
        // An iname of one bound may not be a parameter of another.
        let params: Vec<String> = params
            .into_iter()
            .filter(|p| !dims.contains(p))
            .collect();
        Ok(IterationDomain {
            set_dims: dims,
            params,
            bounds,
        })
    }

    pub fn set_dims(&self) -> &[String] {
        &self.set_dims
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }

    pub fn bounds(&self) -> &[DimBounds] {
        &self.bounds
    }

    pub fn is_universe(&self) -> bool {
        self.set_dims.is_empty()
    }

    /// Conjunction of two box domains over disjoint dimension sets.
    pub fn intersect(&self, other: &IterationDomain) -> IterationDomain {
        let mut bounds = self.bounds.clone();
        bounds.extend(other.bounds.iter().cloned());
        let mut set_dims = self.set_dims.clone();
        set_dims.extend(other.set_dims.iter().cloned());
        let mut params: BTreeSet<String> = self.params.iter().cloned().collect();
        params.extend(other.params.iter().cloned());
        let params = params.into_iter().filter(|p| !set_dims.contains(p)).collect();
        IterationDomain {
            set_dims,
            params,
            bounds,
        }
    }

    /// Rename one set dimension, rewriting its bound entry.
    pub fn rename_dim(&self, old: &str, new: &str) -> Result<IterationDomain, DomainError> {
        if !self.set_dims.iter().any(|d| d == old) {
            return Err(DomainError::UnknownDim(old.to_string()));
        }
        let set_dims = self
            .set_dims
            .iter()
            .map(|d| {
                if d == old {
                    new.to_string()
                } else {
                    d.clone()
                }
            })
            .collect();
        let bounds = self
            .bounds
            .iter()
            .map(|b| DimBounds {
                dim: if b.dim == old {
                    new.to_string()
                } else {
                    b.dim.clone()
                },
                lower: b.lower.clone(),
                upper: b.upper.clone(),
            })
            .collect();
        Ok(IterationDomain {
            set_dims,
            params: self.params.clone(),
            bounds,
        })
    }
}

impl fmt::Display for IterationDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] -> {{ [{}] : ", self.params.join(", "), self.set_dims.join(", "))?;
        for (i, b) in self.bounds.iter().enumerate() {
            if i > 0 {
                write!(f, " and ")?;
            }
            write!(f, "{} <= {} < {}", b.lower, b.dim, b.upper)?;
        }
        write!(f, " }}")
    }
}
