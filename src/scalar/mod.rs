//! # Scalar Expression Algebra
//!
//! The small arithmetic expression trees that live inside
//! [`IndexLambda`](crate::array::ArrayKind::IndexLambda) bodies, shape
//! components, and generated loop-nest instructions.
//!
//! Expressions are immutable and shared through [`ScalarRef`]. The walker,
//! rewriter, substitution, and free-variable collector below are the only
//! traversal entry points; transformation passes build on them instead of
//! re-matching the tree shape.
//!
//! Naming conventions carried by the rest of the pipeline:
//! - `_0, _1, …` are elementwise output indices,
//! - `_r0, _r1, …` are reduction indices,
//! - operand names resolve through an index-lambda's bindings,
//! - any other free variable is a size parameter.

use crate::value::{DType, Lit};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

pub type ScalarRef = Arc<ScalarExpr>;

/// Bounds of one reduction index: a half-open `(lower, upper)` range.
pub type ReductionBounds = BTreeMap<String, (ScalarRef, ScalarRef)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    /// Integer division, rounding toward negative infinity.
    FloorDiv,
    /// Mathematical modulo; the result has the sign of the divisor.
    Rem,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Reduction operators usable in [`ScalarExpr::Reduce`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReductionOp {
    Sum,
    Product,
    Max,
    Min,
    All,
    Any,
}

impl ReductionOp {
    /// The loop-nest builtin implementing this reduction.
    pub fn loop_nest_name(self) -> &'static str {
        match self {
            ReductionOp::Sum => "sum",
            ReductionOp::Product => "product",
            ReductionOp::Max => "max",
            ReductionOp::Min => "min",
            ReductionOp::All => "all",
            ReductionOp::Any => "any",
        }
    }
}

/// A scalar-valued expression tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ScalarExpr {
    Constant(Lit),
    Variable(String),
    Unary {
        op: UnaryOp,
        inner: ScalarRef,
    },
    Binary {
        op: BinaryOp,
        left: ScalarRef,
        right: ScalarRef,
    },
    Comparison {
        op: CmpOp,
        left: ScalarRef,
        right: ScalarRef,
    },
    If {
        condition: ScalarRef,
        then: ScalarRef,
        otherwise: ScalarRef,
    },
    /// Subscript into a named operand; index expressions must be
    /// integer-valued.
    Subscript {
        array: String,
        indices: Vec<ScalarRef>,
    },
    /// Call to a builtin identified by a dotted name in the reserved
    /// `arrayloom.` namespace.
    Call {
        function: String,
        args: Vec<ScalarRef>,
    },
    Reduce {
        op: ReductionOp,
        bounds: ReductionBounds,
        inner: ScalarRef,
    },
    Cast {
        dtype: DType,
        inner: ScalarRef,
    },
    /// Reference to a whole sub-array, used only in generated loop-nest
    /// instructions that feed external kernel calls.
    SubArrayRef {
        inames: Vec<String>,
        array: String,
    },
}

// ============================================================================
// Constructors
// ============================================================================

pub fn var(name: impl Into<String>) -> ScalarRef {
    Arc::new(ScalarExpr::Variable(name.into()))
}

pub fn lit(value: Lit) -> ScalarRef {
    Arc::new(ScalarExpr::Constant(value))
}

pub fn int(value: i64) -> ScalarRef {
    lit(Lit::Int(value))
}

/// The elementwise output index `_k`.
pub fn elem_index(k: usize) -> ScalarRef {
    var(format!("_{k}"))
}

/// The reduction index `_rk`.
pub fn reduction_index(k: usize) -> ScalarRef {
    var(format!("_r{k}"))
}

pub fn binary(op: BinaryOp, left: ScalarRef, right: ScalarRef) -> ScalarRef {
    Arc::new(ScalarExpr::Binary { op, left, right })
}

pub fn add(left: ScalarRef, right: ScalarRef) -> ScalarRef {
    // Folding x + 0 keeps generated index arithmetic readable.
    if matches!(&*right, ScalarExpr::Constant(l) if l.is_zero()) {
        return left;
    }
    if matches!(&*left, ScalarExpr::Constant(l) if l.is_zero()) {
        return right;
    }
    binary(BinaryOp::Add, left, right)
}

pub fn sub(left: ScalarRef, right: ScalarRef) -> ScalarRef {
    if matches!(&*right, ScalarExpr::Constant(l) if l.is_zero()) {
        return left;
    }
    binary(BinaryOp::Sub, left, right)
}

pub fn mul(left: ScalarRef, right: ScalarRef) -> ScalarRef {
    if matches!(&*left, ScalarExpr::Constant(Lit::Int(1))) {
        return right;
    }
    if matches!(&*right, ScalarExpr::Constant(Lit::Int(1))) {
        return left;
    }
    binary(BinaryOp::Mul, left, right)
}

pub fn floor_div(left: ScalarRef, right: ScalarRef) -> ScalarRef {
    if matches!(&*right, ScalarExpr::Constant(Lit::Int(1))) {
        return left;
    }
    binary(BinaryOp::FloorDiv, left, right)
}

pub fn rem(left: ScalarRef, right: ScalarRef) -> ScalarRef {
    binary(BinaryOp::Rem, left, right)
}

pub fn compare(op: CmpOp, left: ScalarRef, right: ScalarRef) -> ScalarRef {
    Arc::new(ScalarExpr::Comparison { op, left, right })
}

pub fn if_then_else(condition: ScalarRef, then: ScalarRef, otherwise: ScalarRef) -> ScalarRef {
    Arc::new(ScalarExpr::If {
        condition,
        then,
        otherwise,
    })
}

pub fn subscript(array: impl Into<String>, indices: Vec<ScalarRef>) -> ScalarRef {
    Arc::new(ScalarExpr::Subscript {
        array: array.into(),
        indices,
    })
}

pub fn call(function: impl Into<String>, args: Vec<ScalarRef>) -> ScalarRef {
    Arc::new(ScalarExpr::Call {
        function: function.into(),
        args,
    })
}

pub fn reduce(op: ReductionOp, bounds: ReductionBounds, inner: ScalarRef) -> ScalarRef {
    Arc::new(ScalarExpr::Reduce { op, bounds, inner })
}

pub fn cast(dtype: DType, inner: ScalarRef) -> ScalarRef {
    Arc::new(ScalarExpr::Cast { dtype, inner })
}

// ============================================================================
// Traversal
// ============================================================================

/// Pre-order walk over `expr` and all subexpressions.
///
/// Reduction bound expressions are visited; bound names are not treated
/// specially here (use [`free_variables`] for binding-aware collection).
pub fn for_each(expr: &ScalarRef, f: &mut impl FnMut(&ScalarRef)) {
    f(expr);
    match &**expr {
        ScalarExpr::Constant(_) | ScalarExpr::Variable(_) | ScalarExpr::SubArrayRef { .. } => {}
        ScalarExpr::Unary { inner, .. } | ScalarExpr::Cast { inner, .. } => for_each(inner, f),
        ScalarExpr::Binary { left, right, .. } | ScalarExpr::Comparison { left, right, .. } => {
            for_each(left, f);
            for_each(right, f);
        }
        ScalarExpr::If {
            condition,
            then,
            otherwise,
        } => {
            for_each(condition, f);
            for_each(then, f);
            for_each(otherwise, f);
        }
        ScalarExpr::Subscript { indices, .. } => {
            for idx in indices {
                for_each(idx, f);
            }
        }
        ScalarExpr::Call { args, .. } => {
            for arg in args {
                for_each(arg, f);
            }
        }
        ScalarExpr::Reduce { bounds, inner, .. } => {
            for (lo, hi) in bounds.values() {
                for_each(lo, f);
                for_each(hi, f);
            }
            for_each(inner, f);
        }
    }
}

/// Bottom-up rewrite. `f` sees each already-rewritten node and may replace
/// it; returning `None` keeps the node. Unchanged subtrees are shared with
/// the input rather than copied.
pub fn rewrite(expr: &ScalarRef, f: &mut impl FnMut(&ScalarRef) -> Option<ScalarRef>) -> ScalarRef {
    let rebuilt = match &**expr {
        ScalarExpr::Constant(_) | ScalarExpr::Variable(_) | ScalarExpr::SubArrayRef { .. } => {
            expr.clone()
        }
        ScalarExpr::Unary { op, inner } => {
            let new_inner = rewrite(inner, f);
            if Arc::ptr_eq(&new_inner, inner) {
                expr.clone()
            } else {
                Arc::new(ScalarExpr::Unary {
                    op: *op,
                    inner: new_inner,
                })
            }
        }
        ScalarExpr::Binary { op, left, right } => {
            let new_left = rewrite(left, f);
            let new_right = rewrite(right, f);
            if Arc::ptr_eq(&new_left, left) && Arc::ptr_eq(&new_right, right) {
                expr.clone()
            } else {
                Arc::new(ScalarExpr::Binary {
                    op: *op,
                    left: new_left,
                    right: new_right,
                })
            }
        }
        ScalarExpr::Comparison { op, left, right } => {
            let new_left = rewrite(left, f);
            let new_right = rewrite(right, f);
            if Arc::ptr_eq(&new_left, left) && Arc::ptr_eq(&new_right, right) {
                expr.clone()
            } else {
                Arc::new(ScalarExpr::Comparison {
                    op: *op,
                    left: new_left,
                    right: new_right,
                })
            }
        }
        ScalarExpr::If {
            condition,
            then,
            otherwise,
        } => {
            let new_condition = rewrite(condition, f);
            let new_then = rewrite(then, f);
            let new_otherwise = rewrite(otherwise, f);
            if Arc::ptr_eq(&new_condition, condition)
                && Arc::ptr_eq(&new_then, then)
                && Arc::ptr_eq(&new_otherwise, otherwise)
            {
                expr.clone()
            } else {
                Arc::new(ScalarExpr::If {
                    condition: new_condition,
                    then: new_then,
                    otherwise: new_otherwise,
                })
            }
        }
        ScalarExpr::Subscript { array, indices } => {
            let new_indices: Vec<_> = indices.iter().map(|i| rewrite(i, f)).collect();
            if new_indices
                .iter()
                .zip(indices)
                .all(|(a, b)| Arc::ptr_eq(a, b))
            {
                expr.clone()
            } else {
                Arc::new(ScalarExpr::Subscript {
                    array: array.clone(),
                    indices: new_indices,
                })
            }
        }
        ScalarExpr::Call { function, args } => {
            let new_args: Vec<_> = args.iter().map(|a| rewrite(a, f)).collect();
            if new_args.iter().zip(args).all(|(a, b)| Arc::ptr_eq(a, b)) {
                expr.clone()
            } else {
                Arc::new(ScalarExpr::Call {
                    function: function.clone(),
                    args: new_args,
                })
            }
        }
        ScalarExpr::Reduce { op, bounds, inner } => {
            let new_bounds: ReductionBounds = bounds
                .iter()
                .map(|(name, (lo, hi))| (name.clone(), (rewrite(lo, f), rewrite(hi, f))))
                .collect();
            let new_inner = rewrite(inner, f);
            let bounds_unchanged = new_bounds
                .values()
                .zip(bounds.values())
                .all(|((a, b), (c, d))| Arc::ptr_eq(a, c) && Arc::ptr_eq(b, d));
            if bounds_unchanged && Arc::ptr_eq(&new_inner, inner) {
                expr.clone()
            } else {
                Arc::new(ScalarExpr::Reduce {
                    op: *op,
                    bounds: new_bounds,
                    inner: new_inner,
                })
            }
        }
        ScalarExpr::Cast { dtype, inner } => {
            let new_inner = rewrite(inner, f);
            if Arc::ptr_eq(&new_inner, inner) {
                expr.clone()
            } else {
                Arc::new(ScalarExpr::Cast {
                    dtype: *dtype,
                    inner: new_inner,
                })
            }
        }
    };
    f(&rebuilt).unwrap_or(rebuilt)
}

/// Replace free variables by name. Reduction-bound names shadow the
/// substitution inside their reduce body.
pub fn substitute(expr: &ScalarRef, substitutions: &BTreeMap<String, ScalarRef>) -> ScalarRef {
    if substitutions.is_empty() {
        return expr.clone();
    }
    match &**expr {
        ScalarExpr::Variable(name) => substitutions
            .get(name)
            .cloned()
            .unwrap_or_else(|| expr.clone()),
        ScalarExpr::Constant(_) | ScalarExpr::SubArrayRef { .. } => expr.clone(),
        ScalarExpr::Unary { op, inner } => Arc::new(ScalarExpr::Unary {
            op: *op,
            inner: substitute(inner, substitutions),
        }),
        ScalarExpr::Binary { op, left, right } => Arc::new(ScalarExpr::Binary {
            op: *op,
            left: substitute(left, substitutions),
            right: substitute(right, substitutions),
        }),
        ScalarExpr::Comparison { op, left, right } => Arc::new(ScalarExpr::Comparison {
            op: *op,
            left: substitute(left, substitutions),
            right: substitute(right, substitutions),
        }),
        ScalarExpr::If {
            condition,
            then,
            otherwise,
        } => Arc::new(ScalarExpr::If {
            condition: substitute(condition, substitutions),
            then: substitute(then, substitutions),
            otherwise: substitute(otherwise, substitutions),
        }),
        ScalarExpr::Subscript { array, indices } => Arc::new(ScalarExpr::Subscript {
            array: array.clone(),
            indices: indices
                .iter()
                .map(|i| substitute(i, substitutions))
                .collect(),
        }),
        ScalarExpr::Call { function, args } => Arc::new(ScalarExpr::Call {
            function: function.clone(),
            args: args.iter().map(|a| substitute(a, substitutions)).collect(),
        }),
        ScalarExpr::Cast { dtype, inner } => Arc::new(ScalarExpr::Cast {
            dtype: *dtype,
            inner: substitute(inner, substitutions),
        }),
        ScalarExpr::Reduce { op, bounds, inner } => {
            let new_bounds: ReductionBounds = bounds
                .iter()
                .map(|(name, (lo, hi))| {
                    (
                        name.clone(),
                        (substitute(lo, substitutions), substitute(hi, substitutions)),
                    )
                })
                .collect();
            let shadowed: BTreeMap<String, ScalarRef> = substitutions
                .iter()
                .filter(|(name, _)| !bounds.contains_key(*name))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            Arc::new(ScalarExpr::Reduce {
                op: *op,
                bounds: new_bounds,
                inner: substitute(inner, &shadowed),
            })
        }
    }
}

/// Rename the bound variable of every reduction per `renames`, in bounds
/// keys and in the inner expression.
pub fn rename_reduction_indices(
    expr: &ScalarRef,
    renames: &BTreeMap<String, String>,
) -> ScalarRef {
    rewrite(&expr.clone(), &mut |node| {
        if let ScalarExpr::Reduce { op, bounds, inner } = &**node {
            if bounds.keys().any(|k| renames.contains_key(k)) {
                let new_bounds: ReductionBounds = bounds
                    .iter()
                    .map(|(name, bound)| {
                        (
                            renames.get(name).cloned().unwrap_or_else(|| name.clone()),
                            bound.clone(),
                        )
                    })
                    .collect();
                let var_subst: BTreeMap<String, ScalarRef> = renames
                    .iter()
                    .filter(|(old, _)| bounds.contains_key(*old))
                    .map(|(old, new)| (old.clone(), var(new.clone())))
                    .collect();
                return Some(Arc::new(ScalarExpr::Reduce {
                    op: *op,
                    bounds: new_bounds,
                    inner: substitute(inner, &var_subst),
                }));
            }
        }
        None
    })
}

/// Free variable names of `expr`. Subscripted operand names are included;
/// reduction-bound names are not.
pub fn free_variables(expr: &ScalarRef) -> BTreeSet<String> {
    fn go(expr: &ScalarRef, bound: &mut Vec<String>, out: &mut BTreeSet<String>) {
        match &**expr {
            ScalarExpr::Variable(name) => {
                if !bound.iter().any(|b| b == name) {
                    out.insert(name.clone());
                }
            }
            ScalarExpr::Subscript { array, indices } => {
                if !bound.iter().any(|b| b == array) {
                    out.insert(array.clone());
                }
                for idx in indices {
                    go(idx, bound, out);
                }
            }
            ScalarExpr::Reduce { bounds, inner, .. } => {
                for (lo, hi) in bounds.values() {
                    go(lo, bound, out);
                    go(hi, bound, out);
                }
                let n_pushed = bounds.len();
                bound.extend(bounds.keys().cloned());
                go(inner, bound, out);
                bound.truncate(bound.len() - n_pushed);
            }
            ScalarExpr::Constant(_) => {}
            ScalarExpr::SubArrayRef { array, .. } => {
                out.insert(array.clone());
            }
            ScalarExpr::Unary { inner, .. } | ScalarExpr::Cast { inner, .. } => {
                go(inner, bound, out);
            }
            ScalarExpr::Binary { left, right, .. }
            | ScalarExpr::Comparison { left, right, .. } => {
                go(left, bound, out);
                go(right, bound, out);
            }
            ScalarExpr::If {
                condition,
                then,
                otherwise,
            } => {
                go(condition, bound, out);
                go(then, bound, out);
                go(otherwise, bound, out);
            }
            ScalarExpr::Call { args, .. } => {
                for arg in args {
                    go(arg, bound, out);
                }
            }
        }
    }
    let mut out = BTreeSet::new();
    go(expr, &mut Vec::new(), &mut out);
    out
}

/// Whether `expr` is affine in the names of `params`: built from integer
/// constants, variables in `params`, addition, subtraction, negation, and
/// multiplication where at least one factor is constant.
pub fn is_affine(expr: &ScalarRef, params: &BTreeSet<String>) -> bool {
    fn is_const(expr: &ScalarRef) -> bool {
        match &**expr {
            ScalarExpr::Constant(Lit::Int(_)) => true,
            ScalarExpr::Unary {
                op: UnaryOp::Neg,
                inner,
            } => is_const(inner),
            ScalarExpr::Binary {
                op: BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul,
                left,
                right,
            } => is_const(left) && is_const(right),
            _ => false,
        }
    }
    match &**expr {
        ScalarExpr::Constant(Lit::Int(_)) => true,
        ScalarExpr::Variable(name) => params.contains(name),
        ScalarExpr::Unary {
            op: UnaryOp::Neg,
            inner,
        } => is_affine(inner, params),
        ScalarExpr::Binary {
            op: BinaryOp::Add | BinaryOp::Sub,
            left,
            right,
        } => is_affine(left, params) && is_affine(right, params),
        ScalarExpr::Binary {
            op: BinaryOp::Mul,
            left,
            right,
        } => {
            (is_const(left) && is_affine(right, params))
                || (is_const(right) && is_affine(left, params))
        }
        _ => false,
    }
}

// ============================================================================
// Display
// ============================================================================

impl fmt::Display for ScalarExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarExpr::Constant(l) => write!(f, "{l}"),
            ScalarExpr::Variable(name) => write!(f, "{name}"),
            ScalarExpr::Unary { op, inner } => {
                let sym = match op {
                    UnaryOp::Neg => "-",
                    UnaryOp::Not => "!",
                };
                write!(f, "{sym}({inner})")
            }
            ScalarExpr::Binary { op, left, right } => {
                let sym = match op {
                    BinaryOp::Add => "+",
                    BinaryOp::Sub => "-",
                    BinaryOp::Mul => "*",
                    BinaryOp::Div => "/",
                    BinaryOp::FloorDiv => "//",
                    BinaryOp::Rem => "%",
                    BinaryOp::And => "and",
                    BinaryOp::Or => "or",
                };
                write!(f, "({left} {sym} {right})")
            }
            ScalarExpr::Comparison { op, left, right } => {
                let sym = match op {
                    CmpOp::Eq => "==",
                    CmpOp::Ne => "!=",
                    CmpOp::Lt => "<",
                    CmpOp::Le => "<=",
                    CmpOp::Gt => ">",
                    CmpOp::Ge => ">=",
                };
                write!(f, "({left} {sym} {right})")
            }
            ScalarExpr::If {
                condition,
                then,
                otherwise,
            } => write!(f, "({then} if {condition} else {otherwise})"),
            ScalarExpr::Subscript { array, indices } => {
                write!(f, "{array}[")?;
                for (i, idx) in indices.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{idx}")?;
                }
                write!(f, "]")
            }
            ScalarExpr::Call { function, args } => {
                write!(f, "{function}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
            ScalarExpr::Reduce { op, bounds, inner } => {
                write!(f, "{}(", op.loop_nest_name())?;
                for (i, (name, (lo, hi))) in bounds.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{name}:[{lo}, {hi})")?;
                }
                write!(f, ", {inner})")
            }
            ScalarExpr::Cast { dtype, inner } => write!(f, "cast({dtype}, {inner})"),
            ScalarExpr::SubArrayRef { inames, array } => {
                write!(f, "[{}]: {array}[..]", inames.join(", "))
            }
        }
    }
}
