//! # Code Generation: Lowering to Loop-Nest IR
//!
//! Walks the preprocessed DAG and produces, for every array, an
//! [`ImplementedResult`]: a stored buffer, an inlined scalar expression,
//! or a named substitution rule. Stores get polyhedral iteration domains,
//! assignment instructions, and threaded dependency IDs.
//!
//! ```text
//! preprocessed DAG -> [CodeGenMapper] -> TranslationUnit -> BoundProgram
//! ```

use super::{
    generate_name_for_temp, normalize_outputs, preprocess, BoundProgram, LoweringError,
};
use crate::array::{
    ArrayKind, ArrayOrNames, ArrayRef, KernelCallRef, NodeId, ReductionDescriptor, Shape,
    ShapeComponent, ArrayRefExt,
};
use crate::domain::{DimBounds, IterationDomain};
use crate::function::KernelCallBinding;
use crate::loopnest::{
    make_reduction_inames_unique, sub_array_ref, Assignee, GlobalArg, Instruction, KernelArg,
    KernelOptions, LoopKernel, TemporaryVariable, TranslationUnit, ValueArg,
};
use crate::scalar::{self, ReductionBounds, ScalarExpr, ScalarRef};
use crate::tags::{without_kinds, TagKind, TagSet};
use crate::transform::{CombineMapper, InputGatherer};
use crate::utils::UniqueNameGenerator;
use crate::value::{DType, Lit};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

/// The reserved dotted prefix of scalar builtins.
const BUILTIN_PREFIX: &str = "arrayloom.c99.";
/// A builtin that always evaluates to zero; short-circuited during
/// lowering.
const ZERO_BUILTIN: &str = "arrayloom.zero";

// ============================================================================
// Implemented Results
// ============================================================================

/// Generated code for one node of the computation graph.
#[derive(Debug, Clone)]
pub enum ImplementedResult {
    /// The value lives in a named buffer; reading it subscripts the
    /// buffer and inherits the store's instruction dependencies.
    Stored {
        name: String,
        num_indices: usize,
        depends_on: BTreeSet<String>,
    },
    /// The value is a scalar expression over the caller's indices;
    /// reading substitutes `_k` with the requested index expressions.
    Inlined {
        expr: ScalarRef,
        num_indices: usize,
        depends_on: BTreeSet<String>,
    },
    /// The value is exposed as a substitution rule over `num_args` formal
    /// arguments; reading is a call.
    Substitution {
        name: String,
        num_args: usize,
        depends_on: BTreeSet<String>,
    },
}

impl ImplementedResult {
    /// Produce the loop-nest expression reading this result at `indices`,
    /// folding the read's dependencies into `depends_on`.
    pub fn to_loop_expression(
        &self,
        indices: &[ScalarRef],
        depends_on: &mut BTreeSet<String>,
    ) -> Result<ScalarRef, LoweringError> {
        match self {
            ImplementedResult::Stored {
                name,
                num_indices,
                depends_on: deps,
            } => {
                if indices.len() != *num_indices {
                    return Err(LoweringError::Transform(
                        crate::transform::TransformError::Other(format!(
                            "read of '{name}' with {} indices, expected {num_indices}",
                            indices.len()
                        )),
                    ));
                }
                depends_on.extend(deps.iter().cloned());
                if indices.is_empty() {
                    Ok(scalar::var(name.clone()))
                } else {
                    Ok(scalar::subscript(name.clone(), indices.to_vec()))
                }
            }
            ImplementedResult::Inlined {
                expr,
                num_indices,
                depends_on: deps,
            } => {
                if indices.len() != *num_indices {
                    return Err(LoweringError::Transform(
                        crate::transform::TransformError::Other(format!(
                            "inlined read with {} indices, expected {num_indices}",
                            indices.len()
                        )),
                    ));
                }
                depends_on.extend(deps.iter().cloned());
                let substitutions: BTreeMap<String, ScalarRef> = indices
                    .iter()
                    .enumerate()
                    .map(|(d, idx)| (format!("_{d}"), idx.clone()))
                    .collect();
                Ok(scalar::substitute(expr, &substitutions))
            }
            ImplementedResult::Substitution {
                name,
                num_args,
                depends_on: deps,
            } => {
                if indices.len() != *num_args {
                    return Err(LoweringError::Transform(
                        crate::transform::TransformError::Other(format!(
                            "substitution read with {} indices, expected {num_args}",
                            indices.len()
                        )),
                    ));
                }
                depends_on.extend(deps.iter().cloned());
                Ok(scalar::call(name.clone(), indices.to_vec()))
            }
        }
    }
}

// ============================================================================
// Codegen State
// ============================================================================

/// Mutable state threaded through lowering.
pub struct CodeGenState {
    t_unit: TranslationUnit,
    results: HashMap<NodeId, ImplementedResult>,
    kernel_call_results: HashMap<(NodeId, String), ImplementedResult>,
    pub var_name_gen: UniqueNameGenerator,
    pub insn_id_gen: UniqueNameGenerator,
    has_kernel_call: bool,
}

impl CodeGenState {
    fn new(function_name: &str, options: KernelOptions) -> Self {
        CodeGenState {
            t_unit: TranslationUnit::new(LoopKernel::empty(function_name, options)),
            results: HashMap::new(),
            kernel_call_results: HashMap::new(),
            var_name_gen: UniqueNameGenerator::new(),
            insn_id_gen: UniqueNameGenerator::new(),
            has_kernel_call: false,
        }
    }

    pub fn kernel(&self) -> &LoopKernel {
        self.t_unit.default_entrypoint()
    }

    pub fn kernel_mut(&mut self) -> &mut LoopKernel {
        self.t_unit.default_entrypoint_mut()
    }

    /// Register `name` as a scalar size parameter of the kernel.
    fn register_size_param(&mut self, name: &str) {
        if !self.kernel().has_arg(name) {
            self.kernel_mut().args.push(KernelArg::Value(ValueArg {
                name: name.to_string(),
                dtype: DType::Int64,
                tags: TagSet::new(),
            }));
        }
    }
}

// ============================================================================
// Expression Translation
// ============================================================================

/// Read-only context handed from a node to its subexpressions.
struct LocalExprContext<'a> {
    num_indices: usize,
    namespace: &'a IndexMap<String, ImplementedResult>,
    reduction_bounds: ReductionBounds,
    reduction_descrs: &'a BTreeMap<String, ReductionDescriptor>,
}

fn parse_elem_index(name: &str) -> Option<usize> {
    let digits = name.strip_prefix('_')?;
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    if digits.len() > 1 && digits.starts_with('0') {
        return None;
    }
    digits.parse().ok()
}

// ============================================================================
// Codegen Mapper
// ============================================================================

/// Per-node lowering dispatch.
pub struct CodeGenMapper {
    array_tag_kinds_to_not_propagate: BTreeSet<TagKind>,
    axis_tag_kinds_to_not_propagate: BTreeSet<TagKind>,
}

impl CodeGenMapper {
    pub fn new(
        array_tag_kinds_to_not_propagate: BTreeSet<TagKind>,
        axis_tag_kinds_to_not_propagate: BTreeSet<TagKind>,
    ) -> Self {
        CodeGenMapper {
            array_tag_kinds_to_not_propagate,
            axis_tag_kinds_to_not_propagate,
        }
    }

    fn filtered_tags(&self, tags: &TagSet) -> TagSet {
        without_kinds(tags, &self.array_tag_kinds_to_not_propagate)
    }

    pub fn rec(
        &mut self,
        expr: &ArrayRef,
        state: &mut CodeGenState,
    ) -> Result<ImplementedResult, LoweringError> {
        if let Some(hit) = state.results.get(&expr.id()) {
            return Ok(hit.clone());
        }
        let result = match expr.kind() {
            ArrayKind::SizeParam { name } => {
                state.register_size_param(name);
                ImplementedResult::Stored {
                    name: name.clone(),
                    num_indices: 0,
                    depends_on: BTreeSet::new(),
                }
            }
            ArrayKind::Placeholder { name } => {
                let shape = shape_to_scalar_expression(expr.shape(), state);
                if expr.tag_of_kind(TagKind::ForceValueArg).is_some() {
                    if expr.ndim() != 0 {
                        return Err(LoweringError::Transform(
                            crate::transform::TransformError::Other(
                                "ForceValueArg applied to a non-scalar placeholder".into(),
                            ),
                        ));
                    }
                    state.kernel_mut().args.push(KernelArg::Value(ValueArg {
                        name: name.clone(),
                        dtype: expr.dtype(),
                        tags: self.filtered_tags(expr.tags()),
                    }));
                } else {
                    let arg = GlobalArg {
                        name: name.clone(),
                        shape,
                        dtype: expr.dtype(),
                        is_input: true,
                        is_output: false,
                        tags: self.filtered_tags(expr.tags()),
                    };
                    state.kernel_mut().args.push(KernelArg::Global(arg));
                }
                ImplementedResult::Stored {
                    name: name.clone(),
                    num_indices: expr.ndim(),
                    depends_on: BTreeSet::new(),
                }
            }
            ArrayKind::IndexLambda {
                expr: body,
                bindings,
                reductions,
            } => {
                let mut namespace: IndexMap<String, ImplementedResult> = IndexMap::new();
                let mut sorted_names: Vec<&String> = bindings.keys().collect();
                sorted_names.sort();
                for name in sorted_names {
                    let implemented = self.rec(&bindings[name], state)?;
                    namespace.insert(name.clone(), implemented);
                }

                let mut depends_on: BTreeSet<String> = BTreeSet::new();
                let ctx = LocalExprContext {
                    num_indices: expr.ndim(),
                    namespace: &namespace,
                    reduction_bounds: ReductionBounds::new(),
                    reduction_descrs: reductions,
                };
                let loop_expr = self.gen_expr(body, state, &ctx, &mut depends_on)?;

                // Walk the shape for size parameters even when inlining.
                shape_to_scalar_expression(expr.shape(), state);

                let inlined = ImplementedResult::Inlined {
                    expr: loop_expr,
                    num_indices: expr.ndim(),
                    depends_on: depends_on.clone(),
                };

                let strategy_tags: Vec<_> =
                    expr.tags().iter().filter(|t| t.is_impl_strategy()).collect();
                match strategy_tags.as_slice() {
                    [] | [crate::tags::Tag::ImplInlined] => inlined,
                    [crate::tags::Tag::ImplStored] => {
                        let name = generate_name_for_temp(
                            expr,
                            &mut state.var_name_gen,
                            "_al_temp",
                        )?;
                        let insn_id =
                            add_store(&name, expr, &inlined, state, self, true)?;
                        ImplementedResult::Stored {
                            name,
                            num_indices: expr.ndim(),
                            depends_on: [insn_id].into_iter().collect(),
                        }
                    }
                    [crate::tags::Tag::ImplSubstitution] => {
                        let name = generate_name_for_temp(
                            expr,
                            &mut state.var_name_gen,
                            "_al_subst",
                        )?;
                        add_substitution(&name, expr, &inlined, state)?;
                        ImplementedResult::Substitution {
                            name,
                            num_args: expr.ndim(),
                            depends_on,
                        }
                    }
                    other => {
                        return Err(LoweringError::UnsupportedImplementationStrategy(
                            other
                                .iter()
                                .map(|t| format!("{t:?}"))
                                .collect::<Vec<_>>()
                                .join(", "),
                        ))
                    }
                }
            }
            ArrayKind::KernelCallResult { call, name } => {
                self.lower_kernel_call(call, state)?;
                state
                    .kernel_call_results
                    .get(&(call.id(), name.clone()))
                    .cloned()
                    .ok_or_else(|| {
                        LoweringError::Transform(crate::transform::TransformError::Other(
                            format!("kernel call has no output '{name}'"),
                        ))
                    })?
            }
            ArrayKind::CallResult { .. } => return Err(LoweringError::OutlinedCall),
            ArrayKind::DataWrapper { .. } => {
                return Err(LoweringError::Transform(
                    crate::transform::TransformError::Other(
                        "data wrapper survived preprocessing".into(),
                    ),
                ))
            }
            _ => return Err(LoweringError::UnloweredNode),
        };
        state.results.insert(expr.id(), result.clone());
        Ok(result)
    }

    fn gen_expr(
        &mut self,
        expr: &ScalarRef,
        state: &mut CodeGenState,
        ctx: &LocalExprContext<'_>,
        depends_on: &mut BTreeSet<String>,
    ) -> Result<ScalarRef, LoweringError> {
        match &**expr {
            ScalarExpr::Constant(_) => Ok(expr.clone()),
            ScalarExpr::Variable(name) => {
                if let Some(index) = parse_elem_index(name) {
                    if index >= ctx.num_indices {
                        return Err(LoweringError::Transform(
                            crate::transform::TransformError::Other(format!(
                                "invalid elementwise index _{index}"
                            )),
                        ));
                    }
                    return Ok(expr.clone());
                }
                if ctx.reduction_bounds.contains_key(name) {
                    return Ok(expr.clone());
                }
                if let Some(implemented) = ctx.namespace.get(name) {
                    return implemented.to_loop_expression(&[], depends_on);
                }
                // Any other free variable is a size parameter.
                state.register_size_param(name);
                Ok(expr.clone())
            }
            ScalarExpr::Subscript { array, indices } => {
                let rec_indices: Vec<ScalarRef> = indices
                    .iter()
                    .map(|i| self.gen_expr(i, state, ctx, depends_on))
                    .collect::<Result<_, _>>()?;
                let implemented = ctx.namespace.get(array).ok_or_else(|| {
                    LoweringError::Transform(crate::transform::TransformError::Other(
                        format!("subscript of unbound operand '{array}'"),
                    ))
                })?;
                implemented.to_loop_expression(&rec_indices, depends_on)
            }
            ScalarExpr::Call { function, args } => {
                if function == ZERO_BUILTIN {
                    return Ok(scalar::lit(Lit::Int(0)));
                }
                let rec_args: Vec<ScalarRef> = args
                    .iter()
                    .map(|a| self.gen_expr(a, state, ctx, depends_on))
                    .collect::<Result<_, _>>()?;
                if let Some(unqualified) = function.strip_prefix(BUILTIN_PREFIX) {
                    Ok(scalar::call(unqualified.to_string(), rec_args))
                } else {
                    Ok(scalar::call(function.clone(), rec_args))
                }
            }
            ScalarExpr::Reduce { op, bounds, inner } => {
                // Give every reduction a fresh iname to keep repeated
                // inlined subexpressions from colliding.
                let renames: BTreeMap<String, String> = bounds
                    .keys()
                    .map(|old| {
                        (
                            old.clone(),
                            state
                                .var_name_gen
                                .fresh(&format!("_al_{}{old}", op.loop_nest_name())),
                        )
                    })
                    .collect();

                let mut new_bounds: ReductionBounds = ReductionBounds::new();
                for (old, (lo, hi)) in bounds {
                    let lo = self.gen_expr(lo, state, ctx, depends_on)?;
                    let hi = self.gen_expr(hi, state, ctx, depends_on)?;
                    new_bounds.insert(renames[old].clone(), (lo, hi));
                }

                let var_subst: BTreeMap<String, ScalarRef> = renames
                    .iter()
                    .map(|(old, new)| (old.clone(), scalar::var(new.clone())))
                    .collect();
                let renamed_inner = scalar::substitute(inner, &var_subst);

                let inner_ctx = LocalExprContext {
                    num_indices: ctx.num_indices,
                    namespace: ctx.namespace,
                    reduction_bounds: {
                        let mut merged = ctx.reduction_bounds.clone();
                        merged.extend(new_bounds.clone());
                        merged
                    },
                    reduction_descrs: ctx.reduction_descrs,
                };
                let rec_inner = self.gen_expr(&renamed_inner, state, &inner_ctx, depends_on)?;

                // Augment the iteration space with the reduction bounds.
                let domain = domain_for_shape(&[], &[], &new_bounds)?;
                state.kernel_mut().domains.push(domain);

                // Reduction-descriptor tags follow the renamed inames.
                for (old, new) in &renames {
                    if let Some(descr) = ctx.reduction_descrs.get(old) {
                        let tags =
                            without_kinds(&descr.tags, &self.axis_tag_kinds_to_not_propagate);
                        if !tags.is_empty() {
                            state.kernel_mut().tag_iname(new, tags);
                        }
                    }
                }

                Ok(scalar::reduce(*op, new_bounds, rec_inner))
            }
            ScalarExpr::Cast { dtype, inner } => Ok(scalar::cast(
                *dtype,
                self.gen_expr(inner, state, ctx, depends_on)?,
            )),
            ScalarExpr::Unary { op, inner } => Ok(Arc::new(ScalarExpr::Unary {
                op: *op,
                inner: self.gen_expr(inner, state, ctx, depends_on)?,
            })),
            ScalarExpr::Binary { op, left, right } => Ok(Arc::new(ScalarExpr::Binary {
                op: *op,
                left: self.gen_expr(left, state, ctx, depends_on)?,
                right: self.gen_expr(right, state, ctx, depends_on)?,
            })),
            ScalarExpr::Comparison { op, left, right } => {
                Ok(Arc::new(ScalarExpr::Comparison {
                    op: *op,
                    left: self.gen_expr(left, state, ctx, depends_on)?,
                    right: self.gen_expr(right, state, ctx, depends_on)?,
                }))
            }
            ScalarExpr::If {
                condition,
                then,
                otherwise,
            } => Ok(Arc::new(ScalarExpr::If {
                condition: self.gen_expr(condition, state, ctx, depends_on)?,
                then: self.gen_expr(then, state, ctx, depends_on)?,
                otherwise: self.gen_expr(otherwise, state, ctx, depends_on)?,
            })),
            ScalarExpr::SubArrayRef { .. } => Err(LoweringError::Transform(
                crate::transform::TransformError::Other(
                    "sub-array references are not valid inside index lambdas".into(),
                ),
            )),
        }
    }

    // External Kernel Calls

    fn lower_kernel_call(
        &mut self,
        call: &KernelCallRef,
        state: &mut CodeGenState,
    ) -> Result<(), LoweringError> {
        if state
            .kernel_call_results
            .keys()
            .any(|(call_id, _)| *call_id == call.id())
        {
            return Ok(());
        }
        state.has_kernel_call = true;

        let callee = call
            .translation_unit()
            .kernel(call.entrypoint())
            .ok_or_else(|| {
                LoweringError::LoopNest(crate::loopnest::LoopNestError::UnknownKernel(
                    call.entrypoint().to_string(),
                ))
            })?
            .clone();

        state.t_unit = state.t_unit.clone().merge(call.translation_unit())?;

        let insn_id = state
            .insn_id_gen
            .fresh(&format!("call_{}", callee.name));

        let mut domains: Vec<IterationDomain> = Vec::new();
        let mut new_temporaries: IndexMap<String, TemporaryVariable> = IndexMap::new();
        let mut assignees: Vec<Assignee> = Vec::new();
        let mut params: Vec<ScalarRef> = Vec::new();
        let mut depends_on: BTreeSet<String> = BTreeSet::new();

        // Walk the callee arguments in order so assignees and parameters
        // line up with its signature.
        for arg in &callee.args {
            match arg {
                KernelArg::Global(garg) if garg.is_output => {
                    let (shape, dtype) =
                        call.outputs().get(&garg.name).cloned().ok_or_else(|| {
                            LoweringError::Transform(
                                crate::transform::TransformError::Other(format!(
                                    "callee output '{}' not declared on the kernel call",
                                    garg.name
                                )),
                            )
                        })?;
                    let temp_name = state.var_name_gen.fresh("_al_temp");
                    let inames: Vec<String> = (0..shape.ndim())
                        .map(|d| state.var_name_gen.fresh(&format!("_{temp_name}_dim{d}")))
                        .collect();
                    let shape_exprs = shape_to_scalar_expression(&shape, state);
                    domains.push(domain_for_shape(
                        &inames,
                        &shape_exprs,
                        &ReductionBounds::new(),
                    )?);
                    assignees.push(Assignee::SubArrayRef {
                        inames: inames.clone(),
                        name: temp_name.clone(),
                    });
                    new_temporaries.insert(
                        temp_name.clone(),
                        TemporaryVariable {
                            name: temp_name.clone(),
                            shape: shape_exprs,
                            dtype,
                            tags: TagSet::new(),
                        },
                    );
                    state.kernel_call_results.insert(
                        (call.id(), garg.name.clone()),
                        ImplementedResult::Stored {
                            name: temp_name,
                            num_indices: shape.ndim(),
                            depends_on: [insn_id.clone()].into_iter().collect(),
                        },
                    );
                }
                KernelArg::Global(garg) => {
                    let binding = call.bindings().get(&garg.name).ok_or_else(|| {
                        LoweringError::Transform(crate::transform::TransformError::Other(
                            format!("no binding for callee input '{}'", garg.name),
                        ))
                    })?;
                    let KernelCallBinding::Array(operand) = binding else {
                        return Err(LoweringError::Transform(
                            crate::transform::TransformError::Other(format!(
                                "callee array input '{}' bound to a scalar",
                                garg.name
                            )),
                        ));
                    };
                    let implemented = self.rec(operand, state)?;
                    let stored_name = match &implemented {
                        ImplementedResult::Stored {
                            name, depends_on: deps, ..
                        } => {
                            depends_on.extend(deps.iter().cloned());
                            name.clone()
                        }
                        other => {
                            // Materialize the operand, then hand the
                            // buffer to the call.
                            let name = generate_name_for_temp(
                                operand,
                                &mut state.var_name_gen,
                                "_al_temp",
                            )?;
                            let store_id =
                                add_store(&name, operand, other, state, self, true)?;
                            depends_on.insert(store_id.clone());
                            state.results.insert(
                                operand.id(),
                                ImplementedResult::Stored {
                                    name: name.clone(),
                                    num_indices: operand.ndim(),
                                    depends_on: [store_id].into_iter().collect(),
                                },
                            );
                            name
                        }
                    };
                    let inames: Vec<String> = (0..operand.ndim())
                        .map(|d| {
                            state
                                .var_name_gen
                                .fresh(&format!("_{stored_name}_dim{d}"))
                        })
                        .collect();
                    let shape_exprs = shape_to_scalar_expression(operand.shape(), state);
                    domains.push(domain_for_shape(
                        &inames,
                        &shape_exprs,
                        &ReductionBounds::new(),
                    )?);
                    params.push(sub_array_ref(inames, stored_name));
                }
                KernelArg::Value(varg) => {
                    let binding = call.bindings().get(&varg.name).ok_or_else(|| {
                        LoweringError::Transform(crate::transform::TransformError::Other(
                            format!("no binding for callee input '{}'", varg.name),
                        ))
                    })?;
                    match binding {
                        KernelCallBinding::Array(operand) => {
                            let implemented = self.rec(operand, state)?;
                            params.push(
                                implemented.to_loop_expression(&[], &mut depends_on)?,
                            );
                        }
                        KernelCallBinding::Scalar(sexpr) => {
                            let namespace = IndexMap::new();
                            let no_descrs = BTreeMap::new();
                            let ctx = LocalExprContext {
                                num_indices: 0,
                                namespace: &namespace,
                                reduction_bounds: ReductionBounds::new(),
                                reduction_descrs: &no_descrs,
                            };
                            params.push(self.gen_expr(sexpr, state, &ctx, &mut depends_on)?);
                        }
                    }
                }
            }
        }

        let insn = Instruction {
            id: insn_id,
            assignees,
            expression: scalar::call(callee.name.clone(), params),
            within_inames: BTreeSet::new(),
            depends_on,
        };

        let kernel = state.kernel_mut();
        kernel.instructions.push(insn);
        kernel.temporary_variables.extend(new_temporaries);
        kernel.domains.extend(domains);

        Ok(())
    }
}

// ============================================================================
// Shapes and Domains
// ============================================================================

/// Shape components as loop-nest scalar expressions, registering any size
/// parameters they mention as kernel value arguments.
pub fn shape_to_scalar_expression(shape: &Shape, state: &mut CodeGenState) -> Vec<ScalarRef> {
    let mut result = Vec::with_capacity(shape.ndim());
    for component in shape.components() {
        match component {
            ShapeComponent::Const(n) => result.push(scalar::int(*n as i64)),
            ShapeComponent::Expr(e) => {
                for name in scalar::free_variables(e) {
                    state.register_size_param(&name);
                }
                result.push(e.clone());
            }
        }
    }
    result
}

/// The half-open box domain for an array of `shape` with reduction bounds
/// `reductions`: one set dimension per axis and per reduction iname,
/// parameter dimensions for the free size parameters.
pub fn domain_for_shape(
    dim_names: &[String],
    shape: &[ScalarRef],
    reductions: &ReductionBounds,
) -> Result<IterationDomain, LoweringError> {
    assert_eq!(dim_names.len(), shape.len());

    let mut bounds: Vec<DimBounds> = dim_names
        .iter()
        .zip(shape)
        .map(|(dim, extent)| DimBounds {
            dim: dim.clone(),
            lower: scalar::int(0),
            upper: extent.clone(),
        })
        .collect();
    for (iname, (lower, upper)) in reductions {
        bounds.push(DimBounds {
            dim: iname.clone(),
            lower: lower.clone(),
            upper: upper.clone(),
        });
    }
    Ok(IterationDomain::from_bounds(bounds)?)
}

// ============================================================================
// Stores and Substitutions
// ============================================================================

/// Add the instruction storing `expr` (implemented as `result`) into a
/// buffer named `name`, returning the instruction id.
///
/// Empty arrays are short-circuited: neither a domain nor an instruction
/// is emitted, only the argument or temporary.
pub fn add_store(
    name: &str,
    expr: &ArrayRef,
    result: &ImplementedResult,
    state: &mut CodeGenState,
    mapper: &CodeGenMapper,
    output_to_temporary: bool,
) -> Result<String, LoweringError> {
    let inames: Vec<String> = (0..expr.ndim())
        .map(|d| state.var_name_gen.fresh(&format!("{name}_dim{d}")))
        .collect();
    let indices: Vec<ScalarRef> = inames.iter().map(|i| scalar::var(i.clone())).collect();

    let mut depends_on: BTreeSet<String> = BTreeSet::new();
    let loop_expr = result.to_loop_expression(&indices, &mut depends_on)?;

    let insn_id = state.insn_id_gen.fresh(&format!("{name}_store"));
    let assignee = if indices.is_empty() {
        Assignee::Variable(name.to_string())
    } else {
        Assignee::Subscript {
            name: name.to_string(),
            indices,
        }
    };
    let insn = Instruction {
        id: insn_id.clone(),
        assignees: vec![assignee],
        expression: loop_expr,
        within_inames: inames.iter().cloned().collect(),
        depends_on,
    };

    let shape_exprs = shape_to_scalar_expression(expr.shape(), state);
    let domain = domain_for_shape(&inames, &shape_exprs, &ReductionBounds::new())?;

    let result_is_empty = expr.shape().is_empty_array();
    if result_is_empty {
        debug!(name, "empty array: suppressing store");
    }

    let array_tags = mapper.filtered_tags(expr.tags());
    {
        let kernel = state.kernel_mut();
        if output_to_temporary {
            kernel.temporary_variables.insert(
                name.to_string(),
                TemporaryVariable {
                    name: name.to_string(),
                    shape: shape_exprs,
                    dtype: expr.dtype(),
                    tags: array_tags,
                },
            );
        } else {
            kernel.args.push(KernelArg::Global(GlobalArg {
                name: name.to_string(),
                shape: shape_exprs,
                dtype: expr.dtype(),
                is_input: false,
                is_output: true,
                tags: array_tags,
            }));
        }
        if !result_is_empty {
            kernel.domains.push(domain);
            kernel.instructions.push(insn);
        }
    }

    // Per-axis tags follow the store's inames.
    if !result_is_empty {
        for (axis, iname) in expr.axes().iter().zip(&inames) {
            let tags = without_kinds(&axis.tags, &mapper.axis_tag_kinds_to_not_propagate);
            if !tags.is_empty() {
                state.kernel_mut().tag_iname(iname, tags);
            }
        }
    }

    Ok(insn_id)
}

/// Expose `expr` as a substitution rule over its `ndim` formal indices.
pub fn add_substitution(
    name: &str,
    expr: &ArrayRef,
    result: &ImplementedResult,
    state: &mut CodeGenState,
) -> Result<(), LoweringError> {
    let arguments: Vec<String> = (0..expr.ndim()).map(|d| format!("_{d}")).collect();
    let indices: Vec<ScalarRef> = (0..expr.ndim()).map(scalar::elem_index).collect();
    let mut depends_on = BTreeSet::new();
    let expression = result.to_loop_expression(&indices, &mut depends_on)?;

    state.kernel_mut().substitutions.insert(
        name.to_string(),
        crate::loopnest::SubstitutionRule {
            name: name.to_string(),
            arguments,
            expression,
        },
    );
    Ok(())
}

// ============================================================================
// generate_kernel
// ============================================================================

/// Options of [`generate_kernel`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeGenConfig {
    pub function_name: String,
    /// When unset, `return_dict` follows the shape of the passed outputs.
    pub options: Option<KernelOptionsConfig>,
    pub array_tag_kinds_to_not_propagate: BTreeSet<TagKind>,
    pub axis_tag_kinds_to_not_propagate: BTreeSet<TagKind>,
}

/// Serializable mirror of [`KernelOptions`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct KernelOptionsConfig {
    pub return_dict: bool,
    pub enforce_bounds_checks: bool,
}

impl From<KernelOptionsConfig> for KernelOptions {
    fn from(config: KernelOptionsConfig) -> Self {
        KernelOptions {
            return_dict: config.return_dict,
            enforce_bounds_checks: config.enforce_bounds_checks,
        }
    }
}

impl Default for CodeGenConfig {
    fn default() -> Self {
        CodeGenConfig {
            function_name: "_al_kernel".to_string(),
            options: None,
            array_tag_kinds_to_not_propagate: [
                TagKind::ImplStored,
                TagKind::Named,
                TagKind::PrefixNamed,
            ]
            .into_iter()
            .collect(),
            axis_tag_kinds_to_not_propagate: BTreeSet::new(),
        }
    }
}

/// Code generation entry point: preprocess `result` and lower it to a
/// loop-nest translation unit bound to the captured data.
pub fn generate_kernel(
    result: &ArrayOrNames,
    config: &CodeGenConfig,
) -> Result<BoundProgram, LoweringError> {
    let result_is_dict = matches!(result, ArrayOrNames::Dict(_));
    let orig_outputs = normalize_outputs(result)?;

    let preproc_result = preprocess(&orig_outputs)?;

    // Stored outputs would be written to a temporary and immediately
    // copied to the output buffer; dropping the tag avoids the redundant
    // store-load pair. Must happen after inlining.
    let mut stripped: IndexMap<String, ArrayRef> = IndexMap::new();
    for (name, output) in preproc_result.outputs.entries() {
        let new_output = if output.is_input_argument() {
            output.clone()
        } else {
            output.without_tags_of_kind(TagKind::ImplStored)
        };
        stripped.insert(name.clone(), new_output);
    }
    let outputs = crate::array::DictOfNamedArrays::new(
        stripped,
        preproc_result.outputs.tags().clone(),
    );

    let options = match config.options {
        Some(opts) => {
            if opts.return_dict != result_is_dict {
                return Err(LoweringError::ReturnDictMismatch);
            }
            opts.into()
        }
        None => KernelOptions {
            return_dict: result_is_dict,
            enforce_bounds_checks: true,
        },
    };

    let mut state = CodeGenState::new(&config.function_name, options);

    // Seed the name generator with input and output names.
    let mut gatherer = InputGatherer::new();
    let mut seed_names: BTreeSet<String> = BTreeSet::new();
    for name in &preproc_result.compute_order {
        let expr = outputs.entries().get(name).ok_or_else(|| {
            LoweringError::Transform(crate::transform::TransformError::Other(format!(
                "compute order names unknown output '{name}'"
            )))
        })?;
        for input in gatherer.rec(expr).values() {
            if let Some(input_name) = input.name() {
                seed_names.insert(input_name.to_string());
            }
        }
    }
    seed_names.extend(outputs.entries().keys().cloned());
    state.var_name_gen.add_names(seed_names);

    let mut cg_mapper = CodeGenMapper::new(
        config.array_tag_kinds_to_not_propagate.clone(),
        config.axis_tag_kinds_to_not_propagate.clone(),
    );

    // One store per named output, in dependency order.
    for name in &preproc_result.compute_order {
        let expr = outputs.entries()[name].clone();
        let implemented = cg_mapper.rec(&expr, &mut state)?;
        let insn_id = add_store(name, &expr, &implemented, &mut state, &cg_mapper, false)?;
        state.results.insert(
            expr.id(),
            ImplementedResult::Stored {
                name: name.clone(),
                num_indices: expr.ndim(),
                depends_on: [insn_id].into_iter().collect(),
            },
        );
    }

    // Repeated inlined subexpressions can reuse a reduction iname across
    // instructions; uniquify before handing the kernel out.
    let mut t_unit = make_reduction_inames_unique(state.t_unit);

    // Without externally authored kernels every access is provably in
    // bounds by construction.
    if !state.has_kernel_call {
        t_unit.default_entrypoint_mut().options.enforce_bounds_checks = false;
    }

    Ok(BoundProgram {
        program: t_unit,
        bound_arguments: preproc_result.bound_arguments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::builders;
    use crate::scalar::BinaryOp;
    use crate::value::DType;

    fn lower_single(expr: ArrayRef) -> BoundProgram {
        generate_kernel(&ArrayOrNames::Array(expr), &CodeGenConfig::default())
            .expect("lowering succeeds")
    }

    #[test]
    fn test_placeholder_becomes_input_argument() {
        let x = builders::make_placeholder("x", Shape::of_consts(&[4]), DType::Float64)
            .expect("valid placeholder");
        let y = builders::elementwise_binary(BinaryOp::Add, &x, &x).expect("valid sum");
        let program = lower_single(y);
        let kernel = program.program.default_entrypoint();

        let arg = kernel.arg("x").expect("input argument present");
        match arg {
            KernelArg::Global(g) => {
                assert!(g.is_input);
                assert!(!g.is_output);
                assert_eq!(g.dtype, DType::Float64);
            }
            other => panic!("expected a global argument, got {other:?}"),
        }
        let out = kernel.arg("_al_out").expect("output argument present");
        match out {
            KernelArg::Global(g) => assert!(g.is_output),
            other => panic!("expected a global argument, got {other:?}"),
        }
        assert_eq!(kernel.instructions.len(), 1);
        assert_eq!(
            kernel.instructions[0].expression.to_string(),
            "(x[_al_out_dim0] + x[_al_out_dim0])"
        );
        // No hand-written kernels: bounds checking is off.
        assert!(!kernel.options.enforce_bounds_checks);
    }

    #[test]
    fn test_store_dependencies_thread_through() {
        use crate::array::ArrayRefExt;
        use crate::tags::Tag;

        let x = builders::make_placeholder("x", Shape::of_consts(&[4]), DType::Float64)
            .expect("valid placeholder");
        let stored = builders::elementwise_binary(BinaryOp::Mul, &x, &x)
            .expect("valid product")
            .tagged(Tag::ImplStored);
        let y =
            builders::elementwise_binary(BinaryOp::Add, &stored, &x).expect("valid sum");
        let program = lower_single(y);
        let kernel = program.program.default_entrypoint();

        // One store for the temporary, one for the output.
        assert_eq!(kernel.instructions.len(), 2);
        let temp_store = &kernel.instructions[0];
        let out_store = &kernel.instructions[1];
        assert!(temp_store.id.contains("_al_temp"));
        assert!(out_store.depends_on.contains(&temp_store.id));
        assert!(kernel.temporary_variables.contains_key("_al_temp"));
    }

    #[test]
    fn test_empty_array_suppresses_store() {
        let x = builders::make_placeholder("x", Shape::of_consts(&[0, 3]), DType::Float64)
            .expect("valid placeholder");
        let y = builders::elementwise_binary(BinaryOp::Add, &x, &x).expect("valid sum");
        let program = lower_single(y);
        let kernel = program.program.default_entrypoint();
        assert!(kernel.instructions.is_empty());
        assert!(kernel.domains.is_empty());
        // The output argument itself still exists.
        assert!(kernel.arg("_al_out").is_some());
    }

    #[test]
    fn test_size_params_become_value_args() {
        let n = ShapeComponent::Expr(scalar::var("n"));
        let x = builders::make_placeholder("x", Shape(vec![n]), DType::Float64)
            .expect("valid placeholder");
        let y = builders::elementwise_binary(BinaryOp::Add, &x, &x).expect("valid sum");
        let program = lower_single(y);
        let kernel = program.program.default_entrypoint();
        match kernel.arg("n").expect("size parameter registered") {
            KernelArg::Value(v) => assert_eq!(v.dtype, DType::Int64),
            other => panic!("expected a value argument, got {other:?}"),
        }
        // The store's domain is parametric in n.
        let store_domain = kernel
            .domains
            .iter()
            .find(|d| d.set_dims().iter().any(|dim| dim.starts_with("_al_out")))
            .expect("store domain present");
        assert_eq!(store_domain.params(), &["n"]);
    }

    #[test]
    fn test_named_tag_picks_output_buffer_name() {
        use crate::array::ArrayRefExt;
        use crate::tags::Tag;

        let x = builders::make_placeholder("x", Shape::of_consts(&[4]), DType::Float64)
            .expect("valid placeholder");
        let stored = builders::elementwise_binary(BinaryOp::Mul, &x, &x)
            .expect("valid product")
            .tagged(Tag::ImplStored)
            .tagged(Tag::Named("xsq".into()));
        let y =
            builders::elementwise_binary(BinaryOp::Add, &stored, &x).expect("valid sum");
        let program = lower_single(y);
        let kernel = program.program.default_entrypoint();
        assert!(kernel.temporary_variables.contains_key("xsq"));
    }

    #[test]
    fn test_substitution_strategy_emits_rule() {
        use crate::array::ArrayRefExt;
        use crate::tags::Tag;

        let x = builders::make_placeholder("x", Shape::of_consts(&[4]), DType::Float64)
            .expect("valid placeholder");
        let subst = builders::elementwise_binary(BinaryOp::Mul, &x, &x)
            .expect("valid product")
            .tagged(Tag::ImplSubstitution);
        let y = builders::elementwise_binary(BinaryOp::Add, &subst, &x).expect("valid sum");
        let program = lower_single(y);
        let kernel = program.program.default_entrypoint();
        assert_eq!(kernel.substitutions.len(), 1);
        let rule = kernel.substitutions.values().next().expect("one rule");
        assert_eq!(rule.arguments, vec!["_0"]);
        // The output store reads through a call to the rule.
        assert!(kernel.instructions[0]
            .expression
            .to_string()
            .contains(&format!("{}(", rule.name)));
    }
}
