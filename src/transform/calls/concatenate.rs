//! # Call Concatenation
//!
//! Fuses structurally-similar call sites into a single batched call by
//! concatenating their inputs along a chosen axis and slicing the batched
//! returns back apart:
//!
//! ```text
//! r1 = f(x1)[out]   (x1: 4x3)          X = concat(x1, x2, axis=0)
//! r2 = f(x2)[out]   (x2: 7x3)   ==>    R = f(X)[out]      (X: 11x3)
//!                                      r1 = R[0:4],  r2 = R[4:11]
//! ```
//!
//! The transformation is semantics-preserving: each original result equals
//! the corresponding slice of the batched return.
//!
//! The analysis proceeds in three phases:
//!
//! 1. **Admissibility**: for every node of the function body, derive along
//!    which axes it could be the concatenation of its siblings
//!    ([`Concatenatability`]), propagating requirements from the scalar
//!    expressions of index lambdas down to the function inputs.
//! 2. **Plan selection**: intersect the per-output requirement maps into
//!    [`FunctionConcatenability`] candidates and validate each against the
//!    concrete call sites (axis lengths, dtypes, constant operands) until
//!    one survives.
//! 3. **Rewrite**: build the batched function body, the concatenated
//!    bindings, the single call, and the per-site output slices; then
//!    splice the slices over the original call results.
//!
//! Only single-level call graphs are supported: call sites whose bodies
//! contain further calls are rejected.

use crate::array::{
    array_refs_equal, builders, Array, ArrayKind, ArrayOrNames, ArrayRef, ArrayRefExt, CallRef,
    NodeId, Shape, ShapeComponent, shape_components_equal,
};
use crate::function::{Call, FunctionDefinition, FunctionRef};
use crate::scalar::{ScalarExpr, ScalarRef};
use crate::tags::{Tag, TagKind, without_kinds};
use crate::transform::lower_to_index_lambda::to_index_lambda;
use crate::transform::{
    CallOrDict, CopyMapper, CopyMapperBase, Deduplicator, MapperPolicy, TransformError,
};
use indexmap::IndexMap;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum ConcatError {
    #[error("no valid concatenatability found for function with identifier '{0}'")]
    NoValidCandidate(String),
    #[error("not enough call sites to concatenate function with identifier '{0}'")]
    NotEnoughCalls(String),
    #[error("concatenation of nested calls is not supported")]
    NestedCall,
    #[error("cycle in the call-site dependency graph")]
    CallSiteCycle,
    #[error("call site participating in concatenation lacks a FunctionIdentifier tag")]
    MissingFunctionIdentifier,
    #[error(transparent)]
    Transform(#[from] TransformError),
    #[error(transparent)]
    Array(#[from] crate::array::ArrayError),
}

/// Candidate-local rejection; the driver moves on to the next candidate.
#[derive(Debug, Error)]
#[error("{0}")]
struct InvalidConcatenatability(String);

/// Scalar-expression-level marker: the inspected axis cannot be
/// concatenated.
struct NonConcatable;

// ============================================================================
// Concatenatability
// ============================================================================

/// How an array in a function body may relate to the corresponding arrays
/// of the sibling call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Concatenatability {
    /// The node is the concatenation of its siblings along this axis.
    AlongAxis(usize),
    /// The node is admissible only if it is identical across sites.
    IfConstant,
}

impl fmt::Display for Concatenatability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Concatenatability::AlongAxis(axis) => write!(f, "concat@{axis}"),
            Concatenatability::IfConstant => write!(f, "constant"),
        }
    }
}

/// One valid concatenation criterion for a function definition: a
/// consistent assignment of concatenatabilities to every output and every
/// parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionConcatenability {
    pub output_to_concatenatability: BTreeMap<String, Concatenatability>,
    pub input_to_concatenatability: BTreeMap<String, Concatenatability>,
}

impl fmt::Display for FunctionConcatenability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "outputs:")?;
        for (name, concat) in &self.output_to_concatenatability {
            writeln!(f, "  {name} => {concat}")?;
        }
        writeln!(f, "inputs:")?;
        for (name, concat) in &self.input_to_concatenatability {
            writeln!(f, "  {name} => {concat}")?;
        }
        Ok(())
    }
}

// ============================================================================
// Options
// ============================================================================

/// Options of [`concatenate_calls`].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ConcatenateOptions {
    /// Tag output slice / input concat axes with
    /// [`Tag::UseInputAxis`] instead of the generic markers.
    pub inherit_axes: bool,
    /// Warn when a batch holds fewer than two call sites.
    pub warn_if_no_calls: bool,
    /// Treat an undersized batch as an error.
    pub err_if_no_calls: bool,
    /// Tag kinds ignored by the call-site similarity comparison.
    pub ignore_tag_kinds: BTreeSet<TagKind>,
}

impl Default for ConcatenateOptions {
    fn default() -> Self {
        ConcatenateOptions {
            inherit_axes: false,
            warn_if_no_calls: true,
            err_if_no_calls: false,
            ignore_tag_kinds: BTreeSet::new(),
        }
    }
}

// ============================================================================
// Call-Site Locations and Dependencies
// ============================================================================

/// A call site's location in the expression: the call plus the stack of
/// enclosing calls (outermost first).
#[derive(Debug, Clone)]
pub struct CallSiteLocation {
    pub call: CallRef,
    pub stack: Vec<CallRef>,
}

impl CallSiteLocation {
    fn key(&self) -> (Vec<NodeId>, NodeId) {
        (
            self.stack.iter().map(|c| c.id()).collect(),
            self.call.id(),
        )
    }
}

impl PartialEq for CallSiteLocation {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for CallSiteLocation {}

impl PartialOrd for CallSiteLocation {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CallSiteLocation {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key().cmp(&other.key())
    }
}

impl std::hash::Hash for CallSiteLocation {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

/// Collects every call site in `expr` along with the call sites each one
/// depends on (through its bindings or from within its function body).
#[derive(Default)]
struct CallSiteDependencyCollector {
    call_site_to_deps: BTreeMap<CallSiteLocation, BTreeSet<CallSiteLocation>>,
}

impl CallSiteDependencyCollector {
    fn collect(
        &mut self,
        expr: &ArrayOrNames,
    ) -> BTreeSet<CallSiteLocation> {
        let mut cache: HashMap<NodeId, BTreeSet<CallSiteLocation>> = HashMap::new();
        match expr {
            ArrayOrNames::Array(a) => self.rec(a, &[], &mut cache),
            ArrayOrNames::Dict(d) => {
                let mut acc = BTreeSet::new();
                for ary in d.entries().values() {
                    acc.extend(self.rec(ary, &[], &mut cache));
                }
                acc
            }
        }
    }

    fn rec(
        &mut self,
        expr: &ArrayRef,
        stack: &[CallRef],
        cache: &mut HashMap<NodeId, BTreeSet<CallSiteLocation>>,
    ) -> BTreeSet<CallSiteLocation> {
        if let Some(hit) = cache.get(&expr.id()) {
            return hit.clone();
        }
        let result = if let ArrayKind::CallResult { call, .. } = expr.kind() {
            let cs = CallSiteLocation {
                call: call.clone(),
                stack: stack.to_vec(),
            };

            let mut deps: BTreeSet<CallSiteLocation> = BTreeSet::new();
            for binding in call.bindings().values() {
                deps.extend(self.rec(binding, stack, cache));
            }
            let mut callee_stack = stack.to_vec();
            callee_stack.push(call.clone());
            let mut callee_cache: HashMap<NodeId, BTreeSet<CallSiteLocation>> = HashMap::new();
            for ret in call.function().returns().values() {
                deps.extend(self.rec(ret, &callee_stack, &mut callee_cache));
            }

            self.call_site_to_deps
                .entry(cs.clone())
                .or_insert_with(|| deps.clone());

            let mut result = deps;
            result.insert(cs);
            result
        } else {
            let mut acc = BTreeSet::new();
            for child in crate::function::child_arrays(expr) {
                acc.extend(self.rec(&child, stack, cache));
            }
            acc
        };
        cache.insert(expr.id(), result.clone());
        result
    }
}

// ============================================================================
// Scalar-Expression Concatenability
// ============================================================================

/// Derive, from an index lambda's scalar expression, which axis of each
/// binding must be concatenated so that the lambda's `iaxis`-axis is the
/// concatenation of its siblings'.
///
/// Rules: `_iaxis` itself indexes only the output and is never
/// concatenatable. A subscript index equal to `_iaxis` demands
/// concatenation of the operand along that subscript position; `_iaxis`
/// buried inside a nontrivial index expression is indirect addressing,
/// allowed only for gather-like nodes and only with a constant indexee.
/// Constants and reduction indices impose no constraint.
fn binding_concatenability(
    expr: &ScalarRef,
    iaxis: usize,
    allow_indirect_addr: bool,
) -> Result<BTreeMap<String, Concatenatability>, NonConcatable> {
    let axis_var = format!("_{iaxis}");

    fn merge(
        into: &mut BTreeMap<String, Concatenatability>,
        from: BTreeMap<String, Concatenatability>,
    ) -> Result<(), NonConcatable> {
        for (name, concat) in from {
            match into.get(&name) {
                Some(existing) if *existing != concat => {
                    // Only one axis of a binding can be concatenated.
                    return Err(NonConcatable);
                }
                Some(_) => {}
                None => {
                    into.insert(name, concat);
                }
            }
        }
        Ok(())
    }

    fn go(
        expr: &ScalarRef,
        axis_var: &str,
        allow_indirect_addr: bool,
    ) -> Result<BTreeMap<String, Concatenatability>, NonConcatable> {
        match &**expr {
            ScalarExpr::Variable(name) => {
                if name == axis_var {
                    Err(NonConcatable)
                } else {
                    Ok(BTreeMap::new())
                }
            }
            ScalarExpr::Constant(_) => Ok(BTreeMap::new()),
            ScalarExpr::Subscript { array, indices } => {
                let mut combined: BTreeMap<String, Concatenatability> = BTreeMap::new();
                for (position, index) in indices.iter().enumerate() {
                    let is_axis_var =
                        matches!(&**index, ScalarExpr::Variable(n) if n == axis_var);
                    if is_axis_var {
                        merge(
                            &mut combined,
                            [(array.clone(), Concatenatability::AlongAxis(position))]
                                .into_iter()
                                .collect(),
                        )?;
                    } else {
                        let rec_index = go(index, axis_var, allow_indirect_addr)?;
                        if !rec_index.is_empty() && !allow_indirect_addr {
                            return Err(NonConcatable);
                        }
                        // Indirect addressing: sound only when the indexee
                        // is the same across the sibling graphs.
                        merge(&mut combined, rec_index)?;
                    }
                }
                if !combined.contains_key(array) {
                    combined.insert(array.clone(), Concatenatability::IfConstant);
                }
                Ok(combined)
            }
            ScalarExpr::Unary { inner, .. } | ScalarExpr::Cast { inner, .. } => {
                go(inner, axis_var, allow_indirect_addr)
            }
            ScalarExpr::Binary { left, right, .. }
            | ScalarExpr::Comparison { left, right, .. } => {
                let mut combined = go(left, axis_var, allow_indirect_addr)?;
                merge(&mut combined, go(right, axis_var, allow_indirect_addr)?)?;
                Ok(combined)
            }
            ScalarExpr::If {
                condition,
                then,
                otherwise,
            } => {
                let mut combined = go(condition, axis_var, allow_indirect_addr)?;
                merge(&mut combined, go(then, axis_var, allow_indirect_addr)?)?;
                merge(&mut combined, go(otherwise, axis_var, allow_indirect_addr)?)?;
                Ok(combined)
            }
            ScalarExpr::Call { args, .. } => {
                let mut combined = BTreeMap::new();
                for arg in args {
                    merge(&mut combined, go(arg, axis_var, allow_indirect_addr)?)?;
                }
                Ok(combined)
            }
            ScalarExpr::Reduce { bounds, inner, .. } => {
                let mut combined = go(inner, axis_var, allow_indirect_addr)?;
                for (lo, hi) in bounds.values() {
                    merge(&mut combined, go(lo, axis_var, allow_indirect_addr)?)?;
                    merge(&mut combined, go(hi, axis_var, allow_indirect_addr)?)?;
                }
                Ok(combined)
            }
            ScalarExpr::SubArrayRef { .. } => Err(NonConcatable),
        }
    }

    go(expr, &axis_var, allow_indirect_addr)
}

// ============================================================================
// Input-Concatenability Accumulator
// ============================================================================

/// Constraints a node's concatenation induces on the function inputs: for
/// each way the node could be concatenated, the required per-input
/// concatenatabilities. Axes missing from the map are not concatenatable.
#[derive(Debug, Clone)]
struct InputConcatAcc {
    seen_inputs: BTreeMap<NodeId, ArrayRef>,
    input_concatability:
        BTreeMap<Concatenatability, BTreeMap<NodeId, (ArrayRef, Concatenatability)>>,
}

/// Intersect operand constraint maps: a node-level concatenatability
/// survives only if every operand admits its required concatenatability
/// with a consistent per-input assignment.
fn combine_input_accs(
    operand_accs: &[InputConcatAcc],
    expr_concat_to_operand_concats: BTreeMap<Concatenatability, Vec<Concatenatability>>,
) -> InputConcatAcc {
    let mut seen_inputs: BTreeMap<NodeId, ArrayRef> = BTreeMap::new();
    for acc in operand_accs {
        seen_inputs.extend(acc.seen_inputs.clone());
    }

    let mut input_concatability = BTreeMap::new();

    'candidates: for (out_concat, operand_concats) in expr_concat_to_operand_concats {
        let mut merged: BTreeMap<NodeId, (ArrayRef, Concatenatability)> = BTreeMap::new();
        for (operand_concat, operand_acc) in operand_concats.iter().zip(operand_accs) {
            let Some(required) = operand_acc.input_concatability.get(operand_concat) else {
                // The operand cannot be concatenated the required way.
                continue 'candidates;
            };
            for (id, (input, concat)) in required {
                match merged.get(id) {
                    Some((_, existing)) if existing != concat => continue 'candidates,
                    Some(_) => {}
                    None => {
                        merged.insert(*id, (input.clone(), *concat));
                    }
                }
            }
        }
        input_concatability.insert(out_concat, merged);
    }

    InputConcatAcc {
        seen_inputs,
        input_concatability,
    }
}

/// Computes [`InputConcatAcc`]s across the corresponding nodes of all
/// sibling call sites (`exprs[0]` is the template).
#[derive(Default)]
struct InputConcatGetter {
    cache: HashMap<Vec<NodeId>, InputConcatAcc>,
}

impl InputConcatGetter {
    fn rec(&mut self, exprs: &[ArrayRef]) -> Result<InputConcatAcc, ConcatError> {
        let key: Vec<NodeId> = exprs.iter().map(|e| e.id()).collect();
        if let Some(hit) = self.cache.get(&key) {
            return Ok(hit.clone());
        }
        let template = &exprs[0];
        let acc = match template.kind() {
            ArrayKind::Placeholder { .. }
            | ArrayKind::DataWrapper { .. }
            | ArrayKind::SizeParam { .. } => {
                let mut input_concatability = BTreeMap::new();
                for idim in 0..template.ndim() {
                    input_concatability.insert(
                        Concatenatability::AlongAxis(idim),
                        [(
                            template.id(),
                            (template.clone(), Concatenatability::AlongAxis(idim)),
                        )]
                        .into_iter()
                        .collect(),
                    );
                }
                input_concatability.insert(
                    Concatenatability::IfConstant,
                    [(
                        template.id(),
                        (template.clone(), Concatenatability::IfConstant),
                    )]
                    .into_iter()
                    .collect(),
                );
                InputConcatAcc {
                    seen_inputs: [(template.id(), template.clone())].into_iter().collect(),
                    input_concatability,
                }
            }
            ArrayKind::CallResult { .. } => return Err(ConcatError::NestedCall),
            ArrayKind::KernelCallResult { .. } => {
                return Err(ConcatError::Transform(TransformError::Other(
                    "external kernel calls cannot be concatenated; rewrite them as array \
                     operations"
                        .into(),
                )))
            }
            _ => {
                let allow_indirect = matches!(
                    template.kind(),
                    ArrayKind::AdvancedIndexContiguous { .. }
                        | ArrayKind::AdvancedIndexNonContiguous { .. }
                );
                self.rec_index_lambda_like(exprs, allow_indirect)?
            }
        };
        self.cache.insert(key, acc.clone());
        Ok(acc)
    }

    fn rec_index_lambda_like(
        &mut self,
        exprs: &[ArrayRef],
        allow_indirect_addr: bool,
    ) -> Result<InputConcatAcc, ConcatError> {
        let lambdas: Vec<ArrayRef> = exprs
            .iter()
            .map(to_index_lambda)
            .collect::<Result<_, _>>()?;
        let template = &lambdas[0];
        let binding_names = match template.kind() {
            ArrayKind::IndexLambda { bindings, .. } => {
                bindings.keys().cloned().collect::<Vec<String>>()
            }
            _ => unreachable!("to_index_lambda returns an index lambda"),
        };
        let mut sorted_names = binding_names;
        sorted_names.sort();

        let mut operand_accs: Vec<InputConcatAcc> = Vec::with_capacity(sorted_names.len());
        for name in &sorted_names {
            let operands: Vec<ArrayRef> = lambdas
                .iter()
                .map(|l| match l.kind() {
                    ArrayKind::IndexLambda { bindings, .. } => {
                        bindings.get(name).cloned().ok_or_else(|| {
                            ConcatError::Transform(TransformError::Other(format!(
                                "sibling body lacks binding '{name}'"
                            )))
                        })
                    }
                    _ => unreachable!("to_index_lambda returns an index lambda"),
                })
                .collect::<Result<_, _>>()?;
            operand_accs.push(self.rec(&operands)?);
        }

        let mut expr_concat_to_operand_concats: BTreeMap<Concatenatability, Vec<Concatenatability>> =
            BTreeMap::new();

        for iaxis in 0..template.ndim() {
            // A length-1 axis may have been dropped from the scalar
            // expression; look at the sibling bodies for one with a
            // nontrivial extent before judging the axis.
            let mut derived: Option<BTreeMap<String, Concatenatability>> = None;
            let mut invalid = false;
            for lambda in &lambdas {
                if lambda.shape().components()[iaxis].is_one() {
                    continue;
                }
                let body = match lambda.kind() {
                    ArrayKind::IndexLambda { expr, .. } => expr,
                    _ => unreachable!("to_index_lambda returns an index lambda"),
                };
                match binding_concatenability(body, iaxis, allow_indirect_addr) {
                    Ok(map) => {
                        if derived.is_none() {
                            derived = Some(map);
                        }
                    }
                    Err(NonConcatable) => {
                        invalid = true;
                        break;
                    }
                }
            }
            if invalid {
                continue;
            }
            let Some(bnd_name_to_concat) = derived else {
                continue;
            };
            let requirements: Vec<Concatenatability> = sorted_names
                .iter()
                .map(|name| {
                    bnd_name_to_concat
                        .get(name)
                        .copied()
                        .unwrap_or(Concatenatability::IfConstant)
                })
                .collect();
            expr_concat_to_operand_concats
                .insert(Concatenatability::AlongAxis(iaxis), requirements);
        }

        expr_concat_to_operand_concats.insert(
            Concatenatability::IfConstant,
            sorted_names
                .iter()
                .map(|_| Concatenatability::IfConstant)
                .collect(),
        );

        Ok(combine_input_accs(
            &operand_accs,
            expr_concat_to_operand_concats,
        ))
    }
}

// ============================================================================
// Candidate Enumeration
// ============================================================================

/// Candidates in which every output and every input concatenate along the
/// same axis (or are constant); a quick linear pass that suffices for
/// typical workloads.
fn valid_constraints_simple(
    call_sites: &[CallRef],
) -> Result<Vec<FunctionConcatenability>, ConcatError> {
    let template_fn = call_sites[0].function();
    let mut getter = InputConcatGetter::default();

    let mut output_accs: BTreeMap<String, InputConcatAcc> = BTreeMap::new();
    for name in template_fn.returns().keys() {
        let outputs: Vec<ArrayRef> = call_sites
            .iter()
            .map(|cs| {
                cs.function().returns().get(name).cloned().ok_or_else(|| {
                    ConcatError::Transform(TransformError::Other(format!(
                        "call site lacks return '{name}'"
                    )))
                })
            })
            .collect::<Result<_, _>>()?;
        output_accs.insert(name.clone(), getter.rec(&outputs)?);
    }

    let mut candidate_axes: BTreeSet<Concatenatability> = BTreeSet::new();
    for acc in output_accs.values() {
        candidate_axes.extend(acc.input_concatability.keys().copied());
    }

    let mut input_args: BTreeMap<NodeId, ArrayRef> = BTreeMap::new();
    for acc in output_accs.values() {
        input_args.extend(acc.seen_inputs.clone());
    }

    let mut valid = Vec::new();
    for candidate in candidate_axes {
        let admissible = output_accs.values().all(|acc| {
            acc.input_concatability
                .get(&candidate)
                .is_some_and(|required| {
                    required.values().all(|(_, input_concat)| {
                        *input_concat == candidate
                            || *input_concat == Concatenatability::IfConstant
                    })
                })
        });
        if admissible {
            let outputs = output_accs
                .keys()
                .map(|name| (name.clone(), candidate))
                .collect();
            let inputs = input_args
                .values()
                .filter_map(|input| match input.kind() {
                    ArrayKind::Placeholder { name } => Some((name.clone(), candidate)),
                    _ => None,
                })
                .collect();
            valid.push(FunctionConcatenability {
                output_to_concatenatability: outputs,
                input_to_concatenatability: inputs,
            });
        }
    }
    Ok(valid)
}

/// Exhaustive candidate enumeration over per-output axis choices. The
/// candidate count grows with the product of per-output possibilities;
/// intended for hard cases where the simple search comes up empty.
pub fn valid_constraints_exhaustive(
    function: &FunctionRef,
) -> Result<Vec<FunctionConcatenability>, ConcatError> {
    let mut getter = InputConcatGetter::default();
    let mut output_accs: Vec<(String, InputConcatAcc)> = Vec::new();
    for (name, ret) in function.returns() {
        output_accs.push((name.clone(), getter.rec(std::slice::from_ref(ret))?));
    }

    let mut valid = Vec::new();
    let mut choices: Vec<(String, Concatenatability)> = Vec::new();

    fn search(
        output_accs: &[(String, InputConcatAcc)],
        depth: usize,
        choices: &mut Vec<(String, Concatenatability)>,
        merged: &BTreeMap<NodeId, (ArrayRef, Concatenatability)>,
        valid: &mut Vec<FunctionConcatenability>,
    ) {
        if depth == output_accs.len() {
            let outputs = choices.iter().cloned().collect();
            let inputs = merged
                .values()
                .filter_map(|(input, concat)| match input.kind() {
                    ArrayKind::Placeholder { name } => Some((name.clone(), *concat)),
                    _ => None,
                })
                .collect();
            valid.push(FunctionConcatenability {
                output_to_concatenatability: outputs,
                input_to_concatenatability: inputs,
            });
            return;
        }
        let (name, acc) = &output_accs[depth];
        for (concat, required) in &acc.input_concatability {
            let mut next = merged.clone();
            let mut consistent = true;
            for (id, (input, input_concat)) in required {
                match next.get(id) {
                    Some((_, existing)) if existing != input_concat => {
                        consistent = false;
                        break;
                    }
                    Some(_) => {}
                    None => {
                        next.insert(*id, (input.clone(), *input_concat));
                    }
                }
            }
            if consistent {
                choices.push((name.clone(), *concat));
                search(output_accs, depth + 1, choices, &next, valid);
                choices.pop();
            }
        }
    }

    search(
        &output_accs,
        0,
        &mut choices,
        &BTreeMap::new(),
        &mut valid,
    );
    Ok(valid)
}

// ============================================================================
// Plan Validation
// ============================================================================

fn have_same_axis_length(arrays: &[ArrayRef], iaxis: usize) -> bool {
    let reference = &arrays[0].shape().components()[iaxis];
    arrays[1..]
        .iter()
        .all(|a| shape_components_equal(&a.shape().components()[iaxis], reference))
}

fn have_same_axis_length_except(arrays: &[ArrayRef], iaxis: usize) -> bool {
    let ndim = arrays[0].ndim();
    arrays.iter().all(|a| a.ndim() == ndim)
        && (0..ndim)
            .filter(|&idim| idim != iaxis)
            .all(|idim| have_same_axis_length(arrays, idim))
}

fn verify_arrays_can_be_concated_along_axis(
    arrays: &[ArrayRef],
    check_dtype: bool,
    check_name: bool,
    iaxis: usize,
) -> Result<(), InvalidConcatenatability> {
    if !have_same_axis_length_except(arrays, iaxis) {
        return Err(InvalidConcatenatability(
            "axis lengths are incompatible".into(),
        ));
    }
    if check_dtype && arrays[1..].iter().any(|a| a.dtype() != arrays[0].dtype()) {
        return Err(InvalidConcatenatability("dtype varies across calls".into()));
    }
    if check_name {
        let name = arrays[0].name();
        if arrays[1..].iter().any(|a| a.name() != name) {
            return Err(InvalidConcatenatability("name varies across calls".into()));
        }
    }
    // Slicing the batched outputs requires concrete extents.
    for ary in arrays {
        if ary.shape().components()[iaxis].as_const().is_none() {
            return Err(InvalidConcatenatability(
                "concatenation axis has a symbolic length".into(),
            ));
        }
    }
    Ok(())
}

fn verify_arrays_same(arrays: &[ArrayRef]) -> Result<(), InvalidConcatenatability> {
    if arrays[1..].iter().any(|a| !array_refs_equal(a, &arrays[0])) {
        return Err(InvalidConcatenatability(
            "arrays are not the same across calls".into(),
        ));
    }
    Ok(())
}

fn get_concatenated_shape(arrays: &[ArrayRef], iaxis: usize) -> Shape {
    let total: u64 = arrays
        .iter()
        .filter_map(|a| a.shape().components()[iaxis].as_const())
        .sum();
    Shape(
        arrays[0]
            .shape()
            .components()
            .iter()
            .enumerate()
            .map(|(idim, component)| {
                if idim == iaxis {
                    ShapeComponent::Const(total)
                } else {
                    component.clone()
                }
            })
            .collect(),
    )
}

/// Validates a candidate plan against the concrete function bodies and
/// records the resulting per-node concatenatabilities.
#[derive(Default)]
struct ConcatabilityCollector {
    ary_to_concatenatability: HashMap<NodeId, Concatenatability>,
    checked: HashSet<Vec<NodeId>>,
}

impl ConcatabilityCollector {
    fn record(
        &mut self,
        expr: &ArrayRef,
        concat: Concatenatability,
    ) -> Result<bool, InvalidConcatenatability> {
        match self.ary_to_concatenatability.get(&expr.id()) {
            Some(existing) if *existing != concat => Err(InvalidConcatenatability(format!(
                "node requires both {existing} and {concat}"
            ))),
            Some(_) => Ok(false),
            None => {
                self.ary_to_concatenatability.insert(expr.id(), concat);
                Ok(true)
            }
        }
    }

    fn check(
        &mut self,
        exprs: &[ArrayRef],
        concat: Concatenatability,
    ) -> Result<(), InvalidConcatenatability> {
        let key: Vec<NodeId> = exprs.iter().map(|e| e.id()).collect();
        if !self.checked.insert(key) {
            // Revisit with the same siblings: only the recorded
            // concatenatability must agree.
            self.record(&exprs[0], concat)?;
            return Ok(());
        }
        let template = &exprs[0];
        match template.kind() {
            ArrayKind::Placeholder { .. }
            | ArrayKind::DataWrapper { .. }
            | ArrayKind::SizeParam { .. } => {
                match concat {
                    Concatenatability::IfConstant => verify_arrays_same(exprs)?,
                    Concatenatability::AlongAxis(axis) => {
                        verify_arrays_can_be_concated_along_axis(exprs, true, true, axis)?;
                    }
                }
                self.record(template, concat)?;
                Ok(())
            }
            ArrayKind::CallResult { .. } | ArrayKind::KernelCallResult { .. } => Err(
                InvalidConcatenatability("call results inside function bodies".into()),
            ),
            _ => {
                self.record(template, concat)?;
                let allow_indirect = matches!(
                    template.kind(),
                    ArrayKind::AdvancedIndexContiguous { .. }
                        | ArrayKind::AdvancedIndexNonContiguous { .. }
                );
                self.check_index_lambda_like(exprs, concat, allow_indirect)
            }
        }
    }

    fn check_index_lambda_like(
        &mut self,
        exprs: &[ArrayRef],
        concat: Concatenatability,
        allow_indirect_addr: bool,
    ) -> Result<(), InvalidConcatenatability> {
        let lambdas: Vec<ArrayRef> = exprs
            .iter()
            .map(|e| {
                to_index_lambda(e).map_err(|err| InvalidConcatenatability(err.to_string()))
            })
            .collect::<Result<_, _>>()?;
        let template = &lambdas[0];
        let binding_names: Vec<String> = match template.kind() {
            ArrayKind::IndexLambda { bindings, .. } => bindings.keys().cloned().collect(),
            _ => unreachable!("to_index_lambda returns an index lambda"),
        };

        let binding_of = |lambda: &ArrayRef, name: &str| -> ArrayRef {
            match lambda.kind() {
                ArrayKind::IndexLambda { bindings, .. } => bindings[name].clone(),
                _ => unreachable!("to_index_lambda returns an index lambda"),
            }
        };

        match concat {
            Concatenatability::IfConstant => {
                verify_arrays_same(&lambdas)?;
                for name in &binding_names {
                    let operands: Vec<ArrayRef> =
                        lambdas.iter().map(|l| binding_of(l, name)).collect();
                    self.check(&operands, Concatenatability::IfConstant)?;
                }
                Ok(())
            }
            Concatenatability::AlongAxis(axis) => {
                verify_arrays_can_be_concated_along_axis(&lambdas, true, false, axis)?;

                // The defining expressions of all bodies with a nontrivial
                // extent along the axis must agree.
                let mut nontrivial_expr: Option<&ScalarRef> = None;
                let mut derived: Option<BTreeMap<String, Concatenatability>> = None;
                for lambda in &lambdas {
                    let (body, extent) = match lambda.kind() {
                        ArrayKind::IndexLambda { expr, .. } => {
                            (expr, &lambda.shape().components()[axis])
                        }
                        _ => unreachable!("to_index_lambda returns an index lambda"),
                    };
                    if extent.is_one() {
                        continue;
                    }
                    match nontrivial_expr {
                        None => nontrivial_expr = Some(body),
                        Some(seen) if seen != body => {
                            return Err(InvalidConcatenatability(
                                "defining expressions differ across calls".into(),
                            ))
                        }
                        Some(_) => {}
                    }
                    if derived.is_none() {
                        derived = Some(
                            binding_concatenability(body, axis, allow_indirect_addr).map_err(
                                |NonConcatable| {
                                    InvalidConcatenatability(format!(
                                        "axis {axis} is not concatenatable"
                                    ))
                                },
                            )?,
                        );
                    }
                }
                let bnd_name_to_concat = match derived {
                    Some(map) => map,
                    None => {
                        let body = match template.kind() {
                            ArrayKind::IndexLambda { expr, .. } => expr,
                            _ => unreachable!("to_index_lambda returns an index lambda"),
                        };
                        binding_concatenability(body, axis, allow_indirect_addr).map_err(
                            |NonConcatable| {
                                InvalidConcatenatability(format!(
                                    "axis {axis} is not concatenatable"
                                ))
                            },
                        )?
                    }
                };

                for name in &binding_names {
                    let operands: Vec<ArrayRef> =
                        lambdas.iter().map(|l| binding_of(l, name)).collect();
                    let operand_concat = bnd_name_to_concat
                        .get(name)
                        .copied()
                        .unwrap_or(Concatenatability::IfConstant);
                    self.check(&operands, operand_concat)?;
                }
                Ok(())
            }
        }
    }
}

/// Try each candidate in order; the first plan that validates against all
/// call sites wins. Rejected candidates are logged and skipped.
fn get_ary_to_concatenatabilities(
    call_sites: &[CallRef],
    fid: &str,
) -> Result<HashMap<NodeId, Concatenatability>, ConcatError> {
    let candidates = valid_constraints_simple(call_sites)?;
    let n_candidates = candidates.len();

    let mut accepted: Option<HashMap<NodeId, Concatenatability>> = None;
    for (icandidate, candidate) in candidates.into_iter().enumerate() {
        let mut collector = ConcatabilityCollector::default();
        let outcome: Result<(), InvalidConcatenatability> = (|| {
            // Constraints on the caller-side parameter bindings.
            for (name, input_concat) in &candidate.input_to_concatenatability {
                let bindings: Vec<ArrayRef> = call_sites
                    .iter()
                    .map(|cs| cs.bindings()[name].clone())
                    .collect();
                match input_concat {
                    Concatenatability::IfConstant => verify_arrays_same(&bindings)
                        .map_err(|e| {
                            InvalidConcatenatability(format!(
                                "binding for input '{name}' is not concatenatable: {e}"
                            ))
                        })?,
                    Concatenatability::AlongAxis(axis) => {
                        verify_arrays_can_be_concated_along_axis(&bindings, false, false, *axis)
                            .map_err(|e| {
                                InvalidConcatenatability(format!(
                                    "binding for input '{name}' is not concatenatable: {e}"
                                ))
                            })?;
                    }
                }
            }
            // Constraints on the function bodies.
            for (name, output_concat) in &candidate.output_to_concatenatability {
                let returns: Vec<ArrayRef> = call_sites
                    .iter()
                    .map(|cs| cs.function().returns()[name].clone())
                    .collect();
                collector.check(&returns, *output_concat).map_err(|e| {
                    InvalidConcatenatability(format!(
                        "function output '{name}' is not concatenatable: {e}"
                    ))
                })?;
            }
            Ok(())
        })();

        match outcome {
            Ok(()) => {
                if accepted.is_none() {
                    info!(
                        function = fid,
                        candidate = icandidate,
                        "found a valid concatenatability:\n{candidate}"
                    );
                    accepted = Some(collector.ary_to_concatenatability);
                } else {
                    warn!(
                        function = fid,
                        "multiple concatenation possibilities; using the first, which may \
                         not be the best choice"
                    );
                    break;
                }
            }
            Err(e) => {
                debug!(
                    function = fid,
                    candidate = icandidate,
                    "rejected concatenation candidate: {e}"
                );
            }
        }
    }

    accepted.ok_or_else(|| {
        debug!(
            function = fid,
            "exhausted all {n_candidates} candidates without a valid plan"
        );
        ConcatError::NoValidCandidate(fid.to_string())
    })
}

// ============================================================================
// Memoized Input Concatenation and Output Slicing
// ============================================================================

/// Builds concatenated caller-side inputs, memoized to preserve
/// structural sharing across bindings and batches.
struct InputConcatenator {
    inherit_axes: bool,
    cache: HashMap<(Vec<NodeId>, usize), ArrayRef>,
}

impl InputConcatenator {
    fn new(inherit_axes: bool) -> Self {
        InputConcatenator {
            inherit_axes,
            cache: HashMap::new(),
        }
    }

    fn concatenate(
        &mut self,
        arrays: &[ArrayRef],
        axis: usize,
    ) -> Result<ArrayRef, ConcatError> {
        let key = (
            arrays.iter().map(|a| a.id()).collect::<Vec<NodeId>>(),
            axis,
        );
        if let Some(hit) = self.cache.get(&key) {
            return Ok(hit.clone());
        }
        let concat_axis_tag = if self.inherit_axes {
            Tag::UseInputAxis {
                arg: Some(0),
                axis,
            }
        } else {
            Tag::ConcatenatedCallInputConcatAxis
        };
        let result = builders::concatenate(arrays, axis)?
            .with_tagged_axis(axis, concat_axis_tag)?
            .tagged(Tag::ImplStored);
        self.cache.insert(key, result.clone());
        Ok(result)
    }
}

/// Builds the per-site slices of a batched return, memoized like the
/// input concatenator.
struct OutputSlicer {
    inherit_axes: bool,
    cache: HashMap<(NodeId, usize, i64, i64), ArrayRef>,
}

impl OutputSlicer {
    fn new(inherit_axes: bool) -> Self {
        OutputSlicer {
            inherit_axes,
            cache: HashMap::new(),
        }
    }

    fn slice(
        &mut self,
        array: &ArrayRef,
        axis: usize,
        start: i64,
        stop: i64,
    ) -> Result<ArrayRef, ConcatError> {
        let key = (array.id(), axis, start, stop);
        if let Some(hit) = self.cache.get(&key) {
            return Ok(hit.clone());
        }
        let slice_axis_tag = if self.inherit_axes {
            Tag::UseInputAxis { arg: None, axis }
        } else {
            Tag::ConcatenatedCallOutputSliceAxis
        };
        let result = builders::slice_along_axis(array, axis, start, stop)?
            .with_tagged_axis(axis, slice_axis_tag)?
            .tagged(Tag::ImplStored);
        self.cache.insert(key, result.clone());
        Ok(result)
    }

    fn slices(
        &mut self,
        array: &ArrayRef,
        axis: usize,
        slice_sizes: &[u64],
    ) -> Result<Vec<ArrayRef>, ConcatError> {
        let mut result = Vec::with_capacity(slice_sizes.len());
        let mut start = 0i64;
        for &size in slice_sizes {
            let stop = start + size as i64;
            result.push(self.slice(array, axis, start, stop)?);
            start = stop;
        }
        Ok(result)
    }
}

// ============================================================================
// Function-Body Concatenation
// ============================================================================

/// Rewrites the template function body so that every node becomes the
/// concatenation (or the shared constant) of the corresponding nodes of
/// all sibling bodies.
struct FunctionConcatenator<'a> {
    cache: HashMap<Vec<NodeId>, ArrayRef>,
    input_concatenator: &'a mut InputConcatenator,
    ary_to_concatenatability: &'a HashMap<NodeId, Concatenatability>,
}

impl<'a> FunctionConcatenator<'a> {
    fn new(
        input_concatenator: &'a mut InputConcatenator,
        ary_to_concatenatability: &'a HashMap<NodeId, Concatenatability>,
    ) -> Self {
        FunctionConcatenator {
            cache: HashMap::new(),
            input_concatenator,
            ary_to_concatenatability,
        }
    }

    fn concatenatability(&self, expr: &ArrayRef) -> Result<Concatenatability, ConcatError> {
        self.ary_to_concatenatability
            .get(&expr.id())
            .copied()
            .ok_or_else(|| {
                ConcatError::Transform(TransformError::Other(
                    "no concatenatability recorded for a body node".into(),
                ))
            })
    }

    fn rec(&mut self, exprs: &[ArrayRef]) -> Result<ArrayRef, ConcatError> {
        let key: Vec<NodeId> = exprs.iter().map(|e| e.id()).collect();
        if let Some(hit) = self.cache.get(&key) {
            return Ok(hit.clone());
        }
        let template = &exprs[0];
        let concat = self.concatenatability(template)?;

        let result = match concat {
            Concatenatability::IfConstant => template.clone(),
            Concatenatability::AlongAxis(axis) => self.rec_along_axis(exprs, axis)?,
        };
        self.cache.insert(key, result.clone());
        Ok(result)
    }

    fn rec_along_axis(
        &mut self,
        exprs: &[ArrayRef],
        axis: usize,
    ) -> Result<ArrayRef, ConcatError> {
        let template = &exprs[0];
        let new_shape = get_concatenated_shape(exprs, axis);

        let rebuild = |kind: ArrayKind| -> Result<ArrayRef, ConcatError> {
            Ok(Array::new(
                kind,
                new_shape.clone(),
                template.dtype(),
                template.axes().to_vec(),
                template.tags().clone(),
                template.non_equality_tags().clone(),
            )?)
        };

        match template.kind() {
            ArrayKind::Placeholder { name } => rebuild(ArrayKind::Placeholder {
                name: name.clone(),
            }),
            ArrayKind::DataWrapper { .. } => {
                self.input_concatenator.concatenate(exprs, axis)
            }
            ArrayKind::SizeParam { .. } => Err(ConcatError::Transform(TransformError::Other(
                "a size parameter cannot be concatenated along an axis".into(),
            ))),
            ArrayKind::IndexLambda {
                expr,
                bindings,
                reductions,
            } => {
                let mut new_bindings: IndexMap<String, ArrayRef> = IndexMap::new();
                for name in bindings.keys() {
                    let operands = sibling_children(exprs, |kind| match kind {
                        ArrayKind::IndexLambda { bindings, .. } => {
                            bindings.get(name).cloned()
                        }
                        _ => None,
                    })?;
                    new_bindings.insert(name.clone(), self.rec(&operands)?);
                }
                rebuild(ArrayKind::IndexLambda {
                    expr: expr.clone(),
                    bindings: new_bindings,
                    reductions: reductions.clone(),
                })
            }
            ArrayKind::Einsum {
                access,
                args,
                reduction_descrs,
            } => {
                let mut new_args = Vec::with_capacity(args.len());
                for iarg in 0..args.len() {
                    let operands = sibling_children(exprs, |kind| match kind {
                        ArrayKind::Einsum { args, .. } => args.get(iarg).cloned(),
                        _ => None,
                    })?;
                    new_args.push(self.rec(&operands)?);
                }
                rebuild(ArrayKind::Einsum {
                    access: access.clone(),
                    args: new_args,
                    reduction_descrs: reduction_descrs.clone(),
                })
            }
            ArrayKind::Reshape { order, .. } => {
                let operands = sibling_children(exprs, |kind| match kind {
                    ArrayKind::Reshape { array, .. } => Some(array.clone()),
                    _ => None,
                })?;
                rebuild(ArrayKind::Reshape {
                    array: self.rec(&operands)?,
                    order: *order,
                })
            }
            ArrayKind::AxisPermutation { permutation, .. } => {
                let operands = sibling_children(exprs, |kind| match kind {
                    ArrayKind::AxisPermutation { array, .. } => Some(array.clone()),
                    _ => None,
                })?;
                rebuild(ArrayKind::AxisPermutation {
                    array: self.rec(&operands)?,
                    permutation: permutation.clone(),
                })
            }
            ArrayKind::Stack {
                arrays,
                axis: stack_axis,
            } => {
                let mut new_arrays = Vec::with_capacity(arrays.len());
                for iarray in 0..arrays.len() {
                    let operands = sibling_children(exprs, |kind| match kind {
                        ArrayKind::Stack { arrays, .. } => arrays.get(iarray).cloned(),
                        _ => None,
                    })?;
                    new_arrays.push(self.rec(&operands)?);
                }
                rebuild(ArrayKind::Stack {
                    arrays: new_arrays,
                    axis: *stack_axis,
                })
            }
            ArrayKind::Concatenate {
                arrays,
                axis: cat_axis,
            } => {
                let mut new_arrays = Vec::with_capacity(arrays.len());
                for iarray in 0..arrays.len() {
                    let operands = sibling_children(exprs, |kind| match kind {
                        ArrayKind::Concatenate { arrays, .. } => arrays.get(iarray).cloned(),
                        _ => None,
                    })?;
                    new_arrays.push(self.rec(&operands)?);
                }
                rebuild(ArrayKind::Concatenate {
                    arrays: new_arrays,
                    axis: *cat_axis,
                })
            }
            ArrayKind::Roll {
                shift,
                axis: roll_axis,
                ..
            } => {
                if *roll_axis == axis {
                    return Err(ConcatError::Transform(TransformError::Other(
                        "cannot concatenate along a rolled axis".into(),
                    )));
                }
                let operands = sibling_children(exprs, |kind| match kind {
                    ArrayKind::Roll { array, .. } => Some(array.clone()),
                    _ => None,
                })?;
                rebuild(ArrayKind::Roll {
                    array: self.rec(&operands)?,
                    shift: *shift,
                    axis: *roll_axis,
                })
            }
            ArrayKind::BasicIndex { indices, .. } => {
                let operands = sibling_children(exprs, |kind| match kind {
                    ArrayKind::BasicIndex { array, .. } => Some(array.clone()),
                    _ => None,
                })?;
                rebuild(ArrayKind::BasicIndex {
                    array: self.rec(&operands)?,
                    indices: indices.clone(),
                })
            }
            ArrayKind::AdvancedIndexContiguous { indices, .. }
            | ArrayKind::AdvancedIndexNonContiguous { indices, .. } => {
                let operands = sibling_children(exprs, |kind| match kind {
                    ArrayKind::AdvancedIndexContiguous { array, .. }
                    | ArrayKind::AdvancedIndexNonContiguous { array, .. } => {
                        Some(array.clone())
                    }
                    _ => None,
                })?;
                let new_array = self.rec(&operands)?;
                let mut new_indices = Vec::with_capacity(indices.len());
                for (i_index, index) in indices.iter().enumerate() {
                    match index {
                        crate::array::AdvIndexArg::Array(_) => {
                            let idx_operands = sibling_children(exprs, |kind| match kind {
                                ArrayKind::AdvancedIndexContiguous { indices, .. }
                                | ArrayKind::AdvancedIndexNonContiguous { indices, .. } => {
                                    match indices.get(i_index) {
                                        Some(crate::array::AdvIndexArg::Array(a)) => {
                                            Some(a.clone())
                                        }
                                        _ => None,
                                    }
                                }
                                _ => None,
                            })?;
                            new_indices.push(crate::array::AdvIndexArg::Array(
                                self.rec(&idx_operands)?,
                            ));
                        }
                        other => new_indices.push(other.clone()),
                    }
                }
                let kind = match template.kind() {
                    ArrayKind::AdvancedIndexContiguous { .. } => {
                        ArrayKind::AdvancedIndexContiguous {
                            array: new_array,
                            indices: new_indices,
                        }
                    }
                    _ => ArrayKind::AdvancedIndexNonContiguous {
                        array: new_array,
                        indices: new_indices,
                    },
                };
                rebuild(kind)
            }
            ArrayKind::CallResult { .. } | ArrayKind::KernelCallResult { .. } => {
                Err(ConcatError::NestedCall)
            }
        }
    }
}

/// Extract the structurally corresponding child from every sibling.
fn sibling_children(
    exprs: &[ArrayRef],
    select: impl Fn(&ArrayKind) -> Option<ArrayRef>,
) -> Result<Vec<ArrayRef>, ConcatError> {
    exprs
        .iter()
        .map(|e| {
            select(e.kind()).ok_or_else(|| {
                ConcatError::Transform(TransformError::Other(
                    "sibling bodies have mismatched structure".into(),
                ))
            })
        })
        .collect()
}

// ============================================================================
// Replacement of Call Results
// ============================================================================

/// Replaces original `CallResult` nodes with the batched-and-sliced
/// expressions.
struct CallResultReplacer {
    base: CopyMapperBase,
    replacement_map: HashMap<(NodeId, String), ArrayRef>,
}

impl CopyMapper for CallResultReplacer {
    fn base(&mut self) -> &mut CopyMapperBase {
        &mut self.base
    }

    fn base_ref(&self) -> &CopyMapperBase {
        &self.base
    }

    fn clone_for_callee(&self) -> Self {
        CallResultReplacer {
            base: self.base.clone_for_callee(),
            replacement_map: self.replacement_map.clone(),
        }
    }

    fn map_call_result(&mut self, expr: &ArrayRef) -> Result<ArrayRef, TransformError> {
        let ArrayKind::CallResult { call, name } = expr.kind() else {
            unreachable!("map_call_result dispatched on a non-call-result node");
        };
        if let Some(replacement) = self
            .replacement_map
            .get(&(call.id(), name.clone()))
            .cloned()
        {
            self.rec(&replacement)
        } else {
            // Fall through to the default rebuild.
            let container = self.rec_call(call)?;
            match container {
                CallOrDict::Call(new_call) => {
                    if Arc::ptr_eq(&new_call, call) {
                        Ok(expr.clone())
                    } else {
                        let ret = &new_call.function().returns()[name];
                        Ok(Array::new(
                            ArrayKind::CallResult {
                                call: new_call.clone(),
                                name: name.clone(),
                            },
                            ret.shape().clone(),
                            ret.dtype(),
                            ret.axes().to_vec(),
                            expr.tags().clone(),
                            expr.non_equality_tags().clone(),
                        )?)
                    }
                }
                CallOrDict::Dict(dict) => Ok(dict
                    .get(name)
                    .cloned()
                    .ok_or_else(|| TransformError::Other(format!("unknown return '{name}'")))?),
            }
        }
    }
}

// ============================================================================
// Batched Rewrite of One Group of Call Sites
// ============================================================================

/// For ordered `call_sites`, build the batched call and map each original
/// `(call, return name)` pair to its replacement expression.
fn get_replacement_map_post_concatenating(
    call_sites: &[CallRef],
    fid: &str,
    input_concatenator: &mut InputConcatenator,
    output_slicer: &mut OutputSlicer,
) -> Result<HashMap<(NodeId, String), ArrayRef>, ConcatError> {
    assert!(!call_sites.is_empty(), "empty call-site batch");

    let ary_to_concatenatability = get_ary_to_concatenatabilities(call_sites, fid)?;

    let template_call = &call_sites[0];
    let template_fn = template_call.function();

    // Batched function body.
    let mut concatenator =
        FunctionConcatenator::new(input_concatenator, &ary_to_concatenatability);
    let mut new_returns: IndexMap<String, ArrayRef> = IndexMap::new();
    let mut returns_changed = false;
    for (name, template_ret) in template_fn.returns() {
        let rets: Vec<ArrayRef> = call_sites
            .iter()
            .map(|cs| cs.function().returns()[name].clone())
            .collect();
        let new_ret = concatenator.rec(&rets)?;
        returns_changed |= !Arc::ptr_eq(&new_ret, template_ret);
        new_returns.insert(name.clone(), new_ret);
    }
    let new_function = if returns_changed {
        FunctionDefinition::new(new_returns, template_fn.tags().clone())?
    } else {
        template_fn.clone()
    };

    // Batched caller-side bindings.
    let mut new_bindings: IndexMap<String, ArrayRef> = IndexMap::new();
    for (param_name, template_binding) in template_call.bindings() {
        let placeholder = template_fn.get_placeholder(param_name).ok_or_else(|| {
            ConcatError::Transform(TransformError::Other(format!(
                "no placeholder for parameter '{param_name}'"
            )))
        })?;
        let param_concat = ary_to_concatenatability
            .get(&placeholder.id())
            .copied()
            .unwrap_or(Concatenatability::IfConstant);
        let new_binding = match param_concat {
            Concatenatability::AlongAxis(axis) => {
                let bindings: Vec<ArrayRef> = call_sites
                    .iter()
                    .map(|cs| cs.bindings()[param_name].clone())
                    .collect();
                input_concatenator.concatenate(&bindings, axis)?
            }
            Concatenatability::IfConstant => template_binding.clone(),
        };
        new_bindings.insert(param_name.clone(), new_binding);
    }

    let new_call = Call::new(new_function, new_bindings, template_call.tags().clone())?;

    // Slice the batched returns back into per-site results.
    let mut replacement_map: HashMap<(NodeId, String), ArrayRef> = HashMap::new();
    for (name, template_ret) in template_fn.returns() {
        let concat = ary_to_concatenatability
            .get(&template_ret.id())
            .copied()
            .ok_or_else(|| {
                ConcatError::Transform(TransformError::Other(
                    "no concatenatability recorded for an output".into(),
                ))
            })?;
        let new_return = crate::function::call_result(&new_call, name)?;
        match concat {
            Concatenatability::IfConstant => {
                for cs in call_sites {
                    replacement_map.insert((cs.id(), name.clone()), new_return.clone());
                }
            }
            Concatenatability::AlongAxis(axis) => {
                let slice_sizes: Vec<u64> = call_sites
                    .iter()
                    .map(|cs| {
                        cs.function().returns()[name].shape().components()[axis]
                            .as_const()
                            .ok_or_else(|| {
                                ConcatError::Transform(TransformError::Other(
                                    "symbolic extent on the concatenation axis".into(),
                                ))
                            })
                    })
                    .collect::<Result<_, _>>()?;
                let output_slices = output_slicer.slices(&new_return, axis, &slice_sizes)?;
                for (cs, output_slice) in call_sites.iter().zip(output_slices) {
                    replacement_map.insert((cs.id(), name.clone()), output_slice);
                }
            }
        }
    }

    Ok(replacement_map)
}

// ============================================================================
// Call-Site Similarity
// ============================================================================

/// Structural similarity of two function-body expressions: identical
/// operations and scalar expressions, shapes allowed to differ, tags
/// compared after dropping the ignored kinds.
fn similar(
    a: &ArrayRef,
    b: &ArrayRef,
    ignore_tag_kinds: &BTreeSet<TagKind>,
    memo: &mut HashSet<(NodeId, NodeId)>,
) -> bool {
    if Arc::ptr_eq(a, b) {
        return true;
    }
    if !memo.insert((a.id(), b.id())) {
        return true;
    }
    if a.ndim() != b.ndim() || a.dtype() != b.dtype() {
        return false;
    }
    if without_kinds(a.tags(), ignore_tag_kinds) != without_kinds(b.tags(), ignore_tag_kinds) {
        return false;
    }

    use ArrayKind::*;
    match (a.kind(), b.kind()) {
        (Placeholder { name: n1 }, Placeholder { name: n2 })
        | (SizeParam { name: n1 }, SizeParam { name: n2 }) => n1 == n2,
        (DataWrapper { .. }, DataWrapper { .. }) => true,
        (
            IndexLambda {
                expr: e1,
                bindings: b1,
                reductions: r1,
            },
            IndexLambda {
                expr: e2,
                bindings: b2,
                reductions: r2,
            },
        ) => {
            e1 == e2
                && r1 == r2
                && b1.len() == b2.len()
                && b1.iter().zip(b2.iter()).all(|((n1, c1), (n2, c2))| {
                    n1 == n2 && similar(c1, c2, ignore_tag_kinds, memo)
                })
        }
        (
            Einsum {
                access: a1,
                args: g1,
                ..
            },
            Einsum {
                access: a2,
                args: g2,
                ..
            },
        ) => {
            a1 == a2
                && g1.len() == g2.len()
                && g1
                    .iter()
                    .zip(g2)
                    .all(|(x, y)| similar(x, y, ignore_tag_kinds, memo))
        }
        (Reshape { array: x, order: o1 }, Reshape { array: y, order: o2 }) => {
            o1 == o2 && similar(x, y, ignore_tag_kinds, memo)
        }
        (
            AxisPermutation {
                array: x,
                permutation: p1,
            },
            AxisPermutation {
                array: y,
                permutation: p2,
            },
        ) => p1 == p2 && similar(x, y, ignore_tag_kinds, memo),
        (
            Stack {
                arrays: x,
                axis: ax1,
            },
            Stack {
                arrays: y,
                axis: ax2,
            },
        )
        | (
            Concatenate {
                arrays: x,
                axis: ax1,
            },
            Concatenate {
                arrays: y,
                axis: ax2,
            },
        ) => {
            ax1 == ax2
                && x.len() == y.len()
                && x.iter()
                    .zip(y)
                    .all(|(p, q)| similar(p, q, ignore_tag_kinds, memo))
        }
        (
            Roll {
                array: x,
                shift: s1,
                axis: ax1,
            },
            Roll {
                array: y,
                shift: s2,
                axis: ax2,
            },
        ) => s1 == s2 && ax1 == ax2 && similar(x, y, ignore_tag_kinds, memo),
        (
            BasicIndex {
                array: x,
                indices: i1,
            },
            BasicIndex {
                array: y,
                indices: i2,
            },
        ) => i1 == i2 && similar(x, y, ignore_tag_kinds, memo),
        (
            AdvancedIndexContiguous {
                array: x,
                indices: i1,
            },
            AdvancedIndexContiguous {
                array: y,
                indices: i2,
            },
        )
        | (
            AdvancedIndexNonContiguous {
                array: x,
                indices: i1,
            },
            AdvancedIndexNonContiguous {
                array: y,
                indices: i2,
            },
        ) => {
            i1.len() == i2.len()
                && i1.iter().zip(i2).all(|(p, q)| match (p, q) {
                    (
                        crate::array::AdvIndexArg::Array(p),
                        crate::array::AdvIndexArg::Array(q),
                    ) => similar(p, q, ignore_tag_kinds, memo),
                    (p, q) => p == q,
                })
        }
        _ => false,
    }
}

// ============================================================================
// Driver
// ============================================================================

/// The axis-0 extent of a call's first return, used as a stable sort key
/// when batching.
fn axis0_len(call: &CallRef) -> u64 {
    call.function()
        .returns()
        .values()
        .next()
        .and_then(|ret| ret.shape().components().first())
        .and_then(ShapeComponent::as_const)
        .unwrap_or(0)
}

/// Returns a copy of `expr` with every selected group of call sites
/// concatenated into one batched call per group.
///
/// Call sites are pooled by their function's [`Tag::FunctionIdentifier`];
/// within a pool, sites become ready once the call sites they depend on
/// have been handled, ready sites are grouped by structural similarity,
/// and each group of two or more is rewritten as a single call. The
/// result graph is deduplicated between pools.
pub fn concatenate_calls(
    expr: &ArrayOrNames,
    call_site_filter: &dyn Fn(&CallSiteLocation) -> bool,
    options: &ConcatenateOptions,
) -> Result<ArrayOrNames, ConcatError> {
    let mut all_sites_collector = CallSiteDependencyCollector::default();
    let all_call_sites = all_sites_collector.collect(expr);

    let mut function_ids: BTreeSet<String> = BTreeSet::new();
    for cs in all_call_sites.iter().filter(|cs| call_site_filter(cs)) {
        match cs.call.function().tag_of_kind(TagKind::FunctionIdentifier) {
            Some(Tag::FunctionIdentifier(id)) => {
                function_ids.insert(id.clone());
            }
            _ => return Err(ConcatError::MissingFunctionIdentifier),
        }
    }

    // One memoized concatenator/slicer across all pools prevents
    // regressions in common-subexpression density.
    let mut input_concatenator = InputConcatenator::new(options.inherit_axes);
    let mut output_slicer = OutputSlicer::new(options.inherit_axes);

    let mut result = expr.clone();

    for fid in function_ids {
        let mut dep_collector = CallSiteDependencyCollector::default();
        dep_collector.collect(&result);
        let call_site_to_deps = dep_collector.call_site_to_deps;

        let mut unbatched: BTreeSet<CallSiteLocation> = call_site_to_deps
            .keys()
            .filter(|cs| {
                call_site_filter(cs)
                    && matches!(
                        cs.call.function().tag_of_kind(TagKind::FunctionIdentifier),
                        Some(Tag::FunctionIdentifier(id)) if *id == fid
                    )
            })
            .cloned()
            .collect();

        // Single-level only: a site below another call, or a body that
        // itself calls, cannot be concatenated.
        for cs in &unbatched {
            if !cs.stack.is_empty() {
                return Err(ConcatError::NestedCall);
            }
            for ret in cs.call.function().returns().values() {
                let mut has_nested = false;
                crate::transform::for_each_array_node(
                    &ArrayOrNames::Array(ret.clone()),
                    false,
                    &mut |node| {
                        if matches!(node.kind(), ArrayKind::CallResult { .. }) {
                            has_nested = true;
                        }
                    },
                );
                if has_nested {
                    return Err(ConcatError::NestedCall);
                }
            }
        }

        // Group ready call sites into batches of mutually similar sites.
        let mut batches: Vec<Vec<CallSiteLocation>> = Vec::new();
        while !unbatched.is_empty() {
            let mut ready: Vec<CallSiteLocation> = unbatched
                .iter()
                .filter(|cs| {
                    call_site_to_deps
                        .get(cs)
                        .map_or(true, |deps| deps.is_disjoint(&unbatched))
                })
                .cloned()
                .collect();
            if ready.is_empty() {
                return Err(ConcatError::CallSiteCycle);
            }
            ready.sort_by_key(|cs| (axis0_len(&cs.call), cs.call.id()));
            let template = ready[0].clone();
            let template_fn = template.call.function();
            let template_names: BTreeSet<&String> = template_fn.returns().keys().collect();

            let mut memo: HashSet<(NodeId, NodeId)> = HashSet::new();
            let batch: Vec<CallSiteLocation> = ready
                .into_iter()
                .filter(|cs| {
                    let fn_ = cs.call.function();
                    let names: BTreeSet<&String> = fn_.returns().keys().collect();
                    names == template_names
                        && cs.stack == template.stack
                        && template_fn.returns().iter().all(|(name, template_ret)| {
                            similar(
                                &fn_.returns()[name],
                                template_ret,
                                &options.ignore_tag_kinds,
                                &mut memo,
                            )
                        })
                })
                .collect();

            if batch.is_empty() {
                return Err(ConcatError::Transform(TransformError::Other(
                    "failed to find similar call sites to concatenate".into(),
                )));
            }
            for cs in &batch {
                unbatched.remove(cs);
            }
            batches.push(batch);
        }

        // Concatenate each batch, collecting the result replacements.
        let mut replacement_map: HashMap<(NodeId, String), ArrayRef> = HashMap::new();
        for (ibatch, batch) in batches.iter().enumerate() {
            debug!(
                function = fid.as_str(),
                batch = ibatch + 1,
                batches = batches.len(),
                call_sites = batch.len(),
                "concatenating call sites"
            );
            if batch.len() <= 1 {
                if options.err_if_no_calls {
                    return Err(ConcatError::NotEnoughCalls(fid));
                }
                if options.warn_if_no_calls {
                    warn!(
                        function = fid.as_str(),
                        "not enough call sites to concatenate"
                    );
                }
                continue;
            }
            let calls: Vec<CallRef> = batch.iter().map(|cs| cs.call.clone()).collect();
            replacement_map.extend(get_replacement_map_post_concatenating(
                &calls,
                &fid,
                &mut input_concatenator,
                &mut output_slicer,
            )?);
        }

        // Dedup before splicing: the freshly built concatenations may
        // duplicate subexpressions already present in the graph.
        let mut dedup = Deduplicator::new();
        result = dedup.dedup(&result)?;
        let replacement_map: HashMap<(NodeId, String), ArrayRef> = replacement_map
            .into_iter()
            .map(|(key, ary)| Ok((key, dedup.dedup_array(&ary)?)))
            .collect::<Result<_, TransformError>>()?;

        let mut replacer = CallResultReplacer {
            base: CopyMapperBase::with_policy(MapperPolicy::unchecked()),
            replacement_map,
        };
        result = replacer.apply(&result)?;
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::Shape;
    use crate::function::call_result;
    use crate::scalar::BinaryOp;
    use crate::tags::TagSet;
    use crate::value::DType;

    fn square_fn(extent: u64, fid: &str) -> FunctionRef {
        let x = builders::make_placeholder(
            "x",
            Shape::of_consts(&[extent, 3]),
            DType::Float64,
        )
        .expect("valid placeholder");
        let body = builders::elementwise_binary(BinaryOp::Mul, &x, &x).expect("valid product");
        let tags: TagSet = [Tag::FunctionIdentifier(fid.to_string())]
            .into_iter()
            .collect();
        FunctionDefinition::new([("out".to_string(), body)].into_iter().collect(), tags)
            .expect("valid function")
    }

    fn call_square(f: &FunctionRef, arg: ArrayRef) -> CallRef {
        Call::new(
            f.clone(),
            [("x".to_string(), arg)].into_iter().collect(),
            TagSet::new(),
        )
        .expect("valid call")
    }

    #[test]
    fn test_binding_concatenability_direct_index() {
        // expr: a[_0, _1] — concatenating output axis 0 demands a@axis0.
        let expr = crate::scalar::subscript(
            "a",
            vec![crate::scalar::elem_index(0), crate::scalar::elem_index(1)],
        );
        let map = binding_concatenability(&expr, 0, false).ok().expect("concatenatable");
        assert_eq!(map["a"], Concatenatability::AlongAxis(0));

        let map = binding_concatenability(&expr, 1, false).ok().expect("concatenatable");
        assert_eq!(map["a"], Concatenatability::AlongAxis(1));
    }

    #[test]
    fn test_binding_concatenability_bare_axis_var() {
        // expr: _0 — the axis indexes only the output.
        let expr = crate::scalar::elem_index(0);
        assert!(binding_concatenability(&expr, 0, false).is_err());
    }

    #[test]
    fn test_binding_concatenability_conflicting_axes() {
        // expr: a[_0, _0] — two positions need the same output axis.
        let expr = crate::scalar::subscript(
            "a",
            vec![crate::scalar::elem_index(0), crate::scalar::elem_index(0)],
        );
        assert!(binding_concatenability(&expr, 0, false).is_err());
    }

    #[test]
    fn test_binding_concatenability_indirect_addressing() {
        // expr: a[idx[_0]] — indirect; allowed only with the flag, and the
        // indexee then must be constant across sites.
        let expr = crate::scalar::subscript(
            "a",
            vec![crate::scalar::subscript(
                "idx",
                vec![crate::scalar::elem_index(0)],
            )],
        );
        assert!(binding_concatenability(&expr, 0, false).is_err());
        let map = binding_concatenability(&expr, 0, true).ok().expect("allowed");
        assert_eq!(map["a"], Concatenatability::IfConstant);
        assert_eq!(map["idx"], Concatenatability::AlongAxis(0));
    }

    #[test]
    fn test_simple_constraints_for_elementwise_fn() {
        let f = square_fn(4, "f");
        let a = builders::make_placeholder("a", Shape::of_consts(&[4, 3]), DType::Float64)
            .expect("valid placeholder");
        let call = call_square(&f, a);
        let candidates =
            valid_constraints_simple(std::slice::from_ref(&call)).expect("analysis succeeds");
        // x*x is concatenatable along either axis (or constant).
        let axes: BTreeSet<Concatenatability> = candidates
            .iter()
            .map(|c| c.output_to_concatenatability["out"])
            .collect();
        assert!(axes.contains(&Concatenatability::AlongAxis(0)));
        assert!(axes.contains(&Concatenatability::AlongAxis(1)));
        assert!(axes.contains(&Concatenatability::IfConstant));
        for candidate in &candidates {
            if let Concatenatability::AlongAxis(axis) =
                candidate.output_to_concatenatability["out"]
            {
                assert_eq!(
                    candidate.input_to_concatenatability["x"],
                    Concatenatability::AlongAxis(axis)
                );
            }
        }
    }

    #[test]
    fn test_concatenate_two_calls() {
        let f4 = square_fn(4, "f");
        let f7 = square_fn(7, "f");
        let a = builders::make_placeholder("a", Shape::of_consts(&[4, 3]), DType::Float64)
            .expect("valid placeholder");
        let b = builders::make_placeholder("b", Shape::of_consts(&[7, 3]), DType::Float64)
            .expect("valid placeholder");
        let call_a = call_square(&f4, a);
        let call_b = call_square(&f7, b);
        let ra = call_result(&call_a, "out").expect("known return");
        let rb = call_result(&call_b, "out").expect("known return");
        let dag = ArrayOrNames::Dict(
            builders::make_dict_of_named_arrays(
                [("ra".to_string(), ra), ("rb".to_string(), rb)]
                    .into_iter()
                    .collect(),
            )
            .expect("valid dict"),
        );

        let result = concatenate_calls(&dag, &|_| true, &ConcatenateOptions::default())
            .expect("concatenation succeeds");

        // Exactly one call site must remain, with an 11x3 parameter.
        let mut calls: Vec<CallRef> = Vec::new();
        crate::transform::for_each_array_node(&result, false, &mut |node| {
            if let ArrayKind::CallResult { call, .. } = node.kind() {
                if !calls.iter().any(|c| Arc::ptr_eq(c, call)) {
                    calls.push(call.clone());
                }
            }
        });
        assert_eq!(calls.len(), 1);
        let the_call = &calls[0];
        assert_eq!(
            the_call.bindings()["x"].shape(),
            &Shape::of_consts(&[11, 3])
        );

        // Each original output becomes a slice of the batched return.
        let ArrayOrNames::Dict(out) = &result else {
            panic!("expected a dict result");
        };
        let ra_new = &out.entries()["ra"];
        let rb_new = &out.entries()["rb"];
        assert_eq!(ra_new.shape(), &Shape::of_consts(&[4, 3]));
        assert_eq!(rb_new.shape(), &Shape::of_consts(&[7, 3]));
        match ra_new.kind() {
            ArrayKind::BasicIndex { indices, .. } => match &indices[0] {
                crate::array::IndexArg::Slice { start, stop, .. } => {
                    assert_eq!((*start, *stop), (0, 4));
                }
                other => panic!("expected a slice, got {other:?}"),
            },
            other => panic!("expected a slice of the batched return, got {other:?}"),
        }
        match rb_new.kind() {
            ArrayKind::BasicIndex { indices, .. } => match &indices[0] {
                crate::array::IndexArg::Slice { start, stop, .. } => {
                    assert_eq!((*start, *stop), (4, 11));
                }
                other => panic!("expected a slice, got {other:?}"),
            },
            other => panic!("expected a slice of the batched return, got {other:?}"),
        }
    }

    #[test]
    fn test_single_call_site_warns_not_errors() {
        let f = square_fn(4, "f");
        let a = builders::make_placeholder("a", Shape::of_consts(&[4, 3]), DType::Float64)
            .expect("valid placeholder");
        let call = call_square(&f, a);
        let dag = ArrayOrNames::Array(call_result(&call, "out").expect("known return"));

        let result = concatenate_calls(&dag, &|_| true, &ConcatenateOptions::default())
            .expect("single site is skipped");
        assert_eq!(result, dag);

        let strict = ConcatenateOptions {
            err_if_no_calls: true,
            ..ConcatenateOptions::default()
        };
        assert!(matches!(
            concatenate_calls(&dag, &|_| true, &strict),
            Err(ConcatError::NotEnoughCalls(_))
        ));
    }

    #[test]
    fn test_missing_function_identifier_is_an_error() {
        let x = builders::make_placeholder("x", Shape::of_consts(&[4]), DType::Float64)
            .expect("valid placeholder");
        let body = builders::elementwise_binary(BinaryOp::Mul, &x, &x).expect("valid product");
        let f = FunctionDefinition::new(
            [("out".to_string(), body)].into_iter().collect(),
            TagSet::new(),
        )
        .expect("valid function");
        let a = builders::make_placeholder("a", Shape::of_consts(&[4]), DType::Float64)
            .expect("valid placeholder");
        let call = Call::new(
            f,
            [("x".to_string(), a)].into_iter().collect(),
            TagSet::new(),
        )
        .expect("valid call");
        let dag = ArrayOrNames::Array(call_result(&call, "out").expect("known return"));

        assert!(matches!(
            concatenate_calls(&dag, &|_| true, &ConcatenateOptions::default()),
            Err(ConcatError::MissingFunctionIdentifier)
        ));
    }
}
