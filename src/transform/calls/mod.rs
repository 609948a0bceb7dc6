//! # Call Transformations
//!
//! Inlining of function calls and the supporting analyses:
//!
//! - [`tag_all_calls_to_be_inlined`] marks every reachable call site,
//! - [`inline_calls`] splices tagged calls' bodies into the caller graph,
//! - [`zero_unused_call_bindings`] replaces bindings whose parameter is
//!   unreachable from any used return with all-zeros arrays, so phantom
//!   inputs do not survive later fusions.
//!
//! Inlining crosses frame boundaries: the body and the caller were cached
//! independently, so the combined result can contain structurally-equal
//! nodes with different identities. The inliner therefore runs with the
//! collision checks disabled; callers typically run
//! [`Deduplicator`](crate::transform::Deduplicator) afterwards.

pub mod concatenate;

use crate::array::{builders, ArrayKind, ArrayOrNames, ArrayRef, CallRef, DictOfNamedArrays, NodeId};
use crate::function::FunctionRef;
use crate::tags::{Tag, TagKind};
use crate::transform::{
    CachedWalkMapper, CallOrDict, CopyMapper, CopyMapperBase, FunctionVisitSet, InputGatherer,
    MapperPolicy, TransformError,
};
use indexmap::IndexMap;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::convert::Infallible;
use std::rc::Rc;
use std::cell::RefCell;
use std::sync::Arc;

// ============================================================================
// Placeholder Substitution
// ============================================================================

/// Replaces placeholder references inside one function body with the
/// caller-side bindings.
///
/// Does not deduplicate subexpressions shared between the body and the
/// substitutions; follow up with a deduplicator when merged duplicates
/// matter. Operates within the current frame only: nested function
/// definitions pass through untouched.
pub struct PlaceholderSubstitutor {
    base: CopyMapperBase,
    substitutions: IndexMap<String, ArrayRef>,
}

impl PlaceholderSubstitutor {
    pub fn new(substitutions: IndexMap<String, ArrayRef>) -> Self {
        PlaceholderSubstitutor {
            base: CopyMapperBase::with_policy(MapperPolicy::unchecked()),
            substitutions,
        }
    }
}

impl CopyMapper for PlaceholderSubstitutor {
    fn base(&mut self) -> &mut CopyMapperBase {
        &mut self.base
    }

    fn base_ref(&self) -> &CopyMapperBase {
        &self.base
    }

    fn clone_for_callee(&self) -> Self {
        PlaceholderSubstitutor {
            base: self.base.clone_for_callee(),
            substitutions: self.substitutions.clone(),
        }
    }

    fn map_placeholder(&mut self, expr: &ArrayRef) -> Result<ArrayRef, TransformError> {
        let ArrayKind::Placeholder { name } = expr.kind() else {
            unreachable!("map_placeholder dispatched on a non-placeholder node");
        };
        // No rec() into the substituted expression: it may contain
        // unrelated placeholders whose names collide with the ones being
        // replaced.
        self.substitutions
            .get(name)
            .cloned()
            .ok_or_else(|| TransformError::Other(format!("no binding for parameter '{name}'")))
    }

    fn map_function_definition(
        &mut self,
        function: &FunctionRef,
    ) -> Result<FunctionRef, TransformError> {
        Ok(function.clone())
    }
}

// ============================================================================
// Inliner
// ============================================================================

/// Primary mapper for [`inline_calls`].
pub struct Inliner {
    base: CopyMapperBase,
}

impl Inliner {
    pub fn new() -> Self {
        // Expressions from two different call-stack frames are merged
        // here, so the collision and duplication checks must be off.
        Inliner {
            base: CopyMapperBase::with_policy(MapperPolicy::unchecked()),
        }
    }
}

impl Default for Inliner {
    fn default() -> Self {
        Self::new()
    }
}

impl CopyMapper for Inliner {
    fn base(&mut self) -> &mut CopyMapperBase {
        &mut self.base
    }

    fn base_ref(&self) -> &CopyMapperBase {
        &self.base
    }

    fn clone_for_callee(&self) -> Self {
        Inliner {
            base: self.base.clone_for_callee(),
        }
    }

    fn map_call(&mut self, call: &CallRef) -> Result<CallOrDict, TransformError> {
        if call.tag_of_kind(TagKind::InlineCall).is_some() {
            let mut bindings: IndexMap<String, ArrayRef> = IndexMap::new();
            for (name, binding) in call.bindings() {
                bindings.insert(name.clone(), self.rec(binding)?);
            }
            let mut substitutor = PlaceholderSubstitutor::new(bindings);
            let mut data: IndexMap<String, ArrayRef> = IndexMap::new();
            for (name, ret) in call.function().returns() {
                let substituted = substitutor.rec(ret)?;
                data.insert(name.clone(), self.rec(&substituted)?);
            }
            Ok(CallOrDict::Dict(DictOfNamedArrays::new(
                data,
                call.tags().clone(),
            )))
        } else {
            // Fall back to the identity rebuild.
            default_map_call(self, call)
        }
    }
}

/// The trait-default call rebuild, callable from overridden `map_call`
/// implementations.
fn default_map_call<M: CopyMapper>(
    mapper: &mut M,
    call: &CallRef,
) -> Result<CallOrDict, TransformError> {
    let new_function = mapper.rec_function_definition(call.function())?;
    let mut new_bindings: IndexMap<String, ArrayRef> = IndexMap::new();
    let mut changed = !Arc::ptr_eq(&new_function, call.function());
    for (name, binding) in call.bindings() {
        let mapped = mapper.rec(binding)?;
        changed |= !Arc::ptr_eq(&mapped, binding);
        new_bindings.insert(name.clone(), mapped);
    }
    if changed {
        Ok(CallOrDict::Call(crate::function::Call::new(
            new_function,
            new_bindings,
            call.tags().clone(),
        )?))
    } else {
        Ok(CallOrDict::Call(call.clone()))
    }
}

/// Returns a copy of `expr` with every call site tagged
/// [`Tag::InlineCall`] inlined into the expression graph.
pub fn inline_calls(expr: &ArrayOrNames) -> Result<ArrayOrNames, TransformError> {
    Inliner::new().apply(expr)
}

// ============================================================================
// Inline Marker
// ============================================================================

/// Primary mapper for [`tag_all_calls_to_be_inlined`].
#[derive(Default)]
pub struct InlineMarker {
    base: CopyMapperBase,
}

impl CopyMapper for InlineMarker {
    fn base(&mut self) -> &mut CopyMapperBase {
        &mut self.base
    }

    fn base_ref(&self) -> &CopyMapperBase {
        &self.base
    }

    fn clone_for_callee(&self) -> Self {
        InlineMarker {
            base: self.base.clone_for_callee(),
        }
    }

    fn map_call(&mut self, call: &CallRef) -> Result<CallOrDict, TransformError> {
        let rebuilt = default_map_call(self, call)?;
        match rebuilt {
            CallOrDict::Call(c) => {
                if c.tag_of_kind(TagKind::InlineCall).is_some() {
                    Ok(CallOrDict::Call(c))
                } else {
                    let mut tags = c.tags().clone();
                    tags.insert(Tag::InlineCall);
                    Ok(CallOrDict::Call(crate::function::Call::new(
                        c.function().clone(),
                        c.bindings().clone(),
                        tags,
                    )?))
                }
            }
            dict => Ok(dict),
        }
    }
}

/// Returns a copy of `expr` with all reachable call sites tagged
/// [`Tag::InlineCall`]. Does not inline; follow with [`inline_calls`].
pub fn tag_all_calls_to_be_inlined(expr: &ArrayOrNames) -> Result<ArrayOrNames, TransformError> {
    InlineMarker::default().apply(expr)
}

// ============================================================================
// Used-Input Collection
// ============================================================================

/// Per-call used-input analysis: which parameters are reachable from the
/// returns actually referenced in the expression.
struct UsedCallInputCollector {
    visited: HashSet<NodeId>,
    visited_functions: FunctionVisitSet,
    /// Function-definition-keyed gatherer cache, shared across frames.
    gatherers: Rc<RefCell<HashMap<NodeId, InputGatherer>>>,
    /// call id -> (call, used parameter names)
    used: Rc<RefCell<HashMap<NodeId, (CallRef, BTreeSet<String>)>>>,
}

impl UsedCallInputCollector {
    fn new() -> Self {
        UsedCallInputCollector {
            visited: HashSet::new(),
            visited_functions: Rc::new(RefCell::new(HashSet::new())),
            gatherers: Rc::new(RefCell::new(HashMap::new())),
            used: Rc::new(RefCell::new(HashMap::new())),
        }
    }
}

impl CachedWalkMapper for UsedCallInputCollector {
    type Error = Infallible;

    fn visited(&mut self) -> &mut HashSet<NodeId> {
        &mut self.visited
    }

    fn visited_functions(&self) -> &FunctionVisitSet {
        &self.visited_functions
    }

    fn clone_for_callee(&self) -> Self {
        UsedCallInputCollector {
            visited: HashSet::new(),
            visited_functions: Rc::clone(&self.visited_functions),
            gatherers: Rc::clone(&self.gatherers),
            used: Rc::clone(&self.used),
        }
    }

    fn post_visit(&mut self, expr: &ArrayRef) -> Result<(), Infallible> {
        if let ArrayKind::CallResult { call, name } = expr.kind() {
            let function = call.function();
            let mut gatherers = self.gatherers.borrow_mut();
            let gatherer = gatherers
                .entry(function.id())
                .or_insert_with(InputGatherer::new);
            let ret = &function.returns()[name];
            let used_names: BTreeSet<String> = gatherer
                .gather(ret)
                .values()
                .filter_map(|input| match input.kind() {
                    ArrayKind::Placeholder { name } => Some(name.clone()),
                    _ => None,
                })
                .collect();
            drop(gatherers);
            let mut used = self.used.borrow_mut();
            let entry = used
                .entry(call.id())
                .or_insert_with(|| (call.clone(), BTreeSet::new()));
            entry.1.extend(used_names);
        }
        Ok(())
    }
}

/// Maps each call to the set of parameter names whose bindings would
/// remain in the DAG if the call were inlined.
fn collect_used_call_inputs(expr: &ArrayOrNames) -> HashMap<NodeId, (CallRef, BTreeSet<String>)> {
    let mut collector = UsedCallInputCollector::new();
    // The collector is infallible; the Result is part of the walk contract.
    let _ = collector.walk_any(expr);
    let used = collector.used.borrow().clone();
    used
}

// ============================================================================
// zero_unused_call_bindings
// ============================================================================

struct UnusedCallBindingZeroer {
    base: CopyMapperBase,
    call_to_used_inputs: Rc<HashMap<NodeId, (CallRef, BTreeSet<String>)>>,
}

impl CopyMapper for UnusedCallBindingZeroer {
    fn base(&mut self) -> &mut CopyMapperBase {
        &mut self.base
    }

    fn base_ref(&self) -> &CopyMapperBase {
        &self.base
    }

    fn clone_for_callee(&self) -> Self {
        UnusedCallBindingZeroer {
            base: self.base.clone_for_callee(),
            call_to_used_inputs: Rc::clone(&self.call_to_used_inputs),
        }
    }

    fn map_call(&mut self, call: &CallRef) -> Result<CallOrDict, TransformError> {
        let new_function = self.rec_function_definition(call.function())?;
        let call_to_used_inputs = Rc::clone(&self.call_to_used_inputs);
        let used: Option<&BTreeSet<String>> = call_to_used_inputs
            .get(&call.id())
            .map(|(_, names)| names);

        let mut changed = !Arc::ptr_eq(&new_function, call.function());
        let mut new_bindings: IndexMap<String, ArrayRef> = IndexMap::new();
        for (name, binding) in call.bindings() {
            let is_used = used.is_some_and(|names| names.contains(name));
            let new_binding = if is_used {
                self.rec(binding)?
            } else {
                builders::zeros(binding.shape().clone(), binding.dtype())?
            };
            changed |= !Arc::ptr_eq(&new_binding, binding);
            new_bindings.insert(name.clone(), new_binding);
        }
        if changed {
            Ok(CallOrDict::Call(crate::function::Call::new(
                new_function,
                new_bindings,
                call.tags().clone(),
            )?))
        } else {
            Ok(CallOrDict::Call(call.clone()))
        }
    }
}

/// Replace call bindings that no used return depends on with arrays of
/// zeros of identical shape and dtype.
pub fn zero_unused_call_bindings(expr: &ArrayOrNames) -> Result<ArrayOrNames, TransformError> {
    let call_to_used_inputs = Rc::new(collect_used_call_inputs(expr));
    let mut zeroer = UnusedCallBindingZeroer {
        base: CopyMapperBase::with_policy(MapperPolicy::unchecked()),
        call_to_used_inputs,
    };
    zeroer.apply(expr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::{ArrayRefExt, Shape};
    use crate::function::{call_result, Call, FunctionDefinition};
    use crate::scalar::BinaryOp;
    use crate::tags::TagSet;
    use crate::transform::Deduplicator;
    use crate::value::{DType, Lit};

    /// f(x) = x*x + 1 over shape
    fn square_plus_one(shape: &[u64]) -> FunctionRef {
        let x = builders::make_placeholder("x", Shape::of_consts(shape), DType::Float64)
            .expect("valid placeholder");
        let xx = builders::elementwise_binary(BinaryOp::Mul, &x, &x).expect("valid product");
        let one = builders::full(Shape::of_consts(shape), Lit::Float(1.0), DType::Float64)
            .expect("valid fill");
        let body = builders::elementwise_binary(BinaryOp::Add, &xx, &one).expect("valid sum");
        FunctionDefinition::new(
            [("out".to_string(), body)].into_iter().collect(),
            TagSet::new(),
        )
        .expect("valid function")
    }

    fn contains_call(expr: &ArrayOrNames) -> bool {
        let mut found = false;
        crate::transform::for_each_array_node(expr, false, &mut |node| {
            if matches!(node.kind(), ArrayKind::CallResult { .. }) {
                found = true;
            }
        });
        found
    }

    #[test]
    fn test_inline_calls_removes_tagged_calls() {
        let f = square_plus_one(&[4]);
        let a = builders::make_placeholder("a", Shape::of_consts(&[4]), DType::Float64)
            .expect("valid placeholder");
        let b = builders::make_placeholder("b", Shape::of_consts(&[4]), DType::Float64)
            .expect("valid placeholder");
        let call_a = Call::new(
            f.clone(),
            [("x".to_string(), a)].into_iter().collect(),
            TagSet::new(),
        )
        .expect("valid call");
        let call_b = Call::new(
            f,
            [("x".to_string(), b)].into_iter().collect(),
            TagSet::new(),
        )
        .expect("valid call");
        let ra = call_result(&call_a, "out").expect("known return");
        let rb = call_result(&call_b, "out").expect("known return");
        let dag = builders::elementwise_binary(BinaryOp::Add, &ra, &rb).expect("valid sum");
        let dag = ArrayOrNames::Array(dag);

        assert!(contains_call(&dag));

        let tagged = tag_all_calls_to_be_inlined(&dag).expect("tagging succeeds");
        let inlined = inline_calls(&tagged).expect("inlining succeeds");
        let inlined = Deduplicator::new().dedup(&inlined).expect("dedup succeeds");

        assert!(!contains_call(&inlined));
    }

    #[test]
    fn test_inline_calls_without_tags_is_identity() {
        let f = square_plus_one(&[4]);
        let a = builders::make_placeholder("a", Shape::of_consts(&[4]), DType::Float64)
            .expect("valid placeholder");
        let call = Call::new(
            f,
            [("x".to_string(), a)].into_iter().collect(),
            TagSet::new(),
        )
        .expect("valid call");
        let dag = ArrayOrNames::Array(call_result(&call, "out").expect("known return"));

        let result = inline_calls(&dag).expect("inlining succeeds");
        assert_eq!(result, dag);
    }

    #[test]
    fn test_tagging_is_idempotent() {
        let f = square_plus_one(&[4]);
        let a = builders::make_placeholder("a", Shape::of_consts(&[4]), DType::Float64)
            .expect("valid placeholder");
        let call = Call::new(
            f,
            [("x".to_string(), a)].into_iter().collect(),
            TagSet::new(),
        )
        .expect("valid call");
        let dag = ArrayOrNames::Array(call_result(&call, "out").expect("known return"));

        let once = tag_all_calls_to_be_inlined(&dag).expect("tagging succeeds");
        let twice = tag_all_calls_to_be_inlined(&once).expect("tagging succeeds");
        assert_eq!(once, twice);
    }

    #[test]
    fn test_zero_unused_call_bindings() {
        // g(a, b) = a + 1; parameter b is unused.
        let a = builders::make_placeholder("a", Shape::of_consts(&[3]), DType::Float64)
            .expect("valid placeholder");
        let b = builders::make_placeholder("b", Shape::of_consts(&[3]), DType::Float64)
            .expect("valid placeholder");
        let one = builders::full(Shape::of_consts(&[3]), Lit::Float(1.0), DType::Float64)
            .expect("valid fill");
        let body = builders::elementwise_binary(BinaryOp::Add, &a, &one).expect("valid sum");
        // Reference b in a second, unused return so it becomes a parameter.
        let unused_ret = b.clone().tagged(Tag::Opaque("unused".into()));
        let g = FunctionDefinition::new(
            [
                ("out".to_string(), body),
                ("aux".to_string(), unused_ret),
            ]
            .into_iter()
            .collect(),
            TagSet::new(),
        )
        .expect("valid function");

        let arg_a = builders::make_placeholder("p", Shape::of_consts(&[3]), DType::Float64)
            .expect("valid placeholder");
        let arg_b = builders::make_placeholder("q", Shape::of_consts(&[3]), DType::Float64)
            .expect("valid placeholder");
        let call = Call::new(
            g,
            [
                ("a".to_string(), arg_a),
                ("b".to_string(), arg_b.clone()),
            ]
            .into_iter()
            .collect(),
            TagSet::new(),
        )
        .expect("valid call");
        // Only "out" is used; "aux" (and with it parameter b) is not.
        let dag = ArrayOrNames::Array(call_result(&call, "out").expect("known return"));

        let zeroed = zero_unused_call_bindings(&dag).expect("zeroing succeeds");

        let ArrayOrNames::Array(result) = &zeroed else {
            panic!("expected an array result");
        };
        let ArrayKind::CallResult { call: new_call, .. } = result.kind() else {
            panic!("expected a call result");
        };
        let new_b = &new_call.bindings()["b"];
        assert!(!crate::array::array_refs_equal(new_b, &arg_b));
        match new_b.kind() {
            ArrayKind::IndexLambda { expr, bindings, .. } => {
                assert!(bindings.is_empty());
                assert_eq!(expr.to_string(), "0");
            }
            other => panic!("expected a zeros index lambda, got {other:?}"),
        }
        // The used binding is kept as-is.
        assert!(Arc::ptr_eq(&new_call.bindings()["a"], &call.bindings()["a"]));
    }
}
