//! # Transformation Framework
//!
//! Identity-preserving memoized visitors over the array DAG:
//!
//! - [`CopyMapper`]: rewrites a DAG into a structurally-identical (or
//!   deliberately changed) new DAG, sharing subtrees through a
//!   per-instance memo keyed by [`NodeId`] (object identity, never
//!   structural equality).
//! - [`CachedWalkMapper`]: visits without producing output; observers extend
//!   `post_visit_*`.
//! - [`CombineMapper`]: folds a monoid value over the DAG with the same
//!   memoization discipline.
//!
//! All three cross into function bodies through `clone_for_callee`, which
//! gives the callee a fresh per-body cache while sharing one
//! function-definition cache, so identical sub-functions are processed
//! once per traversal.
//!
//! Two policy switches guard [`CopyMapper`] composition: *err-on-collision*
//! aborts when two structurally-equal nodes with different identities are
//! mapped, and *err-on-created-duplicate* aborts when a mapper emits two
//! distinct results that are structurally equal. Rewrites that knowingly
//! merge subtrees from different scopes (inlining, concatenation) disable
//! both and follow up with [`Deduplicator`].
//!
//! ```text
//! Array DAG -> [CopyMapper subclasses] -> rewritten DAG -> codegen
//! ```

pub mod calls;
pub mod lower_to_index_lambda;

use crate::array::{
    AdvIndexArg, Array, ArrayError, ArrayKind, ArrayOrNames, ArrayRef, CallRef,
    DictOfNamedArrays, DictRef, KernelCallRef, NodeId,
};
use crate::function::{Call, FunctionDefinition, FunctionRef, KernelCall, KernelCallBinding};
use indexmap::IndexMap;
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::rc::Rc;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error(
        "cache collision: two structurally-equal nodes with distinct identities were mapped; \
         run Deduplicator first or disable the collision check"
    )]
    CacheCollision,
    #[error("mapper produced two distinct results that are structurally equal")]
    CreatedDuplicate,
    #[error("cycle among named outputs")]
    CyclicOutputs,
    #[error(transparent)]
    Array(#[from] ArrayError),
    #[error("{0}")]
    Other(String),
}

/// Deterministically ordered set of array nodes, keyed by identity.
pub type NodeSet = BTreeMap<NodeId, ArrayRef>;

// ============================================================================
// Copy Mapper
// ============================================================================

/// Behavior switches for [`CopyMapper`]; both checks default to on.
#[derive(Debug, Clone, Copy)]
pub struct MapperPolicy {
    pub err_on_collision: bool,
    pub err_on_created_duplicate: bool,
}

impl Default for MapperPolicy {
    fn default() -> Self {
        MapperPolicy {
            err_on_collision: true,
            err_on_created_duplicate: true,
        }
    }
}

impl MapperPolicy {
    /// Policy for rewrites that merge subtrees from different call-stack
    /// frames and must tolerate (then dedup) duplicates.
    pub fn unchecked() -> Self {
        MapperPolicy {
            err_on_collision: false,
            err_on_created_duplicate: false,
        }
    }
}

/// The result of mapping a call container: still a call, or an inlined
/// dict of named arrays.
#[derive(Debug, Clone)]
pub enum CallOrDict {
    Call(CallRef),
    Dict(DictRef),
}

/// Per-instance memo tables of a [`CopyMapper`].
#[derive(Debug, Default)]
pub struct CopyCaches {
    arrays: HashMap<NodeId, ArrayRef>,
    dicts: HashMap<NodeId, DictRef>,
    calls: HashMap<NodeId, CallOrDict>,
    kernel_calls: HashMap<NodeId, KernelCallRef>,
    seen_by_hash: HashMap<u64, Vec<ArrayRef>>,
    produced_by_hash: HashMap<u64, Vec<ArrayRef>>,
}

/// Cross-function cache shared between a mapper and its callee clones.
pub type FunctionCache = Rc<RefCell<HashMap<NodeId, FunctionRef>>>;

/// Shared state embedded by every [`CopyMapper`] implementor.
#[derive(Debug, Default)]
pub struct CopyMapperBase {
    pub caches: CopyCaches,
    pub function_cache: FunctionCache,
    pub policy: MapperPolicy,
}

impl CopyMapperBase {
    pub fn with_policy(policy: MapperPolicy) -> Self {
        CopyMapperBase {
            caches: CopyCaches::default(),
            function_cache: Rc::new(RefCell::new(HashMap::new())),
            policy,
        }
    }

    /// Fresh per-body caches, shared function cache.
    pub fn clone_for_callee(&self) -> Self {
        CopyMapperBase {
            caches: CopyCaches::default(),
            function_cache: Rc::clone(&self.function_cache),
            policy: self.policy,
        }
    }
}

pub trait CopyMapper: Sized {
    fn base(&mut self) -> &mut CopyMapperBase;
    fn base_ref(&self) -> &CopyMapperBase;

    /// Build the mapper instance used inside a callee's function body.
    fn clone_for_callee(&self) -> Self;

    /// Hook applied to every freshly produced node before it is cached;
    /// [`Deduplicator`] interns here.
    fn post_process(&mut self, mapped: ArrayRef) -> ArrayRef {
        mapped
    }

    fn rec(&mut self, expr: &ArrayRef) -> Result<ArrayRef, TransformError> {
        if let Some(hit) = self.base().caches.arrays.get(&expr.id()) {
            return Ok(hit.clone());
        }

        let policy = self.base_ref().policy;
        if policy.err_on_collision {
            let seen = self
                .base()
                .caches
                .seen_by_hash
                .entry(expr.structural_hash())
                .or_default();
            if seen
                .iter()
                .any(|prior| !Arc::ptr_eq(prior, expr) && **prior == **expr)
            {
                return Err(TransformError::CacheCollision);
            }
            seen.push(expr.clone());
        }

        let mapped = self.map_array(expr)?;
        let mapped = self.post_process(mapped);

        if policy.err_on_created_duplicate {
            let produced = self
                .base()
                .caches
                .produced_by_hash
                .entry(mapped.structural_hash())
                .or_default();
            if produced
                .iter()
                .any(|prior| !Arc::ptr_eq(prior, &mapped) && **prior == *mapped)
            {
                return Err(TransformError::CreatedDuplicate);
            }
            produced.push(mapped.clone());
        }

        self.base().caches.arrays.insert(expr.id(), mapped.clone());
        Ok(mapped)
    }

    fn map_array(&mut self, expr: &ArrayRef) -> Result<ArrayRef, TransformError> {
        match expr.kind() {
            ArrayKind::Placeholder { .. } => self.map_placeholder(expr),
            ArrayKind::DataWrapper { .. } => self.map_data_wrapper(expr),
            ArrayKind::SizeParam { .. } => self.map_size_param(expr),
            ArrayKind::IndexLambda { .. } => self.map_index_lambda(expr),
            ArrayKind::Einsum { .. } => self.map_einsum(expr),
            ArrayKind::Reshape { .. } => self.map_reshape(expr),
            ArrayKind::AxisPermutation { .. } => self.map_axis_permutation(expr),
            ArrayKind::Stack { .. } => self.map_stack(expr),
            ArrayKind::Concatenate { .. } => self.map_concatenate(expr),
            ArrayKind::Roll { .. } => self.map_roll(expr),
            ArrayKind::BasicIndex { .. } => self.map_basic_index(expr),
            ArrayKind::AdvancedIndexContiguous { .. } => {
                self.map_advanced_index_contiguous(expr)
            }
            ArrayKind::AdvancedIndexNonContiguous { .. } => {
                self.map_advanced_index_non_contiguous(expr)
            }
            ArrayKind::CallResult { .. } => self.map_call_result(expr),
            ArrayKind::KernelCallResult { .. } => self.map_kernel_call_result(expr),
        }
    }

    fn map_placeholder(&mut self, expr: &ArrayRef) -> Result<ArrayRef, TransformError> {
        rebuild(self, expr)
    }

    fn map_data_wrapper(&mut self, expr: &ArrayRef) -> Result<ArrayRef, TransformError> {
        rebuild(self, expr)
    }

    fn map_size_param(&mut self, expr: &ArrayRef) -> Result<ArrayRef, TransformError> {
        rebuild(self, expr)
    }

    fn map_index_lambda(&mut self, expr: &ArrayRef) -> Result<ArrayRef, TransformError> {
        rebuild(self, expr)
    }

    fn map_einsum(&mut self, expr: &ArrayRef) -> Result<ArrayRef, TransformError> {
        rebuild(self, expr)
    }

    fn map_reshape(&mut self, expr: &ArrayRef) -> Result<ArrayRef, TransformError> {
        rebuild(self, expr)
    }

    fn map_axis_permutation(&mut self, expr: &ArrayRef) -> Result<ArrayRef, TransformError> {
        rebuild(self, expr)
    }

    fn map_stack(&mut self, expr: &ArrayRef) -> Result<ArrayRef, TransformError> {
        rebuild(self, expr)
    }

    fn map_concatenate(&mut self, expr: &ArrayRef) -> Result<ArrayRef, TransformError> {
        rebuild(self, expr)
    }

    fn map_roll(&mut self, expr: &ArrayRef) -> Result<ArrayRef, TransformError> {
        rebuild(self, expr)
    }

    fn map_basic_index(&mut self, expr: &ArrayRef) -> Result<ArrayRef, TransformError> {
        rebuild(self, expr)
    }

    fn map_advanced_index_contiguous(
        &mut self,
        expr: &ArrayRef,
    ) -> Result<ArrayRef, TransformError> {
        rebuild(self, expr)
    }

    fn map_advanced_index_non_contiguous(
        &mut self,
        expr: &ArrayRef,
    ) -> Result<ArrayRef, TransformError> {
        rebuild(self, expr)
    }

    fn map_call_result(&mut self, expr: &ArrayRef) -> Result<ArrayRef, TransformError> {
        let ArrayKind::CallResult { call, name } = expr.kind() else {
            unreachable!("map_call_result dispatched on a non-call-result node");
        };
        match self.rec_call(call)? {
            CallOrDict::Call(new_call) => {
                if Arc::ptr_eq(&new_call, call) {
                    Ok(expr.clone())
                } else {
                    let ret = new_call
                        .function()
                        .returns()
                        .get(name)
                        .ok_or_else(|| ArrayError::UnknownName(name.clone()))?;
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
            CallOrDict::Dict(dict) => {
                let member = dict
                    .get(name)
                    .ok_or_else(|| ArrayError::UnknownName(name.clone()))?;
                Ok(member.clone())
            }
        }
    }

    fn map_kernel_call_result(&mut self, expr: &ArrayRef) -> Result<ArrayRef, TransformError> {
        let ArrayKind::KernelCallResult { call, name } = expr.kind() else {
            unreachable!("map_kernel_call_result dispatched on a non-kernel-call node");
        };
        let new_call = self.rec_kernel_call(call)?;
        if Arc::ptr_eq(&new_call, call) {
            Ok(expr.clone())
        } else {
            Ok(Array::new(
                ArrayKind::KernelCallResult {
                    call: new_call,
                    name: name.clone(),
                },
                expr.shape().clone(),
                expr.dtype(),
                expr.axes().to_vec(),
                expr.tags().clone(),
                expr.non_equality_tags().clone(),
            )?)
        }
    }

    fn rec_call(&mut self, call: &CallRef) -> Result<CallOrDict, TransformError> {
        if let Some(hit) = self.base().caches.calls.get(&call.id()) {
            return Ok(hit.clone());
        }
        let mapped = self.map_call(call)?;
        self.base().caches.calls.insert(call.id(), mapped.clone());
        Ok(mapped)
    }

    fn map_call(&mut self, call: &CallRef) -> Result<CallOrDict, TransformError> {
        let new_function = self.rec_function_definition(call.function())?;
        let mut new_bindings: IndexMap<String, ArrayRef> = IndexMap::new();
        let mut changed = !Arc::ptr_eq(&new_function, call.function());
        for (name, binding) in call.bindings() {
            let new_binding = self.rec(binding)?;
            changed |= !Arc::ptr_eq(&new_binding, binding);
            new_bindings.insert(name.clone(), new_binding);
        }
        if changed {
            Ok(CallOrDict::Call(Call::new(
                new_function,
                new_bindings,
                call.tags().clone(),
            )?))
        } else {
            Ok(CallOrDict::Call(call.clone()))
        }
    }

    fn rec_kernel_call(&mut self, call: &KernelCallRef) -> Result<KernelCallRef, TransformError> {
        if let Some(hit) = self.base().caches.kernel_calls.get(&call.id()) {
            return Ok(hit.clone());
        }
        let mapped = self.map_kernel_call(call)?;
        self.base()
            .caches
            .kernel_calls
            .insert(call.id(), mapped.clone());
        Ok(mapped)
    }

    fn map_kernel_call(&mut self, call: &KernelCallRef) -> Result<KernelCallRef, TransformError> {
        let mut changed = false;
        let mut new_bindings: IndexMap<String, KernelCallBinding> = IndexMap::new();
        for (name, binding) in call.bindings() {
            let new_binding = match binding {
                KernelCallBinding::Array(a) => {
                    let mapped = self.rec(a)?;
                    changed |= !Arc::ptr_eq(&mapped, a);
                    KernelCallBinding::Array(mapped)
                }
                KernelCallBinding::Scalar(s) => KernelCallBinding::Scalar(s.clone()),
            };
            new_bindings.insert(name.clone(), new_binding);
        }
        if changed {
            Ok(KernelCall::new(
                call.translation_unit().clone(),
                call.entrypoint().to_string(),
                new_bindings,
                call.outputs().clone(),
                call.tags().clone(),
            )?)
        } else {
            Ok(call.clone())
        }
    }

    fn rec_function_definition(
        &mut self,
        function: &FunctionRef,
    ) -> Result<FunctionRef, TransformError> {
        if let Some(hit) = self
            .base_ref()
            .function_cache
            .borrow()
            .get(&function.id())
        {
            return Ok(hit.clone());
        }
        let mapped = self.map_function_definition(function)?;
        self.base_ref()
            .function_cache
            .borrow_mut()
            .insert(function.id(), mapped.clone());
        Ok(mapped)
    }

    fn map_function_definition(
        &mut self,
        function: &FunctionRef,
    ) -> Result<FunctionRef, TransformError> {
        let mut callee_mapper = self.clone_for_callee();
        let mut new_returns: IndexMap<String, ArrayRef> = IndexMap::new();
        let mut changed = false;
        for (name, ret) in function.returns() {
            let new_ret = callee_mapper.rec(ret)?;
            changed |= !Arc::ptr_eq(&new_ret, ret);
            new_returns.insert(name.clone(), new_ret);
        }
        if changed {
            Ok(FunctionDefinition::new(
                new_returns,
                function.tags().clone(),
            )?)
        } else {
            Ok(function.clone())
        }
    }

    fn rec_dict(&mut self, dict: &DictRef) -> Result<DictRef, TransformError> {
        if let Some(hit) = self.base().caches.dicts.get(&dict.id()) {
            return Ok(hit.clone());
        }
        let mut new_data: IndexMap<String, ArrayRef> = IndexMap::new();
        let mut changed = false;
        for (name, ary) in dict.entries() {
            let mapped = self.rec(ary)?;
            changed |= !Arc::ptr_eq(&mapped, ary);
            new_data.insert(name.clone(), mapped);
        }
        let mapped = if changed {
            DictOfNamedArrays::new(new_data, dict.tags().clone())
        } else {
            dict.clone()
        };
        self.base().caches.dicts.insert(dict.id(), mapped.clone());
        Ok(mapped)
    }

    /// Map either a single array or a dict of named arrays.
    fn apply(&mut self, expr: &ArrayOrNames) -> Result<ArrayOrNames, TransformError> {
        match expr {
            ArrayOrNames::Array(a) => Ok(ArrayOrNames::Array(self.rec(a)?)),
            ArrayOrNames::Dict(d) => Ok(ArrayOrNames::Dict(self.rec_dict(d)?)),
        }
    }
}

/// Default per-variant behavior: map children, preserve identity if
/// nothing changed.
pub fn rebuild<M: CopyMapper>(mapper: &mut M, expr: &ArrayRef) -> Result<ArrayRef, TransformError> {
    let (new_kind, changed) = match expr.kind() {
        ArrayKind::Placeholder { .. }
        | ArrayKind::DataWrapper { .. }
        | ArrayKind::SizeParam { .. } => return Ok(expr.clone()),
        ArrayKind::IndexLambda {
            expr: sexpr,
            bindings,
            reductions,
        } => {
            let mut changed = false;
            let mut new_bindings: IndexMap<String, ArrayRef> = IndexMap::new();
            for (name, child) in bindings {
                let mapped = mapper.rec(child)?;
                changed |= !Arc::ptr_eq(&mapped, child);
                new_bindings.insert(name.clone(), mapped);
            }
            (
                ArrayKind::IndexLambda {
                    expr: sexpr.clone(),
                    bindings: new_bindings,
                    reductions: reductions.clone(),
                },
                changed,
            )
        }
        ArrayKind::Einsum {
            access,
            args,
            reduction_descrs,
        } => {
            let mut changed = false;
            let mut new_args = Vec::with_capacity(args.len());
            for arg in args {
                let mapped = mapper.rec(arg)?;
                changed |= !Arc::ptr_eq(&mapped, arg);
                new_args.push(mapped);
            }
            (
                ArrayKind::Einsum {
                    access: access.clone(),
                    args: new_args,
                    reduction_descrs: reduction_descrs.clone(),
                },
                changed,
            )
        }
        ArrayKind::Reshape { array, order } => {
            let mapped = mapper.rec(array)?;
            let changed = !Arc::ptr_eq(&mapped, array);
            (
                ArrayKind::Reshape {
                    array: mapped,
                    order: *order,
                },
                changed,
            )
        }
        ArrayKind::AxisPermutation { array, permutation } => {
            let mapped = mapper.rec(array)?;
            let changed = !Arc::ptr_eq(&mapped, array);
            (
                ArrayKind::AxisPermutation {
                    array: mapped,
                    permutation: permutation.clone(),
                },
                changed,
            )
        }
        ArrayKind::Stack { arrays, axis } => {
            let mut changed = false;
            let mut new_arrays = Vec::with_capacity(arrays.len());
            for a in arrays {
                let mapped = mapper.rec(a)?;
                changed |= !Arc::ptr_eq(&mapped, a);
                new_arrays.push(mapped);
            }
            (
                ArrayKind::Stack {
                    arrays: new_arrays,
                    axis: *axis,
                },
                changed,
            )
        }
        ArrayKind::Concatenate { arrays, axis } => {
            let mut changed = false;
            let mut new_arrays = Vec::with_capacity(arrays.len());
            for a in arrays {
                let mapped = mapper.rec(a)?;
                changed |= !Arc::ptr_eq(&mapped, a);
                new_arrays.push(mapped);
            }
            (
                ArrayKind::Concatenate {
                    arrays: new_arrays,
                    axis: *axis,
                },
                changed,
            )
        }
        ArrayKind::Roll { array, shift, axis } => {
            let mapped = mapper.rec(array)?;
            let changed = !Arc::ptr_eq(&mapped, array);
            (
                ArrayKind::Roll {
                    array: mapped,
                    shift: *shift,
                    axis: *axis,
                },
                changed,
            )
        }
        ArrayKind::BasicIndex { array, indices } => {
            let mapped = mapper.rec(array)?;
            let changed = !Arc::ptr_eq(&mapped, array);
            (
                ArrayKind::BasicIndex {
                    array: mapped,
                    indices: indices.clone(),
                },
                changed,
            )
        }
        ArrayKind::AdvancedIndexContiguous { array, indices } => {
            let (new_array, new_indices, changed) =
                rebuild_adv_index(mapper, array, indices)?;
            (
                ArrayKind::AdvancedIndexContiguous {
                    array: new_array,
                    indices: new_indices,
                },
                changed,
            )
        }
        ArrayKind::AdvancedIndexNonContiguous { array, indices } => {
            let (new_array, new_indices, changed) =
                rebuild_adv_index(mapper, array, indices)?;
            (
                ArrayKind::AdvancedIndexNonContiguous {
                    array: new_array,
                    indices: new_indices,
                },
                changed,
            )
        }
        ArrayKind::CallResult { .. } | ArrayKind::KernelCallResult { .. } => {
            unreachable!("call results are mapped through map_call_result")
        }
    };

    if changed {
        Ok(Array::new(
            new_kind,
            expr.shape().clone(),
            expr.dtype(),
            expr.axes().to_vec(),
            expr.tags().clone(),
            expr.non_equality_tags().clone(),
        )?)
    } else {
        Ok(expr.clone())
    }
}

fn rebuild_adv_index<M: CopyMapper>(
    mapper: &mut M,
    array: &ArrayRef,
    indices: &[AdvIndexArg],
) -> Result<(ArrayRef, Vec<AdvIndexArg>, bool), TransformError> {
    let new_array = mapper.rec(array)?;
    let mut changed = !Arc::ptr_eq(&new_array, array);
    let mut new_indices = Vec::with_capacity(indices.len());
    for index in indices {
        match index {
            AdvIndexArg::Array(a) => {
                let mapped = mapper.rec(a)?;
                changed |= !Arc::ptr_eq(&mapped, a);
                new_indices.push(AdvIndexArg::Array(mapped));
            }
            other => new_indices.push(other.clone()),
        }
    }
    Ok((new_array, new_indices, changed))
}

// ============================================================================
// Deduplicator
// ============================================================================

/// Rewrites a DAG so that any two structurally-equal nodes become the same
/// instance. Idempotent.
pub struct Deduplicator {
    base: CopyMapperBase,
    interned: HashMap<u64, Vec<ArrayRef>>,
}

impl Deduplicator {
    pub fn new() -> Self {
        Deduplicator {
            base: CopyMapperBase::with_policy(MapperPolicy::unchecked()),
            interned: HashMap::new(),
        }
    }

    pub fn dedup(&mut self, expr: &ArrayOrNames) -> Result<ArrayOrNames, TransformError> {
        self.apply(expr)
    }

    pub fn dedup_array(&mut self, expr: &ArrayRef) -> Result<ArrayRef, TransformError> {
        self.rec(expr)
    }
}

impl CopyMapper for Deduplicator {
    fn base(&mut self) -> &mut CopyMapperBase {
        &mut self.base
    }

    fn base_ref(&self) -> &CopyMapperBase {
        &self.base
    }

    fn clone_for_callee(&self) -> Self {
        // The intern table is deliberately per-frame: placeholders of
        // different functions may be structurally equal yet must not be
        // merged across bodies.
        Deduplicator {
            base: self.base.clone_for_callee(),
            interned: HashMap::new(),
        }
    }

    fn post_process(&mut self, mapped: ArrayRef) -> ArrayRef {
        let bucket = self
            .interned
            .entry(mapped.structural_hash())
            .or_default();
        if let Some(existing) = bucket.iter().find(|prior| ***prior == *mapped) {
            return existing.clone();
        }
        bucket.push(mapped.clone());
        mapped
    }
}

// ============================================================================
// Walk Mapper
// ============================================================================

/// Shared visited-function set between a walker and its callee clones.
pub type FunctionVisitSet = Rc<RefCell<HashSet<NodeId>>>;

pub trait CachedWalkMapper: Sized {
    type Error;

    fn visited(&mut self) -> &mut HashSet<NodeId>;
    fn visited_functions(&self) -> &FunctionVisitSet;
    fn clone_for_callee(&self) -> Self;

    /// Called after a node's children were walked.
    fn post_visit(&mut self, _expr: &ArrayRef) -> Result<(), Self::Error> {
        Ok(())
    }

    fn post_visit_call(&mut self, _call: &CallRef) -> Result<(), Self::Error> {
        Ok(())
    }

    fn walk(&mut self, expr: &ArrayRef) -> Result<(), Self::Error> {
        if !self.visited().insert(expr.id()) {
            return Ok(());
        }
        match expr.kind() {
            ArrayKind::CallResult { call, .. } => {
                self.walk_call(call)?;
            }
            ArrayKind::KernelCallResult { call, .. } => {
                for binding in call.bindings().values() {
                    if let KernelCallBinding::Array(a) = binding {
                        self.walk(a)?;
                    }
                }
            }
            _ => {
                for child in crate::function::child_arrays(expr) {
                    self.walk(&child)?;
                }
            }
        }
        self.post_visit(expr)
    }

    fn walk_call(&mut self, call: &CallRef) -> Result<(), Self::Error> {
        for binding in call.bindings().values() {
            self.walk(binding)?;
        }
        let function = call.function();
        let fresh = self
            .visited_functions()
            .borrow_mut()
            .insert(function.id());
        if fresh {
            let mut callee = self.clone_for_callee();
            for ret in function.returns().values() {
                callee.walk(ret)?;
            }
        }
        self.post_visit_call(call)
    }

    fn walk_dict(&mut self, dict: &DictRef) -> Result<(), Self::Error> {
        for ary in dict.entries().values() {
            self.walk(ary)?;
        }
        Ok(())
    }

    fn walk_any(&mut self, expr: &ArrayOrNames) -> Result<(), Self::Error> {
        match expr {
            ArrayOrNames::Array(a) => self.walk(a),
            ArrayOrNames::Dict(d) => self.walk_dict(d),
        }
    }
}

/// Visit every array node reachable from `expr`, optionally crossing into
/// function bodies (each body once).
pub fn for_each_array_node(
    expr: &ArrayOrNames,
    enter_functions: bool,
    f: &mut impl FnMut(&ArrayRef),
) {
    fn go(
        expr: &ArrayRef,
        enter_functions: bool,
        visited: &mut HashSet<NodeId>,
        visited_fns: &mut HashSet<NodeId>,
        f: &mut impl FnMut(&ArrayRef),
    ) {
        if !visited.insert(expr.id()) {
            return;
        }
        f(expr);
        for child in crate::function::child_arrays(expr) {
            go(&child, enter_functions, visited, visited_fns, f);
        }
        if enter_functions {
            if let ArrayKind::CallResult { call, .. } = expr.kind() {
                if visited_fns.insert(call.function().id()) {
                    for ret in call.function().returns().values() {
                        go(ret, enter_functions, visited, visited_fns, f);
                    }
                }
            }
        }
    }
    let mut visited = HashSet::new();
    let mut visited_fns = HashSet::new();
    match expr {
        ArrayOrNames::Array(a) => go(a, enter_functions, &mut visited, &mut visited_fns, f),
        ArrayOrNames::Dict(d) => {
            for ary in d.entries().values() {
                go(ary, enter_functions, &mut visited, &mut visited_fns, f);
            }
        }
    }
}

// ============================================================================
// Combine Mapper
// ============================================================================

pub trait CombineMapper: Sized {
    type Output: Clone;

    fn cache(&mut self) -> &mut HashMap<NodeId, Self::Output>;
    fn identity(&self) -> Self::Output;
    fn combine2(&self, a: Self::Output, b: Self::Output) -> Self::Output;

    /// The node's own contribution, before children are folded in.
    fn map_node(&mut self, _expr: &ArrayRef) -> Self::Output {
        self.identity()
    }

    fn rec(&mut self, expr: &ArrayRef) -> Self::Output {
        if let Some(hit) = self.cache().get(&expr.id()) {
            return hit.clone();
        }
        let mut acc = self.map_node(expr);
        for child in crate::function::child_arrays(expr) {
            let part = self.rec(&child);
            acc = self.combine2(acc, part);
        }
        self.cache().insert(expr.id(), acc.clone());
        acc
    }

    fn rec_dict(&mut self, dict: &DictRef) -> Self::Output {
        let mut acc = self.identity();
        for ary in dict.entries().values() {
            let part = self.rec(ary);
            acc = self.combine2(acc, part);
        }
        acc
    }
}

/// Collects the input arguments (placeholders, data wrappers, size
/// parameters) reachable from an expression without entering function
/// bodies: a call's contribution is its bindings.
#[derive(Default)]
pub struct InputGatherer {
    cache: HashMap<NodeId, NodeSet>,
}

impl InputGatherer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gather(&mut self, expr: &ArrayRef) -> NodeSet {
        self.rec(expr)
    }
}

impl CombineMapper for InputGatherer {
    type Output = NodeSet;

    fn cache(&mut self) -> &mut HashMap<NodeId, NodeSet> {
        &mut self.cache
    }

    fn identity(&self) -> NodeSet {
        NodeSet::new()
    }

    fn combine2(&self, mut a: NodeSet, b: NodeSet) -> NodeSet {
        a.extend(b);
        a
    }

    fn map_node(&mut self, expr: &ArrayRef) -> NodeSet {
        if expr.is_input_argument() {
            [(expr.id(), expr.clone())].into_iter().collect()
        } else {
            NodeSet::new()
        }
    }
}

/// For a set of "interesting" roots, computes the subset of those roots
/// reachable from an expression; used for inter-output dependency edges.
pub struct SubsetDependencyMapper {
    interesting: HashSet<NodeId>,
    cache: HashMap<NodeId, NodeSet>,
}

impl SubsetDependencyMapper {
    pub fn new(interesting: impl IntoIterator<Item = ArrayRef>) -> Self {
        SubsetDependencyMapper {
            interesting: interesting.into_iter().map(|a| a.id()).collect(),
            cache: HashMap::new(),
        }
    }

    pub fn deps(&mut self, expr: &ArrayRef) -> NodeSet {
        self.rec(expr)
    }
}

impl CombineMapper for SubsetDependencyMapper {
    type Output = NodeSet;

    fn cache(&mut self) -> &mut HashMap<NodeId, NodeSet> {
        &mut self.cache
    }

    fn identity(&self) -> NodeSet {
        NodeSet::new()
    }

    fn combine2(&self, mut a: NodeSet, b: NodeSet) -> NodeSet {
        a.extend(b);
        a
    }

    fn map_node(&mut self, expr: &ArrayRef) -> NodeSet {
        if self.interesting.contains(&expr.id()) {
            [(expr.id(), expr.clone())].into_iter().collect()
        } else {
            NodeSet::new()
        }
    }
}

// ============================================================================
// Topological Ordering
// ============================================================================

/// Order names so that every dependency precedes its dependents. Ties are
/// broken lexicographically for determinism.
pub fn topological_order(
    deps: &BTreeMap<String, BTreeSet<String>>,
) -> Result<Vec<String>, TransformError> {
    let mut remaining_deps: BTreeMap<&str, BTreeSet<&str>> = deps
        .iter()
        .map(|(name, ds)| {
            (
                name.as_str(),
                ds.iter()
                    .map(String::as_str)
                    .filter(|d| *d != name && deps.contains_key(*d))
                    .collect(),
            )
        })
        .collect();

    let mut order = Vec::with_capacity(deps.len());
    while !remaining_deps.is_empty() {
        let ready: Vec<&str> = remaining_deps
            .iter()
            .filter(|(_, ds)| ds.is_empty())
            .map(|(name, _)| *name)
            .collect();
        if ready.is_empty() {
            return Err(TransformError::CyclicOutputs);
        }
        for name in &ready {
            remaining_deps.remove(name);
            order.push((*name).to_string());
        }
        for ds in remaining_deps.values_mut() {
            for name in &ready {
                ds.remove(name);
            }
        }
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::builders;
    use crate::array::Shape;
    use crate::scalar::BinaryOp;
    use crate::value::DType;

    /// The identity copy: all defaults.
    #[derive(Default)]
    struct IdentityCopy {
        base: CopyMapperBase,
    }

    impl CopyMapper for IdentityCopy {
        fn base(&mut self) -> &mut CopyMapperBase {
            &mut self.base
        }

        fn base_ref(&self) -> &CopyMapperBase {
            &self.base
        }

        fn clone_for_callee(&self) -> Self {
            IdentityCopy {
                base: self.base.clone_for_callee(),
            }
        }
    }

    fn small_dag() -> ArrayRef {
        let x = builders::make_placeholder("x", Shape::of_consts(&[3]), DType::Float64)
            .expect("valid placeholder");
        let prod =
            builders::elementwise_binary(BinaryOp::Mul, &x, &x).expect("valid product");
        builders::elementwise_binary(BinaryOp::Add, &prod, &x).expect("valid sum")
    }

    #[test]
    fn test_identity_copy_preserves_instances() {
        let dag = small_dag();
        let mut mapper = IdentityCopy::default();
        let result = mapper.rec(&dag).expect("copy succeeds");
        assert!(Arc::ptr_eq(&result, &dag));
    }

    #[test]
    fn test_collision_check_fires_on_duplicates() {
        let x1 = builders::make_placeholder("x", Shape::of_consts(&[3]), DType::Float64)
            .expect("valid placeholder");
        let x2 = builders::make_placeholder("x", Shape::of_consts(&[3]), DType::Float64)
            .expect("valid placeholder");
        // x1 and x2 are structurally equal but distinct instances.
        let dag = builders::elementwise_binary(BinaryOp::Add, &x1, &x2).expect("valid sum");

        let mut mapper = IdentityCopy::default();
        assert!(matches!(
            mapper.rec(&dag),
            Err(TransformError::CacheCollision)
        ));
    }

    #[test]
    fn test_deduplicator_merges_structural_duplicates() {
        let x1 = builders::make_placeholder("x", Shape::of_consts(&[3]), DType::Float64)
            .expect("valid placeholder");
        let x2 = builders::make_placeholder("x", Shape::of_consts(&[3]), DType::Float64)
            .expect("valid placeholder");
        let dag = builders::elementwise_binary(BinaryOp::Add, &x1, &x2).expect("valid sum");

        let mut dedup = Deduplicator::new();
        let result = dedup.dedup_array(&dag).expect("dedup succeeds");

        match result.kind() {
            ArrayKind::IndexLambda { bindings, .. } => {
                let children: Vec<&ArrayRef> = bindings.values().collect();
                assert_eq!(children.len(), 2);
                assert!(Arc::ptr_eq(children[0], children[1]));
            }
            other => panic!("expected IndexLambda, got {other:?}"),
        }

        // After dedup, checked mappers pass again.
        let mut mapper = IdentityCopy::default();
        assert!(mapper.rec(&result).is_ok());
    }

    #[test]
    fn test_deduplicator_idempotent() {
        let x1 = builders::make_placeholder("x", Shape::of_consts(&[3]), DType::Float64)
            .expect("valid placeholder");
        let x2 = builders::make_placeholder("x", Shape::of_consts(&[3]), DType::Float64)
            .expect("valid placeholder");
        let dag = builders::elementwise_binary(BinaryOp::Add, &x1, &x2).expect("valid sum");

        let once = Deduplicator::new().dedup_array(&dag).expect("dedup");
        let twice = Deduplicator::new().dedup_array(&once).expect("dedup");
        assert_eq!(*once, *twice);
    }

    #[test]
    fn test_input_gatherer() {
        let dag = small_dag();
        let mut gatherer = InputGatherer::new();
        let inputs = gatherer.gather(&dag);
        assert_eq!(inputs.len(), 1);
        let only = inputs.values().next().expect("one input");
        assert_eq!(only.name(), Some("x"));
    }

    #[test]
    fn test_topological_order_is_deterministic_and_deps_first() {
        let deps: BTreeMap<String, BTreeSet<String>> = [
            ("c".to_string(), ["a".to_string()].into_iter().collect()),
            ("b".to_string(), ["a".to_string()].into_iter().collect()),
            ("a".to_string(), BTreeSet::new()),
        ]
        .into_iter()
        .collect();
        let order = topological_order(&deps).expect("acyclic");
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_topological_order_detects_cycles() {
        let deps: BTreeMap<String, BTreeSet<String>> = [
            ("a".to_string(), ["b".to_string()].into_iter().collect()),
            ("b".to_string(), ["a".to_string()].into_iter().collect()),
        ]
        .into_iter()
        .collect();
        assert!(matches!(
            topological_order(&deps),
            Err(TransformError::CyclicOutputs)
        ));
    }
}
