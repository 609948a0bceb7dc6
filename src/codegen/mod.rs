//! # Code Generation: Preprocessing
//!
//! Canonicalizes a DAG for lowering:
//!
//! - inline-tagged calls are inlined,
//! - every [`DataWrapper`](crate::array::ArrayKind::DataWrapper) becomes a
//!   placeholder with a generated name; the concrete data moves into a
//!   side map (`bound_arguments`) returned alongside the rewritten DAG,
//! - high-level nodes are rewritten to index lambdas,
//! - external kernel callees are deduplicated by name (identical kernels
//!   are aliased),
//! - every input name must refer to a unique input node (`NameClash`
//!   otherwise),
//! - the output computation order is a topological order over
//!   inter-output dependencies.
//!
//! ```text
//! user DAG -> inline -> [CodeGenPreprocessor] -> lowering (loopnest.rs)
//! ```

pub mod loopnest;

use crate::array::{
    Array, ArrayKind, ArrayOrNames, ArrayRef, DataHandle, DictRef, KernelCallRef, NodeId,
};
use crate::domain::DomainError;
use crate::function::{KernelCall, KernelCallBinding};
use crate::loopnest::{LoopKernel, LoopNestError, TranslationUnit};
use crate::tags::{Tag, TagKind};
use crate::transform::calls::inline_calls;
use crate::transform::lower_to_index_lambda::to_index_lambda;
use crate::transform::{
    rebuild, topological_order, CachedWalkMapper, CopyMapper, CopyMapperBase, FunctionVisitSet,
    MapperPolicy, SubsetDependencyMapper, TransformError,
};
use crate::utils::UniqueNameGenerator;
use indexmap::IndexMap;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::cell::RefCell;
use std::rc::Rc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum LoweringError {
    #[error("received two separate instances of inputs named '{0}'")]
    NameClash(String),
    #[error("cannot assign the name '{0}': it conflicts with an existing name")]
    NameConflict(String),
    #[error("outlined calls cannot be lowered; inline them first")]
    OutlinedCall,
    #[error("unsupported implementation strategy: {0}")]
    UnsupportedImplementationStrategy(String),
    #[error("options.return_dict must match whether a dictionary of outputs was passed")]
    ReturnDictMismatch,
    #[error("high-level node survived preprocessing")]
    UnloweredNode,
    #[error(transparent)]
    Transform(#[from] TransformError),
    #[error(transparent)]
    Array(#[from] crate::array::ArrayError),
    #[error(transparent)]
    LoopNest(#[from] LoopNestError),
    #[error(transparent)]
    Domain(#[from] DomainError),
}

/// The output of lowering: a translation unit plus the data captured from
/// data wrappers, keyed by the generated placeholder names.
#[derive(Debug, Clone)]
pub struct BoundProgram {
    pub program: TranslationUnit,
    pub bound_arguments: IndexMap<String, DataHandle>,
}

// ============================================================================
// Temp Naming
// ============================================================================

/// Pick the buffer name for `expr`: an exact [`Tag::Named`] wins (and must
/// not conflict), [`Tag::PrefixNamed`] seeds the generator, anything else
/// uses `default_prefix`.
pub(crate) fn generate_name_for_temp(
    expr: &ArrayRef,
    var_name_gen: &mut UniqueNameGenerator,
    default_prefix: &str,
) -> Result<String, LoweringError> {
    if let Some(Tag::Named(name)) = expr.tag_of_kind(TagKind::Named) {
        if var_name_gen.is_name_conflicting(name) {
            return Err(LoweringError::NameConflict(name.clone()));
        }
        var_name_gen.add_name(name);
        return Ok(name.clone());
    }
    if let Some(Tag::PrefixNamed(prefix)) = expr.tag_of_kind(TagKind::PrefixNamed) {
        return Ok(var_name_gen.fresh(prefix));
    }
    Ok(var_name_gen.fresh(default_prefix))
}

// ============================================================================
// normalize_outputs
// ============================================================================

/// Convert outputs to the canonical dict form: a bare array becomes the
/// single member `_al_out`.
pub fn normalize_outputs(result: &ArrayOrNames) -> Result<DictRef, LoweringError> {
    match result {
        ArrayOrNames::Dict(dict) => Ok(dict.clone()),
        ArrayOrNames::Array(array) => {
            let data: IndexMap<String, ArrayRef> =
                [("_al_out".to_string(), array.clone())].into_iter().collect();
            Ok(crate::array::builders::make_dict_of_named_arrays(data)?)
        }
    }
}

// ============================================================================
// Input Naming Check
// ============================================================================

struct NamesValidityChecker {
    visited: HashSet<NodeId>,
    visited_functions: FunctionVisitSet,
    name_to_input: Rc<RefCell<HashMap<String, NodeId>>>,
}

impl NamesValidityChecker {
    fn new() -> Self {
        NamesValidityChecker {
            visited: HashSet::new(),
            visited_functions: Rc::new(RefCell::new(HashSet::new())),
            name_to_input: Rc::new(RefCell::new(HashMap::new())),
        }
    }
}

impl CachedWalkMapper for NamesValidityChecker {
    type Error = LoweringError;

    fn visited(&mut self) -> &mut HashSet<NodeId> {
        &mut self.visited
    }

    fn visited_functions(&self) -> &FunctionVisitSet {
        &self.visited_functions
    }

    fn clone_for_callee(&self) -> Self {
        NamesValidityChecker {
            visited: HashSet::new(),
            visited_functions: Rc::clone(&self.visited_functions),
            // Placeholder names of a function body live in their own
            // frame; each body gets a fresh name table.
            name_to_input: Rc::new(RefCell::new(HashMap::new())),
        }
    }

    fn post_visit(&mut self, expr: &ArrayRef) -> Result<(), LoweringError> {
        if let Some(name) = expr.name() {
            let mut table = self.name_to_input.borrow_mut();
            match table.get(name) {
                Some(&seen) if seen != expr.id() => {
                    return Err(LoweringError::NameClash(name.to_string()));
                }
                Some(_) => {}
                None => {
                    table.insert(name.to_string(), expr.id());
                }
            }
        }
        Ok(())
    }
}

/// Every input-argument name must refer to a unique input node.
pub fn check_validity_of_outputs(outputs: &DictRef) -> Result<(), LoweringError> {
    let mut checker = NamesValidityChecker::new();
    checker.walk_dict(outputs)
}

// ============================================================================
// Preprocessor
// ============================================================================

/// A mapper that simplifies graphs for code generation.
///
/// | source node            | target node    |
/// |------------------------|----------------|
/// | `DataWrapper`          | `Placeholder`  |
/// | `Einsum`               | `IndexLambda`  |
/// | `Reshape`              | `IndexLambda`  |
/// | `AxisPermutation`      | `IndexLambda`  |
/// | `Stack`, `Concatenate` | `IndexLambda`  |
/// | `Roll`, index nodes    | `IndexLambda`  |
pub struct CodeGenPreprocessor {
    base: CopyMapperBase,
    pub bound_arguments: IndexMap<String, DataHandle>,
    pub var_name_gen: UniqueNameGenerator,
    kernels_seen: HashMap<String, LoopKernel>,
}

impl CodeGenPreprocessor {
    pub fn new(var_name_gen: UniqueNameGenerator) -> Self {
        CodeGenPreprocessor {
            // Lowering sugared nodes rebuilds shape expressions that the
            // caller may share between nodes; the collision check would
            // reject those legitimate duplicates.
            base: CopyMapperBase::with_policy(MapperPolicy::unchecked()),
            bound_arguments: IndexMap::new(),
            var_name_gen,
            kernels_seen: HashMap::new(),
        }
    }

    fn lower_after_rebuild(&mut self, expr: &ArrayRef) -> Result<ArrayRef, TransformError> {
        let rebuilt = rebuild(self, expr)?;
        to_index_lambda(&rebuilt)
    }
}

impl CopyMapper for CodeGenPreprocessor {
    fn base(&mut self) -> &mut CopyMapperBase {
        &mut self.base
    }

    fn base_ref(&self) -> &CopyMapperBase {
        &self.base
    }

    fn clone_for_callee(&self) -> Self {
        // Preprocessing runs after inlining; no function bodies remain.
        CodeGenPreprocessor {
            base: self.base.clone_for_callee(),
            bound_arguments: IndexMap::new(),
            var_name_gen: UniqueNameGenerator::new(),
            kernels_seen: HashMap::new(),
        }
    }

    fn map_data_wrapper(&mut self, expr: &ArrayRef) -> Result<ArrayRef, TransformError> {
        let ArrayKind::DataWrapper { name, data } = expr.kind() else {
            unreachable!("map_data_wrapper dispatched on a non-data-wrapper node");
        };
        let new_name = match name {
            Some(n) => n.clone(),
            None => generate_name_for_temp(expr, &mut self.var_name_gen, "_al_data")
                .map_err(|e| TransformError::Other(e.to_string()))?,
        };
        debug!(name = new_name.as_str(), "capturing data wrapper");
        self.bound_arguments.insert(new_name.clone(), data.clone());
        Ok(Array::new(
            ArrayKind::Placeholder { name: new_name },
            expr.shape().clone(),
            expr.dtype(),
            expr.axes().to_vec(),
            expr.tags().clone(),
            expr.non_equality_tags().clone(),
        )?)
    }

    fn map_einsum(&mut self, expr: &ArrayRef) -> Result<ArrayRef, TransformError> {
        self.lower_after_rebuild(expr)
    }

    fn map_reshape(&mut self, expr: &ArrayRef) -> Result<ArrayRef, TransformError> {
        self.lower_after_rebuild(expr)
    }

    fn map_axis_permutation(&mut self, expr: &ArrayRef) -> Result<ArrayRef, TransformError> {
        self.lower_after_rebuild(expr)
    }

    fn map_stack(&mut self, expr: &ArrayRef) -> Result<ArrayRef, TransformError> {
        self.lower_after_rebuild(expr)
    }

    fn map_concatenate(&mut self, expr: &ArrayRef) -> Result<ArrayRef, TransformError> {
        self.lower_after_rebuild(expr)
    }

    fn map_roll(&mut self, expr: &ArrayRef) -> Result<ArrayRef, TransformError> {
        self.lower_after_rebuild(expr)
    }

    fn map_basic_index(&mut self, expr: &ArrayRef) -> Result<ArrayRef, TransformError> {
        self.lower_after_rebuild(expr)
    }

    fn map_advanced_index_contiguous(
        &mut self,
        expr: &ArrayRef,
    ) -> Result<ArrayRef, TransformError> {
        self.lower_after_rebuild(expr)
    }

    fn map_advanced_index_non_contiguous(
        &mut self,
        expr: &ArrayRef,
    ) -> Result<ArrayRef, TransformError> {
        self.lower_after_rebuild(expr)
    }

    fn map_call_result(&mut self, _expr: &ArrayRef) -> Result<ArrayRef, TransformError> {
        Err(TransformError::Other(
            LoweringError::OutlinedCall.to_string(),
        ))
    }

    fn map_kernel_call(
        &mut self,
        call: &KernelCallRef,
    ) -> Result<KernelCallRef, TransformError> {
        let mut new_t_unit = call.translation_unit().clone();
        let mut new_entrypoint = call.entrypoint().to_string();

        // Eliminate callee name collisions against previously seen
        // kernels; structurally identical kernels are aliased instead of
        // renamed.
        let mut namegen = UniqueNameGenerator::with_names(self.kernels_seen.keys().cloned());
        let callee_names: Vec<String> = new_t_unit.kernels().keys().cloned().collect();
        for name in callee_names {
            let kernel = new_t_unit.kernels()[&name].clone();
            if let Some(seen) = self.kernels_seen.get(&name) {
                if *seen != kernel {
                    // Alias if some other seen kernel is this one modulo
                    // its name; otherwise rename to something unique.
                    let alias = self
                        .kernels_seen
                        .iter()
                        .find(|(_, other)| {
                            let mut relabeled = (*other).clone();
                            relabeled.name = name.clone();
                            relabeled == kernel
                        })
                        .map(|(other_name, _)| other_name.clone());
                    let new_name = alias.unwrap_or_else(|| namegen.fresh(&name));
                    if name == new_entrypoint {
                        new_entrypoint = new_name.clone();
                    }
                    new_t_unit = new_t_unit
                        .rename_kernel(&name, &new_name)
                        .map_err(|e| TransformError::Other(e.to_string()))?;
                    self.kernels_seen
                        .entry(new_name.clone())
                        .or_insert_with(|| new_t_unit.kernels()[&new_name].clone());
                    continue;
                }
            }
            self.kernels_seen.insert(name.clone(), kernel);
        }

        let mut sorted_names: Vec<String> = call.bindings().keys().cloned().collect();
        sorted_names.sort();
        let mut new_bindings: IndexMap<String, KernelCallBinding> = IndexMap::new();
        for name in sorted_names {
            let binding = match &call.bindings()[&name] {
                KernelCallBinding::Array(a) => KernelCallBinding::Array(self.rec(a)?),
                KernelCallBinding::Scalar(s) => KernelCallBinding::Scalar(s.clone()),
            };
            new_bindings.insert(name, binding);
        }

        Ok(KernelCall::new(
            new_t_unit,
            new_entrypoint,
            new_bindings,
            call.outputs().clone(),
            call.tags().clone(),
        )?)
    }
}

// ============================================================================
// Preprocess
// ============================================================================

/// The preprocessed computation handed to the lowering stage.
#[derive(Debug, Clone)]
pub struct PreprocessResult {
    pub outputs: DictRef,
    pub compute_order: Vec<String>,
    pub bound_arguments: IndexMap<String, DataHandle>,
}

/// Preprocess a computation for code generation.
pub fn preprocess(outputs: &DictRef) -> Result<PreprocessResult, LoweringError> {
    check_validity_of_outputs(outputs)?;

    // Semantically the order does not matter; scheduling dependencies
    // first gives the later stores their operands as named buffers.
    let output_exprs: Vec<ArrayRef> = outputs.entries().values().cloned().collect();
    let mut dep_mapper = SubsetDependencyMapper::new(output_exprs.clone());
    let id_to_name: HashMap<NodeId, String> = outputs
        .entries()
        .iter()
        .map(|(name, expr)| (expr.id(), name.clone()))
        .collect();

    let mut deps: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for (name, expr) in outputs.entries() {
        let reachable = dep_mapper.deps(expr);
        let dep_names: BTreeSet<String> = reachable
            .keys()
            .filter_map(|id| id_to_name.get(id).cloned())
            .filter(|dep_name| dep_name != name)
            .collect();
        deps.insert(name.clone(), dep_names);
    }
    let compute_order = topological_order(&deps)?;

    let inlined = inline_calls(&ArrayOrNames::Dict(outputs.clone()))?;
    let ArrayOrNames::Dict(inlined) = inlined else {
        unreachable!("inlining a dict yields a dict");
    };

    // Seed the name generator with every input name already present.
    let mut input_names: BTreeSet<String> = BTreeSet::new();
    crate::transform::for_each_array_node(
        &ArrayOrNames::Dict(inlined.clone()),
        false,
        &mut |node| {
            if let Some(name) = node.name() {
                input_names.insert(name.to_string());
            }
        },
    );
    let var_name_gen = UniqueNameGenerator::with_names(input_names);

    let mut preprocessor = CodeGenPreprocessor::new(var_name_gen);
    let new_outputs = preprocessor.rec_dict(&inlined)?;

    Ok(PreprocessResult {
        outputs: new_outputs,
        compute_order,
        bound_arguments: preprocessor.bound_arguments,
    })
}
