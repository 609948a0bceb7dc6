//! # Sub-Graph Invocation
//!
//! A [`FunctionDefinition`] is a closed DAG with named placeholder
//! parameters and named returns. A [`Call`] binds each parameter to a
//! caller-side array; a `CallResult` array node (see
//! [`ArrayKind`](crate::array::ArrayKind)) references one named return of a
//! call. [`KernelCall`] is the analogous container for external loop-nest
//! kernels.

use crate::array::{
    array_refs_equal, Array, ArrayKind, ArrayRef, ArrayError, NodeId, Shape, default_axes,
    shape_components_equal,
};
use crate::loopnest::TranslationUnit;
use crate::scalar::ScalarRef;
use crate::tags::{Tag, TagKind, TagSet};
use crate::utils::is_identifier;
use indexmap::IndexMap;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

pub type FunctionRef = Arc<FunctionDefinition>;

// ============================================================================
// Function Definition
// ============================================================================

/// A closed sub-DAG with named parameters and named returns.
///
/// The body may only reference external values through its parameter
/// placeholders; every placeholder reachable from a return must be a
/// declared parameter.
#[derive(Debug)]
pub struct FunctionDefinition {
    id: NodeId,
    structural_hash: u64,
    parameters: BTreeSet<String>,
    returns: IndexMap<String, ArrayRef>,
    tags: TagSet,
    /// Parameter name -> the placeholder node representing it in the body.
    param_placeholders: BTreeMap<String, ArrayRef>,
}

impl FunctionDefinition {
    pub fn new(
        returns: IndexMap<String, ArrayRef>,
        tags: TagSet,
    ) -> Result<FunctionRef, ArrayError> {
        for name in returns.keys() {
            if !is_identifier(name) {
                return Err(ArrayError::InvalidIdentifier(name.clone()));
            }
        }

        let param_placeholders = collect_placeholders(&returns);
        let parameters: BTreeSet<String> = param_placeholders.keys().cloned().collect();

        let mut hasher = DefaultHasher::new();
        parameters.hash(&mut hasher);
        for (name, ret) in &returns {
            name.hash(&mut hasher);
            ret.structural_hash().hash(&mut hasher);
        }
        tags.hash(&mut hasher);

        Ok(Arc::new(FunctionDefinition {
            id: NodeId::fresh(),
            structural_hash: hasher.finish(),
            parameters,
            returns,
            tags,
            param_placeholders,
        }))
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn structural_hash(&self) -> u64 {
        self.structural_hash
    }

    pub fn parameters(&self) -> &BTreeSet<String> {
        &self.parameters
    }

    pub fn returns(&self) -> &IndexMap<String, ArrayRef> {
        &self.returns
    }

    pub fn tags(&self) -> &TagSet {
        &self.tags
    }

    /// The placeholder node standing for parameter `name` in the body.
    pub fn get_placeholder(&self, name: &str) -> Option<&ArrayRef> {
        self.param_placeholders.get(name)
    }

    pub fn tag_of_kind(&self, kind: TagKind) -> Option<&Tag> {
        crate::tags::tag_of_kind(&self.tags, kind)
    }
}

impl PartialEq for FunctionDefinition {
    fn eq(&self, other: &Self) -> bool {
        self.structural_hash == other.structural_hash
            && self.parameters == other.parameters
            && self.tags == other.tags
            && self.returns.len() == other.returns.len()
            && self
                .returns
                .iter()
                .zip(other.returns.iter())
                .all(|((n1, r1), (n2, r2))| n1 == n2 && array_refs_equal(r1, r2))
    }
}

impl Eq for FunctionDefinition {}

impl Hash for FunctionDefinition {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.structural_hash.hash(state);
    }
}

/// Walk every return body, collecting the placeholder node for each
/// distinct parameter name.
fn collect_placeholders(returns: &IndexMap<String, ArrayRef>) -> BTreeMap<String, ArrayRef> {
    fn go(
        expr: &ArrayRef,
        visited: &mut HashSet<NodeId>,
        out: &mut BTreeMap<String, ArrayRef>,
    ) {
        if !visited.insert(expr.id()) {
            return;
        }
        if let ArrayKind::Placeholder { name } = expr.kind() {
            out.entry(name.clone()).or_insert_with(|| expr.clone());
        }
        for child in child_arrays(expr) {
            go(&child, visited, out);
        }
    }
    let mut visited = HashSet::new();
    let mut out = BTreeMap::new();
    for ret in returns.values() {
        go(ret, &mut visited, &mut out);
    }
    out
}

/// The direct array children of a node, in a deterministic order.
pub fn child_arrays(expr: &ArrayRef) -> Vec<ArrayRef> {
    match expr.kind() {
        ArrayKind::Placeholder { .. }
        | ArrayKind::DataWrapper { .. }
        | ArrayKind::SizeParam { .. } => Vec::new(),
        ArrayKind::IndexLambda { bindings, .. } => bindings.values().cloned().collect(),
        ArrayKind::Einsum { args, .. } => args.clone(),
        ArrayKind::Reshape { array, .. }
        | ArrayKind::AxisPermutation { array, .. }
        | ArrayKind::Roll { array, .. }
        | ArrayKind::BasicIndex { array, .. } => vec![array.clone()],
        ArrayKind::Stack { arrays, .. } | ArrayKind::Concatenate { arrays, .. } => arrays.clone(),
        ArrayKind::AdvancedIndexContiguous { array, indices }
        | ArrayKind::AdvancedIndexNonContiguous { array, indices } => {
            let mut children = vec![array.clone()];
            for index in indices {
                if let crate::array::AdvIndexArg::Array(a) = index {
                    children.push(a.clone());
                }
            }
            children
        }
        ArrayKind::CallResult { call, .. } => call
            .bindings()
            .values()
            .cloned()
            .collect(),
        ArrayKind::KernelCallResult { call, .. } => call
            .bindings()
            .values()
            .filter_map(|b| match b {
                KernelCallBinding::Array(a) => Some(a.clone()),
                KernelCallBinding::Scalar(_) => None,
            })
            .collect(),
    }
}

// ============================================================================
// Call
// ============================================================================

/// A call site: binds every parameter of a function to a caller array.
#[derive(Debug)]
pub struct Call {
    id: NodeId,
    structural_hash: u64,
    function: FunctionRef,
    bindings: IndexMap<String, ArrayRef>,
    tags: TagSet,
}

impl Call {
    pub fn new(
        function: FunctionRef,
        bindings: IndexMap<String, ArrayRef>,
        tags: TagSet,
    ) -> Result<Arc<Call>, ArrayError> {
        let bound: BTreeSet<String> = bindings.keys().cloned().collect();
        if &bound != function.parameters() {
            return Err(ArrayError::Invalid(format!(
                "call bindings {bound:?} do not match function parameters {:?}",
                function.parameters()
            )));
        }
        for (name, binding) in &bindings {
            if let Some(placeholder) = function.get_placeholder(name) {
                if placeholder.dtype() != binding.dtype() {
                    return Err(ArrayError::Invalid(format!(
                        "binding for '{name}' has dtype {}, parameter expects {}",
                        binding.dtype(),
                        placeholder.dtype()
                    )));
                }
                if placeholder.ndim() != binding.ndim()
                    || !placeholder
                        .shape()
                        .components()
                        .iter()
                        .zip(binding.shape().components())
                        .all(|(a, b)| shape_components_equal(a, b))
                {
                    return Err(ArrayError::ShapeMismatch(format!(
                        "binding for '{name}' has shape {}, parameter expects {}",
                        binding.shape(),
                        placeholder.shape()
                    )));
                }
            }
        }

        let mut hasher = DefaultHasher::new();
        function.structural_hash().hash(&mut hasher);
        for (name, binding) in &bindings {
            name.hash(&mut hasher);
            binding.structural_hash().hash(&mut hasher);
        }
        tags.hash(&mut hasher);

        Ok(Arc::new(Call {
            id: NodeId::fresh(),
            structural_hash: hasher.finish(),
            function,
            bindings,
            tags,
        }))
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn structural_hash(&self) -> u64 {
        self.structural_hash
    }

    pub fn function(&self) -> &FunctionRef {
        &self.function
    }

    pub fn bindings(&self) -> &IndexMap<String, ArrayRef> {
        &self.bindings
    }

    pub fn tags(&self) -> &TagSet {
        &self.tags
    }

    pub fn tag_of_kind(&self, kind: TagKind) -> Option<&Tag> {
        crate::tags::tag_of_kind(&self.tags, kind)
    }
}

impl PartialEq for Call {
    fn eq(&self, other: &Self) -> bool {
        self.structural_hash == other.structural_hash
            && self.tags == other.tags
            && *self.function == *other.function
            && self.bindings.len() == other.bindings.len()
            && self
                .bindings
                .iter()
                .zip(other.bindings.iter())
                .all(|((n1, b1), (n2, b2))| n1 == n2 && array_refs_equal(b1, b2))
    }
}

impl Eq for Call {}

impl Hash for Call {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.structural_hash.hash(state);
    }
}

/// First-class reference to one named return of `call`; shape/dtype/axes
/// mirror the return body's.
pub fn call_result(call: &Arc<Call>, name: &str) -> Result<ArrayRef, ArrayError> {
    let ret = call
        .function()
        .returns()
        .get(name)
        .ok_or_else(|| ArrayError::UnknownName(name.to_string()))?;
    Array::new(
        ArrayKind::CallResult {
            call: call.clone(),
            name: name.to_string(),
        },
        ret.shape().clone(),
        ret.dtype(),
        ret.axes().to_vec(),
        TagSet::new(),
        TagSet::new(),
    )
}

// ============================================================================
// Kernel Call
// ============================================================================

/// A binding passed to an external kernel: an array operand or a scalar
/// expression for a value argument.
#[derive(Debug, Clone)]
pub enum KernelCallBinding {
    Array(ArrayRef),
    Scalar(ScalarRef),
}

impl PartialEq for KernelCallBinding {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (KernelCallBinding::Array(a), KernelCallBinding::Array(b)) => array_refs_equal(a, b),
            (KernelCallBinding::Scalar(a), KernelCallBinding::Scalar(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for KernelCallBinding {}

/// A call to an externally authored loop-nest kernel.
///
/// Outputs of the callee become named results referenced through
/// `KernelCallResult` array nodes.
#[derive(Debug)]
pub struct KernelCall {
    id: NodeId,
    structural_hash: u64,
    translation_unit: TranslationUnit,
    entrypoint: String,
    bindings: IndexMap<String, KernelCallBinding>,
    /// Output name -> (shape, dtype) declared by the callee kernel.
    outputs: IndexMap<String, (Shape, crate::value::DType)>,
    tags: TagSet,
}

impl KernelCall {
    pub fn new(
        translation_unit: TranslationUnit,
        entrypoint: String,
        bindings: IndexMap<String, KernelCallBinding>,
        outputs: IndexMap<String, (Shape, crate::value::DType)>,
        tags: TagSet,
    ) -> Result<Arc<KernelCall>, ArrayError> {
        if translation_unit.kernel(&entrypoint).is_none() {
            return Err(ArrayError::UnknownName(entrypoint));
        }

        let mut hasher = DefaultHasher::new();
        translation_unit.hash(&mut hasher);
        entrypoint.hash(&mut hasher);
        for (name, binding) in &bindings {
            name.hash(&mut hasher);
            match binding {
                KernelCallBinding::Array(a) => {
                    0u8.hash(&mut hasher);
                    a.structural_hash().hash(&mut hasher);
                }
                KernelCallBinding::Scalar(s) => {
                    1u8.hash(&mut hasher);
                    s.hash(&mut hasher);
                }
            }
        }
        outputs.iter().for_each(|(name, decl)| {
            name.hash(&mut hasher);
            decl.hash(&mut hasher);
        });
        tags.hash(&mut hasher);

        Ok(Arc::new(KernelCall {
            id: NodeId::fresh(),
            structural_hash: hasher.finish(),
            translation_unit,
            entrypoint,
            bindings,
            outputs,
            tags,
        }))
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn structural_hash(&self) -> u64 {
        self.structural_hash
    }

    pub fn translation_unit(&self) -> &TranslationUnit {
        &self.translation_unit
    }

    pub fn entrypoint(&self) -> &str {
        &self.entrypoint
    }

    pub fn bindings(&self) -> &IndexMap<String, KernelCallBinding> {
        &self.bindings
    }

    pub fn outputs(&self) -> &IndexMap<String, (Shape, crate::value::DType)> {
        &self.outputs
    }

    pub fn tags(&self) -> &TagSet {
        &self.tags
    }
}

impl PartialEq for KernelCall {
    fn eq(&self, other: &Self) -> bool {
        self.structural_hash == other.structural_hash
            && self.entrypoint == other.entrypoint
            && self.tags == other.tags
            && self.outputs == other.outputs
            && self.translation_unit == other.translation_unit
            && self.bindings.len() == other.bindings.len()
            && self
                .bindings
                .iter()
                .zip(other.bindings.iter())
                .all(|((n1, b1), (n2, b2))| n1 == n2 && b1 == b2)
    }
}

impl Eq for KernelCall {}

impl Hash for KernelCall {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.structural_hash.hash(state);
    }
}

/// Reference one named output of a kernel call.
pub fn kernel_call_result(call: &Arc<KernelCall>, name: &str) -> Result<ArrayRef, ArrayError> {
    let (shape, dtype) = call
        .outputs()
        .get(name)
        .ok_or_else(|| ArrayError::UnknownName(name.to_string()))?
        .clone();
    let ndim = shape.ndim();
    Array::new(
        ArrayKind::KernelCallResult {
            call: call.clone(),
            name: name.to_string(),
        },
        shape,
        dtype,
        default_axes(ndim),
        TagSet::new(),
        TagSet::new(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::builders;
    use crate::value::DType;

    fn square_plus_one() -> FunctionRef {
        // f(x) = x*x + 1
        let x = builders::make_placeholder("x", Shape::of_consts(&[4]), DType::Float64)
            .expect("valid placeholder");
        let body = builders::elementwise_binary(crate::scalar::BinaryOp::Add, &{
            builders::elementwise_binary(crate::scalar::BinaryOp::Mul, &x, &x)
                .expect("valid product")
        }, &builders::full(Shape::of_consts(&[4]), crate::value::Lit::Float(1.0), DType::Float64)
            .expect("valid fill"))
        .expect("valid sum");
        let returns: IndexMap<String, ArrayRef> =
            [("out".to_string(), body)].into_iter().collect();
        FunctionDefinition::new(returns, TagSet::new()).expect("valid function")
    }

    #[test]
    fn test_parameters_inferred_from_body() {
        let f = square_plus_one();
        assert_eq!(
            f.parameters().iter().cloned().collect::<Vec<_>>(),
            vec!["x".to_string()]
        );
        assert!(f.get_placeholder("x").is_some());
    }

    #[test]
    fn test_call_requires_matching_bindings() {
        let f = square_plus_one();
        let arg = builders::make_placeholder("a", Shape::of_consts(&[4]), DType::Float64)
            .expect("valid placeholder");
        let bindings: IndexMap<String, ArrayRef> =
            [("x".to_string(), arg)].into_iter().collect();
        let call = Call::new(f.clone(), bindings, TagSet::new()).expect("valid call");
        let result = call_result(&call, "out").expect("known return");
        assert_eq!(result.ndim(), 1);

        let bad = builders::make_placeholder("b", Shape::of_consts(&[5]), DType::Float64)
            .expect("valid placeholder");
        let bad_bindings: IndexMap<String, ArrayRef> =
            [("x".to_string(), bad)].into_iter().collect();
        assert!(Call::new(f, bad_bindings, TagSet::new()).is_err());
    }

    #[test]
    fn test_structurally_equal_functions() {
        let f = square_plus_one();
        let g = square_plus_one();
        assert_ne!(f.id(), g.id());
        assert_eq!(*f, *g);
    }
}
