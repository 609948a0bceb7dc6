//! # Array DAG Algebra
//!
//! Immutable array-expression nodes. Multiple parents share children by
//! reference; the graph is acyclic; transformations never mutate a node,
//! they build new ones.
//!
//! Two notions of identity coexist:
//!
//! - **Object identity** ([`NodeId`], assigned once at construction) keys
//!   every mapper cache.
//! - **Structural identity** (`PartialEq`/`Hash`) compares all fields
//!   except `non_equality_tags`. Each node stores a content hash computed
//!   at construction from its own fields and its children's stored hashes,
//!   so hashing never re-walks the DAG and equality can short-circuit.
//!
//! ```text
//! builders -> Array DAG -> transform passes -> codegen
//! ```

pub mod builders;

use crate::function::{Call, KernelCall};
use crate::scalar::{self, ScalarRef};
use crate::tags::{Tag, TagKind, TagSet};
use crate::value::DType;
use indexmap::IndexMap;
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

pub type ArrayRef = Arc<Array>;
pub type CallRef = Arc<Call>;
pub type KernelCallRef = Arc<KernelCall>;
pub type DictRef = Arc<DictOfNamedArrays>;

// ============================================================================
// Node Identity
// ============================================================================

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(0);

/// Stable per-node identifier, unique within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    pub fn fresh() -> Self {
        NodeId(NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

// ============================================================================
// Construction Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum ArrayError {
    #[error("'{0}' is not a valid identifier")]
    InvalidIdentifier(String),
    #[error("axis count {axes} does not match shape length {ndim}")]
    AxisCountMismatch { axes: usize, ndim: usize },
    #[error("axis {axis} is out of bounds for an array of dimension {ndim}")]
    AxisOutOfBounds { axis: usize, ndim: usize },
    #[error("shape component is not affine in size parameters: {0}")]
    NonAffineShape(String),
    #[error("expected a nonnegative extent, got {0}")]
    NegativeExtent(i64),
    #[error("operand shapes are incompatible: {0}")]
    ShapeMismatch(String),
    #[error("unknown name '{0}'")]
    UnknownName(String),
    #[error("index expression must be integer-valued: {0}")]
    NonIntegralIndex(String),
    #[error("reduction index '{0}' has no reduction descriptor")]
    MissingReductionDescriptor(String),
    #[error("invalid einsum specification: {0}")]
    BadEinsumSpec(String),
    #[error("{0}")]
    Invalid(String),
}

// ============================================================================
// Shape
// ============================================================================

/// One extent of an array shape: a constant or a scalar expression that is
/// affine in size-parameter names.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ShapeComponent {
    Const(u64),
    Expr(ScalarRef),
}

impl ShapeComponent {
    pub fn as_scalar(&self) -> ScalarRef {
        match self {
            ShapeComponent::Const(n) => scalar::int(*n as i64),
            ShapeComponent::Expr(e) => e.clone(),
        }
    }

    pub fn as_const(&self) -> Option<u64> {
        match self {
            ShapeComponent::Const(n) => Some(*n),
            ShapeComponent::Expr(_) => None,
        }
    }

    pub fn is_zero(&self) -> bool {
        matches!(self, ShapeComponent::Const(0))
    }

    pub fn is_one(&self) -> bool {
        matches!(self, ShapeComponent::Const(1))
    }
}

impl From<u64> for ShapeComponent {
    fn from(n: u64) -> Self {
        ShapeComponent::Const(n)
    }
}

impl fmt::Display for ShapeComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShapeComponent::Const(n) => write!(f, "{n}"),
            ShapeComponent::Expr(e) => write!(f, "{e}"),
        }
    }
}

/// Whether two shape components denote the same extent (structurally).
pub fn shape_components_equal(a: &ShapeComponent, b: &ShapeComponent) -> bool {
    a == b
}

/// An ordered sequence of shape components.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Shape(pub Vec<ShapeComponent>);

impl Shape {
    pub fn scalar() -> Self {
        Shape(Vec::new())
    }

    pub fn of_consts(extents: &[u64]) -> Self {
        Shape(extents.iter().map(|&n| ShapeComponent::Const(n)).collect())
    }

    pub fn ndim(&self) -> usize {
        self.0.len()
    }

    pub fn components(&self) -> &[ShapeComponent] {
        &self.0
    }

    /// Whether any extent is the constant zero (the array holds no
    /// elements and lowering emits nothing for it).
    pub fn is_empty_array(&self) -> bool {
        self.0.iter().any(ShapeComponent::is_zero)
    }

    /// Size-parameter names appearing in symbolic components.
    pub fn parameter_names(&self) -> std::collections::BTreeSet<String> {
        let mut names = std::collections::BTreeSet::new();
        for component in &self.0 {
            if let ShapeComponent::Expr(e) = component {
                names.extend(scalar::free_variables(e));
            }
        }
        names
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, c) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{c}")?;
        }
        write!(f, ")")
    }
}

// ============================================================================
// Axes and Reductions
// ============================================================================

/// Per-dimension metadata carrier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Axis {
    pub tags: TagSet,
}

impl Axis {
    pub fn new() -> Self {
        Axis::default()
    }

    pub fn tagged(&self, tag: Tag) -> Axis {
        let mut tags = self.tags.clone();
        tags.insert(tag);
        Axis { tags }
    }
}

/// Default axis metadata for an array of dimension `ndim`.
pub fn default_axes(ndim: usize) -> Vec<Axis> {
    vec![Axis::default(); ndim]
}

/// Metadata for one reduction index of an index lambda.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ReductionDescriptor {
    pub tags: TagSet,
}

// ============================================================================
// Data Handle
// ============================================================================

static NEXT_DATA_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Debug)]
struct DataHandleInner {
    id: u64,
    shape: Vec<u64>,
    dtype: DType,
}

/// Opaque reference to concrete array data held outside the DAG.
///
/// The handle only promises `shape` and `dtype`; the data itself is
/// resolved by the execution backend through the bound-arguments map.
/// Handles compare by identity: two handles are equal only if they were
/// created by the same call to [`DataHandle::new`].
#[derive(Debug, Clone)]
pub struct DataHandle(Arc<DataHandleInner>);

impl DataHandle {
    pub fn new(shape: Vec<u64>, dtype: DType) -> Self {
        DataHandle(Arc::new(DataHandleInner {
            id: NEXT_DATA_ID.fetch_add(1, Ordering::Relaxed),
            shape,
            dtype,
        }))
    }

    pub fn shape(&self) -> &[u64] {
        &self.0.shape
    }

    pub fn dtype(&self) -> DType {
        self.0.dtype
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }
}

impl PartialEq for DataHandle {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for DataHandle {}

impl Hash for DataHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

// ============================================================================
// Index Arguments
// ============================================================================

/// One position of a basic index: an integer or a slice. Integer indices
/// drop the axis; slices keep it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IndexArg {
    Int(i64),
    Slice {
        start: i64,
        stop: i64,
        step: i64,
    },
}

/// One position of an advanced index: an integer-dtype index array, a
/// plain integer, or a slice.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AdvIndexArg {
    Array(ArrayRef),
    Int(i64),
    Slice {
        start: i64,
        stop: i64,
        step: i64,
    },
}

// ============================================================================
// Einsum Access Descriptors
// ============================================================================

/// Where one operand axis of an einsum maps: to an output axis or to a
/// reduction (contracted) axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EinsumAxis {
    Output(usize),
    Reduction(usize),
}

// ============================================================================
// Array Node
// ============================================================================

/// The operation an [`Array`] node denotes.
#[derive(Debug, Clone)]
pub enum ArrayKind {
    /// Named symbolic input supplied at execution time.
    Placeholder { name: String },
    /// Concrete data packaged behind the array interface.
    DataWrapper {
        name: Option<String>,
        data: DataHandle,
    },
    /// Named scalar integer parameter; may appear in shape expressions.
    SizeParam { name: String },
    /// The canonical node: one scalar expression per output element,
    /// parameterized by `_k` elementwise and `_rk` reduction indices, with
    /// named operands.
    IndexLambda {
        expr: ScalarRef,
        bindings: IndexMap<String, ArrayRef>,
        reductions: BTreeMap<String, ReductionDescriptor>,
    },
    Einsum {
        access: Vec<Vec<EinsumAxis>>,
        args: Vec<ArrayRef>,
        reduction_descrs: BTreeMap<usize, ReductionDescriptor>,
    },
    /// The node's `shape` is the target shape; `order` selects the
    /// linearization.
    Reshape {
        array: ArrayRef,
        order: ReshapeOrder,
    },
    /// Output axis `i` draws from input axis `permutation[i]`.
    AxisPermutation {
        array: ArrayRef,
        permutation: Vec<usize>,
    },
    Stack {
        arrays: Vec<ArrayRef>,
        axis: usize,
    },
    Concatenate {
        arrays: Vec<ArrayRef>,
        axis: usize,
    },
    Roll {
        array: ArrayRef,
        shift: i64,
        axis: usize,
    },
    BasicIndex {
        array: ArrayRef,
        indices: Vec<IndexArg>,
    },
    /// Advanced (gather) indexing with the advanced indices at contiguous
    /// axis positions; result keeps them in place.
    AdvancedIndexContiguous {
        array: ArrayRef,
        indices: Vec<AdvIndexArg>,
    },
    /// Advanced indexing with non-contiguous advanced positions; the
    /// gathered axes move to the front of the result.
    AdvancedIndexNonContiguous {
        array: ArrayRef,
        indices: Vec<AdvIndexArg>,
    },
    /// One named return of a function call.
    CallResult { call: CallRef, name: String },
    /// One named output of an external kernel call.
    KernelCallResult { call: KernelCallRef, name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReshapeOrder {
    C,
    F,
}

/// An immutable array-expression node. Construct through
/// [`builders`](crate::array::builders) (which validate invariants) or
/// [`Array::new`] when rebuilding inside a transformation.
#[derive(Debug)]
pub struct Array {
    id: NodeId,
    structural_hash: u64,
    kind: ArrayKind,
    shape: Shape,
    dtype: DType,
    axes: Vec<Axis>,
    tags: TagSet,
    non_equality_tags: TagSet,
}

impl Array {
    /// Build a node, computing its content hash. The axis-count invariant
    /// is enforced here; operation-specific invariants live in the
    /// builders.
    pub fn new(
        kind: ArrayKind,
        shape: Shape,
        dtype: DType,
        axes: Vec<Axis>,
        tags: TagSet,
        non_equality_tags: TagSet,
    ) -> Result<ArrayRef, ArrayError> {
        if axes.len() != shape.ndim() {
            return Err(ArrayError::AxisCountMismatch {
                axes: axes.len(),
                ndim: shape.ndim(),
            });
        }
        let structural_hash = hash_array_content(&kind, &shape, dtype, &axes, &tags);
        Ok(Arc::new(Array {
            id: NodeId::fresh(),
            structural_hash,
            kind,
            shape,
            dtype,
            axes,
            tags,
            non_equality_tags,
        }))
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn structural_hash(&self) -> u64 {
        self.structural_hash
    }

    pub fn kind(&self) -> &ArrayKind {
        &self.kind
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn ndim(&self) -> usize {
        self.shape.ndim()
    }

    pub fn axes(&self) -> &[Axis] {
        &self.axes
    }

    pub fn tags(&self) -> &TagSet {
        &self.tags
    }

    pub fn non_equality_tags(&self) -> &TagSet {
        &self.non_equality_tags
    }

    /// The input name, for input-argument nodes.
    pub fn name(&self) -> Option<&str> {
        match &self.kind {
            ArrayKind::Placeholder { name } | ArrayKind::SizeParam { name } => Some(name),
            ArrayKind::DataWrapper { name, .. } => name.as_deref(),
            _ => None,
        }
    }

    pub fn is_input_argument(&self) -> bool {
        matches!(
            self.kind,
            ArrayKind::Placeholder { .. }
                | ArrayKind::DataWrapper { .. }
                | ArrayKind::SizeParam { .. }
        )
    }

    pub fn tag_of_kind(&self, kind: TagKind) -> Option<&Tag> {
        crate::tags::tag_of_kind(&self.tags, kind)
    }

    pub fn has_tag(&self, tag: &Tag) -> bool {
        self.tags.contains(tag)
    }
}

/// Rebuild helpers producing new nodes; the receiver is never mutated.
pub trait ArrayRefExt {
    fn tagged(&self, tag: Tag) -> ArrayRef;
    fn without_tags_of_kind(&self, kind: TagKind) -> ArrayRef;
    fn with_tagged_axis(&self, axis: usize, tag: Tag) -> Result<ArrayRef, ArrayError>;
}

/// Rebuild with replaced tag set; axes and shape are untouched, so the
/// axis-count invariant carries over.
fn with_tags(this: &Array, tags: TagSet) -> ArrayRef {
    let structural_hash =
        hash_array_content(&this.kind, &this.shape, this.dtype, &this.axes, &tags);
    Arc::new(Array {
        id: NodeId::fresh(),
        structural_hash,
        kind: this.kind.clone(),
        shape: this.shape.clone(),
        dtype: this.dtype,
        axes: this.axes.clone(),
        tags,
        non_equality_tags: this.non_equality_tags.clone(),
    })
}

impl ArrayRefExt for ArrayRef {
    fn tagged(&self, tag: Tag) -> ArrayRef {
        let mut tags = self.tags.clone();
        tags.insert(tag);
        with_tags(self, tags)
    }

    fn without_tags_of_kind(&self, kind: TagKind) -> ArrayRef {
        let tags: TagSet = self
            .tags
            .iter()
            .filter(|t| t.kind() != kind)
            .cloned()
            .collect();
        with_tags(self, tags)
    }

    fn with_tagged_axis(&self, axis: usize, tag: Tag) -> Result<ArrayRef, ArrayError> {
        if axis >= self.ndim() {
            return Err(ArrayError::AxisOutOfBounds {
                axis,
                ndim: self.ndim(),
            });
        }
        let mut axes = self.axes.clone();
        axes[axis] = axes[axis].tagged(tag);
        Array::new(
            self.kind.clone(),
            self.shape.clone(),
            self.dtype,
            axes,
            self.tags.clone(),
            self.non_equality_tags.clone(),
        )
    }
}

// ============================================================================
// Structural Equality and Hashing
// ============================================================================

/// Child comparison: pointer equality first, then stored hash, then deep
/// comparison.
pub fn array_refs_equal(a: &ArrayRef, b: &ArrayRef) -> bool {
    Arc::ptr_eq(a, b) || (a.structural_hash == b.structural_hash && **a == **b)
}

fn hash_array_content(
    kind: &ArrayKind,
    shape: &Shape,
    dtype: DType,
    axes: &[Axis],
    tags: &TagSet,
) -> u64 {
    let mut hasher = DefaultHasher::new();
    shape.hash(&mut hasher);
    dtype.hash(&mut hasher);
    axes.hash(&mut hasher);
    tags.hash(&mut hasher);
    hash_kind(kind, &mut hasher);
    hasher.finish()
}

fn hash_kind(kind: &ArrayKind, hasher: &mut DefaultHasher) {
    match kind {
        ArrayKind::Placeholder { name } => {
            0u8.hash(hasher);
            name.hash(hasher);
        }
        ArrayKind::DataWrapper { name, data } => {
            1u8.hash(hasher);
            name.hash(hasher);
            data.hash(hasher);
        }
        ArrayKind::SizeParam { name } => {
            2u8.hash(hasher);
            name.hash(hasher);
        }
        ArrayKind::IndexLambda {
            expr,
            bindings,
            reductions,
        } => {
            3u8.hash(hasher);
            expr.hash(hasher);
            for (name, child) in bindings {
                name.hash(hasher);
                child.structural_hash.hash(hasher);
            }
            reductions.hash(hasher);
        }
        ArrayKind::Einsum {
            access,
            args,
            reduction_descrs,
        } => {
            4u8.hash(hasher);
            access.hash(hasher);
            for arg in args {
                arg.structural_hash.hash(hasher);
            }
            reduction_descrs.hash(hasher);
        }
        ArrayKind::Reshape { array, order } => {
            5u8.hash(hasher);
            array.structural_hash.hash(hasher);
            order.hash(hasher);
        }
        ArrayKind::AxisPermutation { array, permutation } => {
            6u8.hash(hasher);
            array.structural_hash.hash(hasher);
            permutation.hash(hasher);
        }
        ArrayKind::Stack { arrays, axis } => {
            7u8.hash(hasher);
            for a in arrays {
                a.structural_hash.hash(hasher);
            }
            axis.hash(hasher);
        }
        ArrayKind::Concatenate { arrays, axis } => {
            8u8.hash(hasher);
            for a in arrays {
                a.structural_hash.hash(hasher);
            }
            axis.hash(hasher);
        }
        ArrayKind::Roll { array, shift, axis } => {
            9u8.hash(hasher);
            array.structural_hash.hash(hasher);
            shift.hash(hasher);
            axis.hash(hasher);
        }
        ArrayKind::BasicIndex { array, indices } => {
            10u8.hash(hasher);
            array.structural_hash.hash(hasher);
            indices.hash(hasher);
        }
        ArrayKind::AdvancedIndexContiguous { array, indices } => {
            11u8.hash(hasher);
            array.structural_hash.hash(hasher);
            hash_adv_indices(indices, hasher);
        }
        ArrayKind::AdvancedIndexNonContiguous { array, indices } => {
            12u8.hash(hasher);
            array.structural_hash.hash(hasher);
            hash_adv_indices(indices, hasher);
        }
        ArrayKind::CallResult { call, name } => {
            13u8.hash(hasher);
            call.structural_hash().hash(hasher);
            name.hash(hasher);
        }
        ArrayKind::KernelCallResult { call, name } => {
            14u8.hash(hasher);
            call.structural_hash().hash(hasher);
            name.hash(hasher);
        }
    }
}

fn hash_adv_indices(indices: &[AdvIndexArg], hasher: &mut DefaultHasher) {
    for index in indices {
        match index {
            AdvIndexArg::Array(a) => {
                0u8.hash(hasher);
                a.structural_hash.hash(hasher);
            }
            AdvIndexArg::Int(i) => {
                1u8.hash(hasher);
                i.hash(hasher);
            }
            AdvIndexArg::Slice { start, stop, step } => {
                2u8.hash(hasher);
                (start, stop, step).hash(hasher);
            }
        }
    }
}

fn kinds_equal(a: &ArrayKind, b: &ArrayKind) -> bool {
    use ArrayKind::*;
    match (a, b) {
        (Placeholder { name: n1 }, Placeholder { name: n2 }) => n1 == n2,
        (
            DataWrapper { name: n1, data: d1 },
            DataWrapper { name: n2, data: d2 },
        ) => n1 == n2 && d1 == d2,
        (SizeParam { name: n1 }, SizeParam { name: n2 }) => n1 == n2,
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
                && b1
                    .iter()
                    .zip(b2.iter())
                    .all(|((n1, c1), (n2, c2))| n1 == n2 && array_refs_equal(c1, c2))
        }
        (
            Einsum {
                access: a1,
                args: g1,
                reduction_descrs: r1,
            },
            Einsum {
                access: a2,
                args: g2,
                reduction_descrs: r2,
            },
        ) => {
            a1 == a2
                && r1 == r2
                && g1.len() == g2.len()
                && g1.iter().zip(g2).all(|(x, y)| array_refs_equal(x, y))
        }
        (
            Reshape {
                array: a1,
                order: o1,
            },
            Reshape {
                array: a2,
                order: o2,
            },
        ) => o1 == o2 && array_refs_equal(a1, a2),
        (
            AxisPermutation {
                array: a1,
                permutation: p1,
            },
            AxisPermutation {
                array: a2,
                permutation: p2,
            },
        ) => p1 == p2 && array_refs_equal(a1, a2),
        (
            Stack {
                arrays: a1,
                axis: x1,
            },
            Stack {
                arrays: a2,
                axis: x2,
            },
        )
        | (
            Concatenate {
                arrays: a1,
                axis: x1,
            },
            Concatenate {
                arrays: a2,
                axis: x2,
            },
        ) => {
            x1 == x2
                && a1.len() == a2.len()
                && a1.iter().zip(a2).all(|(x, y)| array_refs_equal(x, y))
        }
        (
            Roll {
                array: a1,
                shift: s1,
                axis: x1,
            },
            Roll {
                array: a2,
                shift: s2,
                axis: x2,
            },
        ) => s1 == s2 && x1 == x2 && array_refs_equal(a1, a2),
        (
            BasicIndex {
                array: a1,
                indices: i1,
            },
            BasicIndex {
                array: a2,
                indices: i2,
            },
        ) => i1 == i2 && array_refs_equal(a1, a2),
        (
            AdvancedIndexContiguous {
                array: a1,
                indices: i1,
            },
            AdvancedIndexContiguous {
                array: a2,
                indices: i2,
            },
        )
        | (
            AdvancedIndexNonContiguous {
                array: a1,
                indices: i1,
            },
            AdvancedIndexNonContiguous {
                array: a2,
                indices: i2,
            },
        ) => adv_indices_equal(i1, i2) && array_refs_equal(a1, a2),
        (
            CallResult { call: c1, name: n1 },
            CallResult { call: c2, name: n2 },
        ) => n1 == n2 && (Arc::ptr_eq(c1, c2) || **c1 == **c2),
        (
            KernelCallResult { call: c1, name: n1 },
            KernelCallResult { call: c2, name: n2 },
        ) => n1 == n2 && (Arc::ptr_eq(c1, c2) || **c1 == **c2),
        _ => false,
    }
}

fn adv_indices_equal(a: &[AdvIndexArg], b: &[AdvIndexArg]) -> bool {
    a.len() == b.len()
        && a.iter().zip(b).all(|(x, y)| match (x, y) {
            (AdvIndexArg::Array(x), AdvIndexArg::Array(y)) => array_refs_equal(x, y),
            (AdvIndexArg::Int(x), AdvIndexArg::Int(y)) => x == y,
            (
                AdvIndexArg::Slice {
                    start: s1,
                    stop: e1,
                    step: t1,
                },
                AdvIndexArg::Slice {
                    start: s2,
                    stop: e2,
                    step: t2,
                },
            ) => s1 == s2 && e1 == e2 && t1 == t2,
            _ => false,
        })
}

impl PartialEq for Array {
    fn eq(&self, other: &Self) -> bool {
        if std::ptr::eq(self, other) {
            return true;
        }
        self.structural_hash == other.structural_hash
            && self.dtype == other.dtype
            && self.shape == other.shape
            && self.axes == other.axes
            && self.tags == other.tags
            && kinds_equal(&self.kind, &other.kind)
    }
}

impl Eq for Array {}

impl Hash for Array {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.structural_hash.hash(state);
    }
}

// ============================================================================
// Dict of Named Arrays
// ============================================================================

/// An ordered container mapping names to arrays; the result type of
/// multi-output computations.
#[derive(Debug)]
pub struct DictOfNamedArrays {
    id: NodeId,
    structural_hash: u64,
    data: IndexMap<String, ArrayRef>,
    tags: TagSet,
}

impl DictOfNamedArrays {
    pub fn new(data: IndexMap<String, ArrayRef>, tags: TagSet) -> DictRef {
        let mut hasher = DefaultHasher::new();
        for (name, ary) in &data {
            name.hash(&mut hasher);
            ary.structural_hash.hash(&mut hasher);
        }
        tags.hash(&mut hasher);
        Arc::new(DictOfNamedArrays {
            id: NodeId::fresh(),
            structural_hash: hasher.finish(),
            data,
            tags,
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn structural_hash(&self) -> u64 {
        self.structural_hash
    }

    pub fn tags(&self) -> &TagSet {
        &self.tags
    }

    pub fn entries(&self) -> &IndexMap<String, ArrayRef> {
        &self.data
    }

    pub fn get(&self, name: &str) -> Option<&ArrayRef> {
        self.data.get(name)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl PartialEq for DictOfNamedArrays {
    fn eq(&self, other: &Self) -> bool {
        self.structural_hash == other.structural_hash
            && self.tags == other.tags
            && self.data.len() == other.data.len()
            && self
                .data
                .iter()
                .zip(other.data.iter())
                .all(|((n1, a1), (n2, a2))| n1 == n2 && array_refs_equal(a1, a2))
    }
}

impl Eq for DictOfNamedArrays {}

impl Hash for DictOfNamedArrays {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.structural_hash.hash(state);
    }
}

// ============================================================================
// Array-or-Names
// ============================================================================

/// Either a single array or a dict of named arrays; the input/output type
/// of whole-DAG transformations.
#[derive(Debug, Clone)]
pub enum ArrayOrNames {
    Array(ArrayRef),
    Dict(DictRef),
}

impl ArrayOrNames {
    pub fn as_array(&self) -> Option<&ArrayRef> {
        match self {
            ArrayOrNames::Array(a) => Some(a),
            ArrayOrNames::Dict(_) => None,
        }
    }

    pub fn as_dict(&self) -> Option<&DictRef> {
        match self {
            ArrayOrNames::Array(_) => None,
            ArrayOrNames::Dict(d) => Some(d),
        }
    }
}

impl PartialEq for ArrayOrNames {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ArrayOrNames::Array(a), ArrayOrNames::Array(b)) => array_refs_equal(a, b),
            (ArrayOrNames::Dict(a), ArrayOrNames::Dict(b)) => Arc::ptr_eq(a, b) || **a == **b,
            _ => false,
        }
    }
}

impl Eq for ArrayOrNames {}

impl From<ArrayRef> for ArrayOrNames {
    fn from(a: ArrayRef) -> Self {
        ArrayOrNames::Array(a)
    }
}

impl From<DictRef> for ArrayOrNames {
    fn from(d: DictRef) -> Self {
        ArrayOrNames::Dict(d)
    }
}

#[cfg(test)]
mod tests {
    use super::builders;
    use super::*;
    use crate::value::DType;

    #[test]
    fn test_axis_count_matches_shape() {
        let p = builders::make_placeholder("x", Shape::of_consts(&[2, 3]), DType::Float64)
            .expect("valid placeholder");
        assert_eq!(p.axes().len(), p.shape().ndim());
    }

    #[test]
    fn test_structural_equality_ignores_identity() {
        let a = builders::make_placeholder("x", Shape::of_consts(&[4]), DType::Float32)
            .expect("valid placeholder");
        let b = builders::make_placeholder("x", Shape::of_consts(&[4]), DType::Float32)
            .expect("valid placeholder");
        assert_ne!(a.id(), b.id());
        assert_eq!(*a, *b);
        assert_eq!(a.structural_hash(), b.structural_hash());
    }

    #[test]
    fn test_non_equality_tags_do_not_affect_equality() {
        let a = builders::make_placeholder("x", Shape::of_consts(&[4]), DType::Float32)
            .expect("valid placeholder");
        let b = Array::new(
            a.kind().clone(),
            a.shape().clone(),
            a.dtype(),
            a.axes().to_vec(),
            a.tags().clone(),
            [Tag::Opaque("created-by-test".into())].into_iter().collect(),
        )
        .expect("valid rebuild");
        assert_eq!(*a, *b);
        assert_eq!(a.structural_hash(), b.structural_hash());
    }

    #[test]
    fn test_tags_affect_equality() {
        let a = builders::make_placeholder("x", Shape::of_consts(&[4]), DType::Float32)
            .expect("valid placeholder");
        let b = a.tagged(Tag::ImplStored);
        assert_ne!(*a, *b);
    }

    #[test]
    fn test_data_wrappers_compare_by_data_identity() {
        let d1 = DataHandle::new(vec![3], DType::Float64);
        let d2 = DataHandle::new(vec![3], DType::Float64);
        let a = builders::make_data_wrapper(d1.clone(), TagSet::new()).expect("valid wrapper");
        let b = builders::make_data_wrapper(d1, TagSet::new()).expect("valid wrapper");
        let c = builders::make_data_wrapper(d2, TagSet::new()).expect("valid wrapper");
        assert_eq!(*a, *b);
        assert_ne!(*a, *c);
    }

    #[test]
    fn test_empty_array_detection() {
        let shape = Shape::of_consts(&[4, 0, 2]);
        assert!(shape.is_empty_array());
        assert!(!Shape::of_consts(&[4, 2]).is_empty_array());
    }
}
