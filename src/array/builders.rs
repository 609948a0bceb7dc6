//! Validated constructors for array-expression nodes.
//!
//! All user-facing node creation goes through these functions; they enforce
//! the construction invariants (identifier validity, axis/shape agreement,
//! dtype promotion, affine shape expressions) so that the transformation
//! passes can assume well-formed inputs.

use super::{
    default_axes, AdvIndexArg, Array, ArrayError, ArrayKind, ArrayRef, Axis, DataHandle,
    EinsumAxis, IndexArg, ReshapeOrder, Shape, ShapeComponent, shape_components_equal,
    DictOfNamedArrays, DictRef,
};
use crate::array::ReductionDescriptor;
use crate::scalar::{self, ScalarExpr, ScalarRef};
use crate::tags::TagSet;
use crate::utils::is_identifier;
use crate::value::{DType, Lit};
use indexmap::IndexMap;
use std::collections::BTreeMap;

/// Binding names synthesized when re-exposing operands of lowered nodes.
pub(crate) fn nth_input_name(i: usize) -> String {
    format!("_al_in{i}")
}

fn validate_shape(shape: &Shape) -> Result<(), ArrayError> {
    for component in shape.components() {
        if let ShapeComponent::Expr(e) = component {
            let free = scalar::free_variables(e);
            for name in &free {
                if !is_identifier(name) {
                    return Err(ArrayError::InvalidIdentifier(name.clone()));
                }
            }
            if !scalar::is_affine(e, &free) {
                return Err(ArrayError::NonAffineShape(e.to_string()));
            }
        }
    }
    Ok(())
}

// ============================================================================
// Input Arguments
// ============================================================================

pub fn make_placeholder(
    name: impl Into<String>,
    shape: Shape,
    dtype: DType,
) -> Result<ArrayRef, ArrayError> {
    make_placeholder_with_tags(name, shape, dtype, TagSet::new())
}

pub fn make_placeholder_with_tags(
    name: impl Into<String>,
    shape: Shape,
    dtype: DType,
    tags: TagSet,
) -> Result<ArrayRef, ArrayError> {
    let name = name.into();
    if !is_identifier(&name) {
        return Err(ArrayError::InvalidIdentifier(name));
    }
    validate_shape(&shape)?;
    let ndim = shape.ndim();
    Array::new(
        ArrayKind::Placeholder { name },
        shape,
        dtype,
        default_axes(ndim),
        tags,
        TagSet::new(),
    )
}

/// A named scalar integer parameter; usable by name inside shape
/// expressions.
pub fn make_size_param(name: impl Into<String>) -> Result<ArrayRef, ArrayError> {
    let name = name.into();
    if !is_identifier(&name) {
        return Err(ArrayError::InvalidIdentifier(name));
    }
    Array::new(
        ArrayKind::SizeParam { name },
        Shape::scalar(),
        DType::Int64,
        Vec::new(),
        TagSet::new(),
        TagSet::new(),
    )
}

pub fn make_data_wrapper(data: DataHandle, tags: TagSet) -> Result<ArrayRef, ArrayError> {
    make_named_data_wrapper(None, data, tags)
}

pub fn make_named_data_wrapper(
    name: Option<String>,
    data: DataHandle,
    tags: TagSet,
) -> Result<ArrayRef, ArrayError> {
    if let Some(n) = &name {
        if !is_identifier(n) {
            return Err(ArrayError::InvalidIdentifier(n.clone()));
        }
    }
    let shape = Shape::of_consts(data.shape());
    let dtype = data.dtype();
    let ndim = shape.ndim();
    Array::new(
        ArrayKind::DataWrapper { name, data },
        shape,
        dtype,
        default_axes(ndim),
        tags,
        TagSet::new(),
    )
}

// ============================================================================
// Index Lambda
// ============================================================================

/// Build an [`ArrayKind::IndexLambda`] node after checking that
///
/// - binding names are identifiers and the map is in sorted name order,
/// - every subscripted operand in `expr` is bound,
/// - every reduction index `_rk` used in `expr` has a descriptor.
pub fn make_index_lambda(
    expr: ScalarRef,
    shape: Shape,
    dtype: DType,
    bindings: IndexMap<String, ArrayRef>,
    reductions: BTreeMap<String, ReductionDescriptor>,
) -> Result<ArrayRef, ArrayError> {
    validate_shape(&shape)?;

    let mut sorted_bindings: Vec<(String, ArrayRef)> = bindings.into_iter().collect();
    sorted_bindings.sort_by(|(a, _), (b, _)| a.cmp(b));
    let bindings: IndexMap<String, ArrayRef> = sorted_bindings.into_iter().collect();

    for name in bindings.keys() {
        if !is_identifier(name) {
            return Err(ArrayError::InvalidIdentifier(name.clone()));
        }
    }

    let free = scalar::free_variables(&expr);
    for name in &free {
        if let Some(stripped) = name.strip_prefix("_r") {
            if stripped.chars().all(|c| c.is_ascii_digit())
                && !stripped.is_empty()
                && !reductions.contains_key(name)
            {
                return Err(ArrayError::MissingReductionDescriptor(name.clone()));
            }
        }
    }
    let mut subscripted: Vec<String> = Vec::new();
    scalar::for_each(&expr, &mut |node| {
        if let ScalarExpr::Subscript { array, .. } = &**node {
            subscripted.push(array.clone());
        }
    });
    for name in subscripted {
        if !bindings.contains_key(&name) {
            return Err(ArrayError::UnknownName(name));
        }
    }

    let ndim = shape.ndim();
    Array::new(
        ArrayKind::IndexLambda {
            expr,
            bindings,
            reductions,
        },
        shape,
        dtype,
        default_axes(ndim),
        TagSet::new(),
        TagSet::new(),
    )
}

/// An array of `shape` filled with `fill`.
pub fn full(shape: Shape, fill: Lit, dtype: DType) -> Result<ArrayRef, ArrayError> {
    make_index_lambda(
        scalar::lit(fill),
        shape,
        dtype,
        IndexMap::new(),
        BTreeMap::new(),
    )
}

/// An all-zeros array; the replacement value used by
/// [`zero_unused_call_bindings`](crate::transform::calls::zero_unused_call_bindings).
pub fn zeros(shape: Shape, dtype: DType) -> Result<ArrayRef, ArrayError> {
    full(shape, dtype.zero(), dtype)
}

/// Elementwise binary combination of two same-shape operands, with dtype
/// promotion.
pub fn elementwise_binary(
    op: scalar::BinaryOp,
    left: &ArrayRef,
    right: &ArrayRef,
) -> Result<ArrayRef, ArrayError> {
    if left.ndim() != right.ndim()
        || !left
            .shape()
            .components()
            .iter()
            .zip(right.shape().components())
            .all(|(a, b)| shape_components_equal(a, b))
    {
        return Err(ArrayError::ShapeMismatch(format!(
            "{} vs {}",
            left.shape(),
            right.shape()
        )));
    }
    let indices: Vec<ScalarRef> = (0..left.ndim()).map(scalar::elem_index).collect();
    let expr = scalar::binary(
        op,
        scalar::subscript(nth_input_name(0), indices.clone()),
        scalar::subscript(nth_input_name(1), indices),
    );
    let bindings: IndexMap<String, ArrayRef> = [
        (nth_input_name(0), left.clone()),
        (nth_input_name(1), right.clone()),
    ]
    .into_iter()
    .collect();
    make_index_lambda(
        expr,
        left.shape().clone(),
        left.dtype().promote(right.dtype()),
        bindings,
        BTreeMap::new(),
    )
}

// ============================================================================
// High-Level Ops
// ============================================================================

/// Parse and build an einsum node from a subscripts spec like
/// `"ik,kj->ij"`.
pub fn einsum(spec: &str, args: &[ArrayRef]) -> Result<ArrayRef, ArrayError> {
    let (input_spec, output_spec) = spec
        .split_once("->")
        .ok_or_else(|| ArrayError::BadEinsumSpec(format!("missing '->' in '{spec}'")))?;
    let input_specs: Vec<&str> = input_spec.split(',').collect();
    if input_specs.len() != args.len() {
        return Err(ArrayError::BadEinsumSpec(format!(
            "{} operand specs for {} arguments",
            input_specs.len(),
            args.len()
        )));
    }

    let output_letters: Vec<char> = output_spec.chars().collect();
    for (i, c) in output_letters.iter().enumerate() {
        if output_letters[..i].contains(c) {
            return Err(ArrayError::BadEinsumSpec(format!(
                "repeated output subscript '{c}'"
            )));
        }
    }

    // Assign contracted letters reduction slots by first appearance.
    let mut reduction_letters: Vec<char> = Vec::new();
    for arg_spec in &input_specs {
        for c in arg_spec.chars() {
            if !output_letters.contains(&c) && !reduction_letters.contains(&c) {
                reduction_letters.push(c);
            }
        }
    }

    let mut letter_extent: BTreeMap<char, ShapeComponent> = BTreeMap::new();
    let mut access: Vec<Vec<EinsumAxis>> = Vec::new();
    for (arg_spec, arg) in input_specs.iter().zip(args) {
        let letters: Vec<char> = arg_spec.chars().collect();
        if letters.len() != arg.ndim() {
            return Err(ArrayError::BadEinsumSpec(format!(
                "spec '{arg_spec}' has {} subscripts for a {}-dimensional argument",
                letters.len(),
                arg.ndim()
            )));
        }
        let mut arg_access = Vec::new();
        for (axis, c) in letters.iter().enumerate() {
            let extent = &arg.shape().components()[axis];
            match letter_extent.get(c) {
                Some(seen) if !shape_components_equal(seen, extent) => {
                    return Err(ArrayError::ShapeMismatch(format!(
                        "subscript '{c}' has extents {seen} and {extent}"
                    )));
                }
                Some(_) => {}
                None => {
                    letter_extent.insert(*c, extent.clone());
                }
            }
            if let Some(pos) = output_letters.iter().position(|o| o == c) {
                arg_access.push(EinsumAxis::Output(pos));
            } else if let Some(pos) = reduction_letters.iter().position(|r| r == c) {
                arg_access.push(EinsumAxis::Reduction(pos));
            }
        }
        access.push(arg_access);
    }

    let mut out_components = Vec::new();
    for c in &output_letters {
        let extent = letter_extent
            .get(c)
            .ok_or_else(|| ArrayError::BadEinsumSpec(format!("output subscript '{c}' unused")))?;
        out_components.push(extent.clone());
    }

    let dtype = args
        .iter()
        .map(|a| a.dtype())
        .reduce(DType::promote)
        .ok_or_else(|| ArrayError::BadEinsumSpec("einsum needs at least one operand".into()))?;

    let reduction_descrs: BTreeMap<usize, ReductionDescriptor> = (0..reduction_letters.len())
        .map(|i| (i, ReductionDescriptor::default()))
        .collect();

    let shape = Shape(out_components);
    let ndim = shape.ndim();
    Array::new(
        ArrayKind::Einsum {
            access,
            args: args.to_vec(),
            reduction_descrs,
        },
        shape,
        dtype,
        default_axes(ndim),
        TagSet::new(),
        TagSet::new(),
    )
}

pub fn reshape(
    array: &ArrayRef,
    new_shape: Shape,
    order: ReshapeOrder,
) -> Result<ArrayRef, ArrayError> {
    validate_shape(&new_shape)?;
    let old_size: Option<u64> = array
        .shape()
        .components()
        .iter()
        .map(ShapeComponent::as_const)
        .product();
    let new_size: Option<u64> = new_shape
        .components()
        .iter()
        .map(ShapeComponent::as_const)
        .product();
    if let (Some(old), Some(new)) = (old_size, new_size) {
        if old != new {
            return Err(ArrayError::ShapeMismatch(format!(
                "cannot reshape {} elements into {}",
                old, new
            )));
        }
    }
    let ndim = new_shape.ndim();
    Array::new(
        ArrayKind::Reshape {
            array: array.clone(),
            order,
        },
        new_shape,
        array.dtype(),
        default_axes(ndim),
        TagSet::new(),
        TagSet::new(),
    )
}

pub fn permute_axes(array: &ArrayRef, permutation: Vec<usize>) -> Result<ArrayRef, ArrayError> {
    let ndim = array.ndim();
    if permutation.len() != ndim {
        return Err(ArrayError::Invalid(format!(
            "permutation of length {} for a {ndim}-dimensional array",
            permutation.len()
        )));
    }
    let mut seen = vec![false; ndim];
    for &p in &permutation {
        if p >= ndim || seen[p] {
            return Err(ArrayError::Invalid(format!(
                "{permutation:?} is not a permutation of 0..{ndim}"
            )));
        }
        seen[p] = true;
    }
    let shape = Shape(
        permutation
            .iter()
            .map(|&p| array.shape().components()[p].clone())
            .collect(),
    );
    let axes: Vec<Axis> = permutation
        .iter()
        .map(|&p| array.axes()[p].clone())
        .collect();
    Array::new(
        ArrayKind::AxisPermutation {
            array: array.clone(),
            permutation,
        },
        shape,
        array.dtype(),
        axes,
        TagSet::new(),
        TagSet::new(),
    )
}

pub fn roll(array: &ArrayRef, shift: i64, axis: usize) -> Result<ArrayRef, ArrayError> {
    if axis >= array.ndim() {
        return Err(ArrayError::AxisOutOfBounds {
            axis,
            ndim: array.ndim(),
        });
    }
    Array::new(
        ArrayKind::Roll {
            array: array.clone(),
            shift,
            axis,
        },
        array.shape().clone(),
        array.dtype(),
        array.axes().to_vec(),
        TagSet::new(),
        TagSet::new(),
    )
}

pub fn stack(arrays: &[ArrayRef], axis: usize) -> Result<ArrayRef, ArrayError> {
    let first = arrays
        .first()
        .ok_or_else(|| ArrayError::Invalid("cannot stack zero arrays".into()))?;
    if axis > first.ndim() {
        return Err(ArrayError::AxisOutOfBounds {
            axis,
            ndim: first.ndim() + 1,
        });
    }
    for other in &arrays[1..] {
        if other.dtype() != first.dtype() {
            return Err(ArrayError::Invalid(
                "stacked arrays must share a dtype".into(),
            ));
        }
        if other.ndim() != first.ndim()
            || !other
                .shape()
                .components()
                .iter()
                .zip(first.shape().components())
                .all(|(a, b)| shape_components_equal(a, b))
        {
            return Err(ArrayError::ShapeMismatch(format!(
                "{} vs {}",
                other.shape(),
                first.shape()
            )));
        }
    }
    let mut components = first.shape().components().to_vec();
    components.insert(axis, ShapeComponent::Const(arrays.len() as u64));
    let shape = Shape(components);
    let ndim = shape.ndim();
    Array::new(
        ArrayKind::Stack {
            arrays: arrays.to_vec(),
            axis,
        },
        shape,
        first.dtype(),
        default_axes(ndim),
        TagSet::new(),
        TagSet::new(),
    )
}

pub fn concatenate(arrays: &[ArrayRef], axis: usize) -> Result<ArrayRef, ArrayError> {
    let first = arrays
        .first()
        .ok_or_else(|| ArrayError::Invalid("cannot concatenate zero arrays".into()))?;
    if axis >= first.ndim() {
        return Err(ArrayError::AxisOutOfBounds {
            axis,
            ndim: first.ndim(),
        });
    }
    for other in &arrays[1..] {
        if other.dtype() != first.dtype() {
            return Err(ArrayError::Invalid(
                "concatenated arrays must share a dtype".into(),
            ));
        }
        if other.ndim() != first.ndim() {
            return Err(ArrayError::ShapeMismatch(format!(
                "{} vs {}",
                other.shape(),
                first.shape()
            )));
        }
        for (i, (a, b)) in other
            .shape()
            .components()
            .iter()
            .zip(first.shape().components())
            .enumerate()
        {
            if i != axis && !shape_components_equal(a, b) {
                return Err(ArrayError::ShapeMismatch(format!(
                    "axis {i}: {a} vs {b}"
                )));
            }
        }
    }

    let concat_extent = arrays
        .iter()
        .map(|a| a.shape().components()[axis].clone())
        .reduce(|acc, c| match (acc.as_const(), c.as_const()) {
            (Some(x), Some(y)) => ShapeComponent::Const(x + y),
            _ => ShapeComponent::Expr(scalar::add(acc.as_scalar(), c.as_scalar())),
        })
        .unwrap_or(ShapeComponent::Const(0));

    let mut components = first.shape().components().to_vec();
    components[axis] = concat_extent;
    let shape = Shape(components);
    let ndim = shape.ndim();
    Array::new(
        ArrayKind::Concatenate {
            arrays: arrays.to_vec(),
            axis,
        },
        shape,
        first.dtype(),
        default_axes(ndim),
        TagSet::new(),
        TagSet::new(),
    )
}

// ============================================================================
// Indexing
// ============================================================================

fn slice_extent(start: i64, stop: i64, step: i64) -> Result<u64, ArrayError> {
    if step == 0 {
        return Err(ArrayError::Invalid("slice step must be nonzero".into()));
    }
    let span = if step > 0 { stop - start } else { start - stop };
    if span <= 0 {
        return Ok(0);
    }
    let step_abs = step.unsigned_abs() as i64;
    Ok(((span + step_abs - 1) / step_abs) as u64)
}

/// Basic (slice/integer) indexing. `indices` must cover every axis;
/// integer indices drop their axis, slices keep it.
pub fn basic_index(array: &ArrayRef, indices: Vec<IndexArg>) -> Result<ArrayRef, ArrayError> {
    if indices.len() != array.ndim() {
        return Err(ArrayError::Invalid(format!(
            "{} index entries for a {}-dimensional array",
            indices.len(),
            array.ndim()
        )));
    }
    let mut components = Vec::new();
    let mut axes = Vec::new();
    for (axis, index) in indices.iter().enumerate() {
        let extent = &array.shape().components()[axis];
        match index {
            IndexArg::Int(i) => {
                if let Some(n) = extent.as_const() {
                    if *i < 0 || *i >= n as i64 {
                        return Err(ArrayError::Invalid(format!(
                            "index {i} out of bounds for axis {axis} of extent {n}"
                        )));
                    }
                }
            }
            IndexArg::Slice { start, stop, step } => {
                if *start < 0 || *stop < 0 {
                    return Err(ArrayError::Invalid(
                        "slice bounds must be nonnegative".into(),
                    ));
                }
                if let Some(n) = extent.as_const() {
                    if *start > n as i64 || *stop > n as i64 {
                        return Err(ArrayError::Invalid(format!(
                            "slice [{start}:{stop}] out of bounds for axis {axis} of extent {n}"
                        )));
                    }
                }
                components.push(ShapeComponent::Const(slice_extent(*start, *stop, *step)?));
                axes.push(array.axes()[axis].clone());
            }
        }
    }
    let shape = Shape(components);
    Array::new(
        ArrayKind::BasicIndex {
            array: array.clone(),
            indices,
        },
        shape,
        array.dtype(),
        axes,
        TagSet::new(),
        TagSet::new(),
    )
}

/// Slice `array` along one axis, keeping every other axis in full.
pub fn slice_along_axis(
    array: &ArrayRef,
    axis: usize,
    start: i64,
    stop: i64,
) -> Result<ArrayRef, ArrayError> {
    if axis >= array.ndim() {
        return Err(ArrayError::AxisOutOfBounds {
            axis,
            ndim: array.ndim(),
        });
    }
    let indices: Vec<IndexArg> = (0..array.ndim())
        .map(|i| {
            if i == axis {
                IndexArg::Slice {
                    start,
                    stop,
                    step: 1,
                }
            } else {
                let extent = array.shape().components()[i]
                    .as_const()
                    .map(|n| n as i64)
                    .unwrap_or(i64::MAX);
                IndexArg::Slice {
                    start: 0,
                    stop: extent,
                    step: 1,
                }
            }
        })
        .collect();
    // Full slices over symbolic axes are not expressible with constant
    // bounds; re-derive their extents from the input shape instead.
    let mut components = Vec::new();
    let mut axes = Vec::new();
    for (i, index) in indices.iter().enumerate() {
        match index {
            IndexArg::Slice { start, stop, .. } if i == axis => {
                components.push(ShapeComponent::Const(slice_extent(*start, *stop, 1)?));
                axes.push(array.axes()[i].clone());
            }
            _ => {
                components.push(array.shape().components()[i].clone());
                axes.push(array.axes()[i].clone());
            }
        }
    }
    Array::new(
        ArrayKind::BasicIndex {
            array: array.clone(),
            indices,
        },
        Shape(components),
        array.dtype(),
        axes,
        TagSet::new(),
        TagSet::new(),
    )
}

fn validate_adv_indices(
    array: &ArrayRef,
    indices: &[AdvIndexArg],
) -> Result<(Vec<ShapeComponent>, usize), ArrayError> {
    if indices.len() != array.ndim() {
        return Err(ArrayError::Invalid(format!(
            "{} index entries for a {}-dimensional array",
            indices.len(),
            array.ndim()
        )));
    }
    let mut gather_shape: Option<Vec<ShapeComponent>> = None;
    let mut n_array_indices = 0;
    for index in indices {
        if let AdvIndexArg::Array(idx) = index {
            if !idx.dtype().is_integral() {
                return Err(ArrayError::NonIntegralIndex(format!(
                    "index array has dtype {}",
                    idx.dtype()
                )));
            }
            n_array_indices += 1;
            match &gather_shape {
                None => gather_shape = Some(idx.shape().components().to_vec()),
                Some(seen) => {
                    if seen.len() != idx.ndim()
                        || !seen
                            .iter()
                            .zip(idx.shape().components())
                            .all(|(a, b)| shape_components_equal(a, b))
                    {
                        return Err(ArrayError::ShapeMismatch(
                            "advanced index arrays must share a shape".into(),
                        ));
                    }
                }
            }
        }
    }
    let gather_shape = gather_shape
        .ok_or_else(|| ArrayError::Invalid("advanced index needs at least one index array".into()))?;
    Ok((gather_shape, n_array_indices))
}

/// Advanced indexing where the array indices occupy contiguous axis
/// positions; the gathered axes stay in place.
pub fn advanced_index_contiguous(
    array: &ArrayRef,
    indices: Vec<AdvIndexArg>,
) -> Result<ArrayRef, ArrayError> {
    let (gather_shape, _) = validate_adv_indices(array, &indices)?;

    let mut components = Vec::new();
    let mut gather_emitted = false;
    for index in &indices {
        match index {
            AdvIndexArg::Array(_) => {
                if !gather_emitted {
                    components.extend(gather_shape.iter().cloned());
                    gather_emitted = true;
                }
            }
            AdvIndexArg::Int(_) => {}
            AdvIndexArg::Slice { start, stop, step } => {
                components.push(ShapeComponent::Const(slice_extent(*start, *stop, *step)?));
            }
        }
    }
    let shape = Shape(components);
    let ndim = shape.ndim();
    Array::new(
        ArrayKind::AdvancedIndexContiguous {
            array: array.clone(),
            indices,
        },
        shape,
        array.dtype(),
        default_axes(ndim),
        TagSet::new(),
        TagSet::new(),
    )
}

/// Advanced indexing with non-contiguous array-index positions; the
/// gathered axes move to the front of the result.
pub fn advanced_index_non_contiguous(
    array: &ArrayRef,
    indices: Vec<AdvIndexArg>,
) -> Result<ArrayRef, ArrayError> {
    let (gather_shape, _) = validate_adv_indices(array, &indices)?;

    let mut components: Vec<ShapeComponent> = gather_shape;
    for index in &indices {
        match index {
            AdvIndexArg::Array(_) | AdvIndexArg::Int(_) => {}
            AdvIndexArg::Slice { start, stop, step } => {
                components.push(ShapeComponent::Const(slice_extent(*start, *stop, *step)?));
            }
        }
    }
    let shape = Shape(components);
    let ndim = shape.ndim();
    Array::new(
        ArrayKind::AdvancedIndexNonContiguous {
            array: array.clone(),
            indices,
        },
        shape,
        array.dtype(),
        default_axes(ndim),
        TagSet::new(),
        TagSet::new(),
    )
}

// ============================================================================
// Containers
// ============================================================================

/// Build a [`DictOfNamedArrays`], validating member names.
pub fn make_dict_of_named_arrays(
    data: IndexMap<String, ArrayRef>,
) -> Result<DictRef, ArrayError> {
    for name in data.keys() {
        if !is_identifier(name) {
            return Err(ArrayError::InvalidIdentifier(name.clone()));
        }
    }
    Ok(DictOfNamedArrays::new(data, TagSet::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scalar::BinaryOp;

    #[test]
    fn test_placeholder_rejects_bad_names() {
        assert!(make_placeholder("2x", Shape::of_consts(&[1]), DType::Int32).is_err());
        assert!(make_placeholder("", Shape::scalar(), DType::Int32).is_err());
    }

    #[test]
    fn test_shape_must_be_affine() {
        let bad = Shape(vec![ShapeComponent::Expr(scalar::mul(
            scalar::var("n"),
            scalar::var("n"),
        ))]);
        assert!(make_placeholder("x", bad, DType::Int32).is_err());

        let good = Shape(vec![ShapeComponent::Expr(scalar::add(
            scalar::mul(scalar::int(2), scalar::var("n")),
            scalar::int(1),
        ))]);
        assert!(make_placeholder("x", good, DType::Int32).is_ok());
    }

    #[test]
    fn test_index_lambda_checks_operands() {
        let expr = scalar::subscript("a", vec![scalar::elem_index(0)]);
        let err = make_index_lambda(
            expr,
            Shape::of_consts(&[3]),
            DType::Float64,
            IndexMap::new(),
            BTreeMap::new(),
        );
        assert!(matches!(err, Err(ArrayError::UnknownName(_))));
    }

    #[test]
    fn test_index_lambda_requires_reduction_descriptor() {
        let err = make_index_lambda(
            scalar::var("_r0"),
            Shape::scalar(),
            DType::Float64,
            IndexMap::new(),
            BTreeMap::new(),
        );
        assert!(matches!(
            err,
            Err(ArrayError::MissingReductionDescriptor(_))
        ));
    }

    #[test]
    fn test_einsum_matmul_shape() {
        let a = make_placeholder("a", Shape::of_consts(&[5, 7]), DType::Float32)
            .expect("valid placeholder");
        let b = make_placeholder("b", Shape::of_consts(&[7, 2]), DType::Float64)
            .expect("valid placeholder");
        let c = einsum("ik,kj->ij", &[a, b]).expect("valid einsum");
        assert_eq!(c.shape(), &Shape::of_consts(&[5, 2]));
        assert_eq!(c.dtype(), DType::Float64);
        match c.kind() {
            ArrayKind::Einsum { access, .. } => {
                assert_eq!(
                    access[0],
                    vec![EinsumAxis::Output(0), EinsumAxis::Reduction(0)]
                );
                assert_eq!(
                    access[1],
                    vec![EinsumAxis::Reduction(0), EinsumAxis::Output(1)]
                );
            }
            other => panic!("expected Einsum, got {other:?}"),
        }
    }

    #[test]
    fn test_einsum_rejects_extent_mismatch() {
        let a = make_placeholder("a", Shape::of_consts(&[5, 7]), DType::Float32)
            .expect("valid placeholder");
        let b = make_placeholder("b", Shape::of_consts(&[8, 2]), DType::Float32)
            .expect("valid placeholder");
        assert!(einsum("ik,kj->ij", &[a, b]).is_err());
    }

    #[test]
    fn test_reshape_checks_size() {
        let x = make_placeholder("x", Shape::of_consts(&[6]), DType::Float64)
            .expect("valid placeholder");
        assert!(reshape(&x, Shape::of_consts(&[2, 3]), ReshapeOrder::C).is_ok());
        assert!(reshape(&x, Shape::of_consts(&[4, 2]), ReshapeOrder::C).is_err());
    }

    #[test]
    fn test_stack_and_concatenate_shapes() {
        let a = make_placeholder("a", Shape::of_consts(&[4, 3]), DType::Float64)
            .expect("valid placeholder");
        let b = make_placeholder("b", Shape::of_consts(&[7, 3]), DType::Float64)
            .expect("valid placeholder");

        let stacked = stack(&[a.clone(), a.clone()], 0).expect("valid stack");
        assert_eq!(stacked.shape(), &Shape::of_consts(&[2, 4, 3]));

        let cat = concatenate(&[a.clone(), b], 0).expect("valid concatenate");
        assert_eq!(cat.shape(), &Shape::of_consts(&[11, 3]));

        let c = make_placeholder("c", Shape::of_consts(&[4, 4]), DType::Float64)
            .expect("valid placeholder");
        assert!(concatenate(&[a, c], 0).is_err());
    }

    #[test]
    fn test_basic_index_shapes() {
        let x = make_placeholder("x", Shape::of_consts(&[10, 4]), DType::Int64)
            .expect("valid placeholder");
        let sliced = basic_index(
            &x,
            vec![
                IndexArg::Slice {
                    start: 2,
                    stop: 8,
                    step: 2,
                },
                IndexArg::Int(1),
            ],
        )
        .expect("valid basic index");
        assert_eq!(sliced.shape(), &Shape::of_consts(&[3]));

        assert!(basic_index(&x, vec![IndexArg::Int(10), IndexArg::Int(0)]).is_err());
    }

    #[test]
    fn test_slice_along_axis() {
        let x = make_placeholder("x", Shape::of_consts(&[11, 3]), DType::Float64)
            .expect("valid placeholder");
        let s = slice_along_axis(&x, 0, 4, 11).expect("valid slice");
        assert_eq!(s.shape(), &Shape::of_consts(&[7, 3]));
    }

    #[test]
    fn test_elementwise_binary_promotes() {
        let a = make_placeholder("a", Shape::of_consts(&[3]), DType::Int32)
            .expect("valid placeholder");
        let b = make_placeholder("b", Shape::of_consts(&[3]), DType::Float32)
            .expect("valid placeholder");
        let sum = elementwise_binary(BinaryOp::Add, &a, &b).expect("valid sum");
        assert_eq!(sum.dtype(), DType::Float32);
    }

    #[test]
    fn test_zeros() {
        let z = zeros(Shape::of_consts(&[2, 2]), DType::Float64).expect("valid zeros");
        match z.kind() {
            ArrayKind::IndexLambda { expr, bindings, .. } => {
                assert!(bindings.is_empty());
                assert_eq!(expr.to_string(), "0");
            }
            other => panic!("expected IndexLambda, got {other:?}"),
        }
    }
}
