//! Lowering of high-level array nodes to the canonical indexed-scalar
//! form.
//!
//! Every sugared node maps to an [`IndexLambda`](ArrayKind::IndexLambda)
//! with the same shape and dtype whose expression defines one output
//! element in terms of the elementwise indices `_0, _1, …`. Operands are
//! re-exposed under synthetic binding names.

use crate::array::builders::nth_input_name;
use crate::array::{
    AdvIndexArg, Array, ArrayKind, ArrayRef, EinsumAxis, IndexArg, ReductionDescriptor,
    ReshapeOrder, Shape, ShapeComponent,
};
use crate::scalar::{self, CmpOp, ReductionBounds, ReductionOp, ScalarRef};
use crate::transform::TransformError;
use indexmap::IndexMap;
use std::collections::BTreeMap;

/// Rewrite one high-level node as an index lambda over its operands.
///
/// Identity on nodes that already are index lambdas; input arguments and
/// call results have no indexed-scalar form and are rejected.
pub fn to_index_lambda(expr: &ArrayRef) -> Result<ArrayRef, TransformError> {
    match expr.kind() {
        ArrayKind::IndexLambda { .. } => Ok(expr.clone()),
        ArrayKind::Einsum {
            access,
            args,
            reduction_descrs,
        } => lower_einsum(expr, access, args, reduction_descrs),
        ArrayKind::Reshape { array, order } => lower_reshape(expr, array, *order),
        ArrayKind::AxisPermutation { array, permutation } => {
            lower_axis_permutation(expr, array, permutation)
        }
        ArrayKind::Stack { arrays, axis } => lower_stack(expr, arrays, *axis),
        ArrayKind::Concatenate { arrays, axis } => lower_concatenate(expr, arrays, *axis),
        ArrayKind::Roll { array, shift, axis } => lower_roll(expr, array, *shift, *axis),
        ArrayKind::BasicIndex { array, indices } => lower_basic_index(expr, array, indices),
        ArrayKind::AdvancedIndexContiguous { array, indices } => {
            lower_advanced_index(expr, array, indices, true)
        }
        ArrayKind::AdvancedIndexNonContiguous { array, indices } => {
            lower_advanced_index(expr, array, indices, false)
        }
        ArrayKind::Placeholder { .. }
        | ArrayKind::DataWrapper { .. }
        | ArrayKind::SizeParam { .. }
        | ArrayKind::CallResult { .. }
        | ArrayKind::KernelCallResult { .. } => Err(TransformError::Other(format!(
            "node has no indexed-scalar form: {:?}",
            std::mem::discriminant(expr.kind())
        ))),
    }
}

/// Rebuild `expr` as an index lambda, keeping shape, dtype, axes, and
/// tags.
fn as_index_lambda(
    template: &ArrayRef,
    body: ScalarRef,
    bindings: IndexMap<String, ArrayRef>,
    reductions: BTreeMap<String, ReductionDescriptor>,
) -> Result<ArrayRef, TransformError> {
    Ok(Array::new(
        ArrayKind::IndexLambda {
            expr: body,
            bindings,
            reductions,
        },
        template.shape().clone(),
        template.dtype(),
        template.axes().to_vec(),
        template.tags().clone(),
        template.non_equality_tags().clone(),
    )?)
}

fn elem_indices(ndim: usize) -> Vec<ScalarRef> {
    (0..ndim).map(scalar::elem_index).collect()
}

// ============================================================================
// Einsum
// ============================================================================

fn lower_einsum(
    expr: &ArrayRef,
    access: &[Vec<EinsumAxis>],
    args: &[ArrayRef],
    reduction_descrs: &BTreeMap<usize, ReductionDescriptor>,
) -> Result<ArrayRef, TransformError> {
    let mut bindings: IndexMap<String, ArrayRef> = IndexMap::new();
    let mut factors: Vec<ScalarRef> = Vec::new();
    // Reduction extent per reduction slot, discovered from operand axes.
    let mut redn_extent: BTreeMap<usize, ShapeComponent> = BTreeMap::new();

    for (i, (arg_access, arg)) in access.iter().zip(args).enumerate() {
        let name = nth_input_name(i);
        let indices: Vec<ScalarRef> = arg_access
            .iter()
            .enumerate()
            .map(|(axis, descr)| match descr {
                EinsumAxis::Output(k) => scalar::elem_index(*k),
                EinsumAxis::Reduction(j) => {
                    redn_extent
                        .entry(*j)
                        .or_insert_with(|| arg.shape().components()[axis].clone());
                    scalar::reduction_index(*j)
                }
            })
            .collect();
        factors.push(scalar::subscript(name.clone(), indices));
        bindings.insert(name, arg.clone());
    }

    let product = factors
        .into_iter()
        .reduce(scalar::mul)
        .ok_or_else(|| TransformError::Other("einsum with no operands".into()))?;

    if redn_extent.is_empty() {
        return as_index_lambda(expr, product, bindings, BTreeMap::new());
    }

    let bounds: ReductionBounds = redn_extent
        .iter()
        .map(|(j, extent)| {
            (
                format!("_r{j}"),
                (scalar::int(0), extent.as_scalar()),
            )
        })
        .collect();
    let reductions: BTreeMap<String, ReductionDescriptor> = redn_extent
        .keys()
        .map(|j| {
            (
                format!("_r{j}"),
                reduction_descrs.get(j).cloned().unwrap_or_default(),
            )
        })
        .collect();

    let body = scalar::reduce(ReductionOp::Sum, bounds, product);
    as_index_lambda(expr, body, bindings, reductions)
}

// ============================================================================
// Reshape
// ============================================================================

/// Row- or column-major strides over `shape`, as scalar expressions.
fn strides(shape: &Shape, order: ReshapeOrder) -> Vec<ScalarRef> {
    let n = shape.ndim();
    let mut strides = vec![scalar::int(1); n];
    match order {
        ReshapeOrder::C => {
            for i in (0..n.saturating_sub(1)).rev() {
                strides[i] = scalar::mul(
                    strides[i + 1].clone(),
                    shape.components()[i + 1].as_scalar(),
                );
            }
        }
        ReshapeOrder::F => {
            for i in 1..n {
                strides[i] = scalar::mul(
                    strides[i - 1].clone(),
                    shape.components()[i - 1].as_scalar(),
                );
            }
        }
    }
    strides
}

fn lower_reshape(
    expr: &ArrayRef,
    array: &ArrayRef,
    order: ReshapeOrder,
) -> Result<ArrayRef, TransformError> {
    let name = nth_input_name(0);

    // Linearize the output index, then delinearize into operand indices.
    let out_strides = strides(expr.shape(), order);
    let linear = (0..expr.ndim())
        .map(|k| scalar::mul(scalar::elem_index(k), out_strides[k].clone()))
        .reduce(scalar::add)
        .unwrap_or_else(|| scalar::int(0));

    let in_strides = strides(array.shape(), order);
    let in_indices: Vec<ScalarRef> = array
        .shape()
        .components()
        .iter()
        .zip(&in_strides)
        .map(|(extent, stride)| {
            scalar::rem(
                scalar::floor_div(linear.clone(), stride.clone()),
                extent.as_scalar(),
            )
        })
        .collect();

    let body = if array.ndim() == 0 {
        scalar::subscript(name.clone(), Vec::new())
    } else {
        scalar::subscript(name.clone(), in_indices)
    };
    let bindings: IndexMap<String, ArrayRef> =
        [(name, array.clone())].into_iter().collect();
    as_index_lambda(expr, body, bindings, BTreeMap::new())
}

// ============================================================================
// Axis Permutation
// ============================================================================

fn lower_axis_permutation(
    expr: &ArrayRef,
    array: &ArrayRef,
    permutation: &[usize],
) -> Result<ArrayRef, TransformError> {
    // Output axis k draws from input axis permutation[k]; the operand's
    // axis j is therefore indexed by the elementwise index of the output
    // axis that consumes it.
    let mut inverse = vec![0; permutation.len()];
    for (k, &j) in permutation.iter().enumerate() {
        inverse[j] = k;
    }
    let name = nth_input_name(0);
    let indices: Vec<ScalarRef> = inverse.iter().map(|&k| scalar::elem_index(k)).collect();
    let body = scalar::subscript(name.clone(), indices);
    let bindings: IndexMap<String, ArrayRef> =
        [(name, array.clone())].into_iter().collect();
    as_index_lambda(expr, body, bindings, BTreeMap::new())
}

// ============================================================================
// Stack / Concatenate
// ============================================================================

fn lower_stack(
    expr: &ArrayRef,
    arrays: &[ArrayRef],
    axis: usize,
) -> Result<ArrayRef, TransformError> {
    // Operand index tuple: every output index except the stacking axis.
    let operand_indices: Vec<ScalarRef> = (0..expr.ndim())
        .filter(|&k| k != axis)
        .map(scalar::elem_index)
        .collect();

    let mut bindings: IndexMap<String, ArrayRef> = IndexMap::new();
    let mut subscripts: Vec<ScalarRef> = Vec::new();
    for (i, array) in arrays.iter().enumerate() {
        let name = nth_input_name(i);
        subscripts.push(scalar::subscript(name.clone(), operand_indices.clone()));
        bindings.insert(name, array.clone());
    }

    // if _a == 0 then arg0[...] else if _a == 1 then arg1[...] … else last
    let mut body = subscripts
        .pop()
        .ok_or_else(|| TransformError::Other("stack with no operands".into()))?;
    for (i, subscript) in subscripts.into_iter().enumerate().rev() {
        body = scalar::if_then_else(
            scalar::compare(CmpOp::Eq, scalar::elem_index(axis), scalar::int(i as i64)),
            subscript,
            body,
        );
    }
    as_index_lambda(expr, body, bindings, BTreeMap::new())
}

fn lower_concatenate(
    expr: &ArrayRef,
    arrays: &[ArrayRef],
    axis: usize,
) -> Result<ArrayRef, TransformError> {
    let mut bindings: IndexMap<String, ArrayRef> = IndexMap::new();

    // Piecewise selection by cumulative axis offsets.
    let mut pieces: Vec<(ScalarRef, ScalarRef)> = Vec::new(); // (upper bound, subscript)
    let mut offset: ScalarRef = scalar::int(0);
    for (i, array) in arrays.iter().enumerate() {
        let name = nth_input_name(i);
        let indices: Vec<ScalarRef> = (0..expr.ndim())
            .map(|k| {
                if k == axis {
                    scalar::sub(scalar::elem_index(axis), offset.clone())
                } else {
                    scalar::elem_index(k)
                }
            })
            .collect();
        let extent = array.shape().components()[axis].as_scalar();
        offset = scalar::add(offset.clone(), extent);
        pieces.push((offset.clone(), scalar::subscript(name.clone(), indices)));
        bindings.insert(name, array.clone());
    }

    let (_, mut body) = pieces
        .pop()
        .ok_or_else(|| TransformError::Other("concatenate with no operands".into()))?;
    for (upper, subscript) in pieces.into_iter().rev() {
        body = scalar::if_then_else(
            scalar::compare(CmpOp::Lt, scalar::elem_index(axis), upper),
            subscript,
            body,
        );
    }
    as_index_lambda(expr, body, bindings, BTreeMap::new())
}

// ============================================================================
// Roll
// ============================================================================

fn lower_roll(
    expr: &ArrayRef,
    array: &ArrayRef,
    shift: i64,
    axis: usize,
) -> Result<ArrayRef, TransformError> {
    let name = nth_input_name(0);
    let extent = array.shape().components()[axis].as_scalar();
    let indices: Vec<ScalarRef> = (0..expr.ndim())
        .map(|k| {
            if k == axis {
                // Mathematical modulo keeps the index in range for either
                // shift sign.
                scalar::rem(
                    scalar::sub(scalar::elem_index(k), scalar::int(shift)),
                    extent.clone(),
                )
            } else {
                scalar::elem_index(k)
            }
        })
        .collect();
    let body = scalar::subscript(name.clone(), indices);
    let bindings: IndexMap<String, ArrayRef> =
        [(name, array.clone())].into_iter().collect();
    as_index_lambda(expr, body, bindings, BTreeMap::new())
}

// ============================================================================
// Basic Index
// ============================================================================

fn lower_basic_index(
    expr: &ArrayRef,
    array: &ArrayRef,
    indices: &[IndexArg],
) -> Result<ArrayRef, TransformError> {
    let name = nth_input_name(0);
    let mut out_axis = 0usize;
    let operand_indices: Vec<ScalarRef> = indices
        .iter()
        .map(|index| match index {
            IndexArg::Int(i) => scalar::int(*i),
            IndexArg::Slice { start, step, .. } => {
                let k = scalar::elem_index(out_axis);
                out_axis += 1;
                scalar::add(
                    scalar::int(*start),
                    scalar::mul(scalar::int(*step), k),
                )
            }
        })
        .collect();
    let body = scalar::subscript(name.clone(), operand_indices);
    let bindings: IndexMap<String, ArrayRef> =
        [(name, array.clone())].into_iter().collect();
    as_index_lambda(expr, body, bindings, BTreeMap::new())
}

// ============================================================================
// Advanced Index
// ============================================================================

fn lower_advanced_index(
    expr: &ArrayRef,
    array: &ArrayRef,
    indices: &[AdvIndexArg],
    contiguous: bool,
) -> Result<ArrayRef, TransformError> {
    let gather_ndim = indices
        .iter()
        .find_map(|i| match i {
            AdvIndexArg::Array(a) => Some(a.ndim()),
            _ => None,
        })
        .ok_or_else(|| {
            TransformError::Other("advanced index without an index array".into())
        })?;

    // Output axis layout:
    // - contiguous: slice axes before the advanced block, then the gather
    //   axes, then the remaining slice axes;
    // - non-contiguous: gather axes first, then all slice axes in order.
    let first_adv = indices
        .iter()
        .position(|i| matches!(i, AdvIndexArg::Array(_)))
        .unwrap_or(0);

    let gather_start = if contiguous {
        indices[..first_adv]
            .iter()
            .filter(|i| matches!(i, AdvIndexArg::Slice { .. }))
            .count()
    } else {
        0
    };
    let gather_indices: Vec<ScalarRef> = (0..gather_ndim)
        .map(|g| scalar::elem_index(gather_start + g))
        .collect();

    let mut bindings: IndexMap<String, ArrayRef> = IndexMap::new();
    let array_name = nth_input_name(0);
    bindings.insert(array_name.clone(), array.clone());

    let mut slice_out_axis = if contiguous { 0 } else { gather_ndim };
    let mut n_index_arrays = 0usize;
    let mut operand_indices: Vec<ScalarRef> = Vec::new();
    for index in indices {
        match index {
            AdvIndexArg::Array(idx) => {
                n_index_arrays += 1;
                let name = nth_input_name(n_index_arrays);
                operand_indices.push(scalar::subscript(name.clone(), gather_indices.clone()));
                bindings.insert(name, idx.clone());
            }
            AdvIndexArg::Int(i) => operand_indices.push(scalar::int(*i)),
            AdvIndexArg::Slice { start, step, .. } => {
                if contiguous && slice_out_axis == gather_start {
                    // The advanced block sits here; skip its axes.
                    slice_out_axis += gather_ndim;
                }
                let k = scalar::elem_index(slice_out_axis);
                slice_out_axis += 1;
                operand_indices.push(scalar::add(
                    scalar::int(*start),
                    scalar::mul(scalar::int(*step), k),
                ));
            }
        }
    }

    let body = scalar::subscript(array_name, operand_indices);
    as_index_lambda(expr, body, bindings, BTreeMap::new())
}
