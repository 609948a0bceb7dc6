//! Call-concatenation tests: admissibility, batching, rewriting, and the
//! interaction with inlining and lowering.

use arrayloom::array::builders;
use arrayloom::array::{ArrayKind, ArrayOrNames, ArrayRef, IndexArg, Shape};
use arrayloom::codegen::loopnest::{generate_kernel, CodeGenConfig};
use arrayloom::function::call_result;
use arrayloom::scalar::BinaryOp;
use arrayloom::tags::{Tag, TagSet};
use arrayloom::value::{DType, Lit};
use arrayloom::{
    concatenate_calls, Call, ConcatError, ConcatenateOptions, FunctionDefinition, FunctionRef,
};
use indexmap::IndexMap;
use std::sync::Arc;

/// f(x) = x*x + 1 over an `extent`x3 input, tagged with `fid`.
fn square_plus_one(extent: u64, fid: &str) -> FunctionRef {
    let shape = Shape::of_consts(&[extent, 3]);
    let x = builders::make_placeholder("x", shape.clone(), DType::Float64)
        .expect("valid placeholder");
    let xx = builders::elementwise_binary(BinaryOp::Mul, &x, &x).expect("valid product");
    let one = builders::full(shape, Lit::Float(1.0), DType::Float64).expect("valid fill");
    let body = builders::elementwise_binary(BinaryOp::Add, &xx, &one).expect("valid sum");
    let tags: TagSet = [Tag::FunctionIdentifier(fid.to_string())]
        .into_iter()
        .collect();
    FunctionDefinition::new([("out".to_string(), body)].into_iter().collect(), tags)
        .expect("valid function")
}

fn one_arg_call(f: &FunctionRef, arg: ArrayRef) -> Arc<Call> {
    Call::new(
        f.clone(),
        [("x".to_string(), arg)].into_iter().collect(),
        TagSet::new(),
    )
    .expect("valid call")
}

fn two_site_dag() -> ArrayOrNames {
    let a = builders::make_placeholder("a", Shape::of_consts(&[4, 3]), DType::Float64)
        .expect("valid placeholder");
    let b = builders::make_placeholder("b", Shape::of_consts(&[7, 3]), DType::Float64)
        .expect("valid placeholder");
    let call_a = one_arg_call(&square_plus_one(4, "f"), a);
    let call_b = one_arg_call(&square_plus_one(7, "f"), b);
    let outputs: IndexMap<String, ArrayRef> = [
        (
            "ra".to_string(),
            call_result(&call_a, "out").expect("known return"),
        ),
        (
            "rb".to_string(),
            call_result(&call_b, "out").expect("known return"),
        ),
    ]
    .into_iter()
    .collect();
    ArrayOrNames::Dict(builders::make_dict_of_named_arrays(outputs).expect("valid dict"))
}

fn collect_calls(expr: &ArrayOrNames) -> Vec<Arc<Call>> {
    let mut calls: Vec<Arc<Call>> = Vec::new();
    arrayloom::transform::for_each_array_node(expr, false, &mut |node| {
        if let ArrayKind::CallResult { call, .. } = node.kind() {
            if !calls.iter().any(|c| Arc::ptr_eq(c, call)) {
                calls.push(call.clone());
            }
        }
    });
    calls
}

#[test]
fn test_two_call_sites_become_one_batched_call() {
    let dag = two_site_dag();
    let result = concatenate_calls(&dag, &|_| true, &ConcatenateOptions::default())
        .expect("concatenation succeeds");

    let calls = collect_calls(&result);
    assert_eq!(calls.len(), 1);
    let call = &calls[0];

    // Parameter shapes sum the per-site axis lengths.
    assert_eq!(call.bindings()["x"].shape(), &Shape::of_consts(&[11, 3]));
    assert_eq!(
        call.function().returns()["out"].shape(),
        &Shape::of_consts(&[11, 3])
    );

    // The concatenated binding is stored and carries the concat-axis
    // marker on the batched axis.
    let binding = &call.bindings()["x"];
    assert!(binding.has_tag(&Tag::ImplStored));
    assert!(binding.axes()[0]
        .tags
        .contains(&Tag::ConcatenatedCallInputConcatAxis));

    // Each original result becomes a slice of the batched return with
    // cumulative offsets.
    let ArrayOrNames::Dict(outputs) = &result else {
        panic!("expected a dict result");
    };
    let expected = [("ra", (0, 4)), ("rb", (4, 11))];
    for (name, (start, stop)) in expected {
        let out = &outputs.entries()[name];
        assert!(out.has_tag(&Tag::ImplStored));
        match out.kind() {
            ArrayKind::BasicIndex { array, indices } => {
                assert!(matches!(array.kind(), ArrayKind::CallResult { .. }));
                match &indices[0] {
                    IndexArg::Slice {
                        start: s, stop: e, ..
                    } => assert_eq!((*s, *e), (start, stop)),
                    other => panic!("expected a slice, got {other:?}"),
                }
            }
            other => panic!("expected a slice of the batched return, got {other:?}"),
        }
    }
}

#[test]
fn test_concatenated_calls_lower_after_inlining() {
    let dag = two_site_dag();
    let concatenated = concatenate_calls(&dag, &|_| true, &ConcatenateOptions::default())
        .expect("concatenation succeeds");
    let tagged =
        arrayloom::tag_all_calls_to_be_inlined(&concatenated).expect("tagging succeeds");
    let inlined = arrayloom::inline_calls(&tagged).expect("inlining succeeds");

    let program =
        generate_kernel(&inlined, &CodeGenConfig::default()).expect("lowering succeeds");
    let kernel = program.program.default_entrypoint();

    // The concatenated input is materialized once; both outputs read it.
    let (temp_name, temp) = kernel
        .temporary_variables
        .first()
        .expect("concatenated input stored");
    assert_eq!(temp.shape[0].to_string(), "11");
    let temp_store = kernel
        .instructions
        .iter()
        .find(|i| i.id.starts_with(temp_name.as_str()))
        .expect("store for the concatenated input");
    for output in ["ra", "rb"] {
        let store = kernel
            .instructions
            .iter()
            .find(|i| i.id == format!("{output}_store"))
            .expect("output store");
        assert!(store.depends_on.contains(&temp_store.id));
    }
}

#[test]
fn test_inherit_axes_tags_use_input_axis() {
    let dag = two_site_dag();
    let options = ConcatenateOptions {
        inherit_axes: true,
        ..ConcatenateOptions::default()
    };
    let result = concatenate_calls(&dag, &|_| true, &options).expect("concatenation succeeds");
    let calls = collect_calls(&result);
    let binding = &calls[0].bindings()["x"];
    assert!(binding.axes()[0].tags.contains(&Tag::UseInputAxis {
        arg: Some(0),
        axis: 0
    }));
}

#[test]
fn test_call_site_filter_limits_the_pool() {
    let dag = two_site_dag();
    // Filter that rejects everything: nothing to do, graph is unchanged.
    let result = concatenate_calls(&dag, &|_| false, &ConcatenateOptions::default())
        .expect("no-op succeeds");
    assert_eq!(result, dag);
    assert_eq!(collect_calls(&result).len(), 2);
}

#[test]
fn test_dissimilar_sites_are_batched_separately() {
    // g differs from f (x*x rather than x*x+1), but shares the identifier;
    // similarity grouping must keep them in separate batches, each of
    // which is then too small to concatenate.
    let a = builders::make_placeholder("a", Shape::of_consts(&[4, 3]), DType::Float64)
        .expect("valid placeholder");
    let b = builders::make_placeholder("b", Shape::of_consts(&[7, 3]), DType::Float64)
        .expect("valid placeholder");
    let f = square_plus_one(4, "f");
    let g = {
        let shape = Shape::of_consts(&[7, 3]);
        let x = builders::make_placeholder("x", shape, DType::Float64)
            .expect("valid placeholder");
        let body =
            builders::elementwise_binary(BinaryOp::Mul, &x, &x).expect("valid product");
        let tags: TagSet = [Tag::FunctionIdentifier("f".to_string())]
            .into_iter()
            .collect();
        FunctionDefinition::new([("out".to_string(), body)].into_iter().collect(), tags)
            .expect("valid function")
    };
    let call_a = one_arg_call(&f, a);
    let call_b = one_arg_call(&g, b);
    let outputs: IndexMap<String, ArrayRef> = [
        (
            "ra".to_string(),
            call_result(&call_a, "out").expect("known return"),
        ),
        (
            "rb".to_string(),
            call_result(&call_b, "out").expect("known return"),
        ),
    ]
    .into_iter()
    .collect();
    let dag = ArrayOrNames::Dict(
        builders::make_dict_of_named_arrays(outputs).expect("valid dict"),
    );

    let result = concatenate_calls(&dag, &|_| true, &ConcatenateOptions::default())
        .expect("undersized batches are skipped");
    assert_eq!(collect_calls(&result).len(), 2);

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
fn test_nested_calls_are_rejected() {
    // h's body itself calls f: single-level concatenation refuses.
    let f = square_plus_one(4, "f");
    let inner_arg = builders::make_placeholder("y", Shape::of_consts(&[4, 3]), DType::Float64)
        .expect("valid placeholder");
    let inner_call = one_arg_call(&f, inner_arg);
    let inner_result = call_result(&inner_call, "out").expect("known return");
    let tags: TagSet = [Tag::FunctionIdentifier("h".to_string())]
        .into_iter()
        .collect();
    let h = FunctionDefinition::new(
        [("out".to_string(), inner_result)].into_iter().collect(),
        tags,
    )
    .expect("valid function");
    let outer_arg = builders::make_placeholder("z", Shape::of_consts(&[4, 3]), DType::Float64)
        .expect("valid placeholder");
    let outer_call = one_arg_call(&h, outer_arg);
    let dag = ArrayOrNames::Array(call_result(&outer_call, "out").expect("known return"));

    assert!(matches!(
        concatenate_calls(&dag, &|_| true, &ConcatenateOptions::default()),
        Err(ConcatError::NestedCall)
    ));
}

#[test]
fn test_zero_unused_then_concatenate() {
    // g(a, b) returns both a+1 and b; only the first return is used, so b
    // is zeroed before concatenation and the sites remain concatenatable.
    fn two_param_fn(extent: u64) -> FunctionRef {
        let shape = Shape::of_consts(&[extent, 3]);
        let a = builders::make_placeholder("a", shape.clone(), DType::Float64)
            .expect("valid placeholder");
        let b = builders::make_placeholder("b", shape.clone(), DType::Float64)
            .expect("valid placeholder");
        let one = builders::full(shape, Lit::Float(1.0), DType::Float64)
            .expect("valid fill");
        let body = builders::elementwise_binary(BinaryOp::Add, &a, &one).expect("valid sum");
        let tags: TagSet = [Tag::FunctionIdentifier("g".to_string())]
            .into_iter()
            .collect();
        FunctionDefinition::new(
            [("out".to_string(), body), ("aux".to_string(), b)]
                .into_iter()
                .collect(),
            tags,
        )
        .expect("valid function")
    }

    let mk_call = |extent: u64, a_name: &str, b_name: &str| {
        let shape = Shape::of_consts(&[extent, 3]);
        let arg_a = builders::make_placeholder(a_name, shape.clone(), DType::Float64)
            .expect("valid placeholder");
        let arg_b = builders::make_placeholder(b_name, shape, DType::Float64)
            .expect("valid placeholder");
        Call::new(
            two_param_fn(extent),
            [("a".to_string(), arg_a), ("b".to_string(), arg_b)]
                .into_iter()
                .collect(),
            TagSet::new(),
        )
        .expect("valid call")
    };

    let call_1 = mk_call(4, "p1", "q1");
    let call_2 = mk_call(7, "p2", "q2");
    let outputs: IndexMap<String, ArrayRef> = [
        (
            "r1".to_string(),
            call_result(&call_1, "out").expect("known return"),
        ),
        (
            "r2".to_string(),
            call_result(&call_2, "out").expect("known return"),
        ),
    ]
    .into_iter()
    .collect();
    let dag = ArrayOrNames::Dict(
        builders::make_dict_of_named_arrays(outputs).expect("valid dict"),
    );

    let zeroed = arrayloom::zero_unused_call_bindings(&dag).expect("zeroing succeeds");

    // The unused q-bindings are gone from the DAG.
    let mut input_names: Vec<String> = Vec::new();
    arrayloom::transform::for_each_array_node(&zeroed, false, &mut |node| {
        if let Some(name) = node.name() {
            input_names.push(name.to_string());
        }
    });
    assert!(!input_names.iter().any(|n| n.starts_with('q')));

    let result = concatenate_calls(&zeroed, &|_| true, &ConcatenateOptions::default())
        .expect("concatenation succeeds");
    let calls = collect_calls(&result);
    assert_eq!(calls.len(), 1);
    assert_eq!(
        calls[0].bindings()["a"].shape(),
        &Shape::of_consts(&[11, 3])
    );
}
