//! Transformation-framework tests: structural identity, deduplication,
//! inlining invariants, and preprocessing order.

use arrayloom::array::builders;
use arrayloom::array::{ArrayKind, ArrayOrNames, ArrayRef, Shape};
use arrayloom::function::call_result;
use arrayloom::scalar::BinaryOp;
use arrayloom::tags::TagSet;
use arrayloom::value::{DType, Lit};
use arrayloom::{Call, Deduplicator, FunctionDefinition};
use indexmap::IndexMap;
use std::sync::Arc;

fn placeholder(name: &str, extents: &[u64]) -> ArrayRef {
    builders::make_placeholder(name, Shape::of_consts(extents), DType::Float64)
        .expect("valid placeholder")
}

#[test]
fn test_structural_equality_and_hash_agree() {
    let mk = || {
        let x = placeholder("x", &[4]);
        builders::elementwise_binary(BinaryOp::Mul, &x, &x).expect("valid product")
    };
    let a = mk();
    let b = mk();
    assert_ne!(a.id(), b.id());
    assert_eq!(*a, *b);
    assert_eq!(a.structural_hash(), b.structural_hash());
}

#[test]
fn test_dedup_is_idempotent_and_merges() {
    // Two structurally equal subtrees built independently.
    let x1 = placeholder("x", &[4]);
    let x2 = placeholder("x", &[4]);
    let p1 = builders::elementwise_binary(BinaryOp::Mul, &x1, &x1).expect("valid product");
    let p2 = builders::elementwise_binary(BinaryOp::Mul, &x2, &x2).expect("valid product");
    let dag = builders::elementwise_binary(BinaryOp::Add, &p1, &p2).expect("valid sum");

    let once = Deduplicator::new()
        .dedup_array(&dag)
        .expect("dedup succeeds");
    match once.kind() {
        ArrayKind::IndexLambda { bindings, .. } => {
            let children: Vec<&ArrayRef> = bindings.values().collect();
            assert!(Arc::ptr_eq(children[0], children[1]));
        }
        other => panic!("expected IndexLambda, got {other:?}"),
    }

    let twice = Deduplicator::new()
        .dedup_array(&once)
        .expect("dedup succeeds");
    assert_eq!(*once, *twice);
}

#[test]
fn test_inline_calls_is_identity_without_tags() {
    let x = placeholder("x", &[4]);
    let body = builders::elementwise_binary(BinaryOp::Mul, &x, &x).expect("valid product");
    let f = FunctionDefinition::new(
        [("out".to_string(), body)].into_iter().collect(),
        TagSet::new(),
    )
    .expect("valid function");
    let a = placeholder("a", &[4]);
    let call = Call::new(
        f,
        [("x".to_string(), a)].into_iter().collect(),
        TagSet::new(),
    )
    .expect("valid call");
    let result = call_result(&call, "out").expect("known return");
    let one = builders::full(Shape::of_consts(&[4]), Lit::Float(1.0), DType::Float64)
        .expect("valid fill");
    let dag = ArrayOrNames::Array(
        builders::elementwise_binary(BinaryOp::Add, &result, &one).expect("valid sum"),
    );

    let inlined = arrayloom::inline_calls(&dag).expect("inlining succeeds");
    assert_eq!(inlined, dag);
}

#[test]
fn test_inlined_body_substitutes_bindings() {
    let x = placeholder("x", &[4]);
    let body = builders::elementwise_binary(BinaryOp::Mul, &x, &x).expect("valid product");
    let f = FunctionDefinition::new(
        [("out".to_string(), body)].into_iter().collect(),
        TagSet::new(),
    )
    .expect("valid function");
    let a = placeholder("a", &[4]);
    let call = Call::new(
        f,
        [("x".to_string(), a.clone())].into_iter().collect(),
        TagSet::new(),
    )
    .expect("valid call");
    let dag = ArrayOrNames::Array(call_result(&call, "out").expect("known return"));

    let tagged = arrayloom::tag_all_calls_to_be_inlined(&dag).expect("tagging succeeds");
    let inlined = arrayloom::inline_calls(&tagged).expect("inlining succeeds");

    // The result is the body with x replaced by a.
    let ArrayOrNames::Array(result) = &inlined else {
        panic!("expected an array result");
    };
    match result.kind() {
        ArrayKind::IndexLambda { bindings, .. } => {
            for child in bindings.values() {
                assert!(Arc::ptr_eq(child, &a));
            }
        }
        other => panic!("expected the substituted body, got {other:?}"),
    }
}

#[test]
fn test_input_gatherer_sees_through_calls() {
    use arrayloom::transform::CombineMapper;

    let x = placeholder("x", &[4]);
    let body = builders::elementwise_binary(BinaryOp::Mul, &x, &x).expect("valid product");
    let f = FunctionDefinition::new(
        [("out".to_string(), body)].into_iter().collect(),
        TagSet::new(),
    )
    .expect("valid function");
    let a = placeholder("a", &[4]);
    let call = Call::new(
        f,
        [("x".to_string(), a)].into_iter().collect(),
        TagSet::new(),
    )
    .expect("valid call");
    let result = call_result(&call, "out").expect("known return");

    // A call's inputs are its bindings, not the callee's parameters.
    let mut gatherer = arrayloom::InputGatherer::new();
    let inputs = gatherer.rec(&result);
    let names: Vec<_> = inputs.values().filter_map(|i| i.name()).collect();
    assert_eq!(names, vec!["a"]);
}

#[test]
fn test_preprocess_orders_independent_outputs_by_name() {
    let x = placeholder("x", &[4]);
    let u = builders::elementwise_binary(BinaryOp::Add, &x, &x).expect("valid sum");
    let v = builders::elementwise_binary(BinaryOp::Mul, &x, &x).expect("valid product");
    let outputs: IndexMap<String, ArrayRef> =
        [("zeta".to_string(), u), ("alpha".to_string(), v)]
            .into_iter()
            .collect();
    let dict = builders::make_dict_of_named_arrays(outputs).expect("valid dict");

    let result = arrayloom::preprocess(&dict).expect("preprocess succeeds");
    assert_eq!(result.compute_order, vec!["alpha", "zeta"]);
}

#[test]
fn test_preprocess_rejects_outlined_calls() {
    let x = placeholder("x", &[4]);
    let body = builders::elementwise_binary(BinaryOp::Mul, &x, &x).expect("valid product");
    let f = FunctionDefinition::new(
        [("out".to_string(), body)].into_iter().collect(),
        TagSet::new(),
    )
    .expect("valid function");
    let a = placeholder("a", &[4]);
    let call = Call::new(
        f,
        [("x".to_string(), a)].into_iter().collect(),
        TagSet::new(),
    )
    .expect("valid call");
    let outputs: IndexMap<String, ArrayRef> = [(
        "out".to_string(),
        call_result(&call, "out").expect("known return"),
    )]
    .into_iter()
    .collect();
    let dict = builders::make_dict_of_named_arrays(outputs).expect("valid dict");

    // The call is not tagged for inlining, so preprocessing cannot
    // eliminate it and must refuse.
    assert!(arrayloom::preprocess(&dict).is_err());
}

#[test]
fn test_axes_always_match_shape_length() {
    let x = placeholder("x", &[2, 3, 4]);
    let nodes = [
        builders::permute_axes(&x, vec![2, 1, 0]).expect("valid permutation"),
        builders::roll(&x, 1, 2).expect("valid roll"),
        builders::reshape(&x, Shape::of_consts(&[6, 4]), arrayloom::array::ReshapeOrder::C)
            .expect("valid reshape"),
        builders::stack(&[x.clone(), x.clone()], 1).expect("valid stack"),
        builders::concatenate(&[x.clone(), x.clone()], 0).expect("valid concatenate"),
    ];
    for node in nodes {
        assert_eq!(node.axes().len(), node.shape().ndim());
    }
}
