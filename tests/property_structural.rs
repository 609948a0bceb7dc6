//! Property tests for structural identity: equality implies hash
//! equality, provenance tags stay invisible, deduplication is idempotent.

use arrayloom::array::{builders, Array, ArrayKind, Shape};
use arrayloom::scalar::{self, BinaryOp, ScalarRef};
use arrayloom::tags::{Tag, TagSet};
use arrayloom::value::{DType, Lit};
use arrayloom::Deduplicator;
use proptest::prelude::*;

fn dtype_strategy() -> impl Strategy<Value = DType> {
    prop_oneof![
        Just(DType::Bool),
        Just(DType::Int32),
        Just(DType::Int64),
        Just(DType::Float32),
        Just(DType::Float64),
    ]
}

fn shape_strategy() -> impl Strategy<Value = Vec<u64>> {
    proptest::collection::vec(0u64..5, 0..3)
}

/// Small scalar expressions over `_0` and a couple of operand names.
fn scalar_expr_strategy() -> impl Strategy<Value = ScalarRef> {
    let leaf = prop_oneof![
        (-4i64..5).prop_map(|i| scalar::lit(Lit::Int(i))),
        Just(scalar::elem_index(0)),
        Just(scalar::var("n")),
    ];
    leaf.prop_recursive(3, 12, 2, |inner| {
        prop_oneof![
            (inner.clone(), inner.clone()).prop_map(|(a, b)| scalar::binary(
                BinaryOp::Add,
                a,
                b
            )),
            (inner.clone(), inner.clone()).prop_map(|(a, b)| scalar::binary(
                BinaryOp::Mul,
                a,
                b
            )),
            inner
                .clone()
                .prop_map(|a| scalar::subscript("src", vec![a])),
        ]
    })
}

proptest! {
    #[test]
    fn prop_equal_placeholders_hash_equal(
        name in "[a-z][a-z0-9_]{0,6}",
        extents in shape_strategy(),
        dtype in dtype_strategy(),
    ) {
        let a = builders::make_placeholder(&name, Shape::of_consts(&extents), dtype)
            .expect("valid placeholder");
        let b = builders::make_placeholder(&name, Shape::of_consts(&extents), dtype)
            .expect("valid placeholder");
        prop_assert_ne!(a.id(), b.id());
        prop_assert_eq!(&*a, &*b);
        prop_assert_eq!(a.structural_hash(), b.structural_hash());
    }

    #[test]
    fn prop_non_equality_tags_are_invisible(
        extents in shape_strategy(),
        provenance in "[a-z]{1,8}",
    ) {
        let a = builders::make_placeholder("x", Shape::of_consts(&extents), DType::Float64)
            .expect("valid placeholder");
        let b = Array::new(
            a.kind().clone(),
            a.shape().clone(),
            a.dtype(),
            a.axes().to_vec(),
            a.tags().clone(),
            [Tag::Opaque(provenance)].into_iter().collect(),
        )
        .expect("valid rebuild");
        prop_assert_eq!(&*a, &*b);
        prop_assert_eq!(a.structural_hash(), b.structural_hash());
    }

    #[test]
    fn prop_equal_scalar_exprs_hash_equal(expr in scalar_expr_strategy()) {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        // Rebuild the expression through the rewriter: structurally equal,
        // usually a distinct allocation.
        let rebuilt = scalar::rewrite(&expr, &mut |_| None);
        prop_assert_eq!(&*rebuilt, &*expr);

        let mut h1 = DefaultHasher::new();
        expr.hash(&mut h1);
        let mut h2 = DefaultHasher::new();
        rebuilt.hash(&mut h2);
        prop_assert_eq!(h1.finish(), h2.finish());
    }

    #[test]
    fn prop_dedup_idempotent(extents in proptest::collection::vec(1u64..4, 1..3)) {
        let shape = Shape::of_consts(&extents);
        let x1 = builders::make_placeholder("x", shape.clone(), DType::Float64)
            .expect("valid placeholder");
        let x2 = builders::make_placeholder("x", shape, DType::Float64)
            .expect("valid placeholder");
        let dag = builders::elementwise_binary(BinaryOp::Add, &x1, &x2)
            .expect("valid sum");

        let once = Deduplicator::new().dedup_array(&dag).expect("dedup succeeds");
        let twice = Deduplicator::new().dedup_array(&once).expect("dedup succeeds");
        prop_assert_eq!(&*once, &*twice);

        match once.kind() {
            ArrayKind::IndexLambda { bindings, .. } => {
                let children: Vec<_> = bindings.values().collect();
                prop_assert!(std::sync::Arc::ptr_eq(children[0], children[1]));
            }
            other => prop_assert!(false, "expected IndexLambda, got {:?}", other),
        }
    }

    #[test]
    fn prop_index_lambda_identity_is_structural(
        expr in scalar_expr_strategy(),
        extent in 1u64..6,
    ) {
        let src = builders::make_placeholder("src", Shape::of_consts(&[extent]), DType::Float64)
            .expect("valid placeholder");
        let mk = |src: &arrayloom::ArrayRef, expr: &ScalarRef| {
            builders::make_index_lambda(
                expr.clone(),
                Shape::of_consts(&[extent]),
                DType::Float64,
                [("src".to_string(), src.clone())].into_iter().collect(),
                Default::default(),
            )
            .expect("valid index lambda")
        };
        let a = mk(&src, &expr);
        let b = mk(&src, &expr);
        prop_assert_eq!(&*a, &*b);
        prop_assert_eq!(a.structural_hash(), b.structural_hash());
    }
}
