//! End-to-end pipeline tests: DAG construction through loop-nest lowering.

use arrayloom::array::builders;
use arrayloom::array::{ArrayKind, ArrayOrNames, ArrayRefExt, ReshapeOrder, Shape};
use arrayloom::codegen::loopnest::{generate_kernel, CodeGenConfig};
use arrayloom::function::call_result;
use arrayloom::loopnest::{Assignee, KernelArg};
use arrayloom::scalar::BinaryOp;
use arrayloom::tags::{Tag, TagSet};
use arrayloom::value::{DType, Lit};
use arrayloom::{Call, DataHandle, FunctionDefinition};
use indexmap::IndexMap;

fn lower(expr: ArrayOrNames) -> arrayloom::BoundProgram {
    generate_kernel(&expr, &CodeGenConfig::default()).expect("lowering succeeds")
}

#[test]
fn test_reshape_round_trip() {
    let p = builders::make_placeholder("x", Shape::of_consts(&[6]), DType::Float32)
        .expect("valid placeholder");
    let r = builders::reshape(&p, Shape::of_consts(&[2, 3]), ReshapeOrder::C)
        .expect("valid reshape");
    let out = builders::reshape(&r, Shape::of_consts(&[6]), ReshapeOrder::C)
        .expect("valid reshape");

    let program = lower(ArrayOrNames::Array(out));
    let kernel = program.program.default_entrypoint();

    // One output of shape 6, one store, reading from x.
    let out_arg = kernel.arg("_al_out").expect("output present");
    match out_arg {
        KernelArg::Global(g) => {
            assert!(g.is_output);
            assert_eq!(g.shape.len(), 1);
            assert_eq!(g.shape[0].to_string(), "6");
            assert_eq!(g.dtype, DType::Float32);
        }
        other => panic!("expected a global argument, got {other:?}"),
    }
    assert_eq!(kernel.instructions.len(), 1);
    let store = &kernel.instructions[0];
    assert!(store.expression.to_string().contains("x["));
    match &store.assignees[0] {
        Assignee::Subscript { name, indices } => {
            assert_eq!(name, "_al_out");
            assert_eq!(indices.len(), 1);
        }
        other => panic!("expected a subscript assignee, got {other:?}"),
    }
    // The iteration domain covers exactly the output axis.
    assert_eq!(kernel.domains.len(), 1);
    assert_eq!(kernel.domains[0].set_dims(), ["_al_out_dim0"]);
    assert_eq!(kernel.domains[0].bounds()[0].upper.to_string(), "6");
}

#[test]
fn test_einsum_matmul_kernel_structure() {
    let a = builders::make_placeholder("a", Shape::of_consts(&[16, 8]), DType::Float64)
        .expect("valid placeholder");
    let b = builders::make_placeholder("b", Shape::of_consts(&[8, 4]), DType::Float64)
        .expect("valid placeholder");
    let c = builders::einsum("ik,kj->ij", &[a, b]).expect("valid einsum");

    let program = lower(ArrayOrNames::Array(c));
    let kernel = program.program.default_entrypoint();

    assert!(kernel.arg("a").is_some());
    assert!(kernel.arg("b").is_some());
    assert_eq!(kernel.instructions.len(), 1);

    // Two elementwise inames of extents 16 and 4.
    let store_domain = kernel
        .domains
        .iter()
        .find(|d| d.set_dims().iter().any(|dim| dim.starts_with("_al_out")))
        .expect("store domain present");
    assert_eq!(store_domain.set_dims().len(), 2);
    let extents: Vec<String> = store_domain
        .bounds()
        .iter()
        .map(|b| b.upper.to_string())
        .collect();
    assert_eq!(extents, ["16", "4"]);

    // One reduction iname of extent 8.
    let redn_domain = kernel
        .domains
        .iter()
        .find(|d| d.set_dims().iter().any(|dim| dim.starts_with("_al_sum")))
        .expect("reduction domain present");
    assert_eq!(redn_domain.set_dims().len(), 1);
    assert_eq!(redn_domain.bounds()[0].upper.to_string(), "8");

    // The store is sum_k a[i,k]*b[k,j].
    let expr = kernel.instructions[0].expression.to_string();
    assert!(expr.starts_with("sum("), "unexpected store expression {expr}");
    assert!(expr.contains("a[_al_out_dim0, _al_sum_r0"));
    assert!(expr.contains("b[_al_sum_r0"));
}

/// f(x) = x*x + 1
fn square_plus_one(extent: u64) -> arrayloom::FunctionRef {
    let shape = Shape::of_consts(&[extent]);
    let x = builders::make_placeholder("x", shape.clone(), DType::Float64)
        .expect("valid placeholder");
    let xx = builders::elementwise_binary(BinaryOp::Mul, &x, &x).expect("valid product");
    let one = builders::full(shape, Lit::Float(1.0), DType::Float64).expect("valid fill");
    let body = builders::elementwise_binary(BinaryOp::Add, &xx, &one).expect("valid sum");
    FunctionDefinition::new([("out".to_string(), body)].into_iter().collect(), TagSet::new())
        .expect("valid function")
}

#[test]
fn test_inline_two_call_sites() {
    let f = square_plus_one(4);
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
    let outputs: IndexMap<String, arrayloom::ArrayRef> = [
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

    let tagged = arrayloom::tag_all_calls_to_be_inlined(&dag).expect("tagging succeeds");
    let inlined = arrayloom::inline_calls(&tagged).expect("inlining succeeds");

    let mut n_calls = 0;
    arrayloom::transform::for_each_array_node(&inlined, false, &mut |node| {
        if matches!(node.kind(), ArrayKind::CallResult { .. }) {
            n_calls += 1;
        }
    });
    assert_eq!(n_calls, 0);

    // The inlined DAG lowers to one store per output.
    let program = lower(inlined);
    let kernel = program.program.default_entrypoint();
    assert_eq!(kernel.instructions.len(), 2);
    assert!(kernel.instructions.iter().any(|i| i.id == "ra_store"));
    assert!(kernel.instructions.iter().any(|i| i.id == "rb_store"));
    // Both reference their own input and compute x*x + 1.
    for insn in &kernel.instructions {
        let expr = insn.expression.to_string();
        assert!(expr.contains('*') && expr.contains("+ 1"), "got {expr}");
    }
}

#[test]
fn test_data_wrapper_capture() {
    let data = DataHandle::new(vec![5], DType::Float64);
    let wrapped = builders::make_data_wrapper(data.clone(), TagSet::new())
        .expect("valid wrapper");
    let result = builders::elementwise_binary(BinaryOp::Add, &wrapped, &wrapped)
        .expect("valid sum");

    let program = lower(ArrayOrNames::Array(result));

    // The captured data is keyed by the generated placeholder name, and
    // the kernel takes an input argument of that name.
    assert_eq!(program.bound_arguments.len(), 1);
    let (name, handle) = program.bound_arguments.first().expect("one capture");
    assert_eq!(handle.id(), data.id());
    assert_eq!(handle.shape(), &[5]);
    let kernel = program.program.default_entrypoint();
    match kernel.arg(name).expect("captured input present") {
        KernelArg::Global(g) => assert!(g.is_input),
        other => panic!("expected a global argument, got {other:?}"),
    }
}

#[test]
fn test_inter_output_dependency_ordering() {
    let x = builders::make_placeholder("x", Shape::of_consts(&[4]), DType::Float64)
        .expect("valid placeholder");
    let y = builders::elementwise_binary(BinaryOp::Add, &x, &x).expect("valid sum");
    let z = builders::elementwise_binary(BinaryOp::Mul, &y, &y).expect("valid product");
    let outputs: IndexMap<String, arrayloom::ArrayRef> =
        [("z".to_string(), z), ("y".to_string(), y)]
            .into_iter()
            .collect();
    let dag = ArrayOrNames::Dict(
        builders::make_dict_of_named_arrays(outputs).expect("valid dict"),
    );

    let program = lower(dag);
    let kernel = program.program.default_entrypoint();

    // Exactly one store per output, dependency first.
    assert_eq!(kernel.instructions.len(), 2);
    assert_eq!(kernel.instructions[0].id, "y_store");
    assert_eq!(kernel.instructions[1].id, "z_store");
    // z reads y's buffer and depends on its store.
    let z_store = &kernel.instructions[1];
    assert!(z_store.depends_on.contains("y_store"));
    assert!(z_store.expression.to_string().contains("y["));
}

#[test]
fn test_zero_extent_output_emits_nothing() {
    let x = builders::make_placeholder("x", Shape::of_consts(&[0]), DType::Float64)
        .expect("valid placeholder");
    let y = builders::elementwise_binary(BinaryOp::Add, &x, &x).expect("valid sum");
    let program = lower(ArrayOrNames::Array(y));
    let kernel = program.program.default_entrypoint();
    assert!(kernel.instructions.is_empty());
    assert!(kernel.domains.is_empty());
}

#[test]
fn test_lowering_matches_explicit_index_lambda_form() {
    // Lower(high-level op) and Lower(to_index_lambda(high-level op)) agree.
    let x = builders::make_placeholder("x", Shape::of_consts(&[3, 5]), DType::Float64)
        .expect("valid placeholder");
    let t = builders::permute_axes(&x, vec![1, 0]).expect("valid permutation");
    let lowered_direct = lower(ArrayOrNames::Array(t.clone()));

    let as_lambda = arrayloom::transform::lower_to_index_lambda::to_index_lambda(&t)
        .expect("lowerable");
    let lowered_via_lambda = lower(ArrayOrNames::Array(as_lambda));

    let a = lowered_direct.program.default_entrypoint();
    let b = lowered_via_lambda.program.default_entrypoint();
    assert_eq!(
        a.instructions[0].expression.to_string(),
        b.instructions[0].expression.to_string()
    );
    assert_eq!(a.domains, b.domains);
}

#[test]
fn test_outputs_do_not_keep_stored_tags() {
    // An ImplStored output would otherwise be stored twice.
    let x = builders::make_placeholder("x", Shape::of_consts(&[4]), DType::Float64)
        .expect("valid placeholder");
    let y = builders::elementwise_binary(BinaryOp::Add, &x, &x)
        .expect("valid sum")
        .tagged(Tag::ImplStored);
    let program = lower(ArrayOrNames::Array(y));
    let kernel = program.program.default_entrypoint();
    assert_eq!(kernel.instructions.len(), 1);
    assert!(kernel.temporary_variables.is_empty());
}
