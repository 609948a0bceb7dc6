//! # Arrayloom
//!
//! A library for building, transforming, and lowering lazy
//! multidimensional array expressions into loop-nest intermediate code.
//!
//! Users assemble directed acyclic graphs whose nodes denote
//! array-producing operations (elementwise combinators, reductions, shape
//! manipulations, gather indexing, external kernel calls, and sub-graph
//! calls) and later request lowering of a set of named output arrays.
//!
//! ## Pipeline Architecture
//!
//! ```text
//! Array DAG (builders)
//!     ↓
//! [concatenate_calls]        → batched call sites (optional)
//!     ↓
//! [tag_all_calls_to_be_inlined / inline_calls]
//!     ↓
//! [CodeGenPreprocessor]      → canonical indexed-scalar DAG + bound args
//!     ↓
//! [CodeGenMapper]            → loop-nest TranslationUnit
//!     ↓
//! BoundProgram               → downstream code generation backends
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use arrayloom::array::builders;
//! use arrayloom::array::{ArrayOrNames, Shape};
//! use arrayloom::codegen::loopnest::{generate_kernel, CodeGenConfig};
//! use arrayloom::value::DType;
//!
//! // c[i, j] = sum_k a[i, k] * b[k, j]
//! let a = builders::make_placeholder("a", Shape::of_consts(&[16, 8]), DType::Float64)?;
//! let b = builders::make_placeholder("b", Shape::of_consts(&[8, 4]), DType::Float64)?;
//! let c = builders::einsum("ik,kj->ij", &[a, b])?;
//!
//! let program = generate_kernel(&ArrayOrNames::Array(c), &CodeGenConfig::default())?;
//! assert_eq!(program.program.default_entrypoint().instructions.len(), 1);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Module Organization
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `scalar` | Scalar expression algebra used inside index lambdas |
//! | `value` | Dtypes and literal constants |
//! | `tags` | Tag vocabulary recognized by the pipeline |
//! | `array` | Array DAG nodes, structural identity, validated builders |
//! | `function` | Function definitions, calls, external kernel calls |
//! | `transform` | Memoized mappers, dedup, inlining, call concatenation |
//! | `codegen` | Preprocessing and lowering to loop-nest IR |
//! | `loopnest` | The loop-nest IR produced by lowering |
//! | `domain` | Polyhedral box iteration domains |

pub mod array;
pub mod codegen;
pub mod domain;
pub mod function;
pub mod loopnest;
pub mod scalar;
pub mod tags;
pub mod transform;
pub mod utils;
pub mod value;

// Re-export the common surface.
pub use array::builders::{
    advanced_index_contiguous, advanced_index_non_contiguous, basic_index, concatenate, einsum,
    elementwise_binary, full, make_data_wrapper, make_dict_of_named_arrays, make_index_lambda,
    make_named_data_wrapper, make_placeholder, make_size_param, permute_axes, reshape, roll,
    slice_along_axis, stack, zeros,
};
pub use array::{
    Array, ArrayError, ArrayKind, ArrayOrNames, ArrayRef, ArrayRefExt, Axis, DataHandle,
    DictOfNamedArrays, DictRef, NodeId, ReductionDescriptor, Shape, ShapeComponent,
};
pub use codegen::loopnest::{generate_kernel, CodeGenConfig, ImplementedResult};
pub use codegen::{preprocess, BoundProgram, LoweringError, PreprocessResult};
pub use function::{call_result, Call, FunctionDefinition, FunctionRef, KernelCall};
pub use tags::{Tag, TagKind, TagSet};
pub use transform::calls::concatenate::{
    concatenate_calls, CallSiteLocation, ConcatError, ConcatenateOptions, FunctionConcatenability,
};
pub use transform::calls::{inline_calls, tag_all_calls_to_be_inlined, zero_unused_call_bindings};
pub use transform::{CopyMapper, Deduplicator, InputGatherer, TransformError};
pub use value::{DType, Lit};
