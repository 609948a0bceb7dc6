//! # Loop-Nest IR
//!
//! The target representation of lowering: kernels made of assignment
//! instructions over polyhedral iteration domains, with typed array and
//! value arguments, temporaries, and substitution rules.
//!
//! ```text
//! Array DAG -> [codegen] -> TranslationUnit { LoopKernel* } -> backends
//! ```
//!
//! Instruction right-hand sides reuse the scalar expression algebra;
//! reductions carry their bounds redundantly with the kernel's domains so
//! instructions stay readable in isolation.

use crate::domain::IterationDomain;
use crate::scalar::{self, ScalarExpr, ScalarRef};
use crate::tags::TagSet;
use crate::utils::UniqueNameGenerator;
use crate::value::DType;
use indexmap::IndexMap;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use thiserror::Error;

/// Hash an [`IndexMap`] order-independently, matching its order-independent
/// `PartialEq`/`Eq` (two maps with the same entries in different orders are
/// equal, so their hashes must agree regardless of order too).
fn hash_indexmap_unordered<K: Hash, V: Hash, H: Hasher>(map: &IndexMap<K, V>, state: &mut H) {
    let mut combined: u64 = 0;
    for (k, v) in map {
        let mut entry_hasher = DefaultHasher::new();
        k.hash(&mut entry_hasher);
        v.hash(&mut entry_hasher);
        combined ^= entry_hasher.finish();
    }
    combined.hash(state);
}

#[derive(Debug, Error)]
pub enum LoopNestError {
    #[error("kernel '{0}' already exists in the translation unit")]
    DuplicateKernel(String),
    #[error("unknown kernel '{0}'")]
    UnknownKernel(String),
}

// ============================================================================
// Arguments and Temporaries
// ============================================================================

/// A scalar value passed into the kernel by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ValueArg {
    pub name: String,
    pub dtype: DType,
    pub tags: TagSet,
}

/// A global array argument.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GlobalArg {
    pub name: String,
    pub shape: Vec<ScalarRef>,
    pub dtype: DType,
    pub is_input: bool,
    pub is_output: bool,
    pub tags: TagSet,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KernelArg {
    Value(ValueArg),
    Global(GlobalArg),
}

impl KernelArg {
    pub fn name(&self) -> &str {
        match self {
            KernelArg::Value(v) => &v.name,
            KernelArg::Global(g) => &g.name,
        }
    }
}

/// A kernel-private buffer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TemporaryVariable {
    pub name: String,
    pub shape: Vec<ScalarRef>,
    pub dtype: DType,
    pub tags: TagSet,
}

// ============================================================================
// Instructions
// ============================================================================

/// The left-hand side of an assignment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Assignee {
    Variable(String),
    Subscript {
        name: String,
        indices: Vec<ScalarRef>,
    },
    /// Whole-sub-array assignee used by external kernel calls.
    SubArrayRef {
        inames: Vec<String>,
        name: String,
    },
}

/// One assignment instruction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Instruction {
    pub id: String,
    pub assignees: Vec<Assignee>,
    pub expression: ScalarRef,
    pub within_inames: BTreeSet<String>,
    pub depends_on: BTreeSet<String>,
}

/// A named substitution rule: reading the result is a call with `ndim`
/// formal index arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubstitutionRule {
    pub name: String,
    pub arguments: Vec<String>,
    pub expression: ScalarRef,
}

// ============================================================================
// Kernel
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelOptions {
    /// Whether the caller receives outputs as a name-keyed dictionary.
    pub return_dict: bool,
    /// Array accesses are checked against bounds unless disabled.
    pub enforce_bounds_checks: bool,
}

impl Default for KernelOptions {
    fn default() -> Self {
        KernelOptions {
            return_dict: false,
            enforce_bounds_checks: true,
        }
    }
}

/// A single loop-nest kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopKernel {
    pub name: String,
    pub args: Vec<KernelArg>,
    pub temporary_variables: IndexMap<String, TemporaryVariable>,
    pub instructions: Vec<Instruction>,
    pub domains: Vec<IterationDomain>,
    pub substitutions: IndexMap<String, SubstitutionRule>,
    pub iname_tags: BTreeMap<String, TagSet>,
    pub options: KernelOptions,
}

impl Hash for LoopKernel {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.args.hash(state);
        hash_indexmap_unordered(&self.temporary_variables, state);
        self.instructions.hash(state);
        self.domains.hash(state);
        hash_indexmap_unordered(&self.substitutions, state);
        self.iname_tags.hash(state);
        self.options.hash(state);
    }
}

impl LoopKernel {
    pub fn empty(name: impl Into<String>, options: KernelOptions) -> Self {
        LoopKernel {
            name: name.into(),
            args: Vec::new(),
            temporary_variables: IndexMap::new(),
            instructions: Vec::new(),
            domains: Vec::new(),
            substitutions: IndexMap::new(),
            iname_tags: BTreeMap::new(),
            options,
        }
    }

    pub fn has_arg(&self, name: &str) -> bool {
        self.args.iter().any(|a| a.name() == name)
    }

    pub fn arg(&self, name: &str) -> Option<&KernelArg> {
        self.args.iter().find(|a| a.name() == name)
    }

    pub fn instruction(&self, id: &str) -> Option<&Instruction> {
        self.instructions.iter().find(|i| i.id == id)
    }

    /// Attach `tags` to an iname; merges with tags already present.
    pub fn tag_iname(&mut self, iname: &str, tags: TagSet) {
        self.iname_tags
            .entry(iname.to_string())
            .or_default()
            .extend(tags);
    }

    /// Names in use by args, temporaries, substitutions, and inames;
    /// used to seed unique name generators.
    pub fn used_names(&self) -> BTreeSet<String> {
        let mut names: BTreeSet<String> = self.args.iter().map(|a| a.name().to_string()).collect();
        names.extend(self.temporary_variables.keys().cloned());
        names.extend(self.substitutions.keys().cloned());
        for domain in &self.domains {
            names.extend(domain.set_dims().iter().cloned());
        }
        names
    }
}

// ============================================================================
// Translation Unit
// ============================================================================

/// A set of kernels with a designated entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslationUnit {
    kernels: IndexMap<String, LoopKernel>,
    entrypoint: String,
}

impl Hash for TranslationUnit {
    fn hash<H: Hasher>(&self, state: &mut H) {
        hash_indexmap_unordered(&self.kernels, state);
        self.entrypoint.hash(state);
    }
}

impl TranslationUnit {
    pub fn new(kernel: LoopKernel) -> Self {
        let entrypoint = kernel.name.clone();
        let mut kernels = IndexMap::new();
        kernels.insert(entrypoint.clone(), kernel);
        TranslationUnit {
            kernels,
            entrypoint,
        }
    }

    pub fn entrypoint(&self) -> &str {
        &self.entrypoint
    }

    pub fn kernel(&self, name: &str) -> Option<&LoopKernel> {
        self.kernels.get(name)
    }

    pub fn kernels(&self) -> &IndexMap<String, LoopKernel> {
        &self.kernels
    }

    pub fn default_entrypoint(&self) -> &LoopKernel {
        &self.kernels[&self.entrypoint]
    }

    pub fn default_entrypoint_mut(&mut self) -> &mut LoopKernel {
        &mut self.kernels[&self.entrypoint]
    }

    /// Replace a kernel wholesale.
    pub fn with_kernel(mut self, kernel: LoopKernel) -> Self {
        self.kernels.insert(kernel.name.clone(), kernel);
        self
    }

    /// Rename a callee kernel (and the entrypoint if it is the one
    /// renamed).
    pub fn rename_kernel(mut self, old: &str, new: &str) -> Result<Self, LoopNestError> {
        let Some(mut kernel) = self.kernels.shift_remove(old) else {
            return Err(LoopNestError::UnknownKernel(old.to_string()));
        };
        kernel.name = new.to_string();
        if self.entrypoint == old {
            self.entrypoint = new.to_string();
        }
        self.kernels.insert(new.to_string(), kernel);
        Ok(self)
    }

    /// Merge the kernels of `other` into `self`. Name collisions must have
    /// been resolved by the caller (identical duplicates are allowed and
    /// aliased).
    pub fn merge(mut self, other: &TranslationUnit) -> Result<Self, LoopNestError> {
        for (name, kernel) in &other.kernels {
            match self.kernels.get(name) {
                None => {
                    self.kernels.insert(name.clone(), kernel.clone());
                }
                Some(existing) if existing == kernel => {}
                Some(_) => return Err(LoopNestError::DuplicateKernel(name.clone())),
            }
        }
        Ok(self)
    }
}

// ============================================================================
// Reduction Iname Uniquification
// ============================================================================

fn collect_reduction_inames(expr: &ScalarRef, out: &mut Vec<String>) {
    scalar::for_each(expr, &mut |node| {
        if let ScalarExpr::Reduce { bounds, .. } = &**node {
            out.extend(bounds.keys().cloned());
        }
    });
}

/// Make reduction inames unique across all instructions of the entry
/// kernel.
///
/// Inlining can paste the same cached subexpression into several stores;
/// each paste carries the same reduction iname. Every repeated iname is
/// renamed and its reduction-only domain duplicated under the new name.
pub fn make_reduction_inames_unique(mut t_unit: TranslationUnit) -> TranslationUnit {
    let kernel = t_unit.default_entrypoint();
    let mut namegen = UniqueNameGenerator::with_names(kernel.used_names());

    let mut seen: BTreeSet<String> = BTreeSet::new();
    let mut new_instructions = Vec::with_capacity(kernel.instructions.len());
    let mut extra_domains: Vec<IterationDomain> = Vec::new();
    let domains = kernel.domains.clone();

    for insn in &kernel.instructions {
        let mut inames = Vec::new();
        collect_reduction_inames(&insn.expression, &mut inames);

        let mut renames: BTreeMap<String, String> = BTreeMap::new();
        for iname in &inames {
            if seen.contains(iname) && !renames.contains_key(iname) {
                renames.insert(iname.clone(), namegen.fresh(iname));
            }
        }
        seen.extend(inames);

        if renames.is_empty() {
            new_instructions.push(insn.clone());
            continue;
        }

        for (old, new) in &renames {
            for domain in &domains {
                if domain.set_dims().iter().any(|d| d == old) {
                    if let Ok(renamed) = domain.rename_dim(old, new) {
                        extra_domains.push(renamed);
                    }
                }
            }
        }

        let new_expr = scalar::rename_reduction_indices(&insn.expression, &renames);
        new_instructions.push(Instruction {
            expression: new_expr,
            ..insn.clone()
        });
    }

    let kernel = t_unit.default_entrypoint_mut();
    kernel.instructions = new_instructions;
    kernel.domains.extend(extra_domains);
    t_unit
}

/// Convenience: a `ScalarRef` reading a whole sub-array, for kernel-call
/// parameters.
pub fn sub_array_ref(inames: Vec<String>, array: impl Into<String>) -> ScalarRef {
    Arc::new(ScalarExpr::SubArrayRef {
        inames,
        array: array.into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DimBounds;
    use crate::scalar::{int, reduce, subscript, var, ReductionOp};

    fn kernel_with_two_sums() -> TranslationUnit {
        let bounds: scalar::ReductionBounds =
            [("_al_sum_r0".to_string(), (int(0), int(8)))].into_iter().collect();
        let sum_expr = reduce(
            ReductionOp::Sum,
            bounds,
            subscript("x", vec![var("_al_sum_r0")]),
        );

        let mut kernel = LoopKernel::empty("loom_knl", KernelOptions::default());
        kernel.domains.push(
            IterationDomain::from_bounds(vec![DimBounds {
                dim: "_al_sum_r0".into(),
                lower: int(0),
                upper: int(8),
            }])
            .expect("affine bounds"),
        );
        for (i, name) in ["a_store", "b_store"].iter().enumerate() {
            kernel.instructions.push(Instruction {
                id: (*name).to_string(),
                assignees: vec![Assignee::Variable(format!("out{i}"))],
                expression: sum_expr.clone(),
                within_inames: BTreeSet::new(),
                depends_on: BTreeSet::new(),
            });
        }
        TranslationUnit::new(kernel)
    }

    #[test]
    fn test_reduction_inames_made_unique() {
        let t_unit = make_reduction_inames_unique(kernel_with_two_sums());
        let kernel = t_unit.default_entrypoint();

        let mut first = Vec::new();
        collect_reduction_inames(&kernel.instructions[0].expression, &mut first);
        let mut second = Vec::new();
        collect_reduction_inames(&kernel.instructions[1].expression, &mut second);

        assert_eq!(first, vec!["_al_sum_r0".to_string()]);
        assert_eq!(second.len(), 1);
        assert_ne!(second[0], "_al_sum_r0");
        // The renamed iname received its own domain.
        assert!(kernel
            .domains
            .iter()
            .any(|d| d.set_dims() == [second[0].clone()]));
    }

    #[test]
    fn test_merge_rejects_conflicting_kernels() {
        let a = TranslationUnit::new(LoopKernel::empty("f", KernelOptions::default()));
        let mut other_kernel = LoopKernel::empty("f", KernelOptions::default());
        other_kernel.args.push(KernelArg::Value(ValueArg {
            name: "n".into(),
            dtype: DType::Int64,
            tags: TagSet::new(),
        }));
        let b = TranslationUnit::new(other_kernel);
        assert!(a.clone().merge(&a).is_ok());
        assert!(a.merge(&b).is_err());
    }

    #[test]
    fn test_rename_kernel_updates_entrypoint() {
        let t = TranslationUnit::new(LoopKernel::empty("f", KernelOptions::default()));
        let t = t.rename_kernel("f", "g").expect("known kernel");
        assert_eq!(t.entrypoint(), "g");
        assert!(t.kernel("g").is_some());
    }
}
