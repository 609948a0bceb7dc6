//! # Tag Vocabulary
//!
//! Tags are small immutable values attached to arrays, axes, and reduction
//! descriptors. The pipeline recognizes the variants below and treats
//! everything else (`Opaque`) as inert metadata that is carried along.
//!
//! Tags never influence the value an array denotes; they steer name choice
//! (`Named`, `PrefixNamed`), materialization (`ImplStored`, `ImplInlined`,
//! `ImplSubstitution`), argument kinds (`ForceValueArg`), inlining
//! (`InlineCall`), and call concatenation (`FunctionIdentifier` and the
//! concat-axis markers).

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A tag attached to an array, an axis, or a reduction descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Tag {
    /// Request exactly this name for the node's buffer.
    Named(String),
    /// Request a generated name with this prefix.
    PrefixNamed(String),
    /// Materialize the node into a stored buffer.
    ImplStored,
    /// Inline the node's expression at every use site.
    ImplInlined,
    /// Expose the node as a named substitution rule.
    ImplSubstitution,
    /// Pass a scalar placeholder as a value argument instead of an array.
    ForceValueArg,
    /// Mark a call site for inlining.
    InlineCall,
    /// Identifies a function across call sites; concatenation pools call
    /// sites sharing this tag.
    FunctionIdentifier(String),
    /// Axis marker placed on concatenated call inputs.
    ConcatenatedCallInputConcatAxis,
    /// Axis marker placed on sliced call outputs.
    ConcatenatedCallOutputSliceAxis,
    /// Axis marker that inherits axis metadata from input `arg` (none for
    /// the output side) at the given axis.
    UseInputAxis { arg: Option<usize>, axis: usize },
    /// User-provided metadata; never interpreted.
    Opaque(String),
}

/// The discriminant of a [`Tag`]; ignore lists and filters are expressed in
/// terms of kinds rather than full values.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum TagKind {
    Named,
    PrefixNamed,
    ImplStored,
    ImplInlined,
    ImplSubstitution,
    ForceValueArg,
    InlineCall,
    FunctionIdentifier,
    ConcatenatedCallInputConcatAxis,
    ConcatenatedCallOutputSliceAxis,
    UseInputAxis,
    Opaque,
}

impl Tag {
    pub fn kind(&self) -> TagKind {
        match self {
            Tag::Named(_) => TagKind::Named,
            Tag::PrefixNamed(_) => TagKind::PrefixNamed,
            Tag::ImplStored => TagKind::ImplStored,
            Tag::ImplInlined => TagKind::ImplInlined,
            Tag::ImplSubstitution => TagKind::ImplSubstitution,
            Tag::ForceValueArg => TagKind::ForceValueArg,
            Tag::InlineCall => TagKind::InlineCall,
            Tag::FunctionIdentifier(_) => TagKind::FunctionIdentifier,
            Tag::ConcatenatedCallInputConcatAxis => TagKind::ConcatenatedCallInputConcatAxis,
            Tag::ConcatenatedCallOutputSliceAxis => TagKind::ConcatenatedCallOutputSliceAxis,
            Tag::UseInputAxis { .. } => TagKind::UseInputAxis,
            Tag::Opaque(_) => TagKind::Opaque,
        }
    }

    /// Whether this tag selects an implementation strategy.
    pub fn is_impl_strategy(&self) -> bool {
        matches!(
            self,
            Tag::ImplStored | Tag::ImplInlined | Tag::ImplSubstitution
        )
    }
}

/// An immutable, deterministically ordered set of tags.
pub type TagSet = BTreeSet<Tag>;

/// Look up the single tag of `kind` in `tags`, if present.
pub fn tag_of_kind(tags: &TagSet, kind: TagKind) -> Option<&Tag> {
    tags.iter().find(|t| t.kind() == kind)
}

pub fn has_tag_of_kind(tags: &TagSet, kind: TagKind) -> bool {
    tag_of_kind(tags, kind).is_some()
}

/// Remove every tag whose kind is in `kinds`.
pub fn without_kinds(tags: &TagSet, kinds: &BTreeSet<TagKind>) -> TagSet {
    tags.iter()
        .filter(|t| !kinds.contains(&t.kind()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_lookup() {
        let mut tags = TagSet::new();
        tags.insert(Tag::Named("out".into()));
        tags.insert(Tag::ImplStored);

        assert!(has_tag_of_kind(&tags, TagKind::ImplStored));
        assert_eq!(
            tag_of_kind(&tags, TagKind::Named),
            Some(&Tag::Named("out".into()))
        );
        assert!(!has_tag_of_kind(&tags, TagKind::InlineCall));
    }

    #[test]
    fn test_without_kinds_filters() {
        let mut tags = TagSet::new();
        tags.insert(Tag::ImplStored);
        tags.insert(Tag::Opaque("provenance".into()));

        let kinds: BTreeSet<TagKind> = [TagKind::ImplStored].into_iter().collect();
        let filtered = without_kinds(&tags, &kinds);
        assert_eq!(filtered.len(), 1);
        assert!(has_tag_of_kind(&filtered, TagKind::Opaque));
    }

    #[test]
    fn test_impl_strategy_tags() {
        assert!(Tag::ImplStored.is_impl_strategy());
        assert!(Tag::ImplSubstitution.is_impl_strategy());
        assert!(!Tag::InlineCall.is_impl_strategy());
    }
}
