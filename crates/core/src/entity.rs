//! Entity trait: identity + continuity across state changes.

/// Entity marker + minimal interface.
///
/// A purchase stays the same entity while its attributes, status and deletion
/// flag change; only the identifier decides sameness.
pub trait Entity {
    /// Strongly-typed entity identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the entity identifier.
    fn id(&self) -> &Self::Id;

    /// Hidden from default views without being physically removed.
    fn is_soft_deleted(&self) -> bool {
        false
    }
}
