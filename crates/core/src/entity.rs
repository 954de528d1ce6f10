//! Entity trait: identity + a human-readable name.

/// Entity marker + minimal interface.
pub trait Entity {
    /// Strongly-typed entity identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the entity identifier.
    fn id(&self) -> &Self::Id;

    /// Name shown to editors in failure reports.
    fn display_name(&self) -> &str;
}
