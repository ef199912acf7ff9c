//! Value object trait: equality by value, not identity.

/// Marker trait for value objects.
///
/// Value objects have no identity and never change after construction: a
/// parsed entry reference, one status-history entry or a date range are equal
/// exactly when their attributes are equal. "Changing" one means building a
/// new value.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
