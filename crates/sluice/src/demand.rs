//! Demand signal used for backpressure.

use std::cmp::Ordering;

/// How much more a downstream is willing to receive.
///
/// Ordered by room to send more: `None < Max(n) < Unlimited`. `Cancel` is
/// terminal and incomparable with the other states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Demand {
    /// Nothing right now.
    #[default]
    None,
    /// At most this many more values. Construct with [`Demand::max`]; a
    /// `Max(0)` is treated as `None` everywhere.
    Max(u64),
    /// No limit.
    Unlimited,
    /// Stop permanently.
    Cancel,
}

impl Demand {
    /// Finite demand, normalizing zero to [`Demand::None`].
    pub const fn max(count: u64) -> Self {
        if count == 0 {
            Demand::None
        } else {
            Demand::Max(count)
        }
    }

    /// Returns true if at least one more value may be sent.
    pub const fn has_room(&self) -> bool {
        match self {
            Demand::Unlimited => true,
            Demand::Max(count) => *count > 0,
            Demand::None | Demand::Cancel => false,
        }
    }

    pub const fn is_cancel(&self) -> bool {
        matches!(self, Demand::Cancel)
    }

    /// The remaining finite quantity; `None` for unlimited or cancelled demand.
    pub const fn quantity(&self) -> Option<u64> {
        match self {
            Demand::None => Some(0),
            Demand::Max(count) => Some(*count),
            Demand::Unlimited | Demand::Cancel => None,
        }
    }

    /// Demand after one value has been delivered against it.
    #[must_use]
    pub const fn decremented(self) -> Self {
        match self {
            Demand::Max(count) if count > 1 => Demand::Max(count - 1),
            Demand::Max(_) => Demand::None,
            other => other,
        }
    }

    /// Rank used for ordering; `None` for `Cancel`.
    const fn room(&self) -> Option<u128> {
        match self {
            Demand::None => Some(0),
            Demand::Max(count) => Some(*count as u128),
            Demand::Unlimited => Some(u128::MAX),
            Demand::Cancel => None,
        }
    }
}

impl PartialOrd for Demand {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self.room(), other.room()) {
            // `Max(0)` ranks with `None` without being equal to it.
            (Some(lhs), Some(rhs)) if lhs == rhs && self != other => None,
            (Some(lhs), Some(rhs)) => Some(lhs.cmp(&rhs)),
            (None, None) => Some(Ordering::Equal),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_zero_normalizes() {
        assert_eq!(Demand::max(0), Demand::None);
        assert_eq!(Demand::max(3), Demand::Max(3));
        assert!(!Demand::Max(0).has_room());
    }

    #[test]
    fn test_ordering_by_room() {
        assert!(Demand::None < Demand::max(1));
        assert!(Demand::max(1) < Demand::max(5));
        assert!(Demand::max(u64::MAX) < Demand::Unlimited);
        assert_eq!(Demand::Cancel.partial_cmp(&Demand::Cancel), Some(Ordering::Equal));
        assert_eq!(Demand::Cancel.partial_cmp(&Demand::Unlimited), None);
        assert_eq!(Demand::None.partial_cmp(&Demand::Cancel), None);
    }

    #[test]
    fn test_decrement() {
        assert_eq!(Demand::max(2).decremented(), Demand::Max(1));
        assert_eq!(Demand::max(1).decremented(), Demand::None);
        assert_eq!(Demand::None.decremented(), Demand::None);
        assert_eq!(Demand::Unlimited.decremented(), Demand::Unlimited);
        assert_eq!(Demand::Cancel.decremented(), Demand::Cancel);
    }

    #[test]
    fn test_queries() {
        assert!(Demand::Unlimited.has_room());
        assert!(!Demand::Cancel.has_room());
        assert!(Demand::Cancel.is_cancel());
        assert_eq!(Demand::max(4).quantity(), Some(4));
        assert_eq!(Demand::Unlimited.quantity(), None);
        assert_eq!(Demand::default(), Demand::None);
    }
}
