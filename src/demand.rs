//! Demand accounting shared by every executor.

use crate::error::ProtocolViolation;

/// Demand signal used for backpressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Demand {
    /// Finite demand with remaining count.
    Finite(u64),
    /// Unbounded demand. Reached by requesting `u64::MAX` or by overflowing.
    Unbounded,
}

impl Demand {
    /// Returns `true` if there is remaining demand.
    pub const fn has_demand(&self) -> bool {
        match self {
            Demand::Unbounded => true,
            Demand::Finite(remaining) => *remaining > 0,
        }
    }

    /// Returns `true` if the demand is unbounded.
    pub const fn is_unbounded(&self) -> bool {
        matches!(self, Demand::Unbounded)
    }

    /// Returns the remaining finite demand, if any.
    pub const fn remaining(&self) -> Option<u64> {
        match self {
            Demand::Finite(value) => Some(*value),
            Demand::Unbounded => None,
        }
    }

    /// The smaller of two demands.
    pub fn min(self, other: Demand) -> Demand {
        match (self, other) {
            (Demand::Unbounded, other) | (other, Demand::Unbounded) => other,
            (Demand::Finite(a), Demand::Finite(b)) => Demand::Finite(a.min(b)),
        }
    }

    /// How much must be added to `self` to reach `target`, if anything.
    ///
    /// Returns the amount to pass to `request`, where `u64::MAX` stands for
    /// unbounded.
    pub fn shortfall(self, target: Demand) -> Option<u64> {
        match (self, target) {
            (Demand::Unbounded, _) => None,
            (Demand::Finite(_), Demand::Unbounded) => Some(u64::MAX),
            (Demand::Finite(current), Demand::Finite(target)) if target > current => {
                Some(target - current)
            }
            (Demand::Finite(_), Demand::Finite(_)) => None,
        }
    }
}

impl From<u64> for Demand {
    fn from(value: u64) -> Self {
        if value == u64::MAX {
            Demand::Unbounded
        } else {
            Demand::Finite(value)
        }
    }
}

/// Tracks demand granted by a consumer and not yet satisfied.
#[derive(Debug, Clone)]
pub struct DemandTracker {
    current: Demand,
}

impl DemandTracker {
    /// Creates a new demand tracker with zero demand.
    pub const fn new() -> Self {
        Self {
            current: Demand::Finite(0),
        }
    }

    /// Returns the current demand value.
    pub const fn current(&self) -> Demand {
        self.current
    }

    /// Returns `true` if at least one more element may be delivered.
    pub const fn has_demand(&self) -> bool {
        self.current.has_demand()
    }

    /// Adds demand to the tracker. Overflow saturates to unbounded.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolViolation::NonPositiveRequest`] when `amount` is zero.
    pub fn request(&mut self, amount: u64) -> Result<Demand, ProtocolViolation> {
        if amount == 0 {
            return Err(ProtocolViolation::NonPositiveRequest);
        }

        self.current = match self.current {
            Demand::Unbounded => Demand::Unbounded,
            Demand::Finite(current) => match current.checked_add(amount) {
                Some(total) if total != u64::MAX => Demand::Finite(total),
                _ => Demand::Unbounded,
            },
        };
        Ok(self.current)
    }

    /// Raises the tracked demand to `target` if it is below it.
    ///
    /// Returns the amount that was added, as it should be passed to `request`.
    pub fn raise_to(&mut self, target: Demand) -> Option<u64> {
        let shortfall = self.current.shortfall(target)?;
        self.current = match self.current {
            Demand::Finite(current) if shortfall != u64::MAX => Demand::Finite(current + shortfall),
            _ => Demand::Unbounded,
        };
        Some(shortfall)
    }

    /// Consumes a single unit of demand when available.
    #[must_use]
    pub fn consume_one(&mut self) -> bool {
        match self.current {
            Demand::Unbounded => true,
            Demand::Finite(value) if value > 0 => {
                self.current = Demand::Finite(value - 1);
                true
            }
            Demand::Finite(_) => false,
        }
    }

    /// Forgets all outstanding demand.
    pub fn clear(&mut self) {
        self.current = Demand::Finite(0);
    }
}

impl Default for DemandTracker {
    fn default() -> Self {
        Self::new()
    }
}
