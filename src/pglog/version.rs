use serde::{Deserialize, Serialize};
use std::fmt;

/// Totally ordered log version: the epoch in which a mutation was issued and a
/// per-group sequence number. Ordering is lexicographic on `(epoch, version)`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Eversion {
    pub epoch: u64,
    pub version: u64,
}

impl Eversion {
    pub const ZERO: Eversion = Eversion {
        epoch: 0,
        version: 0,
    };
    pub const MAX: Eversion = Eversion {
        epoch: u64::MAX,
        version: u64::MAX,
    };

    pub const fn new(epoch: u64, version: u64) -> Self {
        Self { epoch, version }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    pub fn is_max(&self) -> bool {
        *self == Self::MAX
    }
}

impl fmt::Display for Eversion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}'{}", self.epoch, self.version)
    }
}

impl From<(u64, u64)> for Eversion {
    fn from((epoch, version): (u64, u64)) -> Self {
        Self::new(epoch, version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_by_epoch_then_sequence() {
        assert!(Eversion::new(1, 9) < Eversion::new(2, 1));
        assert!(Eversion::new(2, 1) < Eversion::new(2, 2));
        assert!(Eversion::ZERO < Eversion::new(0, 1));
        assert!(Eversion::new(u64::MAX, 0) < Eversion::MAX);
    }

    #[test]
    fn displays_epoch_tick_version() {
        assert_eq!(Eversion::new(3, 17).to_string(), "3'17");
    }
}
