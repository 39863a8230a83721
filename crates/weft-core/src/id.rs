//! Fiber identifier type

use core::fmt;

/// Unique identifier for a fiber.
///
/// Ids are assigned monotonically from a process-global counter, starting at
/// zero with the first main fiber. Zero therefore always names a thread-main
/// fiber; the value is never recycled.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FiberId(u64);

impl FiberId {
    /// Create a new FiberId from a raw value
    #[inline]
    pub const fn new(id: u64) -> Self {
        FiberId(id)
    }

    /// Get the raw u64 value
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for FiberId {
    #[inline]
    fn from(id: u64) -> Self {
        FiberId(id)
    }
}

impl From<FiberId> for u64 {
    #[inline]
    fn from(id: FiberId) -> Self {
        id.0
    }
}

impl fmt::Debug for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FiberId({})", self.0)
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fiber_id_basics() {
        let id = FiberId::new(42);
        assert_eq!(id.as_u64(), 42);
        assert_eq!(format!("{}", id), "42");
        assert_eq!(format!("{:?}", id), "FiberId(42)");
    }

    #[test]
    fn test_fiber_id_conversions() {
        let id: FiberId = 100u64.into();
        let raw: u64 = id.into();
        assert_eq!(raw, 100);
    }
}
