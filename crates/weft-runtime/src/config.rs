//! Runtime configuration
//!
//! Compile-time defaults with environment overrides, resolved once.
//!
//! Environment variables:
//! - `WEFT_STACK_SIZE` - Default fiber stack size in bytes

use std::sync::OnceLock;
use weft_core::env::env_get;

/// Default fiber stack size: 128 KiB
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

static STACK_SIZE: OnceLock<usize> = OnceLock::new();

/// The configured default stack size for fibers created with `stacksize == 0`.
///
/// Read from `WEFT_STACK_SIZE` on first use and cached for the process
/// lifetime.
#[inline]
pub fn stack_size() -> usize {
    *STACK_SIZE.get_or_init(|| env_get("WEFT_STACK_SIZE", DEFAULT_STACK_SIZE))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_size_default() {
        // The cached value is either the default or whatever the environment
        // set before the first call; both are non-zero.
        assert!(stack_size() > 0);
    }
}
