//! Architecture-specific context switching
//!
//! Each backend provides two operations over [`weft_core::SavedRegs`]:
//!
//! - `init_context(regs, stack_top, entry_fn, entry_arg)`: arrange for the
//!   first switch into `regs` to begin executing `entry_fn(entry_arg)` on the
//!   given stack.
//! - `switch_context(save, load)`: save the callee-saved state of the
//!   caller into `save` and resume execution from `load`. Returns when some
//!   later switch loads `save` again.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(target_arch = "aarch64")]
pub mod aarch64;
