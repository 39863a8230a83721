//! aarch64 context switching implementation
//!
//! TODO: port the x86_64 switch to ARM64 (save x19-x28, fp, lr, sp, d8-d15)

use weft_core::context::SavedRegs;

/// Initialize a fresh fiber context
pub unsafe fn init_context(
    _regs: *mut SavedRegs,
    _stack_top: *mut u8,
    _entry_fn: usize,
    _entry_arg: usize,
) {
    todo!("aarch64 init_context not yet implemented")
}

/// Perform a voluntary context switch
pub unsafe extern "C" fn switch_context(_save: *mut SavedRegs, _load: *const SavedRegs) {
    todo!("aarch64 switch_context not yet implemented")
}
