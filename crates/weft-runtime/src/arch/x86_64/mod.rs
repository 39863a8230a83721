//! x86_64 context switching implementation
//!
//! Inline naked assembly over the callee-saved register set; stable since
//! Rust 1.88.

use std::arch::naked_asm;
use weft_core::context::SavedRegs;

/// Initialize a fresh fiber context.
///
/// Sets up `regs` so that the first `switch_context` into it enters the
/// trampoline, which calls `entry_fn(entry_arg)`.
///
/// # Safety
///
/// `regs` must point to valid `SavedRegs` memory. `stack_top` must be the
/// high end of a live stack buffer large enough for the entry function.
#[inline]
pub unsafe fn init_context(
    regs: *mut SavedRegs,
    stack_top: *mut u8,
    entry_fn: usize,
    entry_arg: usize,
) {
    // 16-byte aligned per the System V AMD64 ABI; the trampoline's `call`
    // then gives the entry function a standard post-call frame.
    let aligned_sp = (stack_top as usize) & !0xF;

    let regs = &mut *regs;
    regs.rsp = aligned_sp as u64;
    regs.rip = fiber_trampoline as usize as u64;
    regs.rbx = 0;
    regs.rbp = 0;
    regs.r12 = entry_fn as u64; // entry function
    regs.r13 = entry_arg as u64; // entry argument
    regs.r14 = 0;
    regs.r15 = 0;
}

/// Trampoline that calls the entry function with its argument.
///
/// The entry function performs the terminal yield itself and never returns
/// here; the trap instruction backstops that contract.
#[unsafe(naked)]
unsafe extern "C" fn fiber_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        "ud2",
    );
}

/// Perform a voluntary context switch.
///
/// Saves callee-saved registers to `save` and loads from `load`. The call
/// returns (to the original caller) when another switch loads `save`.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_save: *mut SavedRegs, _load: *const SavedRegs) {
    naked_asm!(
        // Save callee-saved registers to save (RDI)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load callee-saved registers from load (RSI)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        // Jump to the loaded RIP
        "jmp rax",
        // Return point for saved contexts
        "1:",
        "ret",
    );
}
