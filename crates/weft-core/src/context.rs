//! Saved machine context for fiber switching
//!
//! The layout is `repr(C)` with fixed field order because the arch layer's
//! assembly addresses fields by byte offset.

/// Callee-saved registers captured at a voluntary switch point (System V
/// AMD64 ABI). One of these lives in every fiber; the dispatch loop's own
/// suspension point is saved into the anchor fiber's block.
///
/// Offsets (stable, used by the assembly):
/// ```text
/// 0x00: rsp   0x08: rip   0x10: rbx   0x18: rbp
/// 0x20: r12   0x28: r13   0x30: r14   0x38: r15
/// ```
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SavedRegs {
    pub rsp: u64,
    pub rip: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

impl SavedRegs {
    /// A zeroed context; filled in by the arch layer before first use
    pub const fn zeroed() -> Self {
        Self {
            rsp: 0,
            rip: 0,
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
        }
    }
}

impl Default for SavedRegs {
    fn default() -> Self {
        Self::zeroed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        // The assembly depends on these offsets
        assert_eq!(core::mem::size_of::<SavedRegs>(), 64);
        assert_eq!(core::mem::offset_of!(SavedRegs, rsp), 0x00);
        assert_eq!(core::mem::offset_of!(SavedRegs, rip), 0x08);
        assert_eq!(core::mem::offset_of!(SavedRegs, r15), 0x38);
    }
}
