//! Thin wrappers around the cache maintenance instructions used by the
//! hammering and checking loops.

/// Flushes the cache line containing `p` from every level of the cache hierarchy.
///
/// # Safety
///
/// `p` must point into mapped memory.
#[inline(always)]
pub unsafe fn clflush(p: *const u8) {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        std::arch::x86_64::_mm_clflush(p)
    };
    #[cfg(not(target_arch = "x86_64"))]
    let _ = p;
}

/// Serializes all preceding loads and stores.
#[inline(always)]
pub fn mfence() {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        std::arch::x86_64::_mm_mfence()
    };
    #[cfg(not(target_arch = "x86_64"))]
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}
