//! Instrumentation annotation hooks.
//!
//! These exist so the call sites named in §4.1/§4.4 are present; they
//! are no-ops unless an external analyzer is attached, which this
//! crate never does on its own. Behind `instrumentation-trace` they
//! additionally log at trace level, useful for confirming during
//! development that an annotation fires at the point the spec expects.

#[cfg(feature = "instrumentation-trace")]
macro_rules! trace_hook {
    ($name:literal, $addr:expr, $len:expr) => {
        log::trace!("vg::{} addr={:p} len={}", $name, $addr, $len)
    };
}

/// Mark `len` bytes starting at `addr` as defined (initialized).
pub fn make_defined(addr: *const u8, len: usize) {
    #[cfg(feature = "instrumentation-trace")]
    trace_hook!("make_defined", addr, len);
    #[cfg(not(feature = "instrumentation-trace"))]
    let _ = (addr, len);
}

/// Mark `len` bytes starting at `addr` as undefined (uninitialized).
pub fn make_undefined(addr: *const u8, len: usize) {
    #[cfg(feature = "instrumentation-trace")]
    trace_hook!("make_undefined", addr, len);
    #[cfg(not(feature = "instrumentation-trace"))]
    let _ = (addr, len);
}

/// Mark `len` bytes starting at `addr` as inaccessible.
pub fn make_noaccess(addr: *const u8, len: usize) {
    #[cfg(feature = "instrumentation-trace")]
    trace_hook!("make_noaccess", addr, len);
    #[cfg(not(feature = "instrumentation-trace"))]
    let _ = (addr, len);
}

/// Mark `len` bytes starting at `addr` as clean (no pending writes).
pub fn set_clean(addr: *const u8, len: usize) {
    #[cfg(feature = "instrumentation-trace")]
    trace_hook!("set_clean", addr, len);
    #[cfg(not(feature = "instrumentation-trace"))]
    let _ = (addr, len);
}

/// Note that `len` bytes starting at `addr` are part of the current
/// transaction's write-set.
pub fn add_to_tx(addr: *const u8, len: usize) {
    #[cfg(feature = "instrumentation-trace")]
    trace_hook!("add_to_tx", addr, len);
    #[cfg(not(feature = "instrumentation-trace"))]
    let _ = (addr, len);
}

/// Remove `len` bytes starting at `addr` from the current
/// transaction's write-set.
pub fn remove_from_tx(addr: *const u8, len: usize) {
    #[cfg(feature = "instrumentation-trace")]
    trace_hook!("remove_from_tx", addr, len);
    #[cfg(not(feature = "instrumentation-trace"))]
    let _ = (addr, len);
}
