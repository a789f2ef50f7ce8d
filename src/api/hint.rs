//! Branch weighting for the burst paths.

#[cold]
#[inline(never)]
fn cold_path() {}

/// Returns `b`, telling the optimizer `false` is the rare outcome.
#[inline(always)]
pub fn likely(b: bool) -> bool {
    if !b {
        cold_path();
    }
    b
}

/// Returns `b`, telling the optimizer `true` is the rare outcome.
#[inline(always)]
pub fn unlikely(b: bool) -> bool {
    if b {
        cold_path();
    }
    b
}
