//! Bounded busy-waiting.
//!
//! Every wait in the kernel core (IPI delivery, the pause-the-world lock, the
//! bring-up handshake, timer calibration) goes through [`spin_until`], so a
//! wedged device or a core that never answers becomes a reported error instead
//! of a silent hang.

use kestrel_common::SpinTimeout;

/// Spins until `condition` returns true, checking it at most `limit + 1` times.
///
/// Returns the number of failed checks on success.
pub fn spin_until(
    limit: u64,
    what: &'static str,
    mut condition: impl FnMut() -> bool,
) -> Result<u64, SpinTimeout> {
    for spins in 0..=limit {
        if condition() {
            return Ok(spins);
        }
        core::hint::spin_loop();
    }
    Err(SpinTimeout {
        what,
        iterations: limit,
    })
}
