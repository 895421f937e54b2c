//! The fatal-corruption primitive (§7.1).
//!
//! Corruption detected while decoding persistent metadata is not a
//! recoverable error at this layer: it means the caller has already
//! committed to a block identity that the on-media state contradicts.
//! There is nothing to return to — the only sound move is to log the
//! violated invariant and stop.

use std::fmt::Display;

/// Log `reason` at error level and abort the process.
///
/// Never returns. Callers use this at the tail of a decode step once
/// they've determined the persistent metadata cannot be trusted.
#[cold]
#[track_caller]
pub fn corrupt(reason: impl Display) -> ! {
    log::error!("persistent-memory metadata corruption: {reason}");
    panic!("persistent-memory metadata corruption: {reason}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "metadata corruption")]
    fn corrupt_panics() {
        corrupt("unknown chunk type 9");
    }
}
