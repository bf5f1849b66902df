//! Ephemerons for a multi-domain incremental collector.
//!
//! An ephemeron holds zero or more keys and one payload. The payload stays
//! reachable only while every key is reachable through something other than
//! the ephemeron; once a key dies the collector clears it together with the
//! payload.
//!
//! The operations here are collector-agnostic. Everything they need from the
//! heap (phase, liveness, allocation, barriers, the registry head) comes
//! through the [`Runtime`] trait, implemented once per domain.

mod blit;
mod clean;
mod copy;
mod ephemeron;
mod error;
mod runtime;
mod weak;

#[cfg(test)]
mod testing;

pub use clean::{Cleaned, clean, resolve_forward};
pub use ephemeron::{DATA_OFFSET, DOMAIN_OFFSET, Ephemeron, FIRST_KEY, LINK_OFFSET};
pub use error::{EphemeronError, Result};
pub use runtime::{DomainId, GcPhase, Runtime};
pub use weak::WeakArray;
