//! Persistent, multi-process telemetry counters.
//!
//! `tally` records named counters into a per-day, memory-mapped file on
//! local disk. Incrementing is one atomic fetch-add on mapped memory; any
//! number of concurrent processes of the same program safely share and
//! aggregate into the same file with no coordination beyond atomic
//! operations on the mapping.
//!
//! ```no_run
//! static OPENS: tally::Counter = tally::Counter::new("file/opens");
//!
//! fn main() {
//!     tally::open(tally::identity!());
//!     OPENS.inc();
//! }
//! ```
//!
//! Counters never fail and never block user code: before [`open`], when
//! telemetry is disabled, or when the file cannot be written, increments are
//! silent no-ops.
//!
//! # On disk
//!
//! The active file is `<program>[@<version>]-<toolchain>-<os>-<arch>-` plus
//! the current date and `.v1.count`, in the local telemetry directory. The
//! format (a header, a 512-bucket hash table, and 32-byte-aligned records
//! holding an atomic value and a name) is documented in the `layout`
//! module. Files rotate at the validity boundary (a midnight); a completed
//! file is never written again and is picked up by the upload side, which
//! can decode it with [`parse_file`].

#![forbid(unsafe_op_in_unsafe_fn)]

mod config;
mod counter;
mod error;
mod hash;
mod ident;
mod layout;
mod mapped;
mod parse;
mod registry;
mod rotate;

#[cfg(test)]
mod proptests;

pub use config::{Config, Mode};
pub use counter::Counter;
pub use error::CounterError;
pub use ident::Identity;
pub use parse::{parse, parse_file, CounterData, ParseError};
pub use registry::CounterRegistry;

/// Start recording for this process: open today's counter file under the
/// default configuration, arm the rotation timer, and count the start in
/// `counter/main`.
///
/// Call once, early in `main`. Counters used before this are no-ops.
pub fn open(identity: Identity) {
    registry::DEFAULT.open(identity, Config::from_env());
}

/// [`open`] with an explicit configuration instead of `$TALLY_DIR` and the
/// platform default directory.
pub fn open_with(identity: Identity, config: Config) {
    registry::DEFAULT.open(identity, config);
}

/// Add 1 to the named counter on the process-wide registry.
///
/// For hot counters prefer a static [`Counter`], which caches its slot; this
/// resolves the name on every call.
pub fn inc(name: &str) {
    add(name, 1);
}

/// Add `n` to the named counter on the process-wide registry.
pub fn add(name: &str, n: u64) {
    if n == 0 {
        return;
    }
    if let Some(slot) = registry::DEFAULT.lookup(name) {
        slot.add(n);
    }
}
