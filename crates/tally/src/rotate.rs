//! Rotation: binding the registry to a day-stamped file, and moving to a
//! fresh one when the date in the name changes.
//!
//! The active file is `<prefix>YYYY-MM-DD.v1.count` in the local telemetry
//! directory. Rotation is single-flight under the registry mutex; the timer
//! re-arms itself after each pass.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Days, Local};
use rand::Rng;
use tracing::debug;

use crate::config::{dir_nonempty, Config};
use crate::error::CounterError;
use crate::layout::{FILE_VERSION, MAX_META_LEN};
use crate::mapped::MappedFile;
use crate::registry::{CounterRegistry, RegistryState};

impl CounterRegistry {
    /// Rotate if the computed filename differs from the active one, then arm
    /// a timer for the next check at the file's expiry.
    pub fn rotate(&'static self) {
        if let Some(expire) = self.rotate_at(Local::now()) {
            let delay = (expire - Local::now()).to_std().unwrap_or(Duration::ZERO);
            let spawned = thread::Builder::new()
                .name("tally-rotate".into())
                .spawn(move || {
                    thread::sleep(delay);
                    self.rotate();
                });
            if let Err(err) = spawned {
                debug!(%err, "failed to arm rotation timer");
            }
        }
    }

    /// One rotation pass at time `now`. Returns the expiry to re-check at,
    /// or `None` when initialisation failed and rotation is permanently off.
    ///
    /// Opening the new file happens before the old mapping is released, so a
    /// failed rotation leaves the previous file serving until the next tick,
    /// with the failure counted in `counter/rotate-error`.
    pub(crate) fn rotate_at(&'static self, now: DateTime<Local>) -> Option<DateTime<Local>> {
        let mut invalidate = false;
        let expire;
        {
            let mut state = self.lock_state();
            let (name, exp, meta) = filename(&mut state, now)?;
            expire = exp;

            let current = self.current_mapping();
            if let Some(cur) = &current {
                if cur.path() == name.as_path() {
                    return Some(expire);
                }
            }

            match MappedFile::open(&name, &meta, None) {
                Ok(m) => {
                    debug!(file = %name.display(), "rotated to new counter file");
                    if let Some(prev) = &current {
                        prev.close_file();
                    }
                    self.set_current(Some(m));
                    invalidate = true;
                }
                Err(err) => {
                    debug!(%err, file = %name.display(), "rotate failed");
                    if let Some(prev) = &current {
                        // Best-effort self-diagnostic on the surviving
                        // mapping.
                        if let Ok((m, off)) = MappedFile::new_counter(prev, "counter/rotate-error") {
                            m.value_at(off).fetch_add(1, Ordering::Relaxed);
                            if !Arc::ptr_eq(&m, prev) {
                                self.set_current(Some(m));
                                invalidate = true;
                            }
                        }
                    }
                }
            }
        }
        if invalidate {
            self.invalidate_counters();
        }
        Some(expire)
    }
}

/// Compute the active filename for `now`, its expiry, and the metadata block
/// for a file opened now. Initialises the registry state on first use;
/// `None` means initialisation failed (the error is recorded in the state).
fn filename(
    state: &mut RegistryState,
    now: DateTime<Local>,
) -> Option<(std::path::PathBuf, DateTime<Local>, String)> {
    if state.local_dir.is_none() && state.err.is_none() {
        init(state);
        if let Some(err) = &state.err {
            debug!(%err, "counter file init failed");
        }
    }
    if state.err.is_some() {
        return None;
    }

    let begin = midnight(now);
    let validity = file_validity(state.config.as_ref()?);
    let end = begin + Days::new(validity);

    let meta = state.identity.as_ref()?.metadata(begin, end);
    if meta.len() > MAX_META_LEN {
        // Impossible for identities this crate builds, but fatal if it
        // happens: no usable header can be written.
        state.err = Some(CounterError::MetadataTooLong(meta.len()));
        return None;
    }

    let name = state.local_dir.as_ref()?.join(format!(
        "{}{}.{}.count",
        state.prefix.as_ref()?,
        now.format("%Y-%m-%d"),
        FILE_VERSION,
    ));
    Some((name, end, meta))
}

/// First-use initialisation: identity, mode, and the local directory.
fn init(state: &mut RegistryState) {
    let Some(identity) = state.identity.as_ref() else {
        state.err = Some(CounterError::MissingBuildInfo);
        return;
    };
    if identity.program_base().is_empty() {
        state.err = Some(CounterError::MissingBuildInfo);
        return;
    }

    let config = state.config.get_or_insert_with(Config::from_env);
    if config.mode() == crate::config::Mode::Off {
        state.err = Some(CounterError::Disabled);
        return;
    }

    let local_dir = config.local_dir();
    if let Err(err) = std::fs::create_dir_all(&local_dir) {
        state.err = Some(CounterError::Io(err));
        return;
    }

    state.prefix = Some(identity.name_prefix());
    state.local_dir = Some(local_dir);
}

/// How many days the file named now stays valid.
///
/// Established clients rotate every 7 days. A new client (nothing in the
/// upload or local directory; unreadable counts as nothing) gets a
/// randomised 8 to 14 days so first uploads do not arrive in a synchronised
/// burst.
fn file_validity(config: &Config) -> u64 {
    if dir_nonempty(&config.upload_dir()) || dir_nonempty(&config.local_dir()) {
        return 7;
    }
    8 + rand::thread_rng().gen_range(0..7)
}

/// Midnight at the start of `now`'s day. When a timezone transition removes
/// midnight, the earliest valid instant of the day is used.
fn midnight(now: DateTime<Local>) -> DateTime<Local> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .and_then(|naive| naive.and_local_timezone(Local).earliest())
        .unwrap_or(now)
}
