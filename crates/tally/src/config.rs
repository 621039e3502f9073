//! Telemetry directories and mode.

use std::fs;
use std::path::{Path, PathBuf};

/// Recording mode, from the `TALLY_MODE` environment variable or the `mode`
/// file in the local directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Record and upload.
    On,
    /// Record, but never upload.
    Local,
    /// Record nothing. Unrecognised mode strings also land here.
    Off,
}

impl Mode {
    fn parse(s: &str) -> Mode {
        match s.trim() {
            "on" => Mode::On,
            "local" => Mode::Local,
            _ => Mode::Off,
        }
    }
}

/// Where counter files live.
///
/// The telemetry root holds a `local` directory of `.count` files (the only
/// directory the counter core writes), an `upload` directory owned by the
/// uploader, and a `debug` directory for logs.
#[derive(Debug, Clone)]
pub struct Config {
    root: PathBuf,
}

impl Config {
    /// Config rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Config {
        Config { root: root.into() }
    }

    /// The default config: `$TALLY_DIR` if set, else `tally` under the
    /// platform config directory, else `.tally` in the working directory.
    pub fn from_env() -> Config {
        if let Some(dir) = std::env::var_os("TALLY_DIR") {
            return Config::new(dir);
        }
        match dirs::config_dir() {
            Some(base) => Config::new(base.join("tally")),
            None => Config::new(".tally"),
        }
    }

    pub fn local_dir(&self) -> PathBuf {
        self.root.join("local")
    }

    pub fn upload_dir(&self) -> PathBuf {
        self.root.join("upload")
    }

    pub fn debug_dir(&self) -> PathBuf {
        self.root.join("debug")
    }

    /// The effective mode. `TALLY_MODE` wins over the mode file; a missing
    /// mode file means `on`.
    pub fn mode(&self) -> Mode {
        if let Ok(value) = std::env::var("TALLY_MODE") {
            return Mode::parse(&value);
        }
        match fs::read_to_string(self.mode_file()) {
            Ok(contents) => Mode::parse(&contents),
            Err(_) => Mode::On,
        }
    }

    pub(crate) fn mode_file(&self) -> PathBuf {
        self.local_dir().join("mode")
    }
}

/// Whether a directory has any entries. Unreadable counts as empty.
pub(crate) fn dir_nonempty(dir: &Path) -> bool {
    match fs::read_dir(dir) {
        Ok(mut entries) => entries.next().is_some(),
        Err(_) => false,
    }
}
