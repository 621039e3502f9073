//! Program identity: who is writing this counter file.
//!
//! Identity pins the filename prefix and the metadata block, which is how
//! concurrent processes end up sharing a file: only invocations of the same
//! program, version, toolchain, OS, and architecture agree on both.

use std::path::Path;

use chrono::{DateTime, Local};

/// The identity under which counters are recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Program name. Path components and a trailing `.exe` are stripped at
    /// init.
    pub program: String,
    /// Version of the program. Unstable versions collapse to `devel`.
    pub program_version: String,
    /// Version of the toolchain the program was built with. Unstable
    /// versions collapse to `devel`.
    pub toolchain_version: String,
    /// Operating system, defaulting to the running one.
    pub os: String,
    /// Architecture, defaulting to the running one.
    pub arch: String,
}

impl Identity {
    /// Identity for `program`, with OS and architecture taken from the
    /// running process.
    pub fn new(
        program: impl Into<String>,
        program_version: impl Into<String>,
        toolchain_version: impl Into<String>,
    ) -> Identity {
        Identity {
            program: program.into(),
            program_version: program_version.into(),
            toolchain_version: toolchain_version.into(),
            os: std::env::consts::OS.to_owned(),
            arch: std::env::consts::ARCH.to_owned(),
        }
    }

    /// Like [`Identity::new`], with the program name taken from the current
    /// executable. Returns `None` when the executable path is unavailable,
    /// in which case initialisation reports missing build info.
    pub fn from_current_exe(
        program_version: impl Into<String>,
        toolchain_version: impl Into<String>,
    ) -> Option<Identity> {
        let exe = std::env::current_exe().ok()?;
        let program = exe.file_name()?.to_str()?.to_owned();
        Some(Identity::new(program, program_version, toolchain_version))
    }

    /// The base program name: no directories, no `.exe`.
    pub(crate) fn program_base(&self) -> &str {
        let base = Path::new(&self.program)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(self.program.as_str());
        base.strip_suffix(".exe").unwrap_or(base)
    }

    /// Filename prefix: `prog[@progver]-toolchain-os-arch-`.
    pub(crate) fn name_prefix(&self) -> String {
        let prog_vers = collapse_devel(&self.program_version);
        let at_vers = if prog_vers.is_empty() {
            String::new()
        } else {
            format!("@{prog_vers}")
        };
        format!(
            "{}{}-{}-{}-{}-",
            self.program_base(),
            at_vers,
            collapse_devel(&self.toolchain_version),
            self.os,
            self.arch,
        )
    }

    /// The metadata block for a file spanning `[begin, end)`.
    pub(crate) fn metadata(&self, begin: DateTime<Local>, end: DateTime<Local>) -> String {
        format!(
            "TimeBegin: {}\nTimeEnd: {}\nProgram: {}\nVersion: {}\nToolchain: {}\nOS: {}\nArch: {}\n\n",
            begin.to_rfc3339(),
            end.to_rfc3339(),
            self.program_base(),
            collapse_devel(&self.program_version),
            collapse_devel(&self.toolchain_version),
            self.os,
            self.arch,
        )
    }
}

/// Construct an [`Identity`] from the calling crate's Cargo metadata.
///
/// Expands at the call site, so `CARGO_PKG_NAME` and `CARGO_PKG_VERSION`
/// describe the embedding program, not this library.
#[macro_export]
macro_rules! identity {
    () => {
        $crate::Identity::new(
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            option_env!("CARGO_PKG_RUST_VERSION").unwrap_or("devel"),
        )
    };
}

/// Unstable version strings all count together: anything containing `devel`
/// or a `-` (pre-release tags, VCS suffixes) becomes plain `devel`.
pub(crate) fn collapse_devel(version: &str) -> &str {
    if version.contains("devel") || version.contains('-') {
        "devel"
    } else {
        version
    }
}
