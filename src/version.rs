//! Version strings for the clirelay binary.
//!
//! Release builds may set `CLIRELAY_GIT_REV` at compile time; the revision
//! then shows up in `--version` and in the health endpoint.

use std::sync::LazyLock;

/// The package version from Cargo.toml.
pub const PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Git revision baked in at build time (empty string if not set).
pub const GIT_REV: &str = match option_env!("CLIRELAY_GIT_REV") {
    Some(rev) => rev,
    None => "",
};

static FULL_VERSION: LazyLock<String> = LazyLock::new(|| {
    if GIT_REV.is_empty() {
        PKG_VERSION.to_string()
    } else {
        format!("{} ({})", PKG_VERSION, GIT_REV)
    }
});

static LONG_VERSION: LazyLock<String> = LazyLock::new(|| {
    let mut version = full_version();
    if !GIT_REV.is_empty() {
        version.push_str("\nBuilt from git revision");
    }
    version
});

/// `"X.Y.Z (abcdef0)"` with a revision, `"X.Y.Z"` without.
pub fn full_version() -> String {
    FULL_VERSION.clone()
}

/// Short version for clap's `version` attribute.
pub fn clap_version() -> &'static str {
    PKG_VERSION
}

/// Long version for `--version`, including the git revision if known.
pub fn long_version() -> &'static str {
    LONG_VERSION.as_str()
}
