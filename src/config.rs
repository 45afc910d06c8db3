/// Per-run compiler policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Check buffer capacity before every emitted operation.
    ///
    /// When off, pushes past the value stack's capacity go unnoticed and the
    /// instruction buffer is only checked once the epilogue is appended.
    pub hardened: bool,
}

impl Config {
    pub const fn hardened() -> Self {
        Self { hardened: true }
    }

    pub const fn unguarded() -> Self {
        Self { hardened: false }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hardened: cfg!(feature = "hardened"),
        }
    }
}
