//! Error taxonomy shared by the cache, allocator, journal and recovery.

/// Errors surfaced by the metadata engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, onlyerror::Error)]
pub enum FatError {
    /// Device read, write or flush failed.
    #[error("device I/O failure")]
    Io,
    /// A FAT entry or log record holds a value that cannot be valid.
    #[error("on-disk metadata is corrupt")]
    Corrupt,
    /// A chain hit its tail before the requested number of hops.
    #[error("cluster chain is shorter than expected")]
    ChainTooShort,
    /// Not enough free clusters for the request.
    #[error("no free clusters left")]
    NoSpace,
    /// Out-of-range cluster, malformed record or misuse of a transaction.
    #[error("invalid parameter")]
    InvalidParam,
    /// The volume was flipped to read-only after a corruption.
    #[error("volume is read-only")]
    ReadOnly,
    /// The log lock was not released within the configured spin budget.
    #[error("timed out waiting for the log lock")]
    Busy,
    /// Configuration or layout could not be parsed.
    #[error("malformed configuration")]
    Config,
}

impl FatError {
    /// Whether this error means the on-disk structures cannot be trusted.
    pub fn is_corruption(&self) -> bool {
        matches!(self, FatError::Corrupt | FatError::ChainTooShort)
    }
}

pub type FatResult<T> = Result<T, FatError>;
