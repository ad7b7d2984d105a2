use crate::error::{FatError, FatResult};

/// Byte-addressed backing store for the FAT area and the log area.
pub trait BlockDevice: Send + Sync {
    fn read_at(&self, pos: u64, buf: &mut [u8]) -> FatResult<usize>;
    fn write_at(&self, pos: u64, buf: &[u8]) -> FatResult<usize>;
    fn size(&self) -> u64;
    /// Durably persist every previously written byte.
    fn flush(&self) -> FatResult<()>;
}

/// Reads exactly `buf.len()` bytes at `pos`; a short read is an I/O error.
pub fn read_exact_at(dev: &dyn BlockDevice, pos: u64, buf: &mut [u8]) -> FatResult<()> {
    if pos + buf.len() as u64 > dev.size() {
        return Err(FatError::InvalidParam);
    }
    match dev.read_at(pos, buf)? {
        n if n == buf.len() => Ok(()),
        _ => Err(FatError::Io),
    }
}

/// Writes all of `buf` at `pos`; a short write is an I/O error.
pub fn write_all_at(dev: &dyn BlockDevice, pos: u64, buf: &[u8]) -> FatResult<()> {
    if pos + buf.len() as u64 > dev.size() {
        return Err(FatError::InvalidParam);
    }
    match dev.write_at(pos, buf)? {
        n if n == buf.len() => Ok(()),
        _ => Err(FatError::Io),
    }
}
