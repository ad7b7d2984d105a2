#![cfg_attr(not(test), no_std)]
extern crate alloc;

// FAT access
pub mod cache;
pub mod device;
pub mod table;
pub mod types;

// Allocation and the journal
pub mod allocator;
pub mod journal;
pub mod record;
pub mod recovery;
pub mod segment;
mod txn;

pub mod config;
pub mod dirent;
pub mod error;
pub mod fs;

#[cfg(test)]
mod testutil;


pub use config::{FsConfig, VolumeLayout};
pub use device::BlockDevice;
pub use dirent::{EntryRef, EntryStore, RawDirEntry, XattrHeader};
pub use error::{FatError, FatResult};
pub use fs::{FileSystem, MountFlags, Transaction};
pub use journal::OwnerId;
pub use record::TxKind;
pub use recovery::RecoveryReport;
pub use types::{Chunk, Cluster, FatEntry, FatVariant, Segment};

#[macro_export]
macro_rules! le_u16 {
    ($buf:expr, $at:expr) => {
        u16::from_le_bytes([$buf[$at], $buf[$at + 1]])
    };
}

#[macro_export]
macro_rules! le_u32 {
    ($buf:expr, $at:expr) => {
        u32::from_le_bytes([$buf[$at], $buf[$at + 1], $buf[$at + 2], $buf[$at + 3]])
    };
}

#[macro_export]
macro_rules! le_u64 {
    ($buf:expr, $at:expr) => {
        u64::from_le_bytes([
            $buf[$at],
            $buf[$at + 1],
            $buf[$at + 2],
            $buf[$at + 3],
            $buf[$at + 4],
            $buf[$at + 5],
            $buf[$at + 6],
            $buf[$at + 7],
        ])
    };
}
