use thiserror::Error;

pub type Result<T> = core::result::Result<T, FsError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FsError {
    #[error("no such file: {0:?}")]
    NotFound(String),

    #[error("invalid file name: {0:?}")]
    InvalidName(String),

    #[error("invalid open mode: {0:?}")]
    InvalidMode(String),

    #[error("invalid whence: {0}")]
    InvalidWhence(i32),

    #[error("directory is full")]
    DirectoryFull,

    #[error("no free block left on device")]
    NoSpace,

    #[error("file exceeds the maximum addressable size")]
    FileTooLarge,

    #[error("handle is not open for reading")]
    NotReadable,

    #[error("handle is not open for writing")]
    NotWritable,

    #[error("handle is not in the file table")]
    BadHandle,

    #[error("inode {0} is referenced by other handles")]
    FileBusy(u16),

    #[error("file table is not empty, refusing to format")]
    FormatBusy,

    #[error("{inodes} inodes do not fit on a device of {total_blocks} blocks")]
    InvalidGeometry { inodes: usize, total_blocks: usize },

    #[error("inode {i_number} has unknown flag {flag}")]
    Corrupted { i_number: u16, flag: i16 },

    #[error("block {0} is referenced more than once")]
    CrossLinked(u16),

    #[error("block {0} lies outside the data region")]
    StrayBlock(u16),

    #[error("block {0} is neither free nor owned by a file")]
    LostBlock(u16),

    #[error("filesystem panic on write: inode {i_number}, offset {offset}")]
    Panic { i_number: u16, offset: usize },
}
