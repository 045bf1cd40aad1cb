/* flat-fs 的整体架构，自上而下 */

// 文件系统层：open/read/write/seek/close/delete/format/sync
mod fs;

// 打开文件表层：管理打开文件句柄与 inode 状态迁移
mod file_table;

// 目录层：inode 编号与文件名之间的映射
mod directory;

// 磁盘数据结构层：超级块、空闲链表、inode 与间接块
mod layout;

// 块缓存层：内存上的磁盘块数据缓存
mod block_cache;

mod error;

pub use block_dev::BlockDevice;

pub use self::{
    error::{FsError, Result},
    file_table::{Access, FileHandle, FileTableEntry, OpenMode},
    fs::{FileSystem, Whence},
};

pub const BLOCK_SIZE: usize = 512;
/// 磁盘 inode 固定占 32 字节
pub const INODE_SIZE: usize = 32;
pub const INODES_PER_BLOCK: usize = BLOCK_SIZE / INODE_SIZE;
/// 直接索引个数
pub const DIRECT_COUNT: usize = 11;
/// 间接块可容纳的块编号数量，每个编号占 2 字节
pub const INDIRECT_COUNT: usize = BLOCK_SIZE / 2;
pub const MAX_FILE_SIZE: usize = (DIRECT_COUNT + INDIRECT_COUNT) * BLOCK_SIZE;
/// 文件名最长字符数
pub const NAME_MAX_LEN: usize = 30;
/// 超级块失效时重新格式化所用的 inode 数量
pub const DEFAULT_INODES: usize = 64;
/// 目录以单个文件存放，每个 inode 在其中占 4 字节长度与 60 字节文件名
pub const MAX_INODES: usize = MAX_FILE_SIZE / (4 + 2 * NAME_MAX_LEN);

type DataBlock = [u8; BLOCK_SIZE];
