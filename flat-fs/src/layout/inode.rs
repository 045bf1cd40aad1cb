//! 磁盘 inode 与间接块
//!
//! 每个 inode 固定 32 字节，每块存放 16 个，从 1 号块开始：
//!
//! ```text
//! length(i32) | count(i16) | flag(i16) | direct[11](i16) | indirect(i16)
//! ```
//!
//! - 直接索引必须从 0 号槽开始连续填充，不能留空；
//! - 11 个直接索引全部填满后才能挂上间接块；
//! - 间接块把整块视为 256 个 i16 编号，每个编号指向一个数据块。

use super::{decode_ptr, encode_ptr, read_i16, read_i32, write_i16, write_i32};
use crate::block_cache::BlockCacheManager;
use crate::error::{FsError, Result};
use crate::{BLOCK_SIZE, DIRECT_COUNT, DataBlock, INDIRECT_COUNT, INODE_SIZE, INODES_PER_BLOCK};

/// inode 的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(i16)]
pub enum InodeFlag {
    #[default]
    Unused = 0,
    Used = 1,
    OpenRead = 2,
    /// 以写方式打开过，句柄已全部释放
    WriteQueuedUnused = 3,
    OpenReadWrite = 4,
    OpenAppend = 5,
}

impl TryFrom<i16> for InodeFlag {
    type Error = i16;

    fn try_from(raw: i16) -> core::result::Result<Self, Self::Error> {
        Ok(match raw {
            0 => Self::Unused,
            1 => Self::Used,
            2 => Self::OpenRead,
            3 => Self::WriteQueuedUnused,
            4 => Self::OpenReadWrite,
            5 => Self::OpenAppend,
            _ => return Err(raw),
        })
    }
}

impl InodeFlag {
    /// 释放一个句柄后的状态：读类降为未使用，写类降为待写未使用
    pub fn released(self) -> Self {
        match self {
            Self::Used | Self::OpenRead => Self::Unused,
            Self::OpenReadWrite | Self::OpenAppend => Self::WriteQueuedUnused,
            idle => idle,
        }
    }
}

/// [`DiskInode::register_block`] 拒绝登记的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterError {
    /// 目标槽位已有数据块
    AlreadyAssigned,
    /// 前面的直接索引还空着
    OutOfOrder,
    /// 需要先挂上间接块
    NeedsIndirect,
    /// 超出单级间接索引的寻址范围
    OutOfRange,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskInode {
    /// 文件大小（字节）
    pub length: u32,
    /// 引用此 inode 的打开文件表项个数
    pub count: u16,
    pub flag: InodeFlag,
    /// 直接索引
    direct: [Option<u16>; DIRECT_COUNT],
    /// 指向一个间接块
    indirect: Option<u16>,
}

/// 从 inode 上摘下的间接块
pub struct ReleasedIndirect {
    pub block_id: u16,
    raw: DataBlock,
}

impl ReleasedIndirect {
    /// 间接块登记过的全部数据块
    pub fn data_blocks(&self) -> impl Iterator<Item = u16> + '_ {
        self.raw
            .chunks_exact(2)
            .filter_map(|slot| decode_ptr(read_i16(slot, 0)))
    }
}

impl Default for DiskInode {
    fn default() -> Self {
        Self::new()
    }
}

impl DiskInode {
    /// 新建文件时的 inode
    pub fn new() -> Self {
        Self {
            length: 0,
            count: 0,
            flag: InodeFlag::Used,
            direct: [None; DIRECT_COUNT],
            indirect: None,
        }
    }

    /// 格式化后的 inode
    pub fn unused() -> Self {
        Self {
            flag: InodeFlag::Unused,
            ..Self::new()
        }
    }

    /// 通过编号获取 inode 在磁盘上的位置：**块ID**以及**块内偏移**
    #[inline]
    pub fn position(i_number: u16) -> (usize, usize) {
        let i_number = i_number as usize;
        (
            1 + i_number / INODES_PER_BLOCK,
            i_number % INODES_PER_BLOCK * INODE_SIZE,
        )
    }

    pub fn load(i_number: u16, cache: &BlockCacheManager) -> Result<Self> {
        let (block_id, offset) = Self::position(i_number);
        cache.read(block_id, |block| {
            Self::from_bytes(&block[offset..offset + INODE_SIZE])
                .map_err(|flag| FsError::Corrupted { i_number, flag })
        })
    }

    /// 只覆写自己的 32 字节，同块的其它 inode 保持不变
    pub fn store(&self, i_number: u16, cache: &BlockCacheManager) {
        debug_assert!(self.is_well_formed(), "inode {i_number}: {self:?}");
        let (block_id, offset) = Self::position(i_number);
        let bytes = self.to_bytes();
        cache.modify(block_id, |block| {
            block[offset..offset + INODE_SIZE].copy_from_slice(&bytes)
        });
    }

    /// 只写回长度与块索引，句柄计数与状态以磁盘为准
    pub fn store_data(&self, i_number: u16, cache: &BlockCacheManager) {
        debug_assert!(self.is_well_formed(), "inode {i_number}: {self:?}");
        let (block_id, offset) = Self::position(i_number);
        let bytes = self.to_bytes();
        cache.modify(block_id, |block| {
            let record = &mut block[offset..offset + INODE_SIZE];
            record[..4].copy_from_slice(&bytes[..4]);
            record[8..].copy_from_slice(&bytes[8..]);
        });
    }

    /// 只写回句柄计数与状态
    pub fn store_status(&self, i_number: u16, cache: &BlockCacheManager) {
        let (block_id, offset) = Self::position(i_number);
        let bytes = self.to_bytes();
        cache.modify(block_id, |block| {
            block[offset + 4..offset + 8].copy_from_slice(&bytes[4..8])
        });
    }

    pub fn from_bytes(raw: &[u8]) -> core::result::Result<Self, i16> {
        let mut direct = [None; DIRECT_COUNT];
        for (i, ptr) in direct.iter_mut().enumerate() {
            *ptr = decode_ptr(read_i16(raw, 8 + 2 * i));
        }

        Ok(Self {
            length: read_i32(raw, 0).max(0) as u32,
            count: read_i16(raw, 4).max(0) as u16,
            flag: InodeFlag::try_from(read_i16(raw, 6))?,
            direct,
            indirect: decode_ptr(read_i16(raw, 8 + 2 * DIRECT_COUNT)),
        })
    }

    pub fn to_bytes(&self) -> [u8; INODE_SIZE] {
        let mut raw = [0; INODE_SIZE];
        write_i32(&mut raw, 0, self.length as i32);
        write_i16(&mut raw, 4, self.count as i16);
        write_i16(&mut raw, 6, self.flag as i16);
        for (i, &ptr) in self.direct.iter().enumerate() {
            write_i16(&mut raw, 8 + 2 * i, encode_ptr(ptr));
        }
        write_i16(&mut raw, 8 + 2 * DIRECT_COUNT, encode_ptr(self.indirect));
        raw
    }

    /// 文件内字节偏移所在的数据块
    pub fn block_id(&self, offset: usize, cache: &BlockCacheManager) -> Option<u16> {
        let index = offset / BLOCK_SIZE;
        if index < DIRECT_COUNT {
            return self.direct[index];
        }

        let slot = index - DIRECT_COUNT;
        if slot >= INDIRECT_COUNT {
            return None;
        }
        let indirect = self.indirect?;
        cache.read(indirect as usize, |block| {
            decode_ptr(read_i16(block, 2 * slot))
        })
    }

    /// 挂上间接块，并把其中的编号全部置为未分配
    pub fn register_indirect(&mut self, block_id: u16, cache: &BlockCacheManager) -> bool {
        if self.indirect.is_some() || self.direct.iter().any(Option::is_none) {
            return false;
        }

        cache.modify(block_id as usize, |block| {
            for slot in block.chunks_exact_mut(2) {
                write_i16(slot, 0, -1);
            }
        });
        self.indirect = Some(block_id);

        true
    }

    /// 把数据块登记到字节偏移所在的槽位
    pub fn register_block(
        &mut self,
        offset: usize,
        block_id: u16,
        cache: &BlockCacheManager,
    ) -> core::result::Result<(), RegisterError> {
        let index = offset / BLOCK_SIZE;

        if index < DIRECT_COUNT {
            if index > 0 && self.direct[index - 1].is_none() {
                return Err(RegisterError::OutOfOrder);
            }
            if self.direct[index].is_some() {
                return Err(RegisterError::AlreadyAssigned);
            }
            self.direct[index] = Some(block_id);
            return Ok(());
        }

        let slot = index - DIRECT_COUNT;
        if slot >= INDIRECT_COUNT {
            return Err(RegisterError::OutOfRange);
        }
        let indirect = self.indirect.ok_or(RegisterError::NeedsIndirect)?;

        cache.modify(indirect as usize, |block| {
            if decode_ptr(read_i16(block, 2 * slot)).is_some() {
                return Err(RegisterError::AlreadyAssigned);
            }
            write_i16(block, 2 * slot, block_id as i16);
            Ok(())
        })
    }

    /// 摘下间接块并交出其内容，由调用者回收其中登记的数据块
    pub fn release_indirect(&mut self, cache: &BlockCacheManager) -> Option<ReleasedIndirect> {
        let block_id = self.indirect.take()?;
        let raw = cache.read(block_id as usize, |block| *block);
        Some(ReleasedIndirect { block_id, raw })
    }

    /// 清空直接索引并交出其中的数据块
    pub fn release_direct(&mut self) -> Vec<u16> {
        self.direct.iter_mut().filter_map(Option::take).collect()
    }

    /// inode 占用的全部块：数据块与间接块
    pub fn blocks(&self, cache: &BlockCacheManager) -> Vec<u16> {
        let mut blocks: Vec<u16> = self.direct.iter().flatten().copied().collect();
        if let Some(indirect) = self.indirect {
            blocks.push(indirect);
            cache.read(indirect as usize, |block| {
                blocks.extend(
                    block
                        .chunks_exact(2)
                        .filter_map(|slot| decode_ptr(read_i16(slot, 0))),
                )
            });
        }
        blocks
    }

    /// 直接索引连续无空洞，且仅在直接索引填满后才有间接块
    pub fn is_well_formed(&self) -> bool {
        let filled = self.direct.iter().take_while(|ptr| ptr.is_some()).count();
        self.direct[filled..].iter().all(Option::is_none)
            && (self.indirect.is_none() || filled == DIRECT_COUNT)
    }
}
