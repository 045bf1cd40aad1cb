//! 超级块：
//! - 记录设备总块数与 inode 数量；
//! - 持有空闲链表的表头，负责数据块的分配与回收。
//!
//! ## 空闲链表
//!
//! 空闲块自身串成一条单向链表，每个空闲块的前 4 字节存放下一个空闲块的编号，
//! 末尾以 [`FREE_LIST_END`] 结束。分配弹出表头，回收压入表头，都是 O(1)。

use log::{debug, info, warn};

use super::{DiskInode, read_i32, write_i32};
use crate::block_cache::BlockCacheManager;
use crate::error::{FsError, Result};
use crate::{DEFAULT_INODES, INODE_SIZE, INODES_PER_BLOCK, MAX_INODES};

/// 空闲链表的结束标记
const FREE_LIST_END: i32 = -1;

/// 块指针只有 16 位，设备最多能编号的块数
const MAX_BLOCKS: usize = i16::MAX as usize + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuperBlock {
    /// 设备总块数
    pub total_blocks: i32,
    /// inode 记录个数，目录容量与之相同
    pub inode_blocks: i32,
    /// 空闲链表表头
    free_list: i32,
}

impl SuperBlock {
    /// 读取 0 号块；内容与设备不符时按默认 inode 数重新格式化
    pub fn load(disk_blocks: usize, cache: &BlockCacheManager) -> Result<Self> {
        if disk_blocks > MAX_BLOCKS {
            return Err(FsError::InvalidGeometry {
                inodes: DEFAULT_INODES,
                total_blocks: disk_blocks,
            });
        }

        let mut super_block = cache.read(0, |block| Self {
            total_blocks: read_i32(block, 0),
            inode_blocks: read_i32(block, 4),
            free_list: read_i32(block, 8),
        });

        if super_block.is_valid(disk_blocks) {
            info!(
                "mounted: {} blocks, {} inodes, free list at {}",
                super_block.total_blocks, super_block.inode_blocks, super_block.free_list
            );
        } else {
            warn!("invalid super block {super_block:?}, formatting");
            super_block.total_blocks = disk_blocks as i32;
            super_block.format(DEFAULT_INODES, cache)?;
        }

        Ok(super_block)
    }

    fn is_valid(&self, disk_blocks: usize) -> bool {
        self.total_blocks as usize == disk_blocks
            && (1..=MAX_INODES as i32).contains(&self.inode_blocks)
            && Self::data_start_of(self.inode_blocks as usize) < disk_blocks
            && (2..self.total_blocks).contains(&self.free_list)
    }

    /// 重置全部 inode，把 inode 区域之后的所有块串进空闲链表
    pub fn format(&mut self, inodes: usize, cache: &BlockCacheManager) -> Result<()> {
        let total_blocks = self.total_blocks as usize;
        if !(1..=MAX_INODES).contains(&inodes) || Self::data_start_of(inodes) >= total_blocks {
            return Err(FsError::InvalidGeometry {
                inodes,
                total_blocks,
            });
        }

        self.inode_blocks = inodes as i32;
        let data_start = self.data_start();

        let unused = DiskInode::unused().to_bytes();
        for block_id in 1..data_start {
            cache.modify(block_id, |block| {
                for slot in block.chunks_exact_mut(INODE_SIZE) {
                    slot.copy_from_slice(&unused);
                }
            });
        }

        for block_id in data_start..total_blocks {
            let next = if block_id + 1 < total_blocks {
                (block_id + 1) as i32
            } else {
                FREE_LIST_END
            };
            cache.modify(block_id, |block| {
                block.fill(0);
                write_i32(block, 0, next);
            });
        }

        self.free_list = data_start as i32;
        self.sync(cache);
        info!("formatted: {total_blocks} blocks, {inodes} inodes, data from block {data_start}");

        Ok(())
    }

    /// 弹出空闲链表表头；链表为空说明设备已满
    pub fn alloc(&mut self, cache: &BlockCacheManager) -> Option<u16> {
        if self.free_list < 0 {
            return None;
        }

        let block_id = self.free_list as usize;
        self.free_list = cache.modify(block_id, |block| {
            let next = read_i32(block, 0);
            block.fill(0);
            next
        });
        debug!("alloc block {block_id}, next free {}", self.free_list);

        Some(block_id as u16)
    }

    /// 把块压回空闲链表表头。
    ///
    /// 不检查该块此前是否已分配，重复回收会破坏链表。
    pub fn dealloc(&mut self, block_id: i32, cache: &BlockCacheManager) -> bool {
        if !(0..self.total_blocks).contains(&block_id) {
            return false;
        }

        let head = self.free_list;
        cache.modify(block_id as usize, |block| {
            block.fill(0);
            write_i32(block, 0, head);
        });
        self.free_list = block_id;
        debug!("dealloc block {block_id}");

        true
    }

    pub fn sync(&self, cache: &BlockCacheManager) {
        cache.modify(0, |block| {
            block.fill(0);
            write_i32(block, 0, self.total_blocks);
            write_i32(block, 4, self.inode_blocks);
            write_i32(block, 8, self.free_list);
        });
    }

    /// 第一个数据块
    #[inline]
    pub fn data_start(&self) -> usize {
        Self::data_start_of(self.inode_blocks as usize)
    }

    #[inline]
    fn data_start_of(inodes: usize) -> usize {
        2 + inodes / INODES_PER_BLOCK
    }

    #[inline]
    pub fn inode_count(&self) -> usize {
        self.inode_blocks as usize
    }

    /// 沿空闲链表收集全部空闲块
    pub fn free_blocks(&self, cache: &BlockCacheManager) -> Vec<u16> {
        let mut blocks = Vec::new();
        let mut next = self.free_list;
        while (0..self.total_blocks).contains(&next) && blocks.len() < self.total_blocks as usize
        {
            blocks.push(next as u16);
            next = cache.read(next as usize, |block| read_i32(block, 0));
        }
        blocks
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use block_dev::RamDisk;
    use proptest::prelude::*;

    use super::*;
    use crate::BLOCK_SIZE;

    fn setup(blocks: usize) -> (Arc<RamDisk>, BlockCacheManager) {
        let disk = Arc::new(RamDisk::new(BLOCK_SIZE, blocks));
        let cache = BlockCacheManager::new(disk.clone());
        (disk, cache)
    }

    #[test]
    fn blank_device_is_formatted() {
        let (disk, cache) = setup(1000);
        let super_block = SuperBlock::load(1000, &cache).unwrap();

        assert_eq!(super_block.total_blocks, 1000);
        assert_eq!(super_block.inode_blocks, DEFAULT_INODES as i32);
        assert_eq!(super_block.free_list, 6);
        assert_eq!(super_block.free_blocks(&cache).len(), 1000 - 6);

        cache.sync_all();
        let raw = disk.snapshot();
        assert_eq!(read_i32(&raw, 0), 1000);
        assert_eq!(read_i32(&raw, 4), 64);
        assert_eq!(read_i32(&raw, 8), 6);
        // 最后一块指向结束标记
        assert_eq!(read_i32(&raw, 999 * BLOCK_SIZE), FREE_LIST_END);
    }

    #[test]
    fn size_mismatch_forces_format() {
        let (_disk, cache) = setup(200);
        let mut super_block = SuperBlock::load(200, &cache).unwrap();
        super_block.format(32, &cache).unwrap();
        cache.sync_all();

        assert_eq!(SuperBlock::load(200, &cache).unwrap().inode_blocks, 32);

        // 超级块记录的总块数与设备不符
        cache.modify(0, |block| write_i32(block, 0, 300));
        assert_eq!(
            SuperBlock::load(200, &cache).unwrap().inode_blocks,
            DEFAULT_INODES as i32
        );
    }

    #[test]
    fn alloc_is_lifo() {
        let (_disk, cache) = setup(100);
        let mut super_block = SuperBlock::load(100, &cache).unwrap();

        let a = super_block.alloc(&cache).unwrap();
        let b = super_block.alloc(&cache).unwrap();
        assert_eq!((a, b), (6, 7));

        assert!(super_block.dealloc(a as i32, &cache));
        assert_eq!(super_block.alloc(&cache), Some(a));
        assert!(!super_block.dealloc(-1, &cache));
        assert!(!super_block.dealloc(100, &cache));
    }

    #[test]
    fn exhausted_list_forces_format() {
        let (_disk, cache) = setup(10);
        let mut super_block = SuperBlock::load(10, &cache).unwrap();
        super_block.format(16, &cache).unwrap();

        let blocks: Vec<_> = std::iter::from_fn(|| super_block.alloc(&cache)).collect();
        assert_eq!(blocks, (3..10).collect::<Vec<_>>());
        assert_eq!(super_block.alloc(&cache), None);

        // 表头为结束标记，小于 2，视为失效
        super_block.sync(&cache);
        let reloaded = SuperBlock::load(10, &cache).unwrap();
        assert_eq!(reloaded.inode_blocks, DEFAULT_INODES as i32);
        assert_eq!(reloaded.free_list, 6);
        assert_eq!(reloaded.free_blocks(&cache).len(), 4);
    }

    #[test]
    fn corrupted_inode_count_forces_format() {
        let (_disk, cache) = setup(100);
        let mut super_block = SuperBlock::load(100, &cache).unwrap();
        super_block.format(32, &cache).unwrap();

        // inode 区域越过设备末尾
        cache.modify(0, |block| write_i32(block, 4, 16 * 100));
        assert_eq!(
            SuperBlock::load(100, &cache).unwrap().inode_blocks,
            DEFAULT_INODES as i32
        );

        // 超过 16 位编号与目录文件的容量
        super_block.format(32, &cache).unwrap();
        cache.modify(0, |block| write_i32(block, 4, 70_000));
        assert_eq!(
            SuperBlock::load(100, &cache).unwrap().inode_blocks,
            DEFAULT_INODES as i32
        );

        cache.modify(0, |block| write_i32(block, 4, 0));
        assert_eq!(
            SuperBlock::load(100, &cache).unwrap().inode_blocks,
            DEFAULT_INODES as i32
        );
    }

    #[test]
    fn allocated_block_is_zeroed() {
        let (_disk, cache) = setup(20);
        let mut super_block = SuperBlock::load(20, &cache).unwrap();

        let block_id = super_block.alloc(&cache).unwrap();
        assert!(cache.read(block_id as usize, |block| block.iter().all(|&b| b == 0)));
    }

    #[test]
    fn rejects_inode_table_larger_than_device() {
        let (_disk, cache) = setup(8);
        let mut super_block = SuperBlock::load(8, &cache).unwrap();
        assert_eq!(
            super_block.format(16 * 7, &cache),
            Err(FsError::InvalidGeometry {
                inodes: 112,
                total_blocks: 8
            })
        );
    }

    #[test]
    fn rejects_directory_larger_than_a_file() {
        let (_disk, cache) = setup(4000);
        let mut super_block = SuperBlock::load(4000, &cache).unwrap();
        assert_eq!(MAX_INODES, 2136);
        assert_eq!(
            super_block.format(2400, &cache),
            Err(FsError::InvalidGeometry {
                inodes: 2400,
                total_blocks: 4000
            })
        );
        assert_eq!(super_block.inode_count(), DEFAULT_INODES);
        super_block.format(MAX_INODES, &cache).unwrap();
    }

    proptest! {
        #[test]
        fn free_list_conservation(ops in prop::collection::vec(any::<bool>(), 1..200)) {
            let (_disk, cache) = setup(64);
            let mut super_block = SuperBlock::load(64, &cache).unwrap();
            super_block.format(16, &cache).unwrap();
            let mut allocated = Vec::new();

            for alloc in ops {
                if alloc {
                    if let Some(block_id) = super_block.alloc(&cache) {
                        allocated.push(block_id);
                    }
                } else if let Some(block_id) = allocated.pop() {
                    prop_assert!(super_block.dealloc(block_id as i32, &cache));
                }
            }

            let free = super_block.free_blocks(&cache);
            let mut all: BTreeSet<u16> = free.iter().copied().collect();
            prop_assert_eq!(all.len(), free.len());
            for &block_id in &allocated {
                prop_assert!(all.insert(block_id));
            }
            let expected: BTreeSet<u16> = (super_block.data_start() as u16..64).collect();
            prop_assert_eq!(all, expected);
        }
    }
}
