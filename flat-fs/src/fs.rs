//! # 文件系统层
//!
//! [`FileSystem`] 独占持有块缓存、超级块、目录与打开文件表，
//! 对外提供 open/read/write/seek/close/delete/format/sync 等操作。
//!
//! 所有操作都只需 `&self`，可以在多个线程间共享同一个文件系统；
//! 但同一个句柄上的读写互斥，不同写句柄之间对同一文件的修改不做协调。

use std::sync::Arc;

use block_dev::BlockDevice;
use log::{error, info, warn};
use spin::{Mutex, MutexGuard};

use crate::block_cache::BlockCacheManager;
use crate::directory::{Directory, ROOT_NAME};
use crate::error::{FsError, Result};
use crate::file_table::{EntryState, FileHandle, FileTable, OpenMode};
use crate::layout::{DiskInode, InodeFlag, RegisterError, SuperBlock};
use crate::{BLOCK_SIZE, MAX_FILE_SIZE};

/// `seek` 的基准位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Start = 0,
    Current = 1,
    End = 2,
}

impl TryFrom<i32> for Whence {
    type Error = FsError;

    fn try_from(raw: i32) -> Result<Self> {
        match raw {
            0 => Ok(Self::Start),
            1 => Ok(Self::Current),
            2 => Ok(Self::End),
            _ => Err(FsError::InvalidWhence(raw)),
        }
    }
}

pub struct FileSystem {
    cache: BlockCacheManager,
    super_block: Mutex<SuperBlock>,
    directory: Mutex<Directory>,
    file_table: FileTable,
}

impl FileSystem {
    /// 挂载块设备：超级块失效时先格式化，再从 0 号 inode 中恢复目录
    pub fn mount(device: Arc<dyn BlockDevice>, disk_blocks: usize) -> Result<Self> {
        let cache = BlockCacheManager::new(device);
        let super_block = SuperBlock::load(disk_blocks, &cache)?;

        let mut directory = Directory::new(super_block.inode_count());
        let root = DiskInode::load(0, &cache)?;
        let mut bytes = vec![0; Directory::byte_size(directory.capacity())];
        let size = read_at(&root, 0, &mut bytes, &cache);
        directory.load_bytes(&bytes[..size]);
        cache.sync_all();

        info!(
            "{} files on a device of {disk_blocks} blocks",
            directory.entries().count() - 1
        );

        Ok(Self {
            cache,
            super_block: Mutex::new(super_block),
            directory: Mutex::new(directory),
            file_table: FileTable::new(),
        })
    }

    /// 打开文件。以 `"w"` 打开时清空文件，其它句柄仍在使用该文件时拒绝
    pub fn open(&self, name: &str, mode: OpenMode) -> Result<FileHandle> {
        if name.is_empty() {
            return Err(FsError::InvalidName(name.to_owned()));
        }

        let entry = self
            .file_table
            .allocate(name, mode, &self.directory, &self.cache)?;
        if mode == OpenMode::Write {
            if let Err(err) = self.truncate(&entry) {
                self.file_table.free(&entry, &self.cache);
                self.cache.sync_all();
                return Err(err);
            }
        }
        self.cache.sync_all();

        Ok(entry)
    }

    /// 共享句柄，每次共享都要对应一次 `close`
    pub fn dup(&self, entry: &FileHandle) -> Result<FileHandle> {
        let mut state = entry.state();
        if state.count == 0 {
            return Err(FsError::BadHandle);
        }
        state.count += 1;

        Ok(entry.clone())
    }

    pub fn close(&self, entry: &FileHandle) -> Result<()> {
        let mut state = entry.state();
        if state.count == 0 {
            warn!("inode {}: handle closed twice", entry.i_number());
            return Err(FsError::BadHandle);
        }
        state.count -= 1;
        if state.count > 0 {
            return Ok(());
        }
        drop(state);

        if !self.file_table.free(entry, &self.cache) {
            warn!("inode {}: handle not in the file table", entry.i_number());
            return Err(FsError::BadHandle);
        }
        self.cache.sync_all();

        Ok(())
    }

    /// 从读写位置开始读，返回读到的字节数；到达文件末尾时返回 0
    pub fn read(&self, entry: &FileHandle, buf: &mut [u8]) -> Result<usize> {
        if !entry.readable() {
            return Err(FsError::NotReadable);
        }

        let mut state = self.entry_state(entry)?;
        let size = read_at(&state.inode, state.seek_ptr, buf, &self.cache);
        state.seek_ptr += size;

        Ok(size)
    }

    /// 从读写位置开始写，按需分配数据块与间接块。
    ///
    /// 设备写满或文件达到上限时，返回已写入的字节数；一个字节都没写入时返回错误。
    pub fn write(&self, entry: &FileHandle, buf: &[u8]) -> Result<usize> {
        if !entry.writable() {
            return Err(FsError::NotWritable);
        }

        let mut state = self.entry_state(entry)?;
        let state = &mut *state;
        if entry.mode() == OpenMode::Append {
            state.seek_ptr = state.inode.length as usize;
        }

        let start = state.seek_ptr;
        let result = self.write_at(entry.i_number(), &mut state.inode, &mut state.seek_ptr, buf);
        state.inode.store_data(entry.i_number(), &self.cache);
        self.super_block.lock().sync(&self.cache);
        self.cache.sync_all();

        let written = state.seek_ptr - start;
        match result {
            Ok(()) => Ok(written),
            Err(FsError::NoSpace | FsError::FileTooLarge) if written > 0 => Ok(written),
            Err(err) => Err(err),
        }
    }

    /// 移动读写位置，结果总是落在 `[0, 文件大小]` 之内
    pub fn seek(&self, entry: &FileHandle, offset: i64, whence: Whence) -> Result<usize> {
        let mut state = self.entry_state(entry)?;
        let length = state.inode.length as i64;
        let base = match whence {
            Whence::Start => 0,
            Whence::Current => state.seek_ptr as i64,
            Whence::End => length,
        };
        state.seek_ptr = base.saturating_add(offset).clamp(0, length) as usize;

        Ok(state.seek_ptr)
    }

    pub fn fsize(&self, entry: &FileHandle) -> Result<usize> {
        Ok(self.entry_state(entry)?.inode.length as usize)
    }

    /// 删除文件：清空其数据块并归还目录槽位
    pub fn delete(&self, name: &str) -> Result<()> {
        if name == ROOT_NAME {
            return Err(FsError::InvalidName(name.to_owned()));
        }
        // 不存在的文件不能借 open 顺带创建
        if self.directory.lock().lookup(name).is_none() {
            return Err(FsError::NotFound(name.to_owned()));
        }

        let entry = self.open(name, OpenMode::Write)?;
        self.close(&entry)?;

        let i_number = entry.i_number();
        if !self.directory.lock().free(i_number) {
            return Err(FsError::NotFound(name.to_owned()));
        }
        DiskInode::unused().store(i_number, &self.cache);
        self.cache.sync_all();

        Ok(())
    }

    /// 以 `inodes` 个 inode 重新格式化，仅在没有打开的文件时允许
    pub fn format(&self, inodes: usize) -> Result<()> {
        self.file_table
            .if_empty(|| -> Result<()> {
                self.super_block.lock().format(inodes, &self.cache)?;
                *self.directory.lock() = Directory::new(inodes);
                Ok(())
            })
            .unwrap_or_else(|| {
                warn!("format refused: {} open handles", self.file_table.len());
                Err(FsError::FormatBusy)
            })?;

        self.sync()
    }

    /// 把目录写回 0 号 inode，并把超级块与全部缓存块落盘
    pub fn sync(&self) -> Result<()> {
        let bytes = self.directory.lock().to_bytes();

        let mut root = DiskInode::load(0, &self.cache)?;
        if root.flag == InodeFlag::Unused {
            root.flag = InodeFlag::Used;
            root.store_status(0, &self.cache);
        }
        let result = self.write_at(0, &mut root, &mut 0, &bytes);
        root.store_data(0, &self.cache);
        self.super_block.lock().sync(&self.cache);
        self.cache.sync_all();

        result
    }

    /// 目录中的全部文件：`(inode 编号, 文件名, 文件大小)`
    pub fn list(&self) -> Result<Vec<(u16, String, usize)>> {
        let entries: Vec<_> = self.directory.lock().entries().collect();
        entries
            .into_iter()
            .map(|(i_number, name)| {
                let inode = DiskInode::load(i_number, &self.cache)?;
                Ok((i_number, name, inode.length as usize))
            })
            .collect()
    }

    pub fn free_block_count(&self) -> usize {
        self.super_block.lock().free_blocks(&self.cache).len()
    }

    pub fn inode_count(&self) -> usize {
        self.super_block.lock().inode_count()
    }

    pub fn open_handles(&self) -> usize {
        self.file_table.len()
    }

    pub fn is_idle(&self) -> bool {
        self.file_table.is_empty()
    }

    /// 阻塞直到所有句柄都被关闭
    pub fn wait_idle(&self) {
        self.file_table.wait_empty();
    }

    /// 检查数据区：每个块要么在空闲链表上，要么恰好属于一个文件
    pub fn check(&self) -> Result<()> {
        let super_block = self.super_block.lock();
        let data_start = super_block.data_start();
        let mut owned = vec![false; super_block.total_blocks as usize];

        let mut claim = |block_id: u16| -> Result<()> {
            let slot = owned
                .get_mut(block_id as usize)
                .filter(|_| block_id as usize >= data_start)
                .ok_or(FsError::StrayBlock(block_id))?;
            if std::mem::replace(slot, true) {
                return Err(FsError::CrossLinked(block_id));
            }
            Ok(())
        };

        for block_id in super_block.free_blocks(&self.cache) {
            claim(block_id)?;
        }
        for i_number in 0..super_block.inode_count() as u16 {
            for block_id in DiskInode::load(i_number, &self.cache)?.blocks(&self.cache) {
                claim(block_id)?;
            }
        }

        match owned[data_start..].iter().position(|&owned| !owned) {
            Some(index) => Err(FsError::LostBlock((data_start + index) as u16)),
            None => Ok(()),
        }
    }
}

impl FileSystem {
    /// 锁住仍然有效的句柄；只读句柄顺带取回磁盘上最新的 inode
    fn entry_state<'a>(&self, entry: &'a FileHandle) -> Result<MutexGuard<'a, EntryState>> {
        let mut state = entry.state();
        if state.count == 0 {
            return Err(FsError::BadHandle);
        }
        if !entry.writable() {
            state.inode = DiskInode::load(entry.i_number(), &self.cache)?;
        }

        Ok(state)
    }

    /// 释放文件占用的全部块，只有一个句柄引用该文件时才允许
    fn truncate(&self, entry: &FileHandle) -> Result<()> {
        let mut state = entry.state();
        let i_number = entry.i_number();
        let count = DiskInode::load(i_number, &self.cache)?.count;
        if count != 1 {
            warn!("inode {i_number}: truncate refused, {count} handles open");
            return Err(FsError::FileBusy(i_number));
        }

        let mut super_block = self.super_block.lock();
        if let Some(indirect) = state.inode.release_indirect(&self.cache) {
            for block_id in indirect.data_blocks() {
                super_block.dealloc(block_id as i32, &self.cache);
            }
            super_block.dealloc(indirect.block_id as i32, &self.cache);
        }
        for block_id in state.inode.release_direct() {
            super_block.dealloc(block_id as i32, &self.cache);
        }
        super_block.sync(&self.cache);

        state.inode.length = 0;
        state.inode.store_data(i_number, &self.cache);

        Ok(())
    }

    /// 从 `*pos` 开始写入，每写完一块就推进 `*pos` 并更新文件长度
    fn write_at(
        &self,
        i_number: u16,
        inode: &mut DiskInode,
        pos: &mut usize,
        buf: &[u8],
    ) -> Result<()> {
        let start = *pos;
        let end = (start + buf.len()).min(MAX_FILE_SIZE);

        while *pos < end {
            let block_id = match inode.block_id(*pos, &self.cache) {
                Some(block_id) => block_id,
                None => self.map_block(i_number, inode, *pos)?,
            };

            let offset = *pos % BLOCK_SIZE;
            let size = (BLOCK_SIZE - offset).min(end - *pos);
            let src = &buf[*pos - start..*pos - start + size];
            self.cache.modify(block_id as usize, |block| {
                block[offset..offset + size].copy_from_slice(src)
            });

            *pos += size;
            inode.length = inode.length.max(*pos as u32);
        }

        if end - start < buf.len() {
            return Err(FsError::FileTooLarge);
        }

        Ok(())
    }

    /// 为文件内偏移分配数据块；需要间接块时先挂上间接块再重试一次
    fn map_block(&self, i_number: u16, inode: &mut DiskInode, offset: usize) -> Result<u16> {
        let mut super_block = self.super_block.lock();
        let block_id = super_block.alloc(&self.cache).ok_or(FsError::NoSpace)?;

        let err = match inode.register_block(offset, block_id, &self.cache) {
            Ok(()) => return Ok(block_id),
            Err(RegisterError::NeedsIndirect) => {
                let Some(indirect) = super_block.alloc(&self.cache) else {
                    super_block.dealloc(block_id as i32, &self.cache);
                    return Err(FsError::NoSpace);
                };
                if !inode.register_indirect(indirect, &self.cache) {
                    super_block.dealloc(indirect as i32, &self.cache);
                }
                match inode.register_block(offset, block_id, &self.cache) {
                    Ok(()) => return Ok(block_id),
                    Err(err) => err,
                }
            }
            Err(err) => err,
        };

        super_block.dealloc(block_id as i32, &self.cache);
        error!("filesystem panic: inode {i_number}, offset {offset}: {err:?}");
        Err(FsError::Panic { i_number, offset })
    }
}

impl Drop for FileSystem {
    fn drop(&mut self) {
        if let Err(err) = self.sync() {
            error!("sync on unmount failed: {err}");
        }
    }
}

/// 从 `offset` 开始读，读到文件末尾或首个未分配的块为止
fn read_at(inode: &DiskInode, offset: usize, buf: &mut [u8], cache: &BlockCacheManager) -> usize {
    let end = (inode.length as usize).min(offset.saturating_add(buf.len()));
    let mut pos = offset;

    while pos < end {
        let Some(block_id) = inode.block_id(pos, cache) else {
            break;
        };

        let block_offset = pos % BLOCK_SIZE;
        let size = (BLOCK_SIZE - block_offset).min(end - pos);
        let dest = &mut buf[pos - offset..pos - offset + size];
        cache.read(block_id as usize, |block| {
            dest.copy_from_slice(&block[block_offset..block_offset + size])
        });

        pos += size;
    }

    pos - offset
}
