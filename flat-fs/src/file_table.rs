//! # 打开文件表层
//!
//! 每次 `open` 产生一个 [`FileTableEntry`]，记录读写位置、打开方式，
//! 以及所指 inode 在内存中的副本。文件表按句柄的身份而非文件名区分表项，
//! 同一个文件可以同时以不同方式被多次打开。
//!
//! 表项的分配与释放、inode 状态的迁移都在文件表的同一把锁下进行。

use std::str::FromStr;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use enumflags2::{BitFlags, bitflags};
use log::debug;

use crate::block_cache::BlockCacheManager;
use crate::directory::{Directory, ROOT_NAME};
use crate::error::{FsError, Result};
use crate::layout::{DiskInode, InodeFlag};

#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read = 0b001,
    Write = 0b010,
    /// 写入总是从文件末尾开始
    Append = 0b100,
}

/// 打开方式，与系统调用层约定的字符串一一对应
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// `"r"`
    Read,
    /// `"w"`，打开时清空文件
    Write,
    /// `"w+"`
    ReadWrite,
    /// `"a"`
    Append,
}

impl FromStr for OpenMode {
    type Err = FsError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "r" => Ok(Self::Read),
            "w" => Ok(Self::Write),
            "w+" => Ok(Self::ReadWrite),
            "a" => Ok(Self::Append),
            _ => Err(FsError::InvalidMode(s.to_owned())),
        }
    }
}

impl OpenMode {
    pub fn access(self) -> BitFlags<Access> {
        match self {
            Self::Read => Access::Read.into(),
            Self::Write => Access::Write.into(),
            Self::ReadWrite => Access::Read | Access::Write,
            Self::Append => Access::Write | Access::Append,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "r",
            Self::Write => "w",
            Self::ReadWrite => "w+",
            Self::Append => "a",
        }
    }

    /// 打开后 inode 所处的状态
    fn open_flag(self) -> InodeFlag {
        match self {
            Self::Read => InodeFlag::OpenRead,
            Self::Write | Self::ReadWrite => InodeFlag::OpenReadWrite,
            Self::Append => InodeFlag::OpenAppend,
        }
    }
}

/// 打开文件句柄
pub type FileHandle = Arc<FileTableEntry>;

#[derive(Debug)]
pub struct FileTableEntry {
    i_number: u16,
    mode: OpenMode,
    state: spin::Mutex<EntryState>,
}

#[derive(Debug)]
pub(crate) struct EntryState {
    /// 读写位置
    pub seek_ptr: usize,
    pub inode: DiskInode,
    /// 共享此句柄的次数，归零时才真正释放
    pub count: u32,
}

impl FileTableEntry {
    #[inline]
    pub fn i_number(&self) -> u16 {
        self.i_number
    }

    #[inline]
    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    #[inline]
    pub fn readable(&self) -> bool {
        self.mode.access().contains(Access::Read)
    }

    #[inline]
    pub fn writable(&self) -> bool {
        self.mode.access().contains(Access::Write)
    }

    #[inline]
    pub(crate) fn state(&self) -> spin::MutexGuard<'_, EntryState> {
        self.state.lock()
    }
}

#[derive(Default)]
pub struct FileTable {
    entries: Mutex<Vec<FileHandle>>,
    /// 表项被释放时通知等待清空的一方
    drained: Condvar,
}

impl FileTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 打开文件：按名字找到 inode，找不到且允许写时新建
    pub(crate) fn allocate(
        &self,
        name: &str,
        mode: OpenMode,
        dir: &spin::Mutex<Directory>,
        cache: &BlockCacheManager,
    ) -> Result<FileHandle> {
        let mut entries = self.entries();

        // 根目录固定为 0 号 inode，不经过查找
        let found = if name == ROOT_NAME {
            Some(0)
        } else {
            dir.lock().lookup(name)
        };

        let (i_number, mut inode, created) = match found {
            Some(i_number) => (i_number, DiskInode::load(i_number, cache)?, false),
            None if mode == OpenMode::Read => return Err(FsError::NotFound(name.to_owned())),
            None => {
                let i_number = dir.lock().allocate(name).ok_or(FsError::DirectoryFull)?;
                (i_number, DiskInode::new(), true)
            }
        };

        inode.flag = mode.open_flag();
        inode.count += 1;
        if created {
            inode.store(i_number, cache);
        } else {
            inode.store_status(i_number, cache);
        }

        let seek_ptr = match mode {
            OpenMode::Append => inode.length as usize,
            _ => 0,
        };
        debug!(
            "open {name:?} as {:?}: inode {i_number}, {} handles",
            mode.as_str(),
            inode.count
        );

        let entry = Arc::new(FileTableEntry {
            i_number,
            mode,
            state: spin::Mutex::new(EntryState {
                seek_ptr,
                inode,
                count: 1,
            }),
        });
        entries.push(entry.clone());

        Ok(entry)
    }

    /// 从表中移除表项并降级 inode 状态；表项不在表中时返回 false
    pub(crate) fn free(&self, entry: &FileHandle, cache: &BlockCacheManager) -> bool {
        let mut entries = self.entries();
        let Some(index) = entries.iter().position(|e| Arc::ptr_eq(e, entry)) else {
            return false;
        };
        entries.swap_remove(index);

        let mut state = entry.state();
        // 计数以磁盘为准，其它句柄可能在此期间打开或关闭过；
        // 只读句柄沿用磁盘上的状态，以免抹掉写者留下的标记
        let on_disk = DiskInode::load(entry.i_number, cache).ok();
        let flag = match &on_disk {
            Some(inode) if !entry.writable() => inode.flag,
            _ => entry.mode.open_flag(),
        };
        let count = on_disk.map_or(state.inode.count, |inode| inode.count);
        state.inode.count = count.saturating_sub(1);
        state.inode.flag = flag.released();
        state.inode.store_status(entry.i_number, cache);
        debug!(
            "close inode {}: {} handles left",
            entry.i_number, state.inode.count
        );
        drop(state);

        self.drained.notify_all();
        true
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// 阻塞直到所有表项都被释放
    pub fn wait_empty(&self) {
        let entries = self.entries();
        let _entries = self
            .drained
            .wait_while(entries, |entries| !entries.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
    }

    /// 表为空时持锁执行 `f`，期间不会有新的表项
    pub(crate) fn if_empty<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let entries = self.entries();
        entries.is_empty().then(f)
    }

    fn entries(&self) -> MutexGuard<'_, Vec<FileHandle>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use block_dev::RamDisk;

    use super::*;
    use crate::BLOCK_SIZE;

    fn setup() -> (FileTable, spin::Mutex<Directory>, BlockCacheManager) {
        let cache = BlockCacheManager::new(Arc::new(RamDisk::new(BLOCK_SIZE, 32)));
        for i_number in 0..16 {
            DiskInode::unused().store(i_number, &cache);
        }
        (FileTable::new(), spin::Mutex::new(Directory::new(16)), cache)
    }

    #[test]
    fn mode_strings() {
        assert_eq!("w+".parse::<OpenMode>(), Ok(OpenMode::ReadWrite));
        assert_eq!(
            "rw".parse::<OpenMode>(),
            Err(FsError::InvalidMode("rw".into()))
        );
        for mode in [
            OpenMode::Read,
            OpenMode::Write,
            OpenMode::ReadWrite,
            OpenMode::Append,
        ] {
            assert_eq!(mode.as_str().parse::<OpenMode>(), Ok(mode));
        }
        assert!(OpenMode::Append.access().contains(Access::Write));
        assert!(!OpenMode::Append.access().contains(Access::Read));
    }

    #[test]
    fn read_does_not_create() {
        let (table, dir, cache) = setup();
        assert_eq!(
            table.allocate("/foo", OpenMode::Read, &dir, &cache).unwrap_err(),
            FsError::NotFound("/foo".into())
        );
        assert!(table.is_empty());
        assert_eq!(dir.lock().lookup("/foo"), None);
    }

    #[test]
    fn flag_transitions() {
        let (table, dir, cache) = setup();

        let writer = table.allocate("/foo", OpenMode::Write, &dir, &cache).unwrap();
        let i_number = writer.i_number();
        assert_eq!(i_number, 1);
        let on_disk = DiskInode::load(i_number, &cache).unwrap();
        assert_eq!((on_disk.flag, on_disk.count), (InodeFlag::OpenReadWrite, 1));

        let reader = table.allocate("/foo", OpenMode::Read, &dir, &cache).unwrap();
        assert_eq!(reader.i_number(), i_number);
        assert_eq!(DiskInode::load(i_number, &cache).unwrap().count, 2);
        assert_eq!(table.len(), 2);

        assert!(table.free(&writer, &cache));
        assert!(!table.free(&writer, &cache));
        let on_disk = DiskInode::load(i_number, &cache).unwrap();
        assert_eq!(
            (on_disk.flag, on_disk.count),
            (InodeFlag::WriteQueuedUnused, 1)
        );

        // 读句柄不会抹掉写者留下的状态
        assert!(table.free(&reader, &cache));
        let on_disk = DiskInode::load(i_number, &cache).unwrap();
        assert_eq!(
            (on_disk.flag, on_disk.count),
            (InodeFlag::WriteQueuedUnused, 0)
        );
        assert!(table.is_empty());

        let reader = table.allocate("/foo", OpenMode::Read, &dir, &cache).unwrap();
        assert!(table.free(&reader, &cache));
        let on_disk = DiskInode::load(i_number, &cache).unwrap();
        assert_eq!((on_disk.flag, on_disk.count), (InodeFlag::Unused, 0));
    }

    #[test]
    fn root_bypasses_lookup() {
        let (table, dir, cache) = setup();
        let root = table.allocate("/", OpenMode::Read, &dir, &cache).unwrap();
        assert_eq!(root.i_number(), 0);
        assert!(root.readable() && !root.writable());
    }

    #[test]
    fn directory_full() {
        let (table, dir, cache) = setup();
        for i in 1..16 {
            let entry = table
                .allocate(&format!("/f{i}"), OpenMode::Append, &dir, &cache)
                .unwrap();
            assert!(table.free(&entry, &cache));
        }
        assert_eq!(
            table
                .allocate("/overflow", OpenMode::Write, &dir, &cache)
                .unwrap_err(),
            FsError::DirectoryFull
        );
    }

    #[test]
    fn wait_empty_wakes_on_free() {
        let (table, dir, cache) = setup();
        let table = Arc::new(table);
        let entry = table.allocate("/foo", OpenMode::Write, &dir, &cache).unwrap();
        assert!(table.if_empty(|| ()).is_none());

        let waiter = {
            let table = table.clone();
            thread::spawn(move || table.wait_empty())
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());

        assert!(table.free(&entry, &cache));
        waiter.join().unwrap();
        assert_eq!(table.if_empty(|| 7), Some(7));
    }
}
