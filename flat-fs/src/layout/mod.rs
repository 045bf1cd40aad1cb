//! # 磁盘数据结构层
//!
//! flat-fs 的磁盘布局：
//! 超级块 | inode 区域 | 空闲链表与数据块区域
//!
//! 所有整数均以大端序落盘。

mod super_block;
pub use super_block::SuperBlock;

mod inode;
pub use inode::{DiskInode, InodeFlag, RegisterError, ReleasedIndirect};

#[inline]
fn read_i32(buf: &[u8], offset: usize) -> i32 {
    let mut bytes = [0; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    i32::from_be_bytes(bytes)
}

#[inline]
fn write_i32(buf: &mut [u8], offset: usize, value: i32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

#[inline]
fn read_i16(buf: &[u8], offset: usize) -> i16 {
    i16::from_be_bytes([buf[offset], buf[offset + 1]])
}

#[inline]
fn write_i16(buf: &mut [u8], offset: usize, value: i16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

/// 块指针落盘时以 -1 表示未分配
#[inline]
fn decode_ptr(raw: i16) -> Option<u16> {
    u16::try_from(raw).ok()
}

#[inline]
fn encode_ptr(ptr: Option<u16>) -> i16 {
    ptr.map_or(-1, |block_id| block_id as i16)
}
