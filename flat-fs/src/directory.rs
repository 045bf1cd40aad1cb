//! # 目录层
//!
//! 整个文件系统只有一个根目录，它是一张定长表：下标即 inode 编号，
//! `sizes[i]` 为文件名长度（0 表示空槽），`names[i]` 为文件名。
//! 0 号槽固定为 `/`，永不释放。
//!
//! 目录以普通文件的形式存放在 0 号 inode 中，落盘格式为
//! 全部长度（每个 4 字节）后接全部文件名（每个 60 字节，UTF-16 大端）。

use crate::NAME_MAX_LEN;

/// 落盘时每个文件名占用的字节数
const NAME_SLOT_SIZE: usize = NAME_MAX_LEN * 2;

pub const ROOT_NAME: &str = "/";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directory {
    sizes: Vec<u32>,
    names: Vec<Vec<u16>>,
}

impl Directory {
    pub fn new(max_inodes: usize) -> Self {
        let mut dir = Self {
            sizes: vec![0; max_inodes],
            names: vec![Vec::new(); max_inodes],
        };
        dir.set(0, ROOT_NAME);
        dir
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.sizes.len()
    }

    /// 为新文件分配 inode 编号；名字为空或目录已满时返回空
    pub fn allocate(&mut self, name: &str) -> Option<u16> {
        let units = Self::encode_name(name);
        if units.is_empty() {
            return None;
        }

        let i_number = self.sizes.iter().skip(1).position(|&size| size == 0)? + 1;
        self.sizes[i_number] = units.len() as u32;
        self.names[i_number] = units;

        Some(i_number as u16)
    }

    /// 释放 inode 编号；编号越界、槽位本就空闲或为根目录时返回 false
    pub fn free(&mut self, i_number: u16) -> bool {
        let i_number = i_number as usize;
        if i_number == 0 || i_number >= self.capacity() || self.sizes[i_number] == 0 {
            return false;
        }

        self.sizes[i_number] = 0;
        self.names[i_number].clear();

        true
    }

    pub fn lookup(&self, name: &str) -> Option<u16> {
        let units = Self::encode_name(name);
        self.sizes
            .iter()
            .zip(&self.names)
            .position(|(&size, stored)| size as usize == units.len() && *stored == units)
            .map(|i_number| i_number as u16)
    }

    /// 全部已占用的槽位：`(inode 编号, 文件名)`
    pub fn entries(&self) -> impl Iterator<Item = (u16, String)> + '_ {
        self.sizes
            .iter()
            .zip(&self.names)
            .enumerate()
            .filter(|(_, (size, _))| **size > 0)
            .map(|(i_number, (_, name))| (i_number as u16, String::from_utf16_lossy(name)))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::byte_size(self.capacity()));
        for &size in &self.sizes {
            bytes.extend_from_slice(&(size as i32).to_be_bytes());
        }
        for name in &self.names {
            let mut slot = [0; NAME_SLOT_SIZE];
            for (dest, unit) in slot.chunks_exact_mut(2).zip(name) {
                dest.copy_from_slice(&unit.to_be_bytes());
            }
            bytes.extend_from_slice(&slot);
        }
        bytes
    }

    /// 用磁盘上读出的内容覆盖目录；内容不足时其余槽位保持不变
    pub fn load_bytes(&mut self, bytes: &[u8]) {
        let capacity = self.capacity();
        let names_start = capacity * 4;

        for (i, raw) in bytes.chunks_exact(4).take(capacity).enumerate() {
            let size = i32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
            self.sizes[i] = size.clamp(0, NAME_MAX_LEN as i32) as u32;
        }

        let names = bytes.get(names_start..).unwrap_or_default();
        for (i, slot) in names.chunks_exact(NAME_SLOT_SIZE).take(capacity).enumerate() {
            self.names[i] = slot
                .chunks_exact(2)
                .take(self.sizes[i] as usize)
                .map(|unit| u16::from_be_bytes([unit[0], unit[1]]))
                .collect();
        }

        // 根目录的名字不受磁盘内容影响
        self.set(0, ROOT_NAME);
    }

    #[inline]
    pub fn byte_size(max_inodes: usize) -> usize {
        max_inodes * (4 + NAME_SLOT_SIZE)
    }

    fn set(&mut self, i_number: usize, name: &str) {
        let units = Self::encode_name(name);
        self.sizes[i_number] = units.len() as u32;
        self.names[i_number] = units;
    }

    /// 截断到 [`NAME_MAX_LEN`] 个 UTF-16 单元，不拆开代理对
    fn encode_name(name: &str) -> Vec<u16> {
        let mut units = Vec::with_capacity(NAME_MAX_LEN);
        for ch in name.chars() {
            let mut buf = [0; 2];
            let encoded = ch.encode_utf16(&mut buf);
            if units.len() + encoded.len() > NAME_MAX_LEN {
                break;
            }
            units.extend_from_slice(encoded);
        }
        units
    }
}
