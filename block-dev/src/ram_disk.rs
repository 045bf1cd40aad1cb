use std::sync::Mutex;

use crate::BlockDevice;

/// 位于内存的块设备，所有块初始为全零
#[derive(Debug)]
pub struct RamDisk {
    block_size: usize,
    blocks: Mutex<Vec<u8>>,
}

impl RamDisk {
    pub fn new(block_size: usize, block_count: usize) -> Self {
        Self {
            block_size,
            blocks: Mutex::new(vec![0; block_size * block_count]),
        }
    }

    #[inline]
    pub fn block_count(&self) -> usize {
        self.blocks.lock().unwrap().len() / self.block_size
    }

    /// 整个设备内容的拷贝，测试时用来检查落盘结果
    pub fn snapshot(&self) -> Vec<u8> {
        self.blocks.lock().unwrap().clone()
    }

    fn range(&self, block_id: usize, len: usize) -> core::ops::Range<usize> {
        assert_eq!(len, self.block_size, "not a complete block!");
        let start = block_id * self.block_size;
        start..start + self.block_size
    }
}

impl BlockDevice for RamDisk {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) {
        let range = self.range(block_id, buf.len());
        let blocks = self.blocks.lock().unwrap();
        assert!(range.end <= blocks.len(), "block {block_id} out of device");
        buf.copy_from_slice(&blocks[range]);
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) {
        let range = self.range(block_id, buf.len());
        let mut blocks = self.blocks.lock().unwrap();
        assert!(range.end <= blocks.len(), "block {block_id} out of device");
        blocks[range].copy_from_slice(buf);
    }
}
