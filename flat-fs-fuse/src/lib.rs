#[cfg(test)]
mod tests;

use std::fs::File;
use std::io::{Read, Write};
use std::io::{Seek, SeekFrom};
use std::sync::Mutex;

use block_dev::BlockDevice;
use flat_fs::BLOCK_SIZE;

/// 以宿主机上的镜像文件充当块设备
pub struct BlockFile(pub Mutex<File>);

impl BlockFile {
    /// 镜像文件可容纳的完整块数
    pub fn block_count(&self) -> std::io::Result<usize> {
        let file = self.0.lock().unwrap();
        Ok(file.metadata()?.len() as usize / BLOCK_SIZE)
    }
}

impl BlockDevice for BlockFile {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) {
        let mut file = self.0.lock().unwrap();
        file.seek(SeekFrom::Start((block_id * BLOCK_SIZE) as u64))
            .expect("seeking error");
        file.read_exact(buf).expect("not a complete block!");
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) {
        let mut file = self.0.lock().unwrap();
        file.seek(SeekFrom::Start((block_id * BLOCK_SIZE) as u64))
            .expect("seeking error");
        assert_eq!(buf.len(), BLOCK_SIZE, "not a complete block!");
        file.write_all(buf).expect("writing error");
    }
}
