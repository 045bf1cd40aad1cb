use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use flat_fs::{BLOCK_SIZE, FileSystem, FsError, OpenMode, Whence};

use crate::BlockFile;

const DISK_BLOCKS: usize = 1000;

/// 临时目录下的镜像文件，测试结束时删除
struct Image(PathBuf);

impl Image {
    fn new(name: &str) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let path = std::env::temp_dir().join(format!(
            "flat-fs-{name}-{}.img",
            std::process::id()
        ));
        let fd = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        fd.set_len((DISK_BLOCKS * BLOCK_SIZE) as u64).unwrap();

        Self(path)
    }

    fn mount(&self) -> FileSystem {
        let fd = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.0)
            .unwrap();
        let block_file = BlockFile(Mutex::new(fd));
        assert_eq!(block_file.block_count().unwrap(), DISK_BLOCKS);

        FileSystem::mount(Arc::new(block_file), DISK_BLOCKS).unwrap()
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.0);
    }
}

#[test]
fn write_close_reopen() {
    let image = Image::new("reopen");
    let data: Vec<u8> = (0..1000).map(|i| i as u8).collect();

    {
        let fs = image.mount();
        fs.format(64).unwrap();
        let handle = fs.open("/foo", OpenMode::Write).unwrap();
        assert_eq!(fs.write(&handle, &data), Ok(1000));
        fs.close(&handle).unwrap();
    }

    let fs = image.mount();
    let handle = fs.open("/foo", OpenMode::Read).unwrap();
    assert_eq!(fs.fsize(&handle), Ok(1000));

    let mut buf = vec![0; 1000];
    assert_eq!(fs.read(&handle, &mut buf), Ok(1000));
    assert_eq!(buf, data);
    assert_eq!(fs.seek(&handle, 10, Whence::End), Ok(1000));
    assert_eq!(fs.read(&handle, &mut buf), Ok(0));
    fs.close(&handle).unwrap();
}

#[test]
fn indirect_file_and_delete() {
    let image = Image::new("indirect");
    let data: Vec<u8> = (0..20 * BLOCK_SIZE).map(|i| (i * 7 % 256) as u8).collect();

    {
        let fs = image.mount();
        let baseline = fs.free_block_count();
        let handle = fs.open("/big", OpenMode::Write).unwrap();
        assert_eq!(fs.write(&handle, &data), Ok(data.len()));
        fs.close(&handle).unwrap();
        assert_eq!(fs.free_block_count(), baseline - 21);
    }

    let fs = image.mount();
    let handle = fs.open("/big", OpenMode::Read).unwrap();
    let mut buf = vec![0; data.len()];
    assert_eq!(fs.read(&handle, &mut buf), Ok(data.len()));
    assert_eq!(buf, data);
    fs.close(&handle).unwrap();

    fs.delete("/big").unwrap();
    assert_eq!(
        fs.open("/big", OpenMode::Read).unwrap_err(),
        FsError::NotFound("/big".into())
    );
    fs.check().unwrap();
}
