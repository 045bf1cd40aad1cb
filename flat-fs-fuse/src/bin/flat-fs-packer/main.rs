mod cli;

use std::fs;
use std::fs::OpenOptions;
use std::io;
use std::sync::Arc;
use std::sync::Mutex;

use clap::Parser;
use cli::Cli;
use flat_fs::{BLOCK_SIZE, FileSystem, MAX_FILE_SIZE, OpenMode};
use flat_fs_fuse::BlockFile;
use log::{info, warn};

fn main() -> io::Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    println!("source={:?}\nout={:?}", cli.source, cli.out);

    let block_file = Arc::new(BlockFile(Mutex::new({
        let fd = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&cli.out)?;
        fd.set_len((cli.blocks * BLOCK_SIZE) as u64)?;

        fd
    })));

    let file_system = FileSystem::mount(block_file, cli.blocks).map_err(io::Error::other)?;
    file_system.format(cli.inodes).map_err(io::Error::other)?;

    let mut files = fs::read_dir(&cli.source)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_ok_and(|kind| kind.is_file()))
        .collect::<Vec<_>>();
    files.sort_by_key(|entry| entry.file_name());

    for file in files {
        let name = format!("/{}", file.file_name().to_string_lossy());
        let data = fs::read(file.path())?;
        if data.len() > MAX_FILE_SIZE {
            warn!("skip {name:?}: {} bytes exceeds {MAX_FILE_SIZE}", data.len());
            continue;
        }

        let handle = file_system.open(&name, OpenMode::Write).map_err(io::Error::other)?;
        let written = file_system.write(&handle, &data).map_err(io::Error::other)?;
        file_system.close(&handle).map_err(io::Error::other)?;
        info!("packed {name:?}: {written}/{} bytes", data.len());
    }

    file_system.sync().map_err(io::Error::other)?;
    for (i_number, name, size) in file_system.list().map_err(io::Error::other)? {
        println!("{i_number:>4} {size:>8} {name}");
    }
    println!("{} blocks free", file_system.free_block_count());

    Ok(())
}
