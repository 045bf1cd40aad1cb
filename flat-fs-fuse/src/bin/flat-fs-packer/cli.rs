use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
pub struct Cli {
    /// Directory whose regular files are copied into the image
    #[arg(long, short)]
    pub source: PathBuf,

    /// Image file to create
    #[arg(long, short = 'O')]
    pub out: PathBuf,

    /// Image size in 512-byte blocks
    #[arg(long, short, default_value_t = 4096)]
    pub blocks: usize,

    /// Number of inodes, which is also the directory capacity
    #[arg(long, short, default_value_t = flat_fs::DEFAULT_INODES)]
    pub inodes: usize,
}
