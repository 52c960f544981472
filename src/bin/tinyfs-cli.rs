//! Small demo binary around the `tinyfs` library: format a backing file,
//! mount it, and run `put`/`get`/`ls`/`rm` against it. This is ambient
//! tooling, not the core spec, but every example repo in the pack ships a
//! binary entry point alongside its library.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use tinyfs::{FileBlockDevice, FormatParams, Fs};

/// Open an already-formatted image, recovering `num_pages`/`page_size` from
/// the info page so the caller doesn't have to pass geometry it can't know
/// ahead of `mount`. Reads the raw header bytes directly (no `FileBlockDevice`
/// involved yet, since that needs the geometry we're trying to discover).
fn open_formatted(path: &Path) -> Result<FileBlockDevice> {
    let mut f = fs::File::open(path).with_context(|| format!("opening {path:?}"))?;
    let mut header = [0u8; 20];
    f.read_exact(&mut header).with_context(|| "reading info page header")?;
    let num_pages = u32::from_le_bytes(header[4..8].try_into().unwrap());
    let page_size_exp = header[8];
    let page_size = 1usize << page_size_exp;
    FileBlockDevice::open(path, num_pages, page_size).map_err(|e| anyhow!(e))
}

#[derive(Parser)]
#[command(name = "tinyfs-cli", about = "Drive a tinyfs image from the command line")]
struct Cli {
    /// Path to the backing device file.
    #[arg(short, long, default_value = "tinyfs.img")]
    device: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Format a fresh device image.
    Format {
        #[arg(long, default_value_t = 4096)]
        pages: u32,
        #[arg(long, default_value_t = 512)]
        page_size: usize,
        #[arg(long, default_value_t = 8)]
        block_size: usize,
        #[arg(long, default_value_t = 4)]
        hash_size: u8,
        #[arg(long, default_value_t = 12)]
        max_name_len: u16,
        #[arg(long, default_value_t = false)]
        erase: bool,
    },
    /// Write the contents of a local file into the image under `name`.
    Put { name: String, local_path: PathBuf },
    /// Read the file `name` out of the image to stdout, or to `local_path`.
    Get { name: String, local_path: Option<PathBuf> },
    /// List every file present in the image.
    Ls,
    /// Remove a file from the image.
    Rm { name: String },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Format {
            pages,
            page_size,
            block_size,
            hash_size,
            max_name_len,
            erase,
        } => {
            let device = FileBlockDevice::open(&cli.device, pages, page_size)
                .with_context(|| format!("opening {:?}", cli.device))?;
            let params = FormatParams {
                block_size_pages: block_size,
                address_size: if pages < 65_536 { 2 } else { 4 },
                hash_size,
                max_file_name_size: max_name_len,
                metadata_entry_size: None,
                erase_first: erase,
            };
            Fs::format(device, params).map_err(|e| anyhow!(e))?;
            info!("formatted {:?} ({pages} pages, {page_size}-byte pages)", cli.device);
        }
        Command::Put { name, local_path } => {
            let device = open_formatted(&cli.device)?;
            let mut fs = Fs::mount(device).map_err(|e| anyhow!(e))?;
            let data = fs::read(&local_path).with_context(|| format!("reading {local_path:?}"))?;
            let mut handle = fs.open(name.as_bytes()).map_err(|e| anyhow!(e))?;
            let page_size = fs.superblock().page_size();
            for (page, chunk) in data.chunks(page_size).enumerate() {
                fs.write(&mut handle, page as u32, chunk, 0).map_err(|e| anyhow!(e))?;
            }
            fs.close(&mut handle).map_err(|e| anyhow!(e))?;
            info!("wrote {} bytes to {name}", data.len());
        }
        Command::Get { name, local_path } => {
            let device = open_formatted(&cli.device)?;
            let mut fs = Fs::mount(device).map_err(|e| anyhow!(e))?;
            let mut handle = fs.open(name.as_bytes()).map_err(|e| anyhow!(e))?;
            let page_size = fs.superblock().page_size();
            let total = handle.page_count() as usize * page_size;
            let mut out = Vec::with_capacity(total);
            let mut page = 0u32;
            while (page as usize) < handle.page_count() as usize {
                let mut buf = vec![0u8; page_size];
                let want = if page == handle.eof_page {
                    handle.eof_byte as usize
                } else {
                    page_size
                };
                if want > 0 {
                    fs.read(&mut handle, page, &mut buf[..want], 0)
                        .map_err(|e| anyhow!(e))?;
                    out.extend_from_slice(&buf[..want]);
                }
                page += 1;
            }
            match local_path {
                Some(path) => fs::write(&path, &out).with_context(|| format!("writing {path:?}"))?,
                None => print!("{}", String::from_utf8_lossy(&out)),
            }
        }
        Command::Ls => {
            let device = open_formatted(&cli.device)?;
            let mut fs = Fs::mount(device).map_err(|e| anyhow!(e))?;
            for name in fs.list().map_err(|e| anyhow!(e))? {
                println!("{}", String::from_utf8_lossy(&name));
            }
        }
        Command::Rm { name } => {
            let device = open_formatted(&cli.device)?;
            let mut fs = Fs::mount(device).map_err(|e| anyhow!(e))?;
            fs.remove(name.as_bytes()).map_err(|e| anyhow!(e))?;
        }
    }
    Ok(())
}
