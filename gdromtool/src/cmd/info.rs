use std::path::{Path, PathBuf};

use argp::FromArgs;
use gdrom::{
    common::Encoding,
    disc::{BootHeader, SECTOR_SIZE},
    read::{EncodingPreference, ReaderOptions, VolumeReader},
};
use size::Size;

use crate::util::path_display;

#[derive(FromArgs, Debug)]
/// Displays information about GD-ROM images.
#[argp(subcommand, name = "info")]
pub struct Args {
    #[argp(positional)]
    /// path to disc image(s) (.gdi, .iso or .bin)
    file: Vec<PathBuf>,
    #[argp(option, short = 't', from_str_fn(std::str::FromStr::from_str))]
    /// directory tree to read: iso9660 or joliet (default: joliet if present)
    tree: Option<Encoding>,
    #[argp(switch, short = 'l')]
    /// list the root directory
    list: bool,
}

pub fn run(args: Args) -> gdrom::Result<()> {
    let options = ReaderOptions {
        encoding: match args.tree {
            Some(Encoding::Primary) => EncodingPreference::Primary,
            Some(Encoding::Joliet) | None => EncodingPreference::Joliet,
        },
    };
    for file in &args.file {
        info_file(file, &options, args.list)?;
    }
    Ok(())
}

fn info_file(path: &Path, options: &ReaderOptions, list: bool) -> gdrom::Result<()> {
    println!("Loading {}", path_display(path));
    let (source, partition) = gdrom::read::open(path)?;
    let mut reader = VolumeReader::mount(source, partition, options)?;
    println!(
        "Volume: LBA {}..{} ({})",
        partition.start,
        partition.end,
        Size::from_bytes((partition.end - partition.start) as u64 * SECTOR_SIZE as u64)
    );

    let header = BootHeader::from_slice(&reader.read_boot_header()?)?;
    println!();
    println!("Hardware ID: {}", header.hardware_id_str());
    println!("Maker ID: {}", header.maker_id_str());
    println!("Product: {} {}", header.product_number_str(), header.product_version_str());
    println!("Release date: {}", header.release_date_str());
    println!("Title: {}", header.title_str());
    println!("Company: {}", header.company_str());
    let boot_file = header.boot_file_name();
    match reader.stat_path(&format!("/{boot_file}"))? {
        Some(entry) => {
            println!("Boot file: {} ({})", boot_file, Size::from_bytes(entry.size))
        }
        None => println!("Boot file: {} [!] missing", boot_file),
    }
    if !header.is_dreamcast() {
        println!("[!] Hardware ID is not SEGA SEGAKATANA");
    }
    println!("TOC:");
    for (number, entry) in header.tracks() {
        println!("  Track {:2}: {}", number, entry);
    }

    for desc in reader.descriptors()? {
        println!();
        println!("{} volume descriptor at LBA {}", desc.encoding, desc.lba);
        println!("System ID: {}", desc.system_id);
        println!("Volume ID: {}", desc.volume_id);
        if !desc.volume_set_id.is_empty() {
            println!("Volume set ID: {}", desc.volume_set_id);
        }
        println!("Publisher: {}", desc.publisher_id);
        println!("Preparer: {}", desc.preparer_id);
        println!("Application: {}", desc.application_id);
        println!("Volume size: {} blocks", desc.block_count);
        if let Some(created) = desc.created {
            println!("Created: {}", created.format("%Y-%m-%d %H:%M:%S"));
        }
        println!("Root directory: LBA {} ({})", desc.root_location, Size::from_bytes(desc.root_size));
    }
    println!();
    println!("Using {} tree ({:?})", reader.descriptor()?.encoding, reader.root_source()?);

    match reader.stat_path("/0GDTEX.PVR")? {
        Some(entry) => println!("Disc texture: 0GDTEX.PVR ({})", Size::from_bytes(entry.size)),
        None => println!("Disc texture: none"),
    }

    if list {
        println!();
        for entry in reader.read_dir("/")?.unwrap_or_default() {
            if entry.is_dir {
                println!("  {:>10}  {}/", "<DIR>", entry.name);
            } else {
                println!(
                    "  {:>10}  {} (LBA {})",
                    Size::from_bytes(entry.size).to_string(),
                    entry.name,
                    entry.location
                );
            }
        }
    }
    println!();
    Ok(())
}
