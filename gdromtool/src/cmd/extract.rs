use std::{
    fs::File,
    io::{BufWriter, Write},
    path::PathBuf,
};

use argp::FromArgs;
use gdrom::{
    ResultContext,
    read::{ReaderOptions, VolumeReader},
};
use indicatif::ProgressBar;
use size::Size;

use crate::util::{bar_style, path_display};

const CHUNK_SIZE: u64 = 0x100000;

#[derive(FromArgs, Debug)]
/// Extracts a file from a GD-ROM image.
#[argp(subcommand, name = "extract")]
pub struct Args {
    #[argp(positional)]
    /// path to disc image (.gdi, .iso or .bin)
    file: PathBuf,
    #[argp(positional)]
    /// output file
    out: PathBuf,
    #[argp(option, short = 'p')]
    /// path of the file inside the volume (e.g. /1ST_READ.BIN)
    path: Option<String>,
    #[argp(switch)]
    /// extract the boot header (IP.BIN) instead of a file
    ip: bool,
}

pub fn run(args: Args) -> gdrom::Result<()> {
    let (source, partition) = gdrom::read::open(&args.file)?;
    let mut reader = VolumeReader::mount(source, partition, &ReaderOptions::default())?;
    let mut out = BufWriter::new(
        File::create(&args.out)
            .with_context(|| format!("Creating file {}", path_display(&args.out)))?,
    );

    let written = match (args.ip, args.path) {
        (true, None) => {
            let data = reader.read_boot_header()?;
            out.write_all(&data).context("Writing boot header")?;
            data.len() as u64
        }
        (false, Some(path)) => {
            let entry = reader
                .stat_path(&path)?
                .ok_or_else(|| gdrom::Error::Other(format!("{path} not found")))?;
            if entry.is_dir {
                return Err(gdrom::Error::Other(format!("{path} is a directory")));
            }
            let pb = ProgressBar::new(entry.size);
            pb.set_style(bar_style("{bytes}/{total_bytes} ({bytes_per_sec})"));
            let mut offset = 0;
            while offset < entry.size {
                let len = CHUNK_SIZE.min(entry.size - offset);
                let data = reader
                    .read_path(&path, offset, len)?
                    .ok_or_else(|| gdrom::Error::Other(format!("{path} not found")))?;
                out.write_all(&data)
                    .with_context(|| format!("Writing {}", path_display(&args.out)))?;
                offset += len;
                pb.set_position(offset);
            }
            pb.finish_and_clear();
            entry.size
        }
        (true, Some(_)) => {
            return Err(gdrom::Error::Other("Both --ip and --path specified".to_string()));
        }
        (false, None) => {
            return Err(gdrom::Error::Other("One of --ip or --path is required".to_string()));
        }
    };
    out.flush().context("Flushing output file")?;
    println!("Wrote {} to {}", Size::from_bytes(written), path_display(&args.out));
    Ok(())
}
