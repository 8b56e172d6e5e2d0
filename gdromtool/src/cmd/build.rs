use std::{path::PathBuf, time::Instant};

use argp::FromArgs;
use gdrom::{
    build::gdrom::{GdromBuilder, GdromOptions},
    disc::{GD_END_LBA, GD_START_LBA},
};
use indicatif::ProgressBar;
use size::Size;

use crate::util::{bar_style, path_display};

#[derive(FromArgs, Debug)]
/// Builds a GDI track set from a data directory and a boot header.
#[argp(subcommand, name = "build")]
pub struct Args {
    #[argp(positional)]
    /// directory holding the disc contents
    data_dir: PathBuf,
    #[argp(positional)]
    /// path to the boot header (IP.BIN)
    ip_bin: PathBuf,
    #[argp(positional)]
    /// output directory for tracks and disc.gdi
    out_dir: PathBuf,
    #[argp(option, short = 'c')]
    /// CDDA track(s) to place after the first data track (raw 2352-byte sectors)
    cdda: Vec<PathBuf>,
    #[argp(switch)]
    /// write raw 2352-byte sectors (.bin) instead of 2048-byte sectors (.iso)
    raw: bool,
    #[argp(switch)]
    /// split the volume after the descriptors even without CDDA tracks
    truncate: bool,
    #[argp(switch)]
    /// add a Joliet directory tree
    joliet: bool,
    #[argp(option)]
    /// volume identifier
    volume_id: Option<String>,
    #[argp(option)]
    /// system identifier
    system_id: Option<String>,
    #[argp(option)]
    /// volume set identifier
    volume_set: Option<String>,
    #[argp(option)]
    /// publisher identifier
    publisher: Option<String>,
    #[argp(option)]
    /// data preparer identifier
    preparer: Option<String>,
    #[argp(option)]
    /// application identifier
    application: Option<String>,
    #[argp(option)]
    /// LBA the high-density area ends at (default: 549150)
    end_sector: Option<u32>,
}

pub fn run(args: Args) -> gdrom::Result<()> {
    let mut options = GdromOptions {
        raw: args.raw,
        truncate_data: args.truncate,
        joliet: args.joliet,
        end_sector: args.end_sector.unwrap_or(GD_END_LBA),
        ..Default::default()
    };
    if options.end_sector <= GD_START_LBA {
        return Err(gdrom::Error::Other(format!(
            "End sector {} is before the start of the high-density area ({})",
            options.end_sector, GD_START_LBA
        )));
    }
    let ids = &mut options.identifiers;
    for (value, field) in [
        (args.volume_id, &mut ids.volume),
        (args.system_id, &mut ids.system),
        (args.volume_set, &mut ids.volume_set),
        (args.publisher, &mut ids.publisher),
        (args.preparer, &mut ids.preparer),
        (args.application, &mut ids.application),
    ] {
        if let Some(value) = value {
            *field = value;
        }
    }

    let mut builder = GdromBuilder::new(options);
    for path in &args.cdda {
        builder.add_cdda(path);
    }

    println!("Building {}...", path_display(&args.data_dir));
    let pb = ProgressBar::new(100);
    pb.set_style(bar_style("{pos}%"));
    let start = Instant::now();
    let output = builder.build(&args.data_dir, &args.ip_bin, &args.out_dir, |percent| {
        pb.set_position(percent as u64)
    })?;
    pb.finish();

    println!();
    println!("Volume size: {}", Size::from_bytes(output.volume_size));
    for track in &output.tracks {
        println!(
            "Track {:2}: {:<5} LBA {:>6}..{:<6} {:>10}  {}",
            track.number,
            track.kind,
            track.lba,
            track.end_lba(),
            Size::from_bytes(track.size).to_string(),
            track.file_name
        );
    }
    println!(
        "Wrote {} in {:.2}s",
        path_display(&output.manifest_path),
        start.elapsed().as_secs_f64()
    );
    Ok(())
}
