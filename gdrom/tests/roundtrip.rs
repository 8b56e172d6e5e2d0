use std::{fs, path::Path};

use chrono::{TimeZone, Utc};
use gdrom::{
    build::gdrom::{GdromBuilder, GdromOptions},
    common::{Encoding, TrackKind},
    disc::{BootHeader, BOOT_FILE_OFFSET, BOOT_HEADER_SIZE, GD_START_LBA, TOC_MAGIC},
    read::{EncodingPreference, ReaderOptions, VolumeReader},
    Error,
};

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

fn write_inputs(root: &Path) {
    let data = root.join("data");
    fs::create_dir_all(data.join("SOUND")).unwrap();
    fs::write(data.join("1ST_READ.BIN"), pattern(70000, 1)).unwrap();
    fs::write(data.join("0GDTEX.PVR"), pattern(512, 2)).unwrap();
    fs::write(data.join("SOUND").join("BGM.ADX"), pattern(9000, 3)).unwrap();
    fs::write(data.join("EMPTY.TXT"), b"").unwrap();

    let mut ip = vec![0u8; BOOT_HEADER_SIZE];
    ip[..16].copy_from_slice(b"SEGA SEGAKATANA ");
    ip[0x10..0x20].copy_from_slice(b"ROUNDTRIP TEST  ");
    ip[BOOT_FILE_OFFSET..BOOT_FILE_OFFSET + 16].copy_from_slice(b"1ST_READ.BIN    ");
    fs::write(root.join("IP.BIN"), ip).unwrap();
}

fn options(raw: bool, joliet: bool) -> GdromOptions {
    GdromOptions {
        raw,
        joliet,
        end_sector: GD_START_LBA + 300,
        creation_time: Some(Utc.with_ymd_and_hms(2001, 2, 3, 4, 5, 6).unwrap()),
        ..Default::default()
    }
}

fn build(root: &Path, options: GdromOptions) -> gdrom::build::gdrom::GdromOutput {
    let mut builder = GdromBuilder::new(options);
    builder
        .build(&root.join("data"), &root.join("IP.BIN"), &root.join("out"), |_| {})
        .expect("Failed to build disc image")
}

fn mount(path: &Path, encoding: EncodingPreference) -> VolumeReader {
    let (source, partition) = gdrom::read::open(path).expect("Failed to open disc image");
    assert_eq!(partition.start, GD_START_LBA);
    VolumeReader::mount(source, partition, &ReaderOptions { encoding })
        .expect("Failed to mount volume")
}

fn check_contents(reader: &mut VolumeReader) {
    let boot = reader.stat_path("/1ST_READ.BIN").unwrap().unwrap();
    assert_eq!(boot.size, 70000);
    assert!(!boot.is_dir);
    assert_eq!(reader.read_path("/1st_read.bin", 0, 70000).unwrap().unwrap(), pattern(70000, 1));
    let adx = reader.read_path("/SOUND/BGM.ADX", 4000, 100).unwrap().unwrap();
    assert_eq!(adx, pattern(9000, 3)[4000..4100]);
    assert_eq!(reader.stat_path("/EMPTY.TXT").unwrap().unwrap().size, 0);
    assert_eq!(reader.stat_path("/NOT_HERE.BIN").unwrap(), None);
    assert_eq!(reader.read_path("/SOUND/NOPE", 0, 1).unwrap(), None);
    assert!(matches!(
        reader.read_path("/0GDTEX.PVR", 500, 13),
        Err(Error::OutOfBounds { offset: 500, len: 13, size: 512 })
    ));

    let mut names = reader
        .read_dir("/")
        .unwrap()
        .unwrap()
        .into_iter()
        .map(|e| (e.name.to_ascii_uppercase(), e.is_dir))
        .collect::<Vec<_>>();
    names.sort();
    assert_eq!(names, vec![
        ("0GDTEX.PVR".to_string(), false),
        ("1ST_READ.BIN".to_string(), false),
        ("EMPTY.TXT".to_string(), false),
        ("SOUND".to_string(), true),
    ]);
    assert_eq!(reader.read_dir("/1ST_READ.BIN").unwrap(), None);
}

fn check_boot_header(reader: &mut VolumeReader, tracks: &[(u8, u32)]) {
    let header = BootHeader::from_slice(&reader.read_boot_header().unwrap()).unwrap();
    assert!(header.is_dreamcast());
    assert_eq!(header.boot_file_name(), "1ST_READ.BIN");
    assert_eq!(header.toc_magic, TOC_MAGIC);
    assert_eq!(header.maker_id_str(), "ROUNDTRIP TEST");
    let toc = header.tracks().map(|(n, e)| (n, e.lba(), e.kind())).collect::<Vec<_>>();
    let expected =
        tracks.iter().map(|&(n, lba)| (n, lba, Some(TrackKind::Data))).collect::<Vec<_>>();
    assert_eq!(toc, expected);
}

#[test]
fn test_roundtrip_iso() {
    let dir = tempfile::tempdir().unwrap();
    write_inputs(dir.path());
    let output = build(dir.path(), options(false, false));
    assert_eq!(output.tracks.len(), 1);
    assert_eq!(output.tracks[0].file_name, "track03.iso");
    assert_eq!(output.volume_size, 300 * 2048);

    let mut reader = mount(&output.manifest_path, EncodingPreference::Joliet);
    assert_eq!(reader.descriptor().unwrap().encoding, Encoding::Primary);
    assert_eq!(reader.descriptor().unwrap().volume_id, "GDROM");
    assert_eq!(reader.descriptor().unwrap().block_count, GD_START_LBA + 300);
    check_contents(&mut reader);
    check_boot_header(&mut reader, &[(3, GD_START_LBA)]);

    reader.unmount();
    assert!(!reader.is_mounted());
    assert!(matches!(reader.stat_path("/1ST_READ.BIN"), Err(Error::NotMounted)));
    assert!(matches!(reader.read_boot_header(), Err(Error::NotMounted)));

    // The data track alone is also a readable image
    let mut reader = mount(&dir.path().join("out/track03.iso"), EncodingPreference::Primary);
    check_contents(&mut reader);
}

#[test]
fn test_roundtrip_raw_joliet() {
    let dir = tempfile::tempdir().unwrap();
    write_inputs(dir.path());
    let output = build(dir.path(), options(true, true));
    assert_eq!(output.tracks[0].file_name, "track03.bin");
    let track = fs::read(dir.path().join("out/track03.bin")).unwrap();
    assert_eq!(track.len(), 300 * 2352);

    let mut reader = mount(&output.manifest_path, EncodingPreference::Joliet);
    assert_eq!(reader.descriptors().unwrap().len(), 2);
    assert_eq!(reader.descriptor().unwrap().encoding, Encoding::Joliet);
    check_contents(&mut reader);
    check_boot_header(&mut reader, &[(3, GD_START_LBA)]);

    let mut reader = mount(&output.manifest_path, EncodingPreference::Primary);
    assert_eq!(reader.descriptor().unwrap().encoding, Encoding::Primary);
    check_contents(&mut reader);
}

#[test]
fn test_roundtrip_truncated() {
    let dir = tempfile::tempdir().unwrap();
    write_inputs(dir.path());
    let output = build(dir.path(), GdromOptions {
        truncate_data: true,
        end_sector: GD_START_LBA + 1000,
        ..options(false, false)
    });
    assert_eq!(output.tracks.len(), 2);
    let (first, last) = (&output.tracks[0], &output.tracks[1]);
    // Track 3 holds the system area and the descriptors only
    assert_eq!((first.number, first.lba, first.size), (3, GD_START_LBA, 18 * 2048));
    assert_eq!(fs::read(dir.path().join("out/track03.iso")).unwrap().len(), 18 * 2048);
    assert_eq!((last.number, last.kind), (4, TrackKind::Data));
    assert_eq!(last.file_name, "track04.iso");
    assert!(last.lba >= GD_START_LBA + 18 + 300);
    assert_eq!(last.end_lba(), GD_START_LBA + 1000);

    let mut reader = mount(&output.manifest_path, EncodingPreference::Joliet);
    check_contents(&mut reader);
    check_boot_header(&mut reader, &[(3, GD_START_LBA), (4, last.lba)]);
}

#[test]
fn test_rebuild_is_deterministic() {
    let dir = tempfile::tempdir().unwrap();
    write_inputs(dir.path());
    build(dir.path(), options(false, false));
    let first = fs::read(dir.path().join("out/track03.iso")).unwrap();
    build(dir.path(), options(false, false));
    let second = fs::read(dir.path().join("out/track03.iso")).unwrap();
    assert!(first == second);
}
