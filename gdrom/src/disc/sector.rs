//! Raw CD sector encoding (mode 1).
//!
//! A raw frame is laid out as:
//!
//! | Offset  | Size | Contents                          |
//! |---------|------|-----------------------------------|
//! | `0x000` | 12   | sync pattern `00 FF*10 00`        |
//! | `0x00C` | 3    | BCD minute/second/frame of LBA+150 |
//! | `0x00F` | 1    | mode (1)                          |
//! | `0x010` | 2048 | user data                         |
//! | `0x810` | 4    | EDC over `0x000..0x810`           |
//! | `0x814` | 8    | zero                              |
//! | `0x81C` | 172  | ECC P parity                      |
//! | `0x8C8` | 104  | ECC Q parity                      |

use tracing::instrument;

use crate::{
    disc::{RAW_SECTOR_SIZE, SECTOR_SIZE, TRACK_GAP},
    util::array_ref,
    Error, Result,
};

/// Sync pattern at the start of every raw data frame.
pub const SYNC: [u8; 12] = [0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x00];

/// Offset of the user data in a mode 1 frame.
pub const MODE1_DATA_OFFSET: usize = 0x10;

/// Offset of the user data in a mode 2 (form 1) frame.
pub const MODE2_DATA_OFFSET: usize = 0x18;

const HEADER_OFFSET: usize = 0x0C;
const MODE_OFFSET: usize = 0x0F;
const EDC_OFFSET: usize = 0x810;
const P_PARITY_OFFSET: usize = 0x81C;
const Q_PARITY_OFFSET: usize = 0x8C8;

const FRAMES_PER_SECOND: u32 = 75;
const SECONDS_PER_MINUTE: u32 = 60;

struct Tables {
    ecc_f: [u8; 256],
    ecc_b: [u8; 256],
    edc: [u32; 256],
}

const fn build_tables() -> Tables {
    let mut ecc_f = [0u8; 256];
    let mut ecc_b = [0u8; 256];
    let mut edc = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let j = ((i << 1) ^ if i & 0x80 != 0 { 0x11D } else { 0 }) as u8;
        ecc_f[i] = j;
        ecc_b[i ^ j as usize] = i as u8;
        let mut e = i as u32;
        let mut k = 0;
        while k < 8 {
            e = (e >> 1) ^ if e & 1 != 0 { 0xD8018001 } else { 0 };
            k += 1;
        }
        edc[i] = e;
        i += 1;
    }
    Tables { ecc_f, ecc_b, edc }
}

static TABLES: Tables = build_tables();

/// Converts a value to packed BCD. Values of 100 and above produce nibbles above 9, which
/// [`from_bcd`] inverts for values below 160.
#[inline]
pub const fn to_bcd(value: u8) -> u8 { (value % 10) | ((value / 10) << 4) }

/// Converts packed BCD to a value.
#[inline]
pub const fn from_bcd(value: u8) -> u8 { (value >> 4) * 10 + (value & 0x0F) }

/// Converts an LBA to minute, second and frame, including the 150 sector lead-in bias.
#[inline]
pub fn msf_from_lba(lba: u32) -> (u8, u8, u8) {
    let address = lba + TRACK_GAP;
    let frames_per_minute = FRAMES_PER_SECOND * SECONDS_PER_MINUTE;
    (
        (address / frames_per_minute) as u8,
        (address / FRAMES_PER_SECOND % SECONDS_PER_MINUTE) as u8,
        (address % FRAMES_PER_SECOND) as u8,
    )
}

/// Converts minute, second and frame back to an LBA.
#[inline]
pub fn lba_from_msf(minute: u8, second: u8, frame: u8) -> u32 {
    ((minute as u32 * SECONDS_PER_MINUTE + second as u32) * FRAMES_PER_SECOND + frame as u32)
        .saturating_sub(TRACK_GAP)
}

/// Computes the CD-ROM EDC (reflected CRC-32, polynomial `0xD8018001`).
pub fn compute_edc(data: &[u8]) -> u32 {
    let mut edc = 0u32;
    for &b in data {
        edc = (edc >> 8) ^ TABLES.edc[((edc ^ b as u32) & 0xFF) as usize];
    }
    edc
}

/// Computes one layer of Reed-Solomon product code parity.
///
/// `src` starts at the frame header; `dest` receives `2 * major_count` bytes.
fn compute_ecc_block(
    src: &[u8],
    major_count: usize,
    minor_count: usize,
    major_mult: usize,
    minor_inc: usize,
    dest: &mut [u8],
) {
    let size = major_count * minor_count;
    for major in 0..major_count {
        let mut index = (major >> 1) * major_mult + (major & 1);
        let mut ecc_a = 0u8;
        let mut ecc_b = 0u8;
        for _ in 0..minor_count {
            let temp = src[index];
            index += minor_inc;
            if index >= size {
                index -= size;
            }
            ecc_a ^= temp;
            ecc_b ^= temp;
            ecc_a = TABLES.ecc_f[ecc_a as usize];
        }
        ecc_a = TABLES.ecc_b[(TABLES.ecc_f[ecc_a as usize] ^ ecc_b) as usize];
        dest[major] = ecc_a;
        dest[major + major_count] = ecc_a ^ ecc_b;
    }
}

fn write_ecc(frame: &mut [u8; RAW_SECTOR_SIZE]) {
    let (src, dest) = frame.split_at_mut(P_PARITY_OFFSET);
    compute_ecc_block(&src[HEADER_OFFSET..], 86, 24, 2, 86, &mut dest[..172]);
    let (src, dest) = frame.split_at_mut(Q_PARITY_OFFSET);
    compute_ecc_block(&src[HEADER_OFFSET..], 52, 43, 86, 88, &mut dest[..104]);
}

/// Encodes a logical sector as a raw mode 1 frame into `out`.
///
/// `logical` shorter than a full sector is zero-padded.
#[instrument(name = "sector::encode_raw_into", skip_all)]
pub fn encode_raw_into(out: &mut [u8; RAW_SECTOR_SIZE], logical: &[u8], lba: u32) -> Result<()> {
    if logical.len() > SECTOR_SIZE {
        return Err(Error::Other(format!(
            "Logical sector is {} bytes, expected at most {}",
            logical.len(),
            SECTOR_SIZE
        )));
    }
    out[..SYNC.len()].copy_from_slice(&SYNC);
    let (minute, second, frame) = msf_from_lba(lba);
    out[HEADER_OFFSET] = to_bcd(minute);
    out[HEADER_OFFSET + 1] = to_bcd(second);
    out[HEADER_OFFSET + 2] = to_bcd(frame);
    out[MODE_OFFSET] = 1;
    out[MODE1_DATA_OFFSET..MODE1_DATA_OFFSET + logical.len()].copy_from_slice(logical);
    out[MODE1_DATA_OFFSET + logical.len()..EDC_OFFSET].fill(0);
    let edc = compute_edc(&out[..EDC_OFFSET]);
    out[EDC_OFFSET..EDC_OFFSET + 4].copy_from_slice(&edc.to_le_bytes());
    out[EDC_OFFSET + 4..P_PARITY_OFFSET].fill(0);
    write_ecc(out);
    Ok(())
}

/// Encodes a logical sector as a raw mode 1 frame.
#[inline]
pub fn encode_raw(logical: &[u8], lba: u32) -> Result<[u8; RAW_SECTOR_SIZE]> {
    let mut out = [0u8; RAW_SECTOR_SIZE];
    encode_raw_into(&mut out, logical, lba)?;
    Ok(out)
}

/// Decodes the LBA from a raw frame header.
#[inline]
pub fn header_lba(frame: &[u8; RAW_SECTOR_SIZE]) -> u32 {
    lba_from_msf(
        from_bcd(frame[HEADER_OFFSET]),
        from_bcd(frame[HEADER_OFFSET + 1]),
        from_bcd(frame[HEADER_OFFSET + 2]),
    )
}

/// Returns the offset of the user data in a raw frame, based on its mode byte.
#[inline]
pub fn user_data_offset(frame: &[u8]) -> usize {
    if frame.len() > MODE_OFFSET && frame[MODE_OFFSET] == 2 {
        MODE2_DATA_OFFSET
    } else {
        MODE1_DATA_OFFSET
    }
}

/// Re-derives the EDC and ECC of a mode 1 frame and compares them with the stored values.
pub fn verify_raw(frame: &[u8; RAW_SECTOR_SIZE]) -> bool {
    if frame[..SYNC.len()] != SYNC || frame[MODE_OFFSET] != 1 {
        return false;
    }
    let stored = u32::from_le_bytes(*array_ref!(frame, EDC_OFFSET, 4));
    if compute_edc(&frame[..EDC_OFFSET]) != stored {
        return false;
    }
    let mut check = *frame;
    write_ecc(&mut check);
    check[P_PARITY_OFFSET..] == frame[P_PARITY_OFFSET..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bcd() {
        assert_eq!(to_bcd(0), 0x00);
        assert_eq!(to_bcd(59), 0x59);
        assert_eq!(from_bcd(0x74), 74);
        for v in 0..160 {
            assert_eq!(from_bcd(to_bcd(v)), v);
        }
    }

    #[test]
    fn test_msf() {
        assert_eq!(msf_from_lba(0), (0, 2, 0));
        assert_eq!(msf_from_lba(45000), (10, 2, 0));
        assert_eq!(lba_from_msf(10, 2, 0), 45000);
        // Past 99 minutes near the end of the high-density area
        let (m, s, f) = msf_from_lba(549149);
        assert_eq!(m, 122);
        assert_eq!(lba_from_msf(m, s, f), 549149);
    }

    #[test]
    fn test_edc_known_value() {
        // CRC-32/CD-ROM-EDC check value
        assert_eq!(compute_edc(b"123456789"), 0x6EC2EDC4);
    }

    #[test]
    fn test_encode_raw() {
        let logical = (0..SECTOR_SIZE).map(|i| (i * 7) as u8).collect::<Vec<_>>();
        for lba in [0, 45000, 45016, 300000, 549149] {
            let frame = encode_raw(&logical, lba).unwrap();
            assert_eq!(frame.len(), RAW_SECTOR_SIZE);
            assert_eq!(&frame[..12], &SYNC);
            assert_eq!(frame[15], 1);
            assert_eq!(header_lba(&frame), lba);
            assert_eq!(&frame[16..16 + SECTOR_SIZE], logical.as_slice());
            assert_eq!(&frame[0x814..0x81C], &[0u8; 8]);
            assert!(verify_raw(&frame));
        }
    }

    #[test]
    fn test_encode_header_bytes() {
        let frame = encode_raw(&[0u8; SECTOR_SIZE], 45000).unwrap();
        assert_eq!(&frame[12..16], &[0x10, 0x02, 0x00, 0x01]);
    }

    #[test]
    fn test_encode_short_sector() {
        let frame = encode_raw(b"tail", 45100).unwrap();
        assert_eq!(&frame[16..20], b"tail");
        assert!(frame[20..16 + SECTOR_SIZE].iter().all(|&b| b == 0));
        assert!(verify_raw(&frame));
        assert!(encode_raw(&[0u8; SECTOR_SIZE + 1], 0).is_err());
    }

    #[test]
    fn test_verify_detects_corruption() {
        let mut frame = encode_raw(&[0x5A; SECTOR_SIZE], 46000).unwrap();
        frame[100] ^= 1;
        assert!(!verify_raw(&frame));
        let mut frame = encode_raw(&[0x5A; SECTOR_SIZE], 46000).unwrap();
        frame[Q_PARITY_OFFSET + 3] ^= 1;
        assert!(!verify_raw(&frame));
    }
}
