//! Frame persistence.
//!
//! Thermal frames are written as 16-bit grayscale PNG with an `eXIf` chunk
//! carrying the capture time as DateTimeOriginal (tag 36867) in the Exif
//! sub-IFD. Color frames are written as plain 8-bit images chosen by file
//! extension.

use crate::frame::{RawColorFrame, RawThermalFrame};
use crate::sensor::SensorError;
use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt};
use chrono::NaiveDateTime;
use ndarray::Array2;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};

/// EXIF DateTimeOriginal.
pub const DATETIME_ORIGINAL_TAG: u16 = 0x9003;
/// Pointer from IFD0 to the Exif sub-IFD.
const EXIF_IFD_POINTER_TAG: u16 = 0x8769;
const TIFF_ASCII: u16 = 2;
const TIFF_LONG: u16 = 4;

/// Capture-time format, microsecond precision.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";
const TIMESTAMP_PARSE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

const EXIF_CHUNK: png::chunk::ChunkType = png::chunk::ChunkType(*b"eXIf");
const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n'];

/// `ir{index}.png`
pub fn thermal_file_name(index: u64) -> String {
    format!("ir{index}.png")
}

/// `rgb{index}.jpg`
pub fn color_file_name(index: u64) -> String {
    format!("rgb{index}.jpg")
}

pub fn format_timestamp(ts: NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s.trim_end_matches('\0').trim(), TIMESTAMP_PARSE_FORMAT).ok()
}

/// Build a little-endian TIFF structure: IFD0 holds only the Exif IFD
/// pointer, and the Exif sub-IFD holds DateTimeOriginal = `value`
/// (NUL-terminated ASCII).
pub fn encode_exif_datetime(value: &str) -> Vec<u8> {
    let ascii: Vec<u8> = value.bytes().chain(std::iter::once(0)).collect();
    // header (8), then each single-entry IFD is count (2) + entry (12) + next offset (4)
    let sub_ifd: u32 = 8 + 18;
    let data_offset: u32 = sub_ifd + 18;

    let mut out = Vec::with_capacity(data_offset as usize + ascii.len());
    out.extend_from_slice(b"II");
    out.extend_from_slice(&42u16.to_le_bytes());
    out.extend_from_slice(&8u32.to_le_bytes());

    push_ifd_entry(&mut out, EXIF_IFD_POINTER_TAG, TIFF_LONG, 1, sub_ifd.to_le_bytes());

    let value_field = if ascii.len() <= 4 {
        let mut inline = [0u8; 4];
        inline[..ascii.len()].copy_from_slice(&ascii);
        inline
    } else {
        data_offset.to_le_bytes()
    };
    push_ifd_entry(
        &mut out,
        DATETIME_ORIGINAL_TAG,
        TIFF_ASCII,
        ascii.len() as u32,
        value_field,
    );

    if ascii.len() > 4 {
        out.extend_from_slice(&ascii);
    }
    out
}

/// One-entry IFD with no successor.
fn push_ifd_entry(out: &mut Vec<u8>, tag: u16, kind: u16, count: u32, value: [u8; 4]) {
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&tag.to_le_bytes());
    out.extend_from_slice(&kind.to_le_bytes());
    out.extend_from_slice(&count.to_le_bytes());
    out.extend_from_slice(&value);
    out.extend_from_slice(&0u32.to_le_bytes());
}

/// Extract the DateTimeOriginal string from a TIFF-structured EXIF blob.
///
/// Looks in IFD0 first, then in the Exif sub-IFD. Accepts both byte orders.
pub fn decode_exif_datetime(exif: &[u8]) -> Option<String> {
    let exif = exif.strip_prefix(b"Exif\0\0").unwrap_or(exif);
    match exif.get(..2)? {
        b"II" => find_datetime::<LittleEndian>(exif),
        b"MM" => find_datetime::<BigEndian>(exif),
        _ => None,
    }
}

fn find_datetime<E: ByteOrder>(tiff: &[u8]) -> Option<String> {
    if E::read_u16(tiff.get(2..4)?) != 42 {
        return None;
    }
    let ifd0 = E::read_u32(tiff.get(4..8)?) as usize;
    let mut sub_ifd = None;

    for ifd in [Some(ifd0), None] {
        let Some(offset) = ifd.or(sub_ifd) else {
            break;
        };
        let count = E::read_u16(tiff.get(offset..offset + 2)?) as usize;
        for i in 0..count {
            let entry = tiff.get(offset + 2 + i * 12..offset + 14 + i * 12)?;
            let tag = E::read_u16(&entry[0..2]);
            let kind = E::read_u16(&entry[2..4]);
            let len = E::read_u32(&entry[4..8]) as usize;
            match (tag, kind) {
                (DATETIME_ORIGINAL_TAG, TIFF_ASCII) => {
                    let raw = if len <= 4 {
                        &entry[8..8 + len]
                    } else {
                        let at = E::read_u32(&entry[8..12]) as usize;
                        tiff.get(at..at + len)?
                    };
                    let text = String::from_utf8_lossy(raw);
                    return Some(text.trim_end_matches('\0').to_string());
                }
                (EXIF_IFD_POINTER_TAG, TIFF_LONG) => {
                    sub_ifd = Some(E::read_u32(&entry[8..12]) as usize);
                }
                _ => {}
            }
        }
    }
    None
}

/// Write a radiometric frame as a 16-bit grayscale PNG with embedded capture time.
pub fn save_thermal_png(
    path: &Path,
    frame: &RawThermalFrame,
    captured_at: NaiveDateTime,
) -> Result<(), SensorError> {
    let (height, width) = frame.dim();
    let file = File::create(path)?;
    let mut encoder = png::Encoder::new(BufWriter::new(file), width as u32, height as u32);
    encoder.set_color(png::ColorType::Grayscale);
    encoder.set_depth(png::BitDepth::Sixteen);

    let mut writer = encoder.write_header().map_err(png_err)?;
    let exif = encode_exif_datetime(&format_timestamp(captured_at));
    writer.write_chunk(EXIF_CHUNK, &exif).map_err(png_err)?;

    // PNG stores 16-bit samples big-endian.
    let mut data = Vec::with_capacity(width * height * 2);
    for &sample in frame.iter() {
        data.extend_from_slice(&sample.to_be_bytes());
    }
    writer.write_image_data(&data).map_err(png_err)?;
    writer.finish().map_err(png_err)?;
    Ok(())
}

/// Write a color frame; the format follows the file extension.
pub fn save_color_image(path: &Path, frame: &RawColorFrame) -> Result<(), SensorError> {
    frame.save(path)?;
    Ok(())
}

/// A thermal frame reloaded from disk.
#[derive(Debug, Clone)]
pub struct PersistedThermal {
    pub frame: RawThermalFrame,
    pub captured_at: Option<NaiveDateTime>,
}

/// Reload a thermal frame written by [`save_thermal_png`].
pub fn load_thermal_frame(path: &Path) -> Result<PersistedThermal, SensorError> {
    let decoder = png::Decoder::new(BufReader::new(File::open(path)?));
    let mut reader = decoder.read_info().map_err(png_decode_err)?;

    let mut buf = vec![0u8; reader.output_buffer_size()];
    let info = reader.next_frame(&mut buf).map_err(png_decode_err)?;
    if info.color_type != png::ColorType::Grayscale || info.bit_depth != png::BitDepth::Sixteen {
        return Err(SensorError::Persist(format!(
            "{}: expected 16-bit grayscale, got {:?}/{:?}",
            path.display(),
            info.color_type,
            info.bit_depth
        )));
    }

    let (width, height) = (info.width as usize, info.height as usize);
    let samples: Vec<u16> = buf[..info.buffer_size()]
        .chunks_exact(2)
        .map(|px| u16::from_be_bytes([px[0], px[1]]))
        .collect();
    let frame = Array2::from_shape_vec((height, width), samples)
        .map_err(|e| SensorError::Persist(e.to_string()))?;

    Ok(PersistedThermal {
        frame,
        captured_at: read_timestamp(path)?,
    })
}

/// Read the embedded capture time of a persisted thermal frame.
pub fn read_timestamp(path: &Path) -> Result<Option<NaiveDateTime>, SensorError> {
    let mut file = BufReader::new(File::open(path)?);
    let exif = read_exif_chunk(&mut file)
        .map_err(|e| SensorError::Persist(format!("{}: {e}", path.display())))?;
    Ok(exif
        .and_then(|blob| decode_exif_datetime(&blob))
        .and_then(|s| parse_timestamp(&s)))
}

/// Walk the PNG chunk list up to the image data and return the `eXIf`
/// payload, if any.
pub fn read_exif_chunk<R: Read>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut signature = [0u8; 8];
    reader.read_exact(&mut signature)?;
    if signature != PNG_SIGNATURE {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "not a PNG file"));
    }

    loop {
        let len = reader.read_u32::<BigEndian>()? as u64;
        let mut kind = [0u8; 4];
        reader.read_exact(&mut kind)?;
        match &kind {
            b"eXIf" => {
                let mut data = vec![0u8; len as usize];
                reader.read_exact(&mut data)?;
                return Ok(Some(data));
            }
            // eXIf must precede the image data.
            b"IDAT" | b"IEND" => return Ok(None),
            _ => {
                // Payload plus CRC.
                let skipped = io::copy(&mut reader.by_ref().take(len + 4), &mut io::sink())?;
                if skipped != len + 4 {
                    return Err(io::ErrorKind::UnexpectedEof.into());
                }
            }
        }
    }
}

/// Reload `ir0.png, ir1.png, …` from a session directory, stopping at the
/// first missing index.
pub fn load_thermal_session(dir: &Path) -> Result<Vec<PersistedThermal>, SensorError> {
    let mut frames = Vec::new();
    for index in 0.. {
        let path: PathBuf = dir.join(thermal_file_name(index));
        if !path.exists() {
            break;
        }
        frames.push(load_thermal_frame(&path)?);
    }
    tracing::debug!(dir = %dir.display(), count = frames.len(), "loaded thermal session");
    Ok(frames)
}

fn png_err(e: png::EncodingError) -> SensorError {
    SensorError::Persist(e.to_string())
}

fn png_decode_err(e: png::DecodingError) -> SensorError {
    SensorError::Persist(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;
    use chrono::NaiveDate;

    fn sample_time() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_micro_opt(14, 5, 7, 123_456)
            .unwrap()
    }

    #[test]
    fn test_timestamp_format() {
        assert_eq!(format_timestamp(sample_time()), "2024-03-09 14:05:07.123456");
        assert_eq!(parse_timestamp("2024-03-09 14:05:07.123456"), Some(sample_time()));
    }

    #[test]
    fn test_exif_layout() {
        let exif = encode_exif_datetime("2024-03-09 14:05:07.123456");
        assert_eq!(&exif[..4], b"II*\0");
        // IFD0 points at the Exif sub-IFD.
        assert_eq!(LittleEndian::read_u16(&exif[10..12]), EXIF_IFD_POINTER_TAG);
        assert_eq!(LittleEndian::read_u32(&exif[18..22]), 26);
        // DateTimeOriginal lives in the sub-IFD, its string after it.
        assert_eq!(LittleEndian::read_u16(&exif[28..30]), DATETIME_ORIGINAL_TAG);
        assert_eq!(LittleEndian::read_u32(&exif[32..36]), 27);
        assert_eq!(LittleEndian::read_u32(&exif[36..40]), 44);
        assert_eq!(exif.len(), 44 + 27);
        assert_eq!(
            decode_exif_datetime(&exif).as_deref(),
            Some("2024-03-09 14:05:07.123456")
        );
    }

    #[test]
    fn test_exif_inline_short_value() {
        let exif = encode_exif_datetime("abc");
        assert_eq!(decode_exif_datetime(&exif).as_deref(), Some("abc"));
    }

    #[test]
    fn test_exif_big_endian_sub_ifd() {
        // MM header, IFD0 with an Exif pointer, sub-IFD with DateTimeOriginal.
        let value = b"2024-03-09 14:05:07.000001\0";
        let mut tiff = Vec::new();
        tiff.extend_from_slice(b"MM");
        tiff.write_u16::<BigEndian>(42).unwrap();
        tiff.write_u32::<BigEndian>(8).unwrap();
        // IFD0 @8: one entry, pointer to sub-IFD @26
        tiff.write_u16::<BigEndian>(1).unwrap();
        tiff.write_u16::<BigEndian>(EXIF_IFD_POINTER_TAG).unwrap();
        tiff.write_u16::<BigEndian>(TIFF_LONG).unwrap();
        tiff.write_u32::<BigEndian>(1).unwrap();
        tiff.write_u32::<BigEndian>(26).unwrap();
        tiff.write_u32::<BigEndian>(0).unwrap();
        // sub-IFD @26: one entry, string @44
        tiff.write_u16::<BigEndian>(1).unwrap();
        tiff.write_u16::<BigEndian>(DATETIME_ORIGINAL_TAG).unwrap();
        tiff.write_u16::<BigEndian>(TIFF_ASCII).unwrap();
        tiff.write_u32::<BigEndian>(value.len() as u32).unwrap();
        tiff.write_u32::<BigEndian>(44).unwrap();
        tiff.write_u32::<BigEndian>(0).unwrap();
        tiff.extend_from_slice(value);

        assert_eq!(
            decode_exif_datetime(&tiff).as_deref(),
            Some("2024-03-09 14:05:07.000001")
        );
    }

    #[test]
    fn test_exif_garbage() {
        assert_eq!(decode_exif_datetime(b""), None);
        assert_eq!(decode_exif_datetime(b"XX*\0\x08\0\0\0"), None);
    }

    #[test]
    fn test_thermal_png_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(thermal_file_name(0));
        let frame = Array2::from_shape_fn((120, 160), |(r, c)| (27315 + r * 160 + c) as u16);

        save_thermal_png(&path, &frame, sample_time()).unwrap();

        let loaded = load_thermal_frame(&path).unwrap();
        assert_eq!(loaded.frame, frame);
        assert_eq!(loaded.captured_at, Some(sample_time()));
        assert_eq!(read_timestamp(&path).unwrap(), Some(sample_time()));
    }

    #[test]
    fn test_exif_chunk_found_before_image_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ir7.png");
        save_thermal_png(&path, &Array2::from_elem((4, 4), 30000u16), sample_time()).unwrap();

        let blob = read_exif_chunk(&mut File::open(&path).unwrap()).unwrap().unwrap();
        assert_eq!(blob, encode_exif_datetime("2024-03-09 14:05:07.123456"));
    }

    #[test]
    fn test_png_without_exif_has_no_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.png");
        image::GrayImage::new(3, 2).save(&path).unwrap();
        assert_eq!(read_timestamp(&path).unwrap(), None);

        let not_png = dir.path().join("rgb0.jpg");
        image::RgbImage::new(3, 2).save(&not_png).unwrap();
        assert!(read_timestamp(&not_png).is_err());
    }

    #[test]
    fn test_load_session_stops_at_gap() {
        let dir = tempfile::tempdir().unwrap();
        let frame = Array2::from_elem((2, 3), 7u16);
        for i in [0, 1, 3] {
            save_thermal_png(&dir.path().join(thermal_file_name(i)), &frame, sample_time())
                .unwrap();
        }
        let frames = load_thermal_session(dir.path()).unwrap();
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn test_color_image_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(color_file_name(4));
        let frame = image::RgbImage::from_pixel(8, 6, image::Rgb([10, 20, 30]));
        save_color_image(&path, &frame).unwrap();
        let back = image::open(&path).unwrap();
        assert_eq!((back.width(), back.height()), (8, 6));
        assert!(path.ends_with("rgb4.jpg"));
    }
}
