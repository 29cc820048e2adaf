//! Minimal DICOM Part-10 element reader.
//!
//! Only what identity extraction needs: the file meta group, the dataset
//! transfer syntax, and top-level element values up to Pixel Data. Nested
//! sequences are walked only to skip them.

use std::collections::BTreeMap;

use crate::error::{IntakeError, Result};

const PREAMBLE_LEN: usize = 128;
const MAGIC: &[u8; 4] = b"DICM";
const UNDEFINED_LENGTH: u32 = 0xFFFF_FFFF;
const MAX_NESTING: usize = 32;

const ITEM: Tag = Tag(0xFFFE, 0xE000);
const ITEM_DELIMITATION: Tag = Tag(0xFFFE, 0xE00D);
const SEQUENCE_DELIMITATION: Tag = Tag(0xFFFE, 0xE0DD);
const TRANSFER_SYNTAX_UID: Tag = Tag(0x0002, 0x0010);
pub(crate) const PIXEL_DATA: Tag = Tag(0x7FE0, 0x0010);

const IMPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2";
const EXPLICIT_VR_BIG_ENDIAN: &str = "1.2.840.10008.1.2.2";
const DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1.99";

/// (group, element) pair. Ordering matches on-disk ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tag(pub u16, pub u16);

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:04X},{:04X})", self.0, self.1)
    }
}

pub mod tags {
    use super::Tag;

    pub const SOP_INSTANCE_UID: Tag = Tag(0x0008, 0x0018);
    pub const STUDY_DATE: Tag = Tag(0x0008, 0x0020);
    pub const ACQUISITION_DATETIME: Tag = Tag(0x0008, 0x002A);
    pub const MODALITY: Tag = Tag(0x0008, 0x0060);
    pub const MANUFACTURER: Tag = Tag(0x0008, 0x0070);
    pub const INSTITUTION_NAME: Tag = Tag(0x0008, 0x0080);
    pub const STUDY_DESCRIPTION: Tag = Tag(0x0008, 0x1030);
    pub const PATIENT_NAME: Tag = Tag(0x0010, 0x0010);
    pub const PATIENT_ID: Tag = Tag(0x0010, 0x0020);
    pub const VIEW_POSITION: Tag = Tag(0x0018, 0x5101);
    pub const STUDY_INSTANCE_UID: Tag = Tag(0x0020, 0x000D);
    pub const INSTANCE_NUMBER: Tag = Tag(0x0020, 0x0013);
    pub const NUMBER_OF_FRAMES: Tag = Tag(0x0028, 0x0008);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    ImplicitLittle,
    ExplicitLittle,
    ExplicitBig,
}

impl Encoding {
    fn from_transfer_syntax(uid: &str) -> Result<Self> {
        match uid {
            IMPLICIT_VR_LITTLE_ENDIAN => Ok(Encoding::ImplicitLittle),
            EXPLICIT_VR_BIG_ENDIAN => Ok(Encoding::ExplicitBig),
            DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN => Err(malformed(
                "deflated transfer syntax is not supported",
            )),
            // Every other transfer syntax (including encapsulated pixel
            // formats) stores the dataset header as explicit VR LE.
            _ => Ok(Encoding::ExplicitLittle),
        }
    }

    fn is_explicit(self) -> bool {
        !matches!(self, Encoding::ImplicitLittle)
    }

    fn is_big_endian(self) -> bool {
        matches!(self, Encoding::ExplicitBig)
    }
}

/// Top-level elements of a parsed object, borrowed from the input buffer.
#[derive(Debug, Default)]
pub struct DataSet<'a> {
    elements: BTreeMap<Tag, &'a [u8]>,
}

impl<'a> DataSet<'a> {
    pub fn raw(&self, tag: Tag) -> Option<&'a [u8]> {
        self.elements.get(&tag).copied()
    }

    /// Text value with DICOM padding (trailing NUL/space) removed. Empty
    /// values are reported as absent.
    pub fn text(&self, tag: Tag) -> Option<String> {
        let raw = self.raw(tag)?;
        let decoded = String::from_utf8_lossy(raw);
        let trimmed = decoded
            .trim_end_matches(['\0', ' '])
            .trim_start_matches(' ');
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }

    pub fn contains(&self, tag: Tag) -> bool {
        self.elements.contains_key(&tag)
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

/// Parse the header of a DICOM object, with or without the Part-10 preamble.
pub fn parse(bytes: &[u8]) -> Result<DataSet<'_>> {
    let mut dataset = DataSet::default();

    let (start, encoding) = if bytes.len() >= PREAMBLE_LEN + MAGIC.len()
        && &bytes[PREAMBLE_LEN..PREAMBLE_LEN + MAGIC.len()] == MAGIC
    {
        read_meta_group(bytes, PREAMBLE_LEN + MAGIC.len(), &mut dataset)?
    } else {
        sniff_bare_dataset(bytes, &mut dataset)?
    };

    let mut reader = Reader::new(bytes, start, encoding);
    while let Some(element) = reader.next_element(0)? {
        if element.tag >= PIXEL_DATA {
            break;
        }
        if element.tag.0 == 0xFFFE {
            return Err(malformed(format!(
                "unexpected delimiter {} at top level",
                element.tag
            )));
        }
        dataset.elements.insert(element.tag, element.value);
    }

    Ok(dataset)
}

fn read_meta_group<'a>(
    bytes: &'a [u8],
    start: usize,
    dataset: &mut DataSet<'a>,
) -> Result<(usize, Encoding)> {
    // The file meta group is always explicit VR little endian.
    let mut reader = Reader::new(bytes, start, Encoding::ExplicitLittle);
    while reader.peek_group() == Some(0x0002) {
        let Some(element) = reader.next_element(0)? else {
            break;
        };
        dataset.elements.insert(element.tag, element.value);
    }

    let encoding = match dataset.text(TRANSFER_SYNTAX_UID) {
        Some(uid) => Encoding::from_transfer_syntax(&uid)?,
        None => Encoding::ExplicitLittle,
    };
    Ok((reader.pos, encoding))
}

fn sniff_bare_dataset<'a>(
    bytes: &'a [u8],
    dataset: &mut DataSet<'a>,
) -> Result<(usize, Encoding)> {
    if bytes.len() < 8 {
        return Err(malformed("input too short to be a DICOM object"));
    }

    let group = u16::from_le_bytes([bytes[0], bytes[1]]);
    if group == 0x0002 {
        return read_meta_group(bytes, 0, dataset);
    }
    if group != 0x0008 {
        return Err(malformed("missing DICM magic and no recognisable dataset"));
    }

    let looks_explicit =
        bytes[4].is_ascii_uppercase() && bytes[5].is_ascii_uppercase();
    let encoding = if looks_explicit {
        Encoding::ExplicitLittle
    } else {
        Encoding::ImplicitLittle
    };
    Ok((0, encoding))
}

struct RawElement<'a> {
    tag: Tag,
    value: &'a [u8],
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    encoding: Encoding,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], pos: usize, encoding: Encoding) -> Self {
        Self { buf, pos, encoding }
    }

    fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    fn peek_group(&self) -> Option<u16> {
        let bytes = self.buf.get(self.pos..self.pos + 2)?;
        Some(self.decode_u16([bytes[0], bytes[1]]))
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(malformed(format!(
                "truncated at offset {}: wanted {len} bytes, {} left",
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn decode_u16(&self, raw: [u8; 2]) -> u16 {
        if self.encoding.is_big_endian() {
            u16::from_be_bytes(raw)
        } else {
            u16::from_le_bytes(raw)
        }
    }

    fn read_u16(&mut self) -> Result<u16> {
        let raw = self.take(2)?;
        Ok(self.decode_u16([raw[0], raw[1]]))
    }

    fn read_u32(&mut self) -> Result<u32> {
        let raw = self.take(4)?;
        let raw = [raw[0], raw[1], raw[2], raw[3]];
        Ok(if self.encoding.is_big_endian() {
            u32::from_be_bytes(raw)
        } else {
            u32::from_le_bytes(raw)
        })
    }

    fn read_tag(&mut self) -> Result<Tag> {
        let group = self.read_u16()?;
        let element = self.read_u16()?;
        Ok(Tag(group, element))
    }

    fn next_element(&mut self, depth: usize) -> Result<Option<RawElement<'a>>> {
        if self.remaining() == 0 {
            return Ok(None);
        }

        let tag = self.read_tag()?;

        // Items and delimiters carry no VR in any encoding.
        if tag.0 == 0xFFFE {
            let len = self.read_u32()?;
            if tag == ITEM && len != UNDEFINED_LENGTH {
                let value = self.take(len as usize)?;
                return Ok(Some(RawElement { tag, value }));
            }
            return Ok(Some(RawElement { tag, value: &[] }));
        }

        let (len, is_sequence) = if self.encoding.is_explicit() {
            let vr = self.take(2)?;
            let vr = [vr[0], vr[1]];
            let len = if has_long_length(&vr) {
                self.take(2)?;
                self.read_u32()?
            } else {
                u32::from(self.read_u16()?)
            };
            (len, &vr == b"SQ")
        } else {
            (self.read_u32()?, false)
        };

        if len == UNDEFINED_LENGTH {
            if tag == PIXEL_DATA {
                // Encapsulated pixel data; callers stop here anyway.
                return Ok(Some(RawElement { tag, value: &[] }));
            }
            self.skip_undefined_sequence(depth + 1)?;
            return Ok(Some(RawElement { tag, value: &[] }));
        }

        let value = self.take(len as usize)?;
        if is_sequence {
            return Ok(Some(RawElement { tag, value: &[] }));
        }
        Ok(Some(RawElement { tag, value }))
    }

    fn skip_undefined_sequence(&mut self, depth: usize) -> Result<()> {
        if depth > MAX_NESTING {
            return Err(malformed("sequence nesting too deep"));
        }

        loop {
            let tag = self.read_tag()?;
            let len = self.read_u32()?;
            match tag {
                SEQUENCE_DELIMITATION => return Ok(()),
                ITEM if len == UNDEFINED_LENGTH => self.skip_undefined_item(depth)?,
                ITEM => {
                    self.take(len as usize)?;
                }
                other => {
                    return Err(malformed(format!(
                        "expected sequence item, found {other}"
                    )));
                }
            }
        }
    }

    fn skip_undefined_item(&mut self, depth: usize) -> Result<()> {
        loop {
            match self.next_element(depth)? {
                Some(element) if element.tag == ITEM_DELIMITATION => return Ok(()),
                Some(_) => continue,
                None => return Err(malformed("item delimiter missing")),
            }
        }
    }
}

fn has_long_length(vr: &[u8; 2]) -> bool {
    matches!(
        vr,
        b"OB" | b"OD" | b"OF" | b"OL" | b"OV" | b"OW" | b"SQ" | b"SV" | b"UC"
            | b"UN" | b"UR" | b"UT" | b"UV"
    )
}

fn malformed(msg: impl Into<String>) -> IntakeError {
    IntakeError::MalformedInput(msg.into())
}


#[cfg(test)]
mod tests {
    use super::fixture::DicomFixture;
    use super::*;

    #[test]
    fn reads_identity_from_explicit_little_endian() {
        let bytes = DicomFixture::new("1.2.3", "1.2.3.4")
            .with(tags::MODALITY, *b"CS", "CR")
            .to_bytes();
        let ds = parse(&bytes).unwrap();
        assert_eq!(ds.text(tags::STUDY_INSTANCE_UID).as_deref(), Some("1.2.3"));
        assert_eq!(ds.text(tags::SOP_INSTANCE_UID).as_deref(), Some("1.2.3.4"));
        assert_eq!(ds.text(tags::MODALITY).as_deref(), Some("CR"));
    }

    #[test]
    fn reads_implicit_and_big_endian_datasets() {
        for fixture in [
            DicomFixture::new("9.8", "9.8.7").implicit(),
            DicomFixture::new("9.8", "9.8.7").big_endian(),
        ] {
            let bytes = fixture.to_bytes();
            let ds = parse(&bytes).unwrap();
            assert_eq!(ds.text(tags::SOP_INSTANCE_UID).as_deref(), Some("9.8.7"));
        }
    }

    #[test]
    fn accepts_bare_dataset_without_preamble() {
        let bytes = DicomFixture::new("5.5", "5.5.1")
            .without_preamble()
            .to_bytes();
        let ds = parse(&bytes).unwrap();
        assert_eq!(ds.text(tags::STUDY_INSTANCE_UID).as_deref(), Some("5.5"));
    }

    #[test]
    fn stops_at_pixel_data_and_skips_sequences() {
        let bytes = DicomFixture::new("1.1", "1.1.1")
            .with_undefined_sequence(Tag(0x0008, 0x1032))
            .with(tags::PATIENT_ID, *b"LO", "P-42")
            .with_pixel_data(64)
            .to_bytes();
        let ds = parse(&bytes).unwrap();
        assert_eq!(ds.text(tags::PATIENT_ID).as_deref(), Some("P-42"));
        assert!(!ds.contains(PIXEL_DATA));
    }

    #[test]
    fn truncation_is_malformed() {
        let bytes = DicomFixture::new("1.1", "1.1.1")
            .with(tags::PATIENT_ID, *b"LO", "P-42")
            .to_bytes();
        let cut = &bytes[..bytes.len() - 3];
        assert!(matches!(parse(cut), Err(IntakeError::MalformedInput(_))));
    }

    #[test]
    fn rejects_non_dicom_bytes() {
        let err = parse(b"just a text file, nothing to see").unwrap_err();
        assert!(matches!(err, IntakeError::MalformedInput(_)));
        assert!(matches!(parse(b""), Err(IntakeError::MalformedInput(_))));
    }
}
