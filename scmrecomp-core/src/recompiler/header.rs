//! SCM Header Parser
//!
//! The script image opens with a chain of header segments, each introduced
//! by a `GOTO` sled jumping to the next one:
//! - segment 1 is the global-variable space (its declared size includes the
//!   leading 8-byte sled: the 7-byte `GOTO` plus one unused byte);
//! - segment 2 is the model table (u32 count, zero-padded 24-byte names);
//! - segment 3 carries the main-segment byte length and the mission offset
//!   table (u32 count, then that many u32 offsets).
//!
//! The `Miami` revision inserts a one-byte segment tag after each sled;
//! `Liberty` has none. Parsing fails when the structure is truncated or the
//! sled sentinels do not match.

use crate::recompiler::error::{Advisory, AdvisoryKind, ProgramContext, RecompilerError};
use crate::recompiler::fetcher::BinaryFetcher;

const MODEL_NAME_LEN: usize = 24;

/// Header revision of the script image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Liberty,
    Miami,
}

/// Decoded SCM header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScmHeader {
    pub version: Version,
    /// Size of the global variable space, including the leading jump sled.
    pub size_global_vars_space: u32,
    pub models: Vec<String>,
    /// Byte length of the main code segment.
    pub main_size: u32,
    /// Byte offsets of the mission segments within the image.
    pub mission_offsets: Vec<u32>,
}

impl ScmHeader {
    /// Decodes the header segments at the top of `bytecode`.
    pub fn from_bytecode(bytecode: &[u8], version: Version) -> Result<Self, RecompilerError> {
        let bf = BinaryFetcher::new(bytecode);

        // Segment 1: globals. The sled target is the start of segment 2,
        // which equals the size of the global variable space.
        let (seg2_offset, _) = read_segment_sled(&bf, 0, version)?;
        let size_global_vars_space = seg2_offset;

        // Segment 2: model table.
        let (seg3_offset, mut cursor) = read_segment_sled(&bf, seg2_offset as usize, version)?;
        let model_count = bf
            .fetch_u32(cursor)
            .ok_or_else(|| truncated("model count", cursor))? as usize;
        cursor += 4;

        let mut models = Vec::with_capacity(model_count);
        for index in 0..model_count {
            let name = bf
                .fetch_chars(cursor, MODEL_NAME_LEN)
                .ok_or_else(|| truncated(&format!("model name {index}"), cursor))?;
            models.push(name);
            cursor += MODEL_NAME_LEN;
        }

        // Segment 3: main size and mission table.
        let (_, mut cursor) = read_segment_sled(&bf, seg3_offset as usize, version)?;
        let main_size = bf
            .fetch_u32(cursor)
            .ok_or_else(|| truncated("main segment size", cursor))?;
        cursor += 4;

        let mission_count = bf
            .fetch_u32(cursor)
            .ok_or_else(|| truncated("mission count", cursor))? as usize;
        cursor += 4;

        let mut mission_offsets = Vec::with_capacity(mission_count);
        for index in 0..mission_count {
            let offset = bf
                .fetch_u32(cursor)
                .ok_or_else(|| truncated(&format!("mission offset {index}"), cursor))?;
            mission_offsets.push(offset);
            cursor += 4;
        }

        Ok(Self {
            version,
            size_global_vars_space,
            models,
            main_size,
            mission_offsets,
        })
    }
}

/// Validates the `GOTO` sled opening a header segment and returns
/// `(jump_target, body_offset)`.
fn read_segment_sled(
    bf: &BinaryFetcher<'_>,
    seg_offset: usize,
    version: Version,
) -> Result<(u32, usize), RecompilerError> {
    let opcode = bf
        .fetch_u16(seg_offset)
        .ok_or_else(|| truncated("segment sled opcode", seg_offset))?;
    if opcode != 0x0002 {
        return Err(RecompilerError::HeaderParseError(format!(
            "segment at 0x{seg_offset:X}: expected GOTO sentinel, found opcode 0x{opcode:04X}"
        )));
    }

    let tag = bf
        .fetch_u8(seg_offset + 2)
        .ok_or_else(|| truncated("segment sled tag", seg_offset + 2))?;
    if tag != 0x01 {
        return Err(RecompilerError::HeaderParseError(format!(
            "segment at 0x{seg_offset:X}: expected i32 tag on sled, found 0x{tag:02X}"
        )));
    }

    let target = bf
        .fetch_u32(seg_offset + 3)
        .ok_or_else(|| truncated("segment sled target", seg_offset + 3))?;

    let mut body = seg_offset + 7;
    if version == Version::Miami {
        // Miami carries a segment tag byte between the sled and the body.
        body += 1;
    }
    Ok((target, body))
}

fn truncated(what: &str, offset: usize) -> RecompilerError {
    RecompilerError::HeaderParseError(format!("truncated header: {what} at 0x{offset:X}"))
}

/// Splits the image into one fetcher per mission segment, in header order.
///
/// Each mission extends from its offset to the next-higher mission offset
/// (the last one to the end of the image). Offsets outside the image yield
/// an empty fetcher so mission indices stay aligned with the header table;
/// the skip is reported to the program context.
pub fn mission_segment_fetcher<'a>(
    bytecode: &'a [u8],
    header: &ScmHeader,
    program: &mut ProgramContext,
) -> Vec<BinaryFetcher<'a>> {
    let mut sorted: Vec<u32> = header.mission_offsets.clone();
    sorted.sort_unstable();

    header
        .mission_offsets
        .iter()
        .map(|&offset| {
            if (offset as usize) >= bytecode.len() {
                program.report(Advisory::new(
                    offset,
                    AdvisoryKind::Truncated,
                    format!("mission offset 0x{offset:X} outside the image"),
                ));
                return BinaryFetcher::new(&[]);
            }
            let end = sorted
                .iter()
                .find(|&&o| o > offset)
                .map(|&o| (o as usize).min(bytecode.len()))
                .unwrap_or(bytecode.len());
            BinaryFetcher::new(&bytecode[offset as usize..end])
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sled(target: u32, version: Version) -> Vec<u8> {
        let mut bytes = vec![0x02, 0x00, 0x01];
        bytes.extend_from_slice(&target.to_le_bytes());
        if version == Version::Miami {
            bytes.push(0x6D);
        }
        bytes
    }

    fn build_header(version: Version, missions: &[u32]) -> Vec<u8> {
        let sled_len = if version == Version::Miami { 8 } else { 7 };
        let seg2 = sled_len as u32 + 1; // one pad byte of globals
        let seg3 = seg2 + sled_len as u32 + 4 + 24; // one model name

        let mut bytes = sled(seg2, version);
        bytes.push(0x00); // globals
        bytes.extend_from_slice(&sled(seg3, version));
        bytes.extend_from_slice(&1u32.to_le_bytes());
        let mut padded = [0u8; 24];
        padded[..6].copy_from_slice(b"PLAYER");
        bytes.extend_from_slice(&padded);
        bytes.extend_from_slice(&sled(0, version));
        bytes.extend_from_slice(&0x100u32.to_le_bytes()); // main size
        bytes.extend_from_slice(&(missions.len() as u32).to_le_bytes());
        for &m in missions {
            bytes.extend_from_slice(&m.to_le_bytes());
        }
        bytes
    }

    #[test]
    fn parse_liberty_header() {
        let bytes = build_header(Version::Liberty, &[0x200, 0x300]);
        let header = ScmHeader::from_bytecode(&bytes, Version::Liberty).unwrap();
        assert_eq!(header.size_global_vars_space, 8);
        assert_eq!(header.models, vec!["PLAYER".to_string()]);
        assert_eq!(header.main_size, 0x100);
        assert_eq!(header.mission_offsets, vec![0x200, 0x300]);
    }

    #[test]
    fn parse_miami_header() {
        let bytes = build_header(Version::Miami, &[0x400]);
        let header = ScmHeader::from_bytecode(&bytes, Version::Miami).unwrap();
        assert_eq!(header.size_global_vars_space, 9);
        assert_eq!(header.mission_offsets, vec![0x400]);
    }

    #[test]
    fn sentinel_mismatch_fails() {
        let mut bytes = build_header(Version::Liberty, &[]);
        bytes[0] = 0x03;
        assert!(ScmHeader::from_bytecode(&bytes, Version::Liberty).is_err());
    }

    #[test]
    fn truncated_header_fails() {
        let bytes = build_header(Version::Liberty, &[]);
        assert!(ScmHeader::from_bytecode(&bytes[..10], Version::Liberty).is_err());
    }

    #[test]
    fn mission_fetchers_cover_back_to_back_segments() {
        let header = ScmHeader {
            version: Version::Liberty,
            size_global_vars_space: 8,
            models: vec![],
            main_size: 4,
            mission_offsets: vec![8, 4],
        };
        let image = [0u8; 12];
        let mut program = ProgramContext::new();
        let fetchers = mission_segment_fetcher(&image, &header, &mut program);
        assert_eq!(fetchers.len(), 2);
        assert_eq!(fetchers[0].size(), 4, "mission at 8 runs to end of image");
        assert_eq!(fetchers[1].size(), 4, "mission at 4 runs to next offset");
        assert!(!program.has_advisories());
    }

    #[test]
    fn out_of_range_mission_offset_reports_advisory() {
        let header = ScmHeader {
            version: Version::Liberty,
            size_global_vars_space: 8,
            models: vec![],
            main_size: 4,
            mission_offsets: vec![100],
        };
        let image = [0u8; 12];
        let mut program = ProgramContext::new();
        let fetchers = mission_segment_fetcher(&image, &header, &mut program);
        assert_eq!(fetchers[0].size(), 0);
        assert!(program.has_advisories());
    }
}
