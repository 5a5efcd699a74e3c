//! 段文件扫描
//!
//! 从文件头开始逐帧解析，直到遇到无法解析或超出文件末尾的帧。扫描结果是
//! 恢复、索引重建、回放和命令行工具的共同基础。

use std::fs::{self, File};
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::constants::{FOOTER_SIZE, FRAME_HEADER_SIZE, SEGMENT_EXTENSION, SEGMENT_HEADER_SIZE};
use crate::error::{Error, Result};
use crate::frame::{FrameHeader, FrameKind};
use crate::header::{SegmentFooter, SegmentHeader};
use crate::record::RecordType;

/// 段文件路径：`{id:010}.blog`
pub fn segment_path(dir: &Path, segment_id: u64) -> PathBuf {
    dir.join(format!("{:010}.{}", segment_id, SEGMENT_EXTENSION))
}

/// 从文件名解析段号
pub fn parse_segment_id(path: &Path) -> Option<u64> {
    if path.extension()? != SEGMENT_EXTENSION {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

/// 列出目录下所有段文件，按段号升序
pub fn list_segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut segments = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if let Some(id) = parse_segment_id(&path) {
            segments.push((id, path));
        }
    }
    segments.sort_by_key(|(id, _)| *id);
    Ok(segments)
}

/// 一帧在段文件中的位置
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameLocation {
    pub kind: FrameKind,
    pub sequence: u64,
    pub timestamp: f64,
    pub offset: u64, // 帧头起始位置
    pub length: u32,
}

impl FrameLocation {
    pub fn payload_offset(&self) -> u64 {
        self.offset + FRAME_HEADER_SIZE as u64
    }

    pub fn end(&self) -> u64 {
        self.payload_offset() + self.length as u64
    }
}

/// 段扫描结果
#[derive(Debug, Clone)]
pub struct SegmentScan {
    pub path: PathBuf,
    pub header: SegmentHeader,
    pub frames: Vec<FrameLocation>,
    /// 最后一个完整帧的结束位置
    pub frames_end: u64,
    pub file_len: u64,
    /// 只有段尾有效且紧接在最后一帧之后才为 Some
    pub footer: Option<SegmentFooter>,
}

impl SegmentScan {
    pub fn scan(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let header = match SegmentHeader::read_from(&mut reader) {
            Ok(header) if header.is_valid() => header,
            Ok(_) => {
                return Err(Error::CorruptSegment {
                    path: path.to_path_buf(),
                    reason: "bad segment header".into(),
                })
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(Error::CorruptSegment {
                    path: path.to_path_buf(),
                    reason: format!("truncated header ({} bytes)", file_len),
                })
            }
            Err(e) => return Err(e.into()),
        };

        let mut frames = Vec::new();
        let mut pos = SEGMENT_HEADER_SIZE;
        let mut last_sequence: Option<u64> = None;
        let mut buf = [0u8; FRAME_HEADER_SIZE];

        while pos + FRAME_HEADER_SIZE as u64 <= file_len {
            reader.read_exact(&mut buf)?;
            let Some(frame) = FrameHeader::parse(&buf) else {
                break;
            };
            if pos + frame.frame_size() > file_len {
                break;
            }
            // 序列号必须严格递增，否则是残留数据
            let in_order = match last_sequence {
                Some(last) => frame.sequence > last,
                None => frame.sequence >= header.first_sequence,
            };
            if !in_order {
                break;
            }

            frames.push(FrameLocation {
                kind: frame.kind,
                sequence: frame.sequence,
                timestamp: frame.timestamp,
                offset: pos,
                length: frame.length,
            });
            reader.seek_relative(frame.length as i64)?;
            pos += frame.frame_size();
            last_sequence = Some(frame.sequence);
        }

        let mut scan = Self {
            path: path.to_path_buf(),
            header,
            frames,
            frames_end: pos,
            file_len,
            footer: None,
        };

        if file_len - pos == FOOTER_SIZE {
            reader.seek(SeekFrom::Start(pos))?;
            let mut raw = [0u8; FOOTER_SIZE as usize];
            reader.read_exact(&mut raw)?;
            let footer = SegmentFooter::parse(&raw).filter(|footer| scan.matches_footer(footer));
            scan.footer = footer;
        }

        Ok(scan)
    }

    /// 段尾的计数必须与实际扫描到的帧一致
    fn matches_footer(&self, footer: &SegmentFooter) -> bool {
        footer.type_counts == self.type_counts() && footer.next_sequence == self.next_sequence()
    }

    pub fn segment_id(&self) -> u64 {
        self.header.segment_id
    }

    /// 段是否完整（可安全读取）
    pub fn is_complete(&self) -> bool {
        self.footer.is_some()
    }

    /// 最后一个完整帧之后的字节数（完整段不含段尾）
    pub fn trailing_bytes(&self) -> u64 {
        let footer = if self.is_complete() { FOOTER_SIZE } else { 0 };
        self.file_len - self.frames_end - footer
    }

    /// 记录帧（不含标记帧）
    pub fn records(&self) -> impl Iterator<Item = (RecordType, &FrameLocation)> {
        self.frames
            .iter()
            .filter_map(|frame| frame.kind.record_type().map(|rt| (rt, frame)))
    }

    pub fn markers(&self) -> impl Iterator<Item = &FrameLocation> {
        self.frames
            .iter()
            .filter(|frame| frame.kind.record_type().is_none())
    }

    pub fn record_count(&self) -> u64 {
        self.records().count() as u64
    }

    pub fn type_counts(&self) -> [u64; RecordType::COUNT] {
        let mut counts = [0u64; RecordType::COUNT];
        for (rt, _) in self.records() {
            counts[rt.index()] += 1;
        }
        counts
    }

    /// 本段之后的下一个序列号
    pub fn next_sequence(&self) -> u64 {
        self.frames
            .last()
            .map(|frame| frame.sequence + 1)
            .unwrap_or(self.header.first_sequence)
    }

    /// 记录时间戳范围 (min, max)
    pub fn time_span(&self) -> Option<(f64, f64)> {
        self.records().fold(None, |span, (_, frame)| {
            let ts = frame.timestamp;
            Some(match span {
                None => (ts, ts),
                Some((lo, hi)) => (lo.min(ts), hi.max(ts)),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::FOOTER_FLAG_RECOVERED;
    use crate::frame::{encode_marker, FrameWriter};
    use crate::record::{DriveCtrl, Imu, Sample};
    use std::io::Write;

    fn write_segment(path: &Path, with_footer: bool) -> Vec<u8> {
        let mut bytes = SegmentHeader::new(3, 10, 0).to_bytes().to_vec();
        let mut writer = FrameWriter::new(10);
        for i in 0..3 {
            let record = DriveCtrl {
                yaw: i as f32,
                twist: [0.0, 0.0],
                timestamp: i as f64,
            }
            .to_record()
            .unwrap();
            bytes.extend(writer.encode(&record).bytes);
        }
        bytes.extend(writer.encode(&Imu::default().to_record().unwrap()).bytes);
        if with_footer {
            let footer = SegmentFooter {
                flags: 0,
                record_count: 4,
                type_counts: [0, 3, 0, 0, 1],
                next_sequence: 14,
                start_timestamp: 0.0,
                end_timestamp: 2.0,
                drops: Default::default(),
            };
            bytes.extend_from_slice(&footer.to_bytes());
        }
        File::create(path).unwrap().write_all(&bytes).unwrap();
        bytes
    }

    #[test]
    fn test_segment_file_names() {
        let dir = Path::new("/tmp/botlog");
        let path = segment_path(dir, 42);
        assert_eq!(path, dir.join("0000000042.blog"));
        assert_eq!(parse_segment_id(&path), Some(42));
        assert_eq!(parse_segment_id(Path::new("/tmp/0000000042.bin")), None);
        assert_eq!(parse_segment_id(Path::new("/tmp/index.blog")), None);
    }

    #[test]
    fn test_scan_complete_segment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0000000003.blog");
        let bytes = write_segment(&path, true);

        let scan = SegmentScan::scan(&path).unwrap();
        assert!(scan.is_complete());
        assert_eq!(scan.segment_id(), 3);
        assert_eq!(scan.frames.len(), 4);
        assert_eq!(scan.frames[0].offset, SEGMENT_HEADER_SIZE);
        assert_eq!(scan.frames[1].offset, SEGMENT_HEADER_SIZE + 21 + 20);
        assert_eq!(scan.frames_end + FOOTER_SIZE, bytes.len() as u64);
        assert_eq!(scan.type_counts(), [0, 3, 0, 0, 1]);
        assert_eq!(scan.next_sequence(), 14);
        assert_eq!(scan.time_span(), Some((0.0, 2.0)));
        assert_eq!(scan.trailing_bytes(), 0);
    }

    #[test]
    fn test_scan_stops_at_torn_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0000000003.blog");
        let bytes = write_segment(&path, false);
        // 截掉最后一帧的一部分
        let file = fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(bytes.len() as u64 - 10).unwrap();

        let scan = SegmentScan::scan(&path).unwrap();
        assert!(!scan.is_complete());
        assert_eq!(scan.frames.len(), 3);
        assert_eq!(scan.trailing_bytes(), 21 + 44 - 10);
    }

    #[test]
    fn test_footer_with_wrong_counts_is_incomplete() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0000000003.blog");
        let mut bytes = write_segment(&path, false);
        let footer = SegmentFooter {
            flags: FOOTER_FLAG_RECOVERED,
            record_count: 3,
            type_counts: [0, 3, 0, 0, 0],
            next_sequence: 14,
            start_timestamp: 0.0,
            end_timestamp: 2.0,
            drops: Default::default(),
        };
        bytes.extend_from_slice(&footer.to_bytes());
        fs::write(&path, &bytes).unwrap();

        assert!(!SegmentScan::scan(&path).unwrap().is_complete());
    }

    #[test]
    fn test_markers_are_not_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0000000000.blog");
        let mut bytes = SegmentHeader::new(0, 0, 0).to_bytes().to_vec();
        bytes.extend(encode_marker(FrameKind::RecoveryMarker, 0.0, 0, 5, 0));
        fs::write(&path, &bytes).unwrap();

        let scan = SegmentScan::scan(&path).unwrap();
        assert_eq!(scan.frames.len(), 1);
        assert_eq!(scan.record_count(), 0);
        assert_eq!(scan.markers().count(), 1);
        assert_eq!(scan.next_sequence(), 1);
        assert_eq!(scan.time_span(), None);
    }

    #[test]
    fn test_bad_header_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0000000000.blog");
        fs::write(&path, b"BLO").unwrap();
        assert!(matches!(
            SegmentScan::scan(&path),
            Err(Error::CorruptSegment { .. })
        ));
    }
}
