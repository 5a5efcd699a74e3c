//! 顺序回放
//!
//! 只读取已定稿的段。没有有效段尾的段不会被当作完整数据返回。

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::constants::{FRAME_HEADER_SIZE, SEGMENT_HEADER_SIZE};
use crate::error::{Error, Result};
use crate::frame::{decode_marker, FrameKind};
use crate::header::SegmentFooter;
use crate::record::Record;
use crate::scan::{list_segments, SegmentScan};

const READ_BUFFER_SIZE: usize = 1 << 20;

/// 回放得到的一帧
#[derive(Debug, Clone, PartialEq)]
pub enum LogEntry {
    Record {
        segment_id: u64,
        sequence: u64,
        offset: u64,
        record: Record,
    },
    Marker {
        segment_id: u64,
        sequence: u64,
        kind: FrameKind,
        timestamp: f64,
        values: (u64, u64),
    },
}

impl LogEntry {
    pub fn sequence(&self) -> u64 {
        match self {
            LogEntry::Record { sequence, .. } | LogEntry::Marker { sequence, .. } => *sequence,
        }
    }

    pub fn timestamp(&self) -> f64 {
        match self {
            LogEntry::Record { record, .. } => record.timestamp(),
            LogEntry::Marker { timestamp, .. } => *timestamp,
        }
    }

    pub fn record(&self) -> Option<&Record> {
        match self {
            LogEntry::Record { record, .. } => Some(record),
            LogEntry::Marker { .. } => None,
        }
    }

    pub fn into_record(self) -> Option<Record> {
        match self {
            LogEntry::Record { record, .. } => Some(record),
            LogEntry::Marker { .. } => None,
        }
    }
}

/// 单个段的读取器
pub struct SegmentReader {
    scan: SegmentScan,
    reader: BufReader<File>,
    next: usize,
}

impl SegmentReader {
    /// 打开已定稿的段，段尾无效时返回 [`Error::IncompleteSegment`]
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let scan = SegmentScan::scan(path)?;
        if !scan.is_complete() {
            return Err(Error::IncompleteSegment(path.to_path_buf()));
        }
        let mut reader = BufReader::with_capacity(READ_BUFFER_SIZE, File::open(path)?);
        reader.seek(SeekFrom::Start(SEGMENT_HEADER_SIZE))?;
        Ok(Self {
            scan,
            reader,
            next: 0,
        })
    }

    pub fn scan(&self) -> &SegmentScan {
        &self.scan
    }

    pub fn footer(&self) -> Option<&SegmentFooter> {
        self.scan.footer.as_ref()
    }

    fn read_next(&mut self) -> Result<Option<LogEntry>> {
        let Some(frame) = self.scan.frames.get(self.next).copied() else {
            return Ok(None);
        };
        self.next += 1;

        // 帧是连续的，帧头已由扫描校验过
        let mut header = [0u8; FRAME_HEADER_SIZE];
        self.reader.read_exact(&mut header)?;
        let mut payload = vec![0u8; frame.length as usize];
        self.reader.read_exact(&mut payload)?;

        let segment_id = self.scan.segment_id();
        let entry = match frame.kind {
            FrameKind::Record(record_type) => {
                let record = Record::new(record_type, payload, frame.timestamp).map_err(|e| {
                    Error::CorruptSegment {
                        path: self.scan.path.clone(),
                        reason: format!("frame seq={}: {}", frame.sequence, e),
                    }
                })?;
                LogEntry::Record {
                    segment_id,
                    sequence: frame.sequence,
                    offset: frame.offset,
                    record,
                }
            }
            kind => LogEntry::Marker {
                segment_id,
                sequence: frame.sequence,
                kind,
                timestamp: frame.timestamp,
                values: decode_marker(&payload).unwrap_or_default(),
            },
        };
        Ok(Some(entry))
    }
}

impl Iterator for SegmentReader {
    type Item = Result<LogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_next().transpose()
    }
}

/// 按段号顺序回放整个目录
///
/// 未定稿的段（例如守护进程正在写入的活动段）被跳过并记录在 `skipped` 中。
pub struct LogReader {
    pending: VecDeque<PathBuf>,
    current: Option<SegmentReader>,
    skipped: Vec<PathBuf>,
}

impl LogReader {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let pending = list_segments(dir.as_ref())?
            .into_iter()
            .map(|(_, path)| path)
            .collect();
        Ok(Self {
            pending,
            current: None,
            skipped: Vec::new(),
        })
    }

    pub fn skipped(&self) -> &[PathBuf] {
        &self.skipped
    }

    /// 只返回记录，跳过标记帧
    pub fn records(self) -> impl Iterator<Item = Result<Record>> {
        self.filter_map(|entry| match entry {
            Ok(entry) => entry.into_record().map(Ok),
            Err(e) => Some(Err(e)),
        })
    }
}

impl Iterator for LogReader {
    type Item = Result<LogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(reader) = self.current.as_mut() {
                match reader.next() {
                    Some(item) => return Some(item),
                    None => self.current = None,
                }
            }

            let path = self.pending.pop_front()?;
            match SegmentReader::open(&path) {
                Ok(reader) => self.current = Some(reader),
                Err(Error::IncompleteSegment(path)) => {
                    warn!("skipping incomplete segment {}", path.display());
                    self.skipped.push(path);
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
