//! 段文件头与段尾
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │ SegmentHeader (32 bytes)                                       │
//! ├────────────────────────────────────────────────────────────────┤
//! │ Frame1 │ Frame2 │ ... │ FrameN │ [Marker]                      │
//! ├────────────────────────────────────────────────────────────────┤
//! │ SegmentFooter (208 bytes, 只有正常定稿的段才有)                │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! 段尾布局:
//! ```text
//!   0  magic "BLGF"          4  flags
//!   8  record_count         16  type_counts[5]
//!  56  next_sequence        64  start_timestamp    72  end_timestamp
//!  80  drops[5] = (dropped_oldest, dropped_newest, timeout_drops)
//! 200  crc32(0..200)       204  "BEND"
//! ```

use std::io::{self, Read, Write};

use crc32fast::Hasher;

use crate::channel::DropCounts;
use crate::constants::{
    FOOTER_CRC_SPAN, FOOTER_DROPS_OFFSET, FOOTER_END_MAGIC, FOOTER_FLAG_PARTIAL_SHUTDOWN,
    FOOTER_FLAG_RECOVERED, FOOTER_MAGIC, FOOTER_SIZE, FORMAT_VERSION, SEGMENT_HEADER_SIZE,
    SEGMENT_MAGIC,
};
use crate::record::{f64_at, RecordType};

fn u64_at(buf: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(raw)
}

fn u32_at(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

/// 段文件头
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHeader {
    pub magic: u32,
    pub version: u16,
    pub header_size: u16,
    pub segment_id: u64,
    pub first_sequence: u64, // 本段第一帧的序列号
    pub created_unix_ms: u64,
}

impl SegmentHeader {
    pub fn new(segment_id: u64, first_sequence: u64, created_unix_ms: u64) -> Self {
        Self {
            magic: SEGMENT_MAGIC,
            version: FORMAT_VERSION,
            header_size: SEGMENT_HEADER_SIZE as u16,
            segment_id,
            first_sequence,
            created_unix_ms,
        }
    }

    pub fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        let mut buf = [0u8; SEGMENT_HEADER_SIZE as usize];
        reader.read_exact(&mut buf)?;

        Ok(Self {
            magic: u32_at(&buf, 0),
            version: u16::from_le_bytes([buf[4], buf[5]]),
            header_size: u16::from_le_bytes([buf[6], buf[7]]),
            segment_id: u64_at(&buf, 8),
            first_sequence: u64_at(&buf, 16),
            created_unix_ms: u64_at(&buf, 24),
        })
    }

    pub fn to_bytes(&self) -> [u8; SEGMENT_HEADER_SIZE as usize] {
        let mut buf = [0u8; SEGMENT_HEADER_SIZE as usize];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..6].copy_from_slice(&self.version.to_le_bytes());
        buf[6..8].copy_from_slice(&self.header_size.to_le_bytes());
        buf[8..16].copy_from_slice(&self.segment_id.to_le_bytes());
        buf[16..24].copy_from_slice(&self.first_sequence.to_le_bytes());
        buf[24..32].copy_from_slice(&self.created_unix_ms.to_le_bytes());
        buf
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.to_bytes())
    }

    pub fn is_valid(&self) -> bool {
        self.magic == SEGMENT_MAGIC
            && self.version == FORMAT_VERSION
            && self.header_size as u64 == SEGMENT_HEADER_SIZE
    }
}

/// 段尾，定稿时写入，是"该段已完整"的唯一依据
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentFooter {
    pub flags: u32,
    pub record_count: u64,
    pub type_counts: [u64; RecordType::COUNT], // 按 tag 顺序
    pub next_sequence: u64,                    // 本段之后的下一个序列号
    pub start_timestamp: f64,
    pub end_timestamp: f64,
    /// 上一段定稿以来各类型在缓冲区被丢弃的记录数
    pub drops: [DropCounts; RecordType::COUNT],
}

impl SegmentFooter {
    pub fn is_recovered(&self) -> bool {
        self.flags & FOOTER_FLAG_RECOVERED != 0
    }

    pub fn is_partial_shutdown(&self) -> bool {
        self.flags & FOOTER_FLAG_PARTIAL_SHUTDOWN != 0
    }

    pub fn count_of(&self, record_type: RecordType) -> u64 {
        self.type_counts[record_type.index()]
    }

    pub fn drops_of(&self, record_type: RecordType) -> DropCounts {
        self.drops[record_type.index()]
    }

    pub fn total_drops(&self) -> u64 {
        self.drops.iter().map(DropCounts::total).sum()
    }

    pub fn to_bytes(&self) -> [u8; FOOTER_SIZE as usize] {
        let mut buf = [0u8; FOOTER_SIZE as usize];
        buf[0..4].copy_from_slice(&FOOTER_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&self.flags.to_le_bytes());
        buf[8..16].copy_from_slice(&self.record_count.to_le_bytes());
        for (i, count) in self.type_counts.iter().enumerate() {
            let off = 16 + i * 8;
            buf[off..off + 8].copy_from_slice(&count.to_le_bytes());
        }
        buf[56..64].copy_from_slice(&self.next_sequence.to_le_bytes());
        buf[64..72].copy_from_slice(&self.start_timestamp.to_le_bytes());
        buf[72..80].copy_from_slice(&self.end_timestamp.to_le_bytes());
        for (i, drops) in self.drops.iter().enumerate() {
            let off = FOOTER_DROPS_OFFSET + i * 24;
            buf[off..off + 8].copy_from_slice(&drops.dropped_oldest.to_le_bytes());
            buf[off + 8..off + 16].copy_from_slice(&drops.dropped_newest.to_le_bytes());
            buf[off + 16..off + 24].copy_from_slice(&drops.timeout_drops.to_le_bytes());
        }

        let mut hasher = Hasher::new();
        hasher.update(&buf[..FOOTER_CRC_SPAN]);
        buf[FOOTER_CRC_SPAN..FOOTER_CRC_SPAN + 4].copy_from_slice(&hasher.finalize().to_le_bytes());
        buf[FOOTER_CRC_SPAN + 4..].copy_from_slice(&FOOTER_END_MAGIC.to_le_bytes());
        buf
    }

    /// 解析段尾，魔数或 CRC 不对返回 None
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() != FOOTER_SIZE as usize {
            return None;
        }
        if u32_at(buf, 0) != FOOTER_MAGIC || u32_at(buf, FOOTER_CRC_SPAN + 4) != FOOTER_END_MAGIC {
            return None;
        }
        let mut hasher = Hasher::new();
        hasher.update(&buf[..FOOTER_CRC_SPAN]);
        if hasher.finalize() != u32_at(buf, FOOTER_CRC_SPAN) {
            return None;
        }

        let mut type_counts = [0u64; RecordType::COUNT];
        for (i, count) in type_counts.iter_mut().enumerate() {
            *count = u64_at(buf, 16 + i * 8);
        }
        let mut drops = [DropCounts::default(); RecordType::COUNT];
        for (i, slot) in drops.iter_mut().enumerate() {
            let off = FOOTER_DROPS_OFFSET + i * 24;
            *slot = DropCounts {
                dropped_oldest: u64_at(buf, off),
                dropped_newest: u64_at(buf, off + 8),
                timeout_drops: u64_at(buf, off + 16),
            };
        }
        let footer = Self {
            flags: u32_at(buf, 4),
            record_count: u64_at(buf, 8),
            type_counts,
            next_sequence: u64_at(buf, 56),
            start_timestamp: f64_at(buf, 64),
            end_timestamp: f64_at(buf, 72),
            drops,
        };
        if footer.type_counts.iter().sum::<u64>() != footer.record_count {
            return None;
        }
        Some(footer)
    }
}
