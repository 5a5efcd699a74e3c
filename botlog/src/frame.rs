//! 帧编码
//!
//! 帧格式：
//! ```text
//! ┌──────┬──────┬───────────┬────────┬─────────────┐
//! │ Tag  │ Len  │ Timestamp │ SeqNum │ Payload ... │
//! │ 1B   │ 4B   │ 8B (f64)  │ 8B     │ Len bytes   │
//! └──────┴──────┴───────────┴────────┴─────────────┘
//! ```
//! 负载按生产者的紧凑布局原样写入，不做二次编码。

use crate::constants::{
    FRAME_HEADER_SIZE, MARKER_PAYLOAD_SIZE, TAG_RECOVERY_MARKER, TAG_SHUTDOWN_MARKER,
};
use crate::record::{Record, RecordType};

/// 帧内容类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Record(RecordType),
    /// 启动恢复时追加的标记
    RecoveryMarker,
    /// 关闭超时时追加的标记
    ShutdownMarker,
}

impl FrameKind {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            TAG_RECOVERY_MARKER => Some(FrameKind::RecoveryMarker),
            TAG_SHUTDOWN_MARKER => Some(FrameKind::ShutdownMarker),
            _ => RecordType::from_tag(tag).map(FrameKind::Record),
        }
    }

    pub fn tag(self) -> u8 {
        match self {
            FrameKind::Record(rt) => rt.tag(),
            FrameKind::RecoveryMarker => TAG_RECOVERY_MARKER,
            FrameKind::ShutdownMarker => TAG_SHUTDOWN_MARKER,
        }
    }

    /// 由 tag 决定的固定负载长度
    pub fn payload_size(self) -> usize {
        match self {
            FrameKind::Record(rt) => rt.payload_size(),
            FrameKind::RecoveryMarker | FrameKind::ShutdownMarker => MARKER_PAYLOAD_SIZE,
        }
    }

    pub fn record_type(self) -> Option<RecordType> {
        match self {
            FrameKind::Record(rt) => Some(rt),
            _ => None,
        }
    }
}

/// 帧头
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameHeader {
    pub kind: FrameKind,
    pub length: u32,
    pub timestamp: f64,
    pub sequence: u64,
}

impl FrameHeader {
    /// 整帧大小（含帧头）
    pub fn frame_size(&self) -> u64 {
        FRAME_HEADER_SIZE as u64 + self.length as u64
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.push(self.kind.tag());
        buf.extend_from_slice(&self.length.to_le_bytes());
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.extend_from_slice(&self.sequence.to_le_bytes());
    }

    /// 解析帧头
    ///
    /// tag 未知或长度与 tag 不一致时返回 None，调用方据此判定记录边界。
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < FRAME_HEADER_SIZE {
            return None;
        }
        let kind = FrameKind::from_tag(buf[0])?;
        let length = u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]);
        if length as usize != kind.payload_size() {
            return None;
        }
        let timestamp = crate::record::f64_at(buf, 5);
        let sequence = u64::from_le_bytes([
            buf[13], buf[14], buf[15], buf[16], buf[17], buf[18], buf[19], buf[20],
        ]);
        Some(Self {
            kind,
            length,
            timestamp,
            sequence,
        })
    }
}

/// 编码一条记录，纯函数，无 I/O
///
/// 输出长度恒为 `FRAME_HEADER_SIZE + payload_size`。负载长度与类型不符说明
/// 记录构造有误，直接 panic。
pub fn encode_frame(record: &Record, sequence: u64) -> Vec<u8> {
    let record_type = record.record_type();
    let payload = record.payload();
    assert_eq!(
        payload.len(),
        record_type.payload_size(),
        "{} payload size mismatch",
        record_type
    );

    let header = FrameHeader {
        kind: FrameKind::Record(record_type),
        length: payload.len() as u32,
        timestamp: record.timestamp(),
        sequence,
    };
    let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    header.write_to(&mut buf);
    buf.extend_from_slice(payload);

    debug_assert_eq!(buf.len(), FRAME_HEADER_SIZE + record_type.payload_size());
    buf
}

/// 编码标记帧
pub fn encode_marker(kind: FrameKind, timestamp: f64, sequence: u64, a: u64, b: u64) -> Vec<u8> {
    debug_assert!(kind.record_type().is_none());
    let header = FrameHeader {
        kind,
        length: MARKER_PAYLOAD_SIZE as u32,
        timestamp,
        sequence,
    };
    let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + MARKER_PAYLOAD_SIZE);
    header.write_to(&mut buf);
    buf.extend_from_slice(&a.to_le_bytes());
    buf.extend_from_slice(&b.to_le_bytes());
    buf
}

/// 解析标记帧负载
pub fn decode_marker(payload: &[u8]) -> Option<(u64, u64)> {
    if payload.len() != MARKER_PAYLOAD_SIZE {
        return None;
    }
    let mut a = [0u8; 8];
    let mut b = [0u8; 8];
    a.copy_from_slice(&payload[0..8]);
    b.copy_from_slice(&payload[8..16]);
    Some((u64::from_le_bytes(a), u64::from_le_bytes(b)))
}

/// 已编码的帧
#[derive(Debug)]
pub struct EncodedFrame {
    pub record_type: RecordType,
    pub timestamp: f64,
    pub sequence: u64,
    pub bytes: Vec<u8>,
}

/// 帧写入器，负责分配单调递增的序列号
#[derive(Debug)]
pub struct FrameWriter {
    next_sequence: u64,
}

impl FrameWriter {
    pub fn new(next_sequence: u64) -> Self {
        Self { next_sequence }
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// 编码并消耗一个序列号
    pub fn encode(&mut self, record: &Record) -> EncodedFrame {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        EncodedFrame {
            record_type: record.record_type(),
            timestamp: record.timestamp(),
            sequence,
            bytes: encode_frame(record, sequence),
        }
    }

    /// 标记帧之后需要跳过已占用的序列号
    pub fn advance_to(&mut self, next_sequence: u64) {
        self.next_sequence = self.next_sequence.max(next_sequence);
    }
}
