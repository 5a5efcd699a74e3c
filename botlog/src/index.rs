//! 内存索引：(段号, 序列号) → 帧偏移
//!
//! 启动时扫描目录重建，运行中由段管理器维护。已定稿的段只保留摘要，
//! 偏移表只给活动段保留。

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::Result;
use crate::scan::{list_segments, SegmentScan};

/// 单个段的索引
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SegmentIndex {
    pub first_sequence: u64,
    pub next_sequence: u64,
    pub records: u64,
    pub complete: bool,
    pub drops: u64, // 段尾记录的丢弃总数
    offsets: Vec<(u64, u64)>, // (sequence, offset)，按序列号递增
}

impl SegmentIndex {
    pub fn offset_of(&self, sequence: u64) -> Option<u64> {
        self.offsets
            .binary_search_by_key(&sequence, |&(seq, _)| seq)
            .ok()
            .map(|i| self.offsets[i].1)
    }

    /// 是否保留了偏移表
    pub fn has_offsets(&self) -> bool {
        !self.offsets.is_empty() || self.first_sequence == self.next_sequence
    }
}

#[derive(Debug, Clone, Default)]
pub struct LogIndex {
    segments: BTreeMap<u64, SegmentIndex>,
}

impl LogIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// 扫描目录中所有段重建索引
    pub fn rebuild(dir: &Path) -> Result<Self> {
        let mut index = Self::new();
        for (_, path) in list_segments(dir)? {
            let scan = SegmentScan::scan(&path)?;
            index.insert_scan(&scan);
        }
        Ok(index)
    }

    pub fn insert_scan(&mut self, scan: &SegmentScan) {
        let entry = SegmentIndex {
            first_sequence: scan.header.first_sequence,
            next_sequence: scan.next_sequence(),
            records: scan.record_count(),
            complete: scan.is_complete(),
            drops: scan
                .footer
                .as_ref()
                .map(|footer| footer.total_drops())
                .unwrap_or(0),
            offsets: scan
                .frames
                .iter()
                .map(|frame| (frame.sequence, frame.offset))
                .collect(),
        };
        self.segments.insert(scan.segment_id(), entry);
    }

    /// 新建活动段
    pub fn open_segment(&mut self, segment_id: u64, first_sequence: u64) {
        self.segments.insert(
            segment_id,
            SegmentIndex {
                first_sequence,
                next_sequence: first_sequence,
                ..Default::default()
            },
        );
    }

    /// 记录一帧，`is_record` 为 false 表示标记帧
    pub fn insert(&mut self, segment_id: u64, sequence: u64, offset: u64, is_record: bool) {
        let entry = self.segments.entry(segment_id).or_default();
        entry.offsets.push((sequence, offset));
        entry.next_sequence = sequence + 1;
        if is_record {
            entry.records += 1;
        }
    }

    /// 段定稿后只保留摘要
    pub fn seal(&mut self, segment_id: u64) {
        if let Some(entry) = self.segments.get_mut(&segment_id) {
            entry.complete = true;
            entry.offsets = Vec::new();
        }
    }

    pub fn set_drops(&mut self, segment_id: u64, drops: u64) {
        if let Some(entry) = self.segments.get_mut(&segment_id) {
            entry.drops = drops;
        }
    }

    pub fn remove(&mut self, segment_id: u64) -> Option<SegmentIndex> {
        self.segments.remove(&segment_id)
    }

    pub fn segment(&self, segment_id: u64) -> Option<&SegmentIndex> {
        self.segments.get(&segment_id)
    }

    pub fn offset_of(&self, segment_id: u64, sequence: u64) -> Option<u64> {
        self.segments.get(&segment_id)?.offset_of(sequence)
    }

    /// 按序列号定位 (段号, 偏移)
    pub fn locate(&self, sequence: u64) -> Option<(u64, u64)> {
        self.segments
            .iter()
            .find(|(_, entry)| (entry.first_sequence..entry.next_sequence).contains(&sequence))
            .and_then(|(&id, entry)| entry.offset_of(sequence).map(|offset| (id, offset)))
    }

    pub fn segment_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.segments.keys().copied()
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// 下一个可用的段号
    pub fn next_segment_id(&self) -> u64 {
        self.segments
            .keys()
            .next_back()
            .map(|id| id + 1)
            .unwrap_or(0)
    }

    /// 所有段之后的下一个序列号
    pub fn next_sequence(&self) -> u64 {
        self.segments
            .values()
            .map(|entry| entry.next_sequence)
            .max()
            .unwrap_or(0)
    }

    pub fn total_records(&self) -> u64 {
        self.segments.values().map(|entry| entry.records).sum()
    }

    /// 所有段尾记录的丢弃总数
    pub fn total_drops(&self) -> u64 {
        self.segments.values().map(|entry| entry.drops).sum()
    }
}
