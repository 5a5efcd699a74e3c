//! 启动恢复
//!
//! 没有有效段尾的段（崩溃或断电留下的）截断到最后一个完整帧，追加恢复标记，
//! 再写入带 RECOVERED 标志的段尾。文件头都读不出来的段重写为空的恢复段。

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::constants::FOOTER_FLAG_RECOVERED;
use crate::error::{Error, Result};
use crate::frame::{encode_marker, FrameKind};
use crate::header::{SegmentFooter, SegmentHeader};
use crate::scan::{list_segments, SegmentScan};
use crate::segment::unix_ms;

/// 单个段的恢复结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveredSegment {
    pub segment_id: u64,
    pub path: PathBuf,
    pub discarded_bytes: u64,  // 截掉的字节数
    pub recovered_frames: u64, // 保留下来的记录数
    pub header_rewritten: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub scanned: usize,
    pub recovered: Vec<RecoveredSegment>,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        self.recovered.is_empty()
    }
}

/// 恢复目录中所有未完整定稿的段
pub fn recover_dir(dir: &Path) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();
    let mut next_sequence = 0u64;

    for (segment_id, path) in list_segments(dir)? {
        report.scanned += 1;
        match SegmentScan::scan(&path) {
            Ok(scan) if scan.is_complete() => {
                debug!("segment {} complete", path.display());
                next_sequence = next_sequence.max(scan.next_sequence());
            }
            Ok(scan) => {
                let recovered = repair_segment(&scan)?;
                // 恢复标记占用一个序列号
                next_sequence = next_sequence.max(scan.next_sequence() + 1);
                report.recovered.push(recovered);
            }
            Err(Error::CorruptSegment { reason, .. }) => {
                let recovered = rewrite_empty(segment_id, &path, next_sequence, &reason)?;
                next_sequence += 1;
                report.recovered.push(recovered);
            }
            Err(e) => return Err(e),
        }
    }

    if report.is_clean() {
        debug!("recovery: {} segments clean", report.scanned);
    } else {
        info!(
            "recovery: {} of {} segments repaired",
            report.recovered.len(),
            report.scanned
        );
    }
    Ok(report)
}

/// 截断到最后一个完整帧并定稿
pub fn repair_segment(scan: &SegmentScan) -> Result<RecoveredSegment> {
    let discarded_bytes = scan.file_len - scan.frames_end;
    let recovered_frames = scan.record_count();
    let marker_sequence = scan.next_sequence();
    let (start_timestamp, end_timestamp) = scan.time_span().unwrap_or((0.0, 0.0));

    let mut file = OpenOptions::new().write(true).open(&scan.path)?;
    file.set_len(scan.frames_end)?;
    file.seek(SeekFrom::Start(scan.frames_end))?;

    let marker = encode_marker(
        FrameKind::RecoveryMarker,
        end_timestamp,
        marker_sequence,
        discarded_bytes,
        recovered_frames,
    );
    let footer = SegmentFooter {
        flags: FOOTER_FLAG_RECOVERED,
        record_count: recovered_frames,
        type_counts: scan.type_counts(),
        next_sequence: marker_sequence + 1,
        start_timestamp,
        end_timestamp,
        // 崩溃前的丢弃计数只在内存里，无从恢复
        drops: Default::default(),
    };
    finish(&mut file, &marker, &footer)?;

    warn!(
        "recovered segment {}: kept {} records, discarded {} bytes",
        scan.path.display(),
        recovered_frames,
        discarded_bytes
    );

    Ok(RecoveredSegment {
        segment_id: scan.segment_id(),
        path: scan.path.clone(),
        discarded_bytes,
        recovered_frames,
        header_rewritten: false,
    })
}

/// 文件头损坏，整段无法解释，重写为空的恢复段
fn rewrite_empty(
    segment_id: u64,
    path: &Path,
    first_sequence: u64,
    reason: &str,
) -> Result<RecoveredSegment> {
    let mut file = OpenOptions::new().write(true).open(path)?;
    let discarded_bytes = file.metadata()?.len();
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;

    SegmentHeader::new(segment_id, first_sequence, unix_ms()).write_to(&mut file)?;
    let marker = encode_marker(
        FrameKind::RecoveryMarker,
        0.0,
        first_sequence,
        discarded_bytes,
        0,
    );
    let footer = SegmentFooter {
        flags: FOOTER_FLAG_RECOVERED,
        record_count: 0,
        type_counts: Default::default(),
        next_sequence: first_sequence + 1,
        start_timestamp: 0.0,
        end_timestamp: 0.0,
        drops: Default::default(),
    };
    finish(&mut file, &marker, &footer)?;

    warn!(
        "rewrote segment {} ({}): discarded {} bytes",
        path.display(),
        reason,
        discarded_bytes
    );

    Ok(RecoveredSegment {
        segment_id,
        path: path.to_path_buf(),
        discarded_bytes,
        recovered_frames: 0,
        header_rewritten: true,
    })
}

fn finish(file: &mut File, marker: &[u8], footer: &SegmentFooter) -> Result<()> {
    file.write_all(marker)?;
    file.write_all(&footer.to_bytes())?;
    file.sync_all()?;
    Ok(())
}
