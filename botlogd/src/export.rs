//! 导出 botlog 段目录
//!
//! 输出目录中：
//! - `{type}.bin`: 每种记录类型一个文件，逐条 `[sequence:8B][payload]`
//! - `index.csv`: 全部帧（含标记）的序列号、段号、偏移、类型、时间戳

use std::collections::btree_map::{BTreeMap, Entry};
use std::fs::{create_dir_all, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use botlog::{FrameKind, LogEntry, LogReader, RecordType};
use tracing::{info, warn};

pub struct ExportOptions<'a> {
    pub dir: &'a Path,
    pub output_dir: &'a Path,
}

/// 导出结果统计
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExportSummary {
    pub records: u64,
    pub markers: u64,
    pub skipped_segments: usize,
}

pub fn run_export(opts: ExportOptions<'_>) -> Result<ExportSummary> {
    create_dir_all(opts.output_dir)
        .with_context(|| format!("create export dir {}", opts.output_dir.display()))?;

    let mut reader = LogReader::open(opts.dir)
        .with_context(|| format!("open botlog dir {}", opts.dir.display()))?;

    let index_path = opts.output_dir.join("index.csv");
    let mut index_writer = BufWriter::new(
        File::create(&index_path).with_context(|| format!("create {}", index_path.display()))?,
    );
    writeln!(
        index_writer,
        "sequence,segment,offset,type,timestamp,value0,value1"
    )?;

    // 按需创建，没有记录的类型不生成文件
    let mut bin_writers: BTreeMap<RecordType, BufWriter<File>> = BTreeMap::new();
    let mut summary = ExportSummary::default();

    for entry in reader.by_ref() {
        let entry = entry.context("read botlog entry")?;
        match entry {
            LogEntry::Record {
                segment_id,
                sequence,
                offset,
                record,
            } => {
                let record_type = record.record_type();
                let writer = match bin_writers.entry(record_type) {
                    Entry::Occupied(e) => e.into_mut(),
                    Entry::Vacant(e) => {
                        let path = bin_path(opts.output_dir, record_type);
                        let file = File::create(&path)
                            .with_context(|| format!("create {}", path.display()))?;
                        e.insert(BufWriter::new(file))
                    }
                };
                writer.write_all(&sequence.to_le_bytes())?;
                writer.write_all(record.payload())?;

                writeln!(
                    index_writer,
                    "{},{},{},{},{:.6},,",
                    sequence,
                    segment_id,
                    offset,
                    record_type,
                    record.timestamp()
                )?;
                summary.records += 1;
            }
            LogEntry::Marker {
                segment_id,
                sequence,
                kind,
                timestamp,
                values,
            } => {
                let name = match kind {
                    FrameKind::RecoveryMarker => "recovery_marker",
                    FrameKind::ShutdownMarker => "shutdown_marker",
                    FrameKind::Record(rt) => rt.name(),
                };
                writeln!(
                    index_writer,
                    "{},{},,{},{:.6},{},{}",
                    sequence, segment_id, name, timestamp, values.0, values.1
                )?;
                summary.markers += 1;
            }
        }
    }

    summary.skipped_segments = reader.skipped().len();
    for path in reader.skipped() {
        warn!("botlogd export: skipped incomplete segment {}", path.display());
    }

    for writer in bin_writers.values_mut() {
        writer.flush()?;
    }
    index_writer.flush()?;

    info!(
        "botlogd export: saved {} records and {} markers to {}",
        summary.records,
        summary.markers,
        opts.output_dir.display()
    );

    Ok(summary)
}

fn bin_path(output_dir: &Path, record_type: RecordType) -> PathBuf {
    output_dir.join(format!("{}.bin", record_type.name()))
}
