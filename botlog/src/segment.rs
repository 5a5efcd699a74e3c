//! 段管理器
//!
//! 负责段文件的整个生命周期：创建、追加、刷盘、按大小/时长轮转、定稿。
//! 运行期间只有段管理器接触文件系统，且只被调度线程持有，追加路径无锁。

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::channel::DropCounts;
use crate::config::{DaemonConfig, RotationConfig};
use crate::constants::{FOOTER_FLAG_PARTIAL_SHUTDOWN, FRAME_HEADER_SIZE};
use crate::error::{Error, Result};
use crate::frame::{encode_marker, EncodedFrame, FrameKind};
use crate::header::{SegmentFooter, SegmentHeader};
use crate::index::LogIndex;
use crate::record::RecordType;
use crate::recovery::{recover_dir, RecoveryReport};
use crate::retry::RetryPolicy;
use crate::scan::segment_path;

pub(crate) fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// 执行一次 I/O 操作，失败按策略退避重试
fn with_retry<T>(
    policy: &RetryPolicy,
    what: &str,
    mut op: impl FnMut() -> io::Result<T>,
) -> Result<T> {
    let mut handle = policy.handle();
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) => match handle.next_delay() {
                Some(delay) => {
                    warn!(
                        "{} failed (attempt {}/{}): {}, retry in {:?}",
                        what,
                        handle.attempts(),
                        policy.max_attempts(),
                        err,
                        delay
                    );
                    thread::sleep(delay);
                }
                None => {
                    return Err(Error::StorageExhausted {
                        attempts: handle.attempts() + 1,
                        source: err,
                    })
                }
            },
        }
    }
}

/// 可截断的段文件
trait SegmentFile: Write + Seek {
    fn truncate_to(&mut self, len: u64) -> io::Result<()>;
}

impl SegmentFile for File {
    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

/// 在 offset 处写入，失败时回滚到 offset
fn write_at<F: SegmentFile>(file: &mut F, offset: u64, bytes: &[u8]) -> io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    if let Err(err) = file.write_all(bytes) {
        // 回滚失败时下一次写入仍从 offset 覆盖
        let _ = file.truncate_to(offset);
        return Err(err);
    }
    Ok(())
}

/// 正在写入的段
struct ActiveSegment {
    id: u64,
    path: PathBuf,
    file: File,
    size: u64,
    frames: u64, // 含标记帧
    record_count: u64,
    type_counts: [u64; RecordType::COUNT],
    start_timestamp: f64,
    end_timestamp: f64,
    first_sequence: u64,
    opened_at: Instant,
}

impl ActiveSegment {
    fn footer(
        &self,
        flags: u32,
        next_sequence: u64,
        drops: [DropCounts; RecordType::COUNT],
    ) -> SegmentFooter {
        let (start_timestamp, end_timestamp) = if self.record_count == 0 {
            (0.0, 0.0)
        } else {
            (self.start_timestamp, self.end_timestamp)
        };
        SegmentFooter {
            flags,
            record_count: self.record_count,
            type_counts: self.type_counts,
            next_sequence,
            start_timestamp,
            end_timestamp,
            drops,
        }
    }
}

/// 段管理器统计
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SegmentStats {
    pub active_segment_id: Option<u64>,
    pub active_bytes: u64,
    pub active_records: u64,
    pub active_age_ms: u64,
    pub records_written: u64,
    pub bytes_written: u64,
    pub segments_finalized: u64,
    pub flushes: u64,
    pub flush_overruns: u64,
    pub last_flush_unix_ms: Option<u64>,
    pub recovered_segments: u64,
    pub partial_shutdowns: u64,
    /// 已写入段尾的丢弃总数，含以往运行
    pub logged_drops: u64,
    pub next_sequence: u64,
}

impl fmt::Display for SegmentStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Segment Statistics:")?;
        match self.active_segment_id {
            Some(id) => writeln!(
                f,
                "  Active segment: {:010} ({} records, {:.1} KB, {} ms old)",
                id,
                self.active_records,
                self.active_bytes as f64 / 1024.0,
                self.active_age_ms
            )?,
            None => writeln!(f, "  Active segment: none")?,
        }
        writeln!(
            f,
            "  Written: {} records, {:.1} MB",
            self.records_written,
            self.bytes_written as f64 / (1024.0 * 1024.0)
        )?;
        writeln!(f, "  Finalized segments: {}", self.segments_finalized)?;
        writeln!(
            f,
            "  Flushes: {} ({} over budget)",
            self.flushes, self.flush_overruns
        )?;
        writeln!(f, "  Recovered segments: {}", self.recovered_segments)?;
        writeln!(f, "  Partial shutdowns: {}", self.partial_shutdowns)?;
        writeln!(f, "  Logged drops: {}", self.logged_drops)?;
        Ok(())
    }
}

pub struct SegmentManager {
    dir: PathBuf,
    rotation: RotationConfig,
    retry: RetryPolicy,
    flush_budget: Duration,
    active: Option<ActiveSegment>,
    next_segment_id: u64,
    next_sequence: u64,
    last_sequence: Option<u64>,
    index: LogIndex,
    recovery: RecoveryReport,
    drops_seen: [DropCounts; RecordType::COUNT],
    drops_logged: [DropCounts; RecordType::COUNT],
    stats: SegmentStats,
}

impl SegmentManager {
    /// 打开日志目录
    ///
    /// 先恢复所有未定稿的段，再重建索引，最后创建新的活动段。
    /// 段号接在已有最大段号之后，序列号接在已有最大序列号之后。
    pub fn open(config: &DaemonConfig) -> Result<Self> {
        let dir = config.dir.clone();
        fs::create_dir_all(&dir)?;

        let recovery = recover_dir(&dir)?;
        let mut index = LogIndex::rebuild(&dir)?;
        for id in index.segment_ids().collect::<Vec<_>>() {
            index.seal(id);
        }

        let next_sequence = index.next_sequence();
        let mut manager = Self {
            next_segment_id: index.next_segment_id(),
            next_sequence,
            last_sequence: next_sequence.checked_sub(1),
            rotation: config.rotation.clone(),
            retry: config.io_retry.policy(),
            flush_budget: config.flush.budget(),
            active: None,
            drops_seen: Default::default(),
            drops_logged: Default::default(),
            stats: SegmentStats {
                recovered_segments: recovery.recovered.len() as u64,
                logged_drops: index.total_drops(),
                next_sequence,
                ..Default::default()
            },
            dir,
            index,
            recovery,
        };
        manager.open_segment()?;
        Ok(manager)
    }

    /// 下一个待分配的序列号
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    pub fn index(&self) -> &LogIndex {
        &self.index
    }

    pub fn active_segment_id(&self) -> Option<u64> {
        self.active.as_ref().map(|active| active.id)
    }

    /// 更新各通道的累计丢弃数，下次定稿时把增量写进段尾
    pub fn observe_drops(&mut self, cumulative: [DropCounts; RecordType::COUNT]) {
        self.drops_seen = cumulative;
    }

    fn pending_drops(&self) -> [DropCounts; RecordType::COUNT] {
        let mut pending = [DropCounts::default(); RecordType::COUNT];
        for (i, slot) in pending.iter_mut().enumerate() {
            *slot = self.drops_seen[i].since(&self.drops_logged[i]);
        }
        pending
    }

    fn open_segment(&mut self) -> Result<()> {
        let id = self.next_segment_id;
        let path = segment_path(&self.dir, id);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;

        let header = SegmentHeader::new(id, self.next_sequence, unix_ms());
        header.write_to(&mut file)?;
        file.sync_all()?;

        self.next_segment_id += 1;
        self.index.open_segment(id, self.next_sequence);
        info!("opened segment {}", path.display());

        self.active = Some(ActiveSegment {
            id,
            path,
            file,
            size: header.header_size as u64,
            frames: 0,
            record_count: 0,
            type_counts: [0; RecordType::COUNT],
            start_timestamp: f64::INFINITY,
            end_timestamp: f64::NEG_INFINITY,
            first_sequence: self.next_sequence,
            opened_at: Instant::now(),
        });
        Ok(())
    }

    /// 追加一帧，返回帧在段内的偏移
    ///
    /// 返回成功表示数据已交给操作系统，持久化由 [`flush`](Self::flush) 保证。
    pub fn append(&mut self, frame: &EncodedFrame) -> Result<u64> {
        if let Some(last) = self.last_sequence {
            if frame.sequence <= last {
                return Err(Error::SequenceRegression {
                    last,
                    got: frame.sequence,
                });
            }
        }

        let len = frame.bytes.len() as u64;
        let needs_rotation = match &self.active {
            Some(active) => active.frames > 0 && active.size + len > self.rotation.max_bytes,
            None => true,
        };
        if needs_rotation {
            self.rotate()?;
        }

        let offset = self.write_frame(&frame.bytes, frame.sequence, true)?;

        if let Some(active) = self.active.as_mut() {
            active.record_count += 1;
            active.type_counts[frame.record_type.index()] += 1;
            active.start_timestamp = active.start_timestamp.min(frame.timestamp);
            active.end_timestamp = active.end_timestamp.max(frame.timestamp);
        }
        self.stats.records_written += 1;
        debug!(
            "appended {} seq={} at {}",
            frame.record_type, frame.sequence, offset
        );
        Ok(offset)
    }

    fn write_frame(&mut self, bytes: &[u8], sequence: u64, is_record: bool) -> Result<u64> {
        if self.active.is_none() {
            self.open_segment()?;
        }
        let Some(active) = self.active.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no active segment").into());
        };
        let offset = active.size;
        let file = &mut active.file;
        with_retry(&self.retry, "append", || write_at(file, offset, bytes))?;

        active.size += bytes.len() as u64;
        active.frames += 1;
        self.index.insert(active.id, sequence, offset, is_record);
        self.last_sequence = Some(sequence);
        self.next_sequence = sequence + 1;
        self.stats.bytes_written += bytes.len() as u64;
        Ok(offset)
    }

    /// 活动段超过时长阈值时轮转，空段不轮转
    pub fn maybe_rotate(&mut self) -> Result<bool> {
        let max_age = self.rotation.max_age();
        let due = match &self.active {
            Some(active) => {
                active.frames > 0 && !max_age.is_zero() && active.opened_at.elapsed() >= max_age
            }
            None => false,
        };
        if due {
            self.rotate()?;
        }
        Ok(due)
    }

    /// 定稿当前段后再打开新段
    pub fn rotate(&mut self) -> Result<()> {
        if let Some(active) = &self.active {
            debug!(
                "rotating segment {:010} at {} bytes, {} records",
                active.id, active.size, active.record_count
            );
        }
        self.finalize_active(0)?;
        self.open_segment()
    }

    /// 将已写入的数据落盘
    pub fn flush(&mut self) -> Result<()> {
        let Some(active) = self.active.as_mut() else {
            return Ok(());
        };
        let start = Instant::now();
        let file = &active.file;
        with_retry(&self.retry, "flush", || file.sync_data())?;

        let elapsed = start.elapsed();
        self.stats.flushes += 1;
        self.stats.last_flush_unix_ms = Some(unix_ms());
        if elapsed > self.flush_budget {
            self.stats.flush_overruns += 1;
            warn!(
                "flush of segment {:010} took {:?} (budget {:?})",
                active.id, elapsed, self.flush_budget
            );
        }
        Ok(())
    }

    /// 正常关闭：定稿活动段，空段直接删除
    pub fn finalize(&mut self) -> Result<()> {
        self.finalize_active(0)
    }

    /// 关闭超时：追加部分关闭标记，段尾置 PARTIAL_SHUTDOWN
    pub fn finalize_with_shutdown_marker(&mut self, abandoned: u64, overrun_ms: u64) -> Result<()> {
        let timestamp = self
            .active
            .as_ref()
            .filter(|active| active.record_count > 0)
            .map(|active| active.end_timestamp)
            .unwrap_or(0.0);
        let sequence = self.next_sequence;
        let marker = encode_marker(
            FrameKind::ShutdownMarker,
            timestamp,
            sequence,
            abandoned,
            overrun_ms,
        );
        self.write_frame(&marker, sequence, false)?;
        self.stats.partial_shutdowns += 1;
        warn!(
            "partial shutdown: {} records abandoned, drain overran by {} ms",
            abandoned, overrun_ms
        );
        self.finalize_active(FOOTER_FLAG_PARTIAL_SHUTDOWN)
    }

    fn finalize_active(&mut self, flags: u32) -> Result<()> {
        let Some(mut active) = self.active.take() else {
            return Ok(());
        };
        let drops = self.pending_drops();
        let dropped: u64 = drops.iter().map(DropCounts::total).sum();

        // 有丢弃的空段也要定稿，否则丢弃计数无处落盘
        if active.frames == 0 && dropped == 0 {
            drop(active.file);
            fs::remove_file(&active.path)?;
            self.index.remove(active.id);
            self.next_segment_id = active.id;
            debug!("removed empty segment {}", active.path.display());
            return Ok(());
        }

        let footer = active.footer(flags, self.next_sequence, drops);
        let bytes = footer.to_bytes();
        let offset = active.size;
        let file = &mut active.file;
        with_retry(&self.retry, "finalize", || {
            write_at(file, offset, &bytes)?;
            file.sync_all()
        })?;

        self.index.set_drops(active.id, dropped);
        self.index.seal(active.id);
        self.drops_logged = self.drops_seen;
        self.stats.logged_drops += dropped;
        self.stats.segments_finalized += 1;
        info!(
            "finalized segment {} ({} records, {} dropped, {} bytes, seq {}..{})",
            active.path.display(),
            active.record_count,
            dropped,
            offset + bytes.len() as u64,
            active.first_sequence,
            self.next_sequence
        );
        Ok(())
    }

    pub fn stats(&self) -> SegmentStats {
        let mut stats = self.stats.clone();
        stats.next_sequence = self.next_sequence;
        if let Some(active) = &self.active {
            stats.active_segment_id = Some(active.id);
            stats.active_bytes = active.size;
            stats.active_records = active.record_count;
            stats.active_age_ms = active.opened_at.elapsed().as_millis() as u64;
        }
        stats
    }
}

impl Drop for SegmentManager {
    fn drop(&mut self) {
        if let Some(active) = &self.active {
            // 未定稿的段留给下次启动恢复
            debug!("segment {:010} left open at {} bytes", active.id, active.size);
        }
    }
}

/// 帧的磁盘大小
pub fn frame_size(record_type: RecordType) -> u64 {
    (FRAME_HEADER_SIZE + record_type.payload_size()) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::SEGMENT_HEADER_SIZE;
    use std::io::Cursor;
    use std::path::Path;
    use crate::frame::FrameWriter;
    use crate::record::{DriveCtrl, Imu, Sample};
    use crate::scan::{list_segments, SegmentScan};

    fn config(dir: &Path) -> DaemonConfig {
        DaemonConfig::with_dir(dir)
    }

    fn ctrl(ts: f64) -> crate::record::Record {
        DriveCtrl {
            yaw: 0.0,
            twist: [0.1, 0.2],
            timestamp: ts,
        }
        .to_record()
        .unwrap()
    }

    #[test]
    fn test_append_and_finalize() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = SegmentManager::open(&config(dir.path())).unwrap();
        let mut writer = FrameWriter::new(manager.next_sequence());

        let first = manager.append(&writer.encode(&ctrl(1.0))).unwrap();
        let second = manager
            .append(&writer.encode(&Imu::default().to_record().unwrap()))
            .unwrap();
        assert_eq!(first, SEGMENT_HEADER_SIZE);
        assert_eq!(second, SEGMENT_HEADER_SIZE + frame_size(RecordType::DriveCtrl));
        assert_eq!(manager.index().offset_of(0, 1), Some(second));

        manager.flush().unwrap();
        manager.finalize().unwrap();

        let stats = manager.stats();
        assert_eq!(stats.records_written, 2);
        assert_eq!(stats.segments_finalized, 1);
        assert_eq!(stats.active_segment_id, None);

        let scan = SegmentScan::scan(segment_path(dir.path(), 0)).unwrap();
        assert!(scan.is_complete());
        let footer = scan.footer.unwrap();
        assert_eq!(footer.record_count, 2);
        assert_eq!(footer.count_of(RecordType::Imu), 1);
        assert_eq!(footer.start_timestamp, 0.0);
        assert_eq!(footer.end_timestamp, 1.0);
        assert!(!footer.is_recovered());
    }

    #[test]
    fn test_sequence_regression_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = SegmentManager::open(&config(dir.path())).unwrap();
        let mut writer = FrameWriter::new(5);
        let frame = writer.encode(&ctrl(1.0));
        manager.append(&frame).unwrap();

        let err = manager.append(&frame).unwrap_err();
        assert!(matches!(err, Error::SequenceRegression { last: 5, got: 5 }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_size_rotation_before_append() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        let frame_len = frame_size(RecordType::DriveCtrl);
        // 恰好放下两帧
        cfg.rotation.max_bytes = SEGMENT_HEADER_SIZE + 2 * frame_len;
        let mut manager = SegmentManager::open(&cfg).unwrap();
        let mut writer = FrameWriter::new(0);

        for i in 0..3 {
            manager.append(&writer.encode(&ctrl(i as f64))).unwrap();
        }
        assert_eq!(manager.active_segment_id(), Some(1));
        manager.finalize().unwrap();

        let segments = list_segments(dir.path()).unwrap();
        assert_eq!(segments.len(), 2);
        let first = SegmentScan::scan(&segments[0].1).unwrap();
        let second = SegmentScan::scan(&segments[1].1).unwrap();
        assert_eq!(first.record_count(), 2);
        assert_eq!(second.record_count(), 1);
        assert_eq!(second.header.first_sequence, 2);
        assert_eq!(first.footer.unwrap().next_sequence, 2);
    }

    #[test]
    fn test_oversized_frame_gets_own_segment() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.rotation.max_bytes = 64;
        let mut manager = SegmentManager::open(&cfg).unwrap();
        let mut writer = FrameWriter::new(0);

        manager.append(&writer.encode(&ctrl(0.0))).unwrap();
        manager.append(&writer.encode(&ctrl(1.0))).unwrap();
        manager.finalize().unwrap();

        assert_eq!(list_segments(dir.path()).unwrap().len(), 2);
    }

    #[test]
    fn test_age_rotation_skips_empty_segment() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.rotation.max_age_ms = 5;
        let mut manager = SegmentManager::open(&cfg).unwrap();

        thread::sleep(Duration::from_millis(10));
        assert!(!manager.maybe_rotate().unwrap());

        let mut writer = FrameWriter::new(0);
        manager.append(&writer.encode(&ctrl(0.0))).unwrap();
        thread::sleep(Duration::from_millis(10));
        assert!(manager.maybe_rotate().unwrap());
        assert_eq!(manager.active_segment_id(), Some(1));
        assert!(SegmentScan::scan(segment_path(dir.path(), 0))
            .unwrap()
            .is_complete());
    }

    #[test]
    fn test_reopen_continues_numbering() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut manager = SegmentManager::open(&config(dir.path())).unwrap();
            let mut writer = FrameWriter::new(manager.next_sequence());
            for i in 0..3 {
                manager.append(&writer.encode(&ctrl(i as f64))).unwrap();
            }
            manager.finalize().unwrap();
        }

        let manager = SegmentManager::open(&config(dir.path())).unwrap();
        assert!(manager.recovery_report().is_clean());
        assert_eq!(manager.next_sequence(), 3);
        assert_eq!(manager.active_segment_id(), Some(1));
    }

    #[test]
    fn test_empty_segment_removed_on_finalize() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = SegmentManager::open(&config(dir.path())).unwrap();
        assert!(segment_path(dir.path(), 0).exists());
        manager.finalize().unwrap();
        assert!(list_segments(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_shutdown_marker() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = SegmentManager::open(&config(dir.path())).unwrap();
        let mut writer = FrameWriter::new(0);
        manager.append(&writer.encode(&ctrl(4.0))).unwrap();
        manager.finalize_with_shutdown_marker(7, 120).unwrap();
        assert_eq!(manager.stats().partial_shutdowns, 1);

        let scan = SegmentScan::scan(segment_path(dir.path(), 0)).unwrap();
        let footer = scan.footer.as_ref().unwrap();
        assert!(footer.is_partial_shutdown());
        assert_eq!(footer.record_count, 1);
        assert_eq!(footer.next_sequence, 2);
        let marker = scan.markers().next().unwrap();
        assert_eq!(marker.kind, FrameKind::ShutdownMarker);
        assert_eq!(marker.timestamp, 4.0);
    }

    /// 内存文件：写满 budget 字节后连续失败 failures 次，之后恢复正常
    struct FlakyFile {
        inner: Cursor<Vec<u8>>,
        budget: usize,
        failures: usize,
    }

    impl FlakyFile {
        fn new(initial: &[u8], budget: usize, failures: usize) -> Self {
            Self {
                inner: Cursor::new(initial.to_vec()),
                budget,
                failures,
            }
        }

        fn bytes(&self) -> &[u8] {
            self.inner.get_ref()
        }
    }

    impl Write for FlakyFile {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.failures == 0 {
                return self.inner.write(buf);
            }
            if self.budget == 0 {
                self.failures -= 1;
                return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
            }
            let n = buf.len().min(self.budget);
            self.budget -= n;
            self.inner.write(&buf[..n])
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Seek for FlakyFile {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            self.inner.seek(pos)
        }
    }

    impl SegmentFile for FlakyFile {
        fn truncate_to(&mut self, len: u64) -> io::Result<()> {
            self.inner.get_mut().truncate(len as usize);
            Ok(())
        }
    }

    fn busy() -> io::Error {
        io::Error::new(io::ErrorKind::Other, "device busy")
    }

    #[test]
    fn test_with_retry_succeeds_after_transient_failures() {
        let policy = RetryPolicy::linear(4, Duration::ZERO);
        let mut calls = 0;
        let value = with_retry(&policy, "append", || {
            calls += 1;
            if calls <= 3 {
                Err(busy())
            } else {
                Ok(calls)
            }
        })
        .unwrap();
        assert_eq!(value, 4);
    }

    #[test]
    fn test_with_retry_exhausts_attempts() {
        let policy = RetryPolicy::exponential(3, Duration::ZERO);
        let mut calls = 0;
        let err = with_retry(&policy, "flush", || -> io::Result<()> {
            calls += 1;
            Err(busy())
        })
        .unwrap_err();

        assert_eq!(calls, 3);
        assert!(matches!(err, Error::StorageExhausted { attempts: 3, .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_failed_write_rolls_back_to_offset() {
        let mut file = FlakyFile::new(b"HEAD", 3, 1);
        let err = write_at(&mut file, 4, b"FRAME").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Other);
        // 已写出的 "FRA" 被截掉
        assert_eq!(file.bytes(), b"HEAD");
    }

    #[test]
    fn test_retried_write_leaves_no_torn_bytes() {
        let mut file = FlakyFile::new(b"HEAD", 3, 1);
        let policy = RetryPolicy::linear(3, Duration::ZERO);
        with_retry(&policy, "append", || write_at(&mut file, 4, b"FRAME")).unwrap();
        assert_eq!(file.bytes(), b"HEADFRAME");
    }

    #[test]
    fn test_flush_over_budget_is_counted() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.flush.budget_ms = 0;
        let mut manager = SegmentManager::open(&cfg).unwrap();
        let mut writer = FrameWriter::new(0);
        manager.append(&writer.encode(&ctrl(0.0))).unwrap();

        manager.flush().unwrap();
        manager.flush().unwrap();
        let stats = manager.stats();
        assert_eq!(stats.flushes, 2);
        assert_eq!(stats.flush_overruns, 2);
        assert!(stats.last_flush_unix_ms.is_some());
    }

    fn drops_of(record_type: RecordType, drops: DropCounts) -> [DropCounts; RecordType::COUNT] {
        let mut all = [DropCounts::default(); RecordType::COUNT];
        all[record_type.index()] = drops;
        all
    }

    #[test]
    fn test_drops_written_per_segment() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = SegmentManager::open(&config(dir.path())).unwrap();
        let mut writer = FrameWriter::new(0);

        manager.append(&writer.encode(&ctrl(0.0))).unwrap();
        let first = DropCounts {
            dropped_oldest: 3,
            dropped_newest: 0,
            timeout_drops: 1,
        };
        manager.observe_drops(drops_of(RecordType::DriveCtrl, first));
        manager.rotate().unwrap();

        // 累计值，第二段只记增量
        manager.append(&writer.encode(&ctrl(1.0))).unwrap();
        let second = DropCounts {
            dropped_oldest: 5,
            dropped_newest: 0,
            timeout_drops: 1,
        };
        manager.observe_drops(drops_of(RecordType::DriveCtrl, second));
        manager.finalize().unwrap();
        assert_eq!(manager.stats().logged_drops, 6);

        let first_footer = SegmentScan::scan(segment_path(dir.path(), 0))
            .unwrap()
            .footer
            .unwrap();
        assert_eq!(first_footer.drops_of(RecordType::DriveCtrl), first);
        let second_footer = SegmentScan::scan(segment_path(dir.path(), 1))
            .unwrap()
            .footer
            .unwrap();
        assert_eq!(
            second_footer.drops_of(RecordType::DriveCtrl),
            DropCounts {
                dropped_oldest: 2,
                dropped_newest: 0,
                timeout_drops: 0,
            }
        );
        assert_eq!(second_footer.total_drops(), 2);

        let reopened = SegmentManager::open(&config(dir.path())).unwrap();
        assert_eq!(reopened.index().total_drops(), 6);
        assert_eq!(reopened.stats().logged_drops, 6);
    }

    #[test]
    fn test_empty_segment_with_drops_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = SegmentManager::open(&config(dir.path())).unwrap();
        let drops = DropCounts {
            dropped_oldest: 0,
            dropped_newest: 2,
            timeout_drops: 0,
        };
        manager.observe_drops(drops_of(RecordType::StereoFrame, drops));
        manager.finalize().unwrap();

        let scan = SegmentScan::scan(segment_path(dir.path(), 0)).unwrap();
        assert!(scan.is_complete());
        assert_eq!(scan.record_count(), 0);
        assert_eq!(scan.footer.unwrap().drops_of(RecordType::StereoFrame), drops);
    }
}
