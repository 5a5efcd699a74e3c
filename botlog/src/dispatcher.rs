//! 调度器
//!
//! 唯一的消费者线程：从所有通道取记录，按时间戳排序写入，时间戳相同时按
//! 优先级。每个通道预取一条记录暂存，比较暂存记录即可选出下一条，不需要
//! 窥视队列。空通道直接跳过，调度器从不等待某个通道。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::channel::{ChannelBuffer, DropCounts};
use crate::config::{DaemonConfig, FlushConfig};
use crate::error::Result;
use crate::frame::FrameWriter;
use crate::record::{Record, RecordType};
use crate::segment::{SegmentManager, SegmentStats};

/// 关闭结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    pub records_written: u64,
    /// 收到停止信号后写入的记录数
    pub drained: u64,
    /// 超时未写入而放弃的记录数
    pub abandoned: u64,
    pub partial: bool,
    pub segments_finalized: u64,
}

pub struct Dispatcher {
    channels: Vec<Arc<ChannelBuffer>>, // 按 tag 排列
    staged: [Option<Record>; RecordType::COUNT],
    ranks: [usize; RecordType::COUNT],
    writer: FrameWriter,
    segments: SegmentManager,
    flush: FlushConfig,
    since_flush: u64,
    last_flush: Instant,
    poll_interval: Duration,
    shutdown_timeout: Duration,
    records_written: u64,
    stats: Arc<Mutex<SegmentStats>>,
}

impl Dispatcher {
    pub fn new(
        config: &DaemonConfig,
        channels: Vec<Arc<ChannelBuffer>>,
        segments: SegmentManager,
        stats: Arc<Mutex<SegmentStats>>,
    ) -> Self {
        debug_assert_eq!(channels.len(), RecordType::COUNT);
        let mut ranks = [0usize; RecordType::COUNT];
        for rt in RecordType::ALL {
            ranks[rt.index()] = config.priority_rank(rt);
        }
        *stats.lock() = segments.stats();

        Self {
            channels,
            staged: Default::default(),
            ranks,
            writer: FrameWriter::new(segments.next_sequence()),
            segments,
            flush: config.flush.clone(),
            since_flush: 0,
            last_flush: Instant::now(),
            poll_interval: config.poll_interval(),
            shutdown_timeout: config.shutdown_timeout(),
            records_written: 0,
            stats,
        }
    }

    pub fn segments(&self) -> &SegmentManager {
        &self.segments
    }

    /// 为空的暂存位从对应通道补一条
    fn refill(&mut self) {
        for (slot, channel) in self.staged.iter_mut().zip(&self.channels) {
            if slot.is_none() {
                *slot = channel.pop();
            }
        }
    }

    /// 选出时间戳最小的暂存记录，相同时取优先级高的
    fn select(&self) -> Option<usize> {
        self.staged
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|record| (i, record.timestamp())))
            .min_by(|&(a, ts_a), &(b, ts_b)| {
                ts_a.total_cmp(&ts_b)
                    .then_with(|| self.ranks[a].cmp(&self.ranks[b]))
            })
            .map(|(i, _)| i)
    }

    /// 写入下一条记录，没有可写记录时返回 false
    pub fn tick(&mut self) -> Result<bool> {
        self.refill();
        let Some(slot) = self.select() else {
            return Ok(false);
        };
        let Some(record) = self.staged[slot].take() else {
            return Ok(false);
        };

        let frame = self.writer.encode(&record);
        self.segments.append(&frame)?;
        self.records_written += 1;
        self.since_flush += 1;
        Ok(true)
    }

    /// 各通道的累计丢弃数，按 tag 排列
    fn drops(&self) -> [DropCounts; RecordType::COUNT] {
        let mut drops = [DropCounts::default(); RecordType::COUNT];
        for (slot, channel) in drops.iter_mut().zip(&self.channels) {
            *slot = channel.drops();
        }
        drops
    }

    fn publish(&self) {
        *self.stats.lock() = self.segments.stats();
    }

    /// 按条数或时间刷盘，按时长轮转
    ///
    /// 统计只在刷盘或轮转后发布，其余时候不碰锁。
    pub fn maintain(&mut self) -> Result<()> {
        self.segments.observe_drops(self.drops());

        let due = self.since_flush >= self.flush.every_records
            || (self.since_flush > 0 && self.last_flush.elapsed() >= self.flush.interval());
        if due {
            self.segments.flush()?;
            self.since_flush = 0;
            self.last_flush = Instant::now();
        }
        let rotated = self.segments.maybe_rotate()?;
        if due || rotated {
            self.publish();
        }
        Ok(())
    }

    /// 尚未写入的记录数（暂存 + 队列）
    pub fn pending(&self) -> u64 {
        let staged = self.staged.iter().filter(|slot| slot.is_some()).count();
        let queued: usize = self.channels.iter().map(|channel| channel.len()).sum();
        (staged + queued) as u64
    }

    /// 调度线程主循环，直到 stop 置位后排空并定稿
    pub fn run(mut self, stop: Arc<AtomicBool>) -> Result<ShutdownReport> {
        info!("dispatcher started at seq={}", self.writer.next_sequence());
        let result = self.run_loop(&stop);
        match result {
            Ok(()) => self.shutdown(),
            Err(e) => {
                error!("dispatcher stopped: {}", e);
                self.publish();
                Err(e)
            }
        }
    }

    fn run_loop(&mut self, stop: &AtomicBool) -> Result<()> {
        while !stop.load(Ordering::Acquire) {
            let step = self.tick().and_then(|wrote| {
                self.maintain()?;
                Ok(wrote)
            });
            match step {
                Ok(true) => {}
                Ok(false) => thread::sleep(self.poll_interval),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!("dispatcher: {}, continuing", e),
            }
        }
        Ok(())
    }

    /// 在关闭时限内排空所有通道，然后定稿活动段
    ///
    /// 超时仍有记录未写入时，追加部分关闭标记并在段尾置位。
    pub fn shutdown(mut self) -> Result<ShutdownReport> {
        let start = Instant::now();
        let deadline = start + self.shutdown_timeout;
        let before = self.records_written;

        while Instant::now() < deadline {
            if !self.tick()? {
                break;
            }
        }
        let drained = self.records_written - before;
        let abandoned = self.pending();
        self.segments.observe_drops(self.drops());

        let partial = abandoned > 0;
        if partial {
            let overrun_ms = start.elapsed().saturating_sub(self.shutdown_timeout).as_millis() as u64;
            warn!(
                "shutdown timeout {:?} exceeded with {} records pending",
                self.shutdown_timeout, abandoned
            );
            self.segments
                .finalize_with_shutdown_marker(abandoned, overrun_ms)?;
        } else {
            self.segments.flush()?;
            self.segments.finalize()?;
        }

        let stats = self.segments.stats();
        *self.stats.lock() = stats.clone();
        info!(
            "dispatcher stopped: {} records written, {} drained, {} abandoned, {} dropped",
            self.records_written, drained, abandoned, stats.logged_drops
        );
        debug!("{}", stats);

        Ok(ShutdownReport {
            records_written: self.records_written,
            drained,
            abandoned,
            partial,
            segments_finalized: stats.segments_finalized,
        })
    }
}
