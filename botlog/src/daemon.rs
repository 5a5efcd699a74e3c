//! 守护进程
//!
//! 把通道、调度线程和段管理器组装起来：
//!
//! ```text
//! producer ─► ChannelBuffer ─┐
//! producer ─► ChannelBuffer ─┼─► Dispatcher ─► FrameWriter ─► SegmentManager ─► *.blog
//! producer ─► ChannelBuffer ─┘
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info};

use crate::channel::{ChannelBuffer, ChannelSnapshot, Producer};
use crate::config::DaemonConfig;
use crate::dispatcher::{Dispatcher, ShutdownReport};
use crate::error::{Error, Result};
use crate::record::RecordType;
use crate::recovery::RecoveryReport;
use crate::segment::{SegmentManager, SegmentStats};

/// 运行状态快照
#[derive(Debug, Clone, Serialize)]
pub struct DaemonMetrics {
    pub running: bool,
    pub channels: Vec<ChannelSnapshot>,
    pub segments: SegmentStats,
    pub recovery: RecoveryReport,
}

impl DaemonMetrics {
    pub fn channel(&self, record_type: RecordType) -> Option<&ChannelSnapshot> {
        self.channels
            .iter()
            .find(|snapshot| snapshot.record_type == record_type)
    }

    pub fn total_drops(&self) -> u64 {
        self.channels.iter().map(ChannelSnapshot::total_drops).sum()
    }
}

enum State {
    Idle(Dispatcher),
    Running(JoinHandle<Result<ShutdownReport>>),
    Stopped,
}

pub struct Daemon {
    config: DaemonConfig,
    channels: Vec<Arc<ChannelBuffer>>,
    producers: Mutex<Vec<Option<Producer>>>,
    stats: Arc<Mutex<SegmentStats>>,
    recovery: RecoveryReport,
    stop: Arc<AtomicBool>,
    state: State,
}

impl Daemon {
    /// 校验配置，恢复日志目录，创建通道
    pub fn new(config: DaemonConfig) -> Result<Self> {
        config.validate()?;

        let segments = SegmentManager::open(&config)?;
        let recovery = segments.recovery_report().clone();

        let channels: Vec<Arc<ChannelBuffer>> = RecordType::ALL
            .iter()
            .map(|&rt| {
                let channel = config.channel(rt);
                Arc::new(ChannelBuffer::new(rt, channel.capacity, channel.policy))
            })
            .collect();
        let producers = channels
            .iter()
            .map(|channel| Some(Producer::new(Arc::clone(channel))))
            .collect();

        let stats = Arc::new(Mutex::new(SegmentStats::default()));
        let dispatcher = Dispatcher::new(&config, channels.clone(), segments, Arc::clone(&stats));

        info!(
            "botlog daemon ready in {} ({} segments recovered)",
            config.dir.display(),
            recovery.recovered.len()
        );

        Ok(Self {
            config,
            channels,
            producers: Mutex::new(producers),
            stats,
            recovery,
            stop: Arc::new(AtomicBool::new(false)),
            state: State::Idle(dispatcher),
        })
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// 取出某类型的生产者，每种类型只能取一次
    pub fn take_producer(&self, record_type: RecordType) -> Result<Producer> {
        self.producers.lock()[record_type.index()]
            .take()
            .ok_or(Error::ProducerTaken(record_type))
    }

    /// 启动调度线程
    pub fn start(&mut self) -> Result<()> {
        let dispatcher = match std::mem::replace(&mut self.state, State::Stopped) {
            State::Idle(dispatcher) => dispatcher,
            other => {
                self.state = other;
                return Err(Error::AlreadyStarted);
            }
        };

        let stop = Arc::clone(&self.stop);
        let handle = thread::Builder::new()
            .name("botlog-dispatch".into())
            .spawn(move || dispatcher.run(stop))?;
        self.state = State::Running(handle);
        Ok(())
    }

    /// 调度线程是否在运行（出现致命错误后会提前退出）
    pub fn is_running(&self) -> bool {
        match &self.state {
            State::Running(handle) => !handle.is_finished(),
            _ => false,
        }
    }

    pub fn metrics(&self) -> DaemonMetrics {
        DaemonMetrics {
            running: self.is_running(),
            channels: self.channels.iter().map(|channel| channel.snapshot()).collect(),
            segments: self.stats.lock().clone(),
            recovery: self.recovery.clone(),
        }
    }

    /// 停止调度线程，排空通道并定稿活动段
    ///
    /// 未启动时在当前线程完成排空和定稿。调度线程因致命错误退出时返回该错误。
    pub fn shutdown(mut self) -> Result<ShutdownReport> {
        self.stop_dispatcher()
    }

    fn stop_dispatcher(&mut self) -> Result<ShutdownReport> {
        self.stop.store(true, Ordering::Release);
        let report = match std::mem::replace(&mut self.state, State::Stopped) {
            State::Idle(dispatcher) => dispatcher.shutdown()?,
            State::Running(handle) => handle.join().map_err(|_| Error::DispatcherPanicked)??,
            State::Stopped => return Ok(ShutdownReport::default()),
        };
        info!(
            "botlog daemon stopped: {} records, {} segments finalized{}",
            report.records_written,
            report.segments_finalized,
            if report.partial { " (partial)" } else { "" }
        );
        Ok(report)
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        if let Err(e) = self.stop_dispatcher() {
            error!("botlog shutdown failed: {}", e);
        }
    }
}
