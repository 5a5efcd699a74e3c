//! botlog - 机器人遥测多路日志
//!
//! 特性：
//! - 每种记录类型一个有界无锁通道，满时按准入策略丢弃
//! - 单写线程按时间戳归并所有通道，时间戳相同时按优先级
//! - 分段存储：按大小/时长轮转，段尾带 CRC，定稿后不可变
//! - 断电安全：启动时截断到最后一个完整帧并打恢复标记

pub mod channel;
pub mod config;
pub mod constants;
pub mod daemon;
pub mod dispatcher;
pub mod error;
pub mod frame;
pub mod header;
pub mod index;
pub mod reader;
pub mod record;
pub mod recovery;
pub mod retry;
pub mod scan;
pub mod segment;

#[cfg(test)]
mod tests;

pub use channel::{
    Admission, AdmissionPolicy, ChannelBuffer, ChannelSnapshot, DropCounts, Producer,
};
pub use config::{ChannelConfig, DaemonConfig, FlushConfig, IoRetryConfig, RotationConfig};
pub use daemon::{Daemon, DaemonMetrics};
pub use dispatcher::ShutdownReport;
pub use error::{Error, Result};
pub use frame::{encode_frame, FrameKind, FrameWriter};
pub use header::{SegmentFooter, SegmentHeader};
pub use index::LogIndex;
pub use reader::{LogEntry, LogReader, SegmentReader};
pub use record::{DriveCtrl, DriveState, DriveStatus, Imu, Record, RecordType, Sample, StereoFrame};
pub use recovery::{recover_dir, RecoveryReport};
pub use scan::{list_segments, SegmentScan};
pub use segment::{SegmentManager, SegmentStats};
