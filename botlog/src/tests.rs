//! 场景测试
//!
//! 轮转、崩溃恢复、跨通道排序和端到端写入

use std::fs::{self, OpenOptions};
use std::path::Path;

use crate::channel::{Admission, AdmissionPolicy};
use crate::config::{ChannelConfig, DaemonConfig};
use crate::daemon::Daemon;
use crate::frame::{FrameKind, FrameWriter};
use crate::index::LogIndex;
use crate::reader::{LogEntry, LogReader, SegmentReader};
use crate::record::{DriveCtrl, DriveState, Imu, Record, RecordType, Sample, StereoFrame};
use crate::scan::{list_segments, segment_path, SegmentScan};
use crate::segment::{frame_size, SegmentManager};

fn read_all(dir: &Path) -> Vec<LogEntry> {
    LogReader::open(dir)
        .unwrap()
        .collect::<crate::Result<Vec<_>>>()
        .unwrap()
}

fn imu(ts: f64) -> Record {
    Imu {
        gyro: [0.01, 0.02, 0.03],
        accel: [0.0, 0.0, 9.81, 0.0, 0.0, 9.81],
        timestamp: ts,
    }
    .to_record()
    .unwrap()
}

/// 累计大小超过阈值：恰好两个段，第一个段在第二个段写入任何帧前已定稿
#[test]
fn test_rotation_finalizes_before_next_write() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = DaemonConfig::with_dir(dir.path());
    let per_frame = frame_size(RecordType::Imu);
    config.rotation.max_bytes = 32 + 10 * per_frame;

    let mut manager = SegmentManager::open(&config).unwrap();
    let mut writer = FrameWriter::new(0);

    for i in 0..10 {
        manager.append(&writer.encode(&imu(i as f64))).unwrap();
    }
    // 第一个段已满但还没有定稿
    assert_eq!(manager.active_segment_id(), Some(0));
    assert!(!SegmentScan::scan(segment_path(dir.path(), 0))
        .unwrap()
        .is_complete());

    manager.append(&writer.encode(&imu(10.0))).unwrap();
    let first = SegmentScan::scan(segment_path(dir.path(), 0)).unwrap();
    let second = SegmentScan::scan(segment_path(dir.path(), 1)).unwrap();
    assert!(first.is_complete());
    assert_eq!(first.record_count(), 10);
    assert_eq!(second.frames.len(), 1);
    assert_eq!(second.frames[0].sequence, 10);

    for i in 11..15 {
        manager.append(&writer.encode(&imu(i as f64))).unwrap();
    }
    manager.finalize().unwrap();

    let segments = list_segments(dir.path()).unwrap();
    println!("segments: {:?}", segments);
    assert_eq!(segments.len(), 2);

    let sequences: Vec<u64> = read_all(dir.path()).iter().map(LogEntry::sequence).collect();
    assert_eq!(sequences, (0..15).collect::<Vec<_>>());
}

/// 崩溃后截断在记录中间：恢复后只保留完整记录，外加一个恢复标记
#[test]
fn test_crash_recovery_mid_record() {
    let dir = tempfile::tempdir().unwrap();
    let config = DaemonConfig::with_dir(dir.path());

    {
        let mut manager = SegmentManager::open(&config).unwrap();
        let mut writer = FrameWriter::new(0);
        for i in 0..6 {
            manager.append(&writer.encode(&imu(i as f64 * 0.01))).unwrap();
        }
        manager.flush().unwrap();
        // 不定稿，模拟断电
    }

    let path = segment_path(dir.path(), 0);
    let len = fs::metadata(&path).unwrap().len();
    let file = OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(len - 30).unwrap();
    drop(file);

    let daemon = Daemon::new(config).unwrap();
    let report = daemon.recovery_report().clone();
    println!("recovery: {:?}", report);
    assert_eq!(report.recovered.len(), 1);
    assert_eq!(report.recovered[0].recovered_frames, 5);
    daemon.shutdown().unwrap();

    let reader = SegmentReader::open(&path).unwrap();
    let footer = reader.footer().unwrap().clone();
    assert!(footer.is_recovered());
    assert_eq!(footer.record_count, 5);

    let entries: Vec<_> = reader.collect::<crate::Result<_>>().unwrap();
    assert_eq!(entries.len(), 6);
    for (i, entry) in entries[..5].iter().enumerate() {
        let record = entry.record().unwrap();
        assert_eq!(record, &imu(i as f64 * 0.01));
    }
    match &entries[5] {
        LogEntry::Marker {
            kind,
            sequence,
            values,
            ..
        } => {
            assert_eq!(*kind, FrameKind::RecoveryMarker);
            assert_eq!(*sequence, 5);
            assert_eq!(values.1, 5);
        }
        other => panic!("expected recovery marker, got {:?}", other),
    }
}

/// 端到端：StereoFrame(1.0)、DriveCtrl(0.5)、Imu(0.75) 按时间戳写入同一个段
#[test]
fn test_end_to_end_ordering() {
    let dir = tempfile::tempdir().unwrap();
    let mut daemon = Daemon::new(DaemonConfig::with_dir(dir.path())).unwrap();

    let stereo = daemon.take_producer(RecordType::StereoFrame).unwrap();
    let ctrl = daemon.take_producer(RecordType::DriveCtrl).unwrap();
    let imu_producer = daemon.take_producer(RecordType::Imu).unwrap();

    let mut frame = StereoFrame::blank(1.0);
    frame.stereo[0] = 0x7F;
    assert!(stereo.submit_sample(&frame).unwrap().is_accepted());
    let command = DriveCtrl {
        yaw: 0.25,
        twist: [0.5, -0.1],
        timestamp: 0.5,
    };
    assert!(ctrl.submit_sample(&command).unwrap().is_accepted());
    assert!(imu_producer.submit_record(imu(0.75)).unwrap().is_accepted());

    daemon.start().unwrap();
    let report = daemon.shutdown().unwrap();
    println!("shutdown: {:?}", report);
    assert_eq!(report.records_written, 3);
    assert_eq!(report.segments_finalized, 1);
    assert!(!report.partial);

    let segments = list_segments(dir.path()).unwrap();
    assert_eq!(segments.len(), 1);
    let scan = SegmentScan::scan(&segments[0].1).unwrap();
    assert!(scan.is_complete());

    let records: Vec<Record> = read_all(dir.path())
        .into_iter()
        .filter_map(LogEntry::into_record)
        .collect();
    let order: Vec<_> = records.iter().map(Record::record_type).collect();
    assert_eq!(
        order,
        vec![
            RecordType::DriveCtrl,
            RecordType::Imu,
            RecordType::StereoFrame
        ]
    );
    assert_eq!(DriveCtrl::from_record(&records[0]), Some(command));
    assert_eq!(StereoFrame::from_record(&records[2]).unwrap().stereo[0], 0x7F);
}

/// 索引重建：每个序列号都能映射到帧偏移
#[test]
fn test_index_rebuild_maps_every_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = DaemonConfig::with_dir(dir.path());
    config.rotation.max_bytes = 32 + 4 * frame_size(RecordType::DriveState);

    {
        let mut manager = SegmentManager::open(&config).unwrap();
        let mut writer = FrameWriter::new(0);
        for i in 0..10 {
            let state = DriveState {
                pos: [i as f32, -(i as f32)],
                timestamp: i as f64,
                ..Default::default()
            };
            manager
                .append(&writer.encode(&state.to_record().unwrap()))
                .unwrap();
        }
        manager.finalize().unwrap();
    }

    let index = LogIndex::rebuild(dir.path()).unwrap();
    assert_eq!(index.segment_count(), 3);
    assert_eq!(index.total_records(), 10);
    assert_eq!(index.next_sequence(), 10);

    for seq in 0..10u64 {
        let (segment_id, offset) = index.locate(seq).unwrap();
        let scan = SegmentScan::scan(segment_path(dir.path(), segment_id)).unwrap();
        let frame = scan.frames.iter().find(|f| f.offset == offset).unwrap();
        assert_eq!(frame.sequence, seq);
    }
    assert_eq!(index.locate(10), None);
}

/// 重启后段号和序列号继续递增
#[test]
fn test_restart_continues_sequences() {
    let dir = tempfile::tempdir().unwrap();

    for round in 0..3 {
        let daemon = Daemon::new(DaemonConfig::with_dir(dir.path())).unwrap();
        let producer = daemon.take_producer(RecordType::Imu).unwrap();
        for i in 0..4 {
            producer.submit_record(imu((round * 4 + i) as f64)).unwrap();
        }
        // Drop 时执行关闭
        drop(daemon);
    }

    let segments = list_segments(dir.path()).unwrap();
    assert_eq!(segments.len(), 3);
    let sequences: Vec<u64> = read_all(dir.path()).iter().map(LogEntry::sequence).collect();
    assert_eq!(sequences, (0..12).collect::<Vec<_>>());
}

/// 通道满时按策略丢弃并计数，写入的只有被接纳的记录
#[test]
fn test_admission_counters_through_daemon() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = DaemonConfig::with_dir(dir.path());
    config.channels.insert(
        RecordType::Imu,
        ChannelConfig {
            capacity: 4,
            policy: AdmissionPolicy::DropOldest,
        },
    );
    config.channels.insert(
        RecordType::DriveState,
        ChannelConfig {
            capacity: 2,
            policy: AdmissionPolicy::DropNewest,
        },
    );
    let daemon = Daemon::new(config).unwrap();
    let imu_producer = daemon.take_producer(RecordType::Imu).unwrap();
    let state_producer = daemon.take_producer(RecordType::DriveState).unwrap();

    for i in 0..6 {
        imu_producer.submit_record(imu(i as f64)).unwrap();
    }
    let mut outcomes = Vec::new();
    for i in 0..3 {
        let state = DriveState {
            timestamp: 100.0 + i as f64,
            ..Default::default()
        };
        outcomes.push(state_producer.submit_sample(&state).unwrap());
    }
    assert_eq!(outcomes[2], Admission::DroppedNewest);

    let metrics = daemon.metrics();
    println!("{}", serde_json::to_string_pretty(&metrics).unwrap());
    let imu_stats = metrics.channel(RecordType::Imu).unwrap();
    assert_eq!(imu_stats.dropped_oldest, 2);
    assert_eq!(imu_stats.len, 4);
    assert_eq!(metrics.channel(RecordType::DriveState).unwrap().dropped_newest, 1);
    assert_eq!(metrics.total_drops(), 3);

    daemon.shutdown().unwrap();

    let timestamps: Vec<f64> = read_all(dir.path()).iter().map(LogEntry::timestamp).collect();
    assert_eq!(timestamps, vec![2.0, 3.0, 4.0, 5.0, 100.0, 101.0]);
}

/// 丢弃计数随段尾落盘，重启后仍可查到
#[test]
fn test_drop_counts_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = DaemonConfig::with_dir(dir.path());
    config.channels.insert(
        RecordType::DriveState,
        ChannelConfig {
            capacity: 1,
            policy: AdmissionPolicy::DropNewest,
        },
    );

    {
        let daemon = Daemon::new(config.clone()).unwrap();
        let producer = daemon.take_producer(RecordType::DriveState).unwrap();
        for i in 0..5 {
            let state = DriveState {
                timestamp: i as f64,
                ..Default::default()
            };
            producer.submit_sample(&state).unwrap();
        }
        assert_eq!(daemon.metrics().total_drops(), 4);
        daemon.shutdown().unwrap();
    }

    let reader = SegmentReader::open(segment_path(dir.path(), 0)).unwrap();
    let footer = reader.footer().unwrap();
    assert_eq!(footer.record_count, 1);
    assert_eq!(footer.drops_of(RecordType::DriveState).dropped_newest, 4);

    // 新进程的内存计数从零开始，历史丢弃从段尾读回
    let daemon = Daemon::new(config).unwrap();
    let metrics = daemon.metrics();
    assert_eq!(metrics.total_drops(), 0);
    assert_eq!(metrics.segments.logged_drops, 4);
    daemon.shutdown().unwrap();
}
