//! 运行模式: 启动守护进程，用合成数据按标称周期驱动各通道

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use botlog::{
    Daemon, DaemonConfig, DriveCtrl, DriveState, DriveStatus, Imu, Producer, RecordType,
    StereoFrame,
};
use tracing::{debug, info, warn};

const STATUS_INTERVAL: Duration = Duration::from_secs(5);
const CHECK_INTERVAL: Duration = Duration::from_millis(100);

pub struct RunOptions {
    pub config: DaemonConfig,
    pub duration: Option<Duration>,
    pub camera: bool,
}

fn wall_clock() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// 合成数据源
struct Synthetic {
    record_type: RecordType,
    tick: u64,
    stereo: Option<StereoFrame>, // 复用 5.5 MB 的图像缓冲
}

impl Synthetic {
    fn new(record_type: RecordType) -> Self {
        Self {
            record_type,
            tick: 0,
            stereo: None,
        }
    }

    fn submit(&mut self, producer: &Producer) -> botlog::Result<botlog::Admission> {
        let timestamp = wall_clock();
        let phase = self.tick as f32 * 0.05;
        self.tick += 1;

        match self.record_type {
            RecordType::StereoFrame => {
                let frame = self
                    .stereo
                    .get_or_insert_with(|| StereoFrame::blank(timestamp));
                frame.timestamp = timestamp;
                // 滚动的竖条纹
                let column = (self.tick as usize * 8) % botlog::record::STEREO_WIDTH;
                for row in frame.stereo.chunks_exact_mut(botlog::record::STEREO_WIDTH * 3) {
                    row.fill(0x20);
                    row[column * 3..column * 3 + 3].fill(0xFF);
                }
                producer.submit_sample(&*frame)
            }
            RecordType::DriveCtrl => producer.submit_sample(&DriveCtrl {
                yaw: phase.sin() * 0.3,
                twist: [0.5, phase.cos() * 0.2],
                timestamp,
            }),
            RecordType::DriveState => {
                let vel = [0.5 + phase.sin() * 0.05, 0.5 - phase.sin() * 0.05];
                producer.submit_sample(&DriveState {
                    pos: [self.tick as f32 * vel[0] * 0.02, self.tick as f32 * vel[1] * 0.02],
                    vel,
                    torque: [0.8, 0.8],
                    timestamp,
                })
            }
            RecordType::DriveStatus => producer.submit_sample(&DriveStatus {
                voltage: 25.2 - self.tick as f32 * 0.001,
                timestamp,
            }),
            RecordType::Imu => producer.submit_sample(&Imu {
                gyro: [0.0, 0.0, phase.cos() * 0.1],
                accel: [
                    phase.sin() * 0.05,
                    0.0,
                    9.81,
                    phase.sin() * 0.05,
                    0.0,
                    9.81,
                ],
                timestamp,
            }),
        }
    }
}

/// 生产者线程：按标称周期提交，返回 (提交数, 被拒数)
fn spawn_producer(
    producer: Producer,
    running: Arc<AtomicBool>,
) -> Result<thread::JoinHandle<(u64, u64)>> {
    let record_type = producer.record_type();
    let handle = thread::Builder::new()
        .name(format!("synth-{}", record_type))
        .spawn(move || {
            let period = record_type.nominal_period();
            let mut source = Synthetic::new(record_type);
            let mut submitted = 0u64;
            let mut rejected = 0u64;
            let mut next = Instant::now();

            while running.load(Ordering::SeqCst) {
                match source.submit(&producer) {
                    Ok(admission) if admission.is_accepted() => {}
                    Ok(admission) => {
                        rejected += 1;
                        debug!("{}: {:?}", record_type, admission);
                    }
                    Err(e) => {
                        warn!("{}: submit failed: {}", record_type, e);
                        rejected += 1;
                    }
                }
                submitted += 1;

                next += period;
                let now = Instant::now();
                if next > now {
                    thread::sleep(next - now);
                } else {
                    // 落后太多时不追赶
                    next = now;
                }
            }
            (submitted, rejected)
        })?;
    Ok(handle)
}

/// 运行守护进程直到 Ctrl+C 或到达时长
pub async fn run_daemon(opts: RunOptions) -> Result<()> {
    let dir = opts.config.dir.clone();
    let mut daemon = Daemon::new(opts.config)
        .with_context(|| format!("open botlog daemon in {}", dir.display()))?;

    let recovery = daemon.recovery_report();
    if !recovery.is_clean() {
        warn!(
            "botlogd: recovered {} segment(s) left by a previous run",
            recovery.recovered.len()
        );
    }

    info!("botlogd: Logging to {}", dir.display());
    info!(
        "botlogd: Rotation at {} bytes or {} ms",
        daemon.config().rotation.max_bytes,
        daemon.config().rotation.max_age_ms
    );
    match opts.duration {
        Some(d) => info!("botlogd: Running for {:?}", d),
        None => info!("botlogd: Press Ctrl+C to stop"),
    }

    let running = Arc::new(AtomicBool::new(true));
    let running_clone = running.clone();
    tokio::spawn(async move {
        if let Ok(()) = tokio::signal::ctrl_c().await {
            info!("botlogd: Received Ctrl+C, stopping...");
            running_clone.store(false, Ordering::SeqCst);
        }
    });

    let mut producers = Vec::new();
    for record_type in RecordType::ALL {
        if record_type == RecordType::StereoFrame && !opts.camera {
            continue;
        }
        let producer = daemon.take_producer(record_type)?;
        producers.push((record_type, spawn_producer(producer, running.clone())?));
    }

    daemon.start()?;

    let start = Instant::now();
    let mut last_status = Instant::now();
    loop {
        tokio::time::sleep(CHECK_INTERVAL).await;
        if !running.load(Ordering::SeqCst) {
            break;
        }
        if opts.duration.is_some_and(|d| start.elapsed() >= d) {
            info!("botlogd: Duration elapsed, stopping...");
            break;
        }
        if !daemon.is_running() {
            warn!("botlogd: Dispatcher exited, stopping...");
            break;
        }
        if last_status.elapsed() >= STATUS_INTERVAL {
            let metrics = daemon.metrics();
            eprint!(
                "\rbotlogd: {} records, segment {:?}, {} drops",
                metrics.segments.records_written,
                metrics.segments.active_segment_id,
                metrics.total_drops()
            );
            last_status = Instant::now();
        }
    }

    // 先停生产者，再排空
    running.store(false, Ordering::SeqCst);
    for (record_type, handle) in producers {
        match handle.join() {
            Ok((submitted, rejected)) => {
                info!(
                    "botlogd: {} submitted {}, rejected {}",
                    record_type, submitted, rejected
                )
            }
            Err(_) => warn!("botlogd: {} producer panicked", record_type),
        }
    }

    let metrics = daemon.metrics();
    let report = daemon.shutdown().context("shut down botlog daemon")?;

    eprintln!();
    info!(
        "botlogd: Done. {} records written ({} drained at shutdown), {} segments finalized",
        report.records_written, report.drained, report.segments_finalized
    );
    if report.partial {
        warn!("botlogd: {} records abandoned at shutdown", report.abandoned);
    }
    println!("{}", serde_json::to_string_pretty(&report)?);
    println!("{}", serde_json::to_string_pretty(&metrics)?);

    Ok(())
}
