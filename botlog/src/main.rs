//! botlog 命令行工具
//!
//! 用法：
//!   botlog stats [dir]                # 每个段的统计
//!   botlog dump [dir] [--limit N]     # 逐帧打印
//!   botlog recover [dir]              # 只执行启动恢复

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use botlog::{list_segments, recover_dir, FrameKind, RecordType, SegmentScan};
use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

const DEFAULT_DIR: &str = "./botlog";

#[derive(Parser)]
#[command(name = "botlog")]
#[command(about = "Inspect and recover botlog segment directories", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// 详细输出
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// 显示每个段的统计
    Stats {
        /// 日志目录
        #[arg(default_value = DEFAULT_DIR)]
        dir: PathBuf,
    },

    /// 逐帧打印（序列号、类型、时间戳、偏移）
    Dump {
        /// 日志目录
        #[arg(default_value = DEFAULT_DIR)]
        dir: PathBuf,

        /// 最多打印的帧数
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// 恢复未定稿的段（不启动守护进程）
    Recover {
        /// 日志目录
        #[arg(default_value = DEFAULT_DIR)]
        dir: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Stats { dir } => cmd_stats(&dir),
        Commands::Dump { dir, limit } => cmd_dump(&dir, limit),
        Commands::Recover { dir } => cmd_recover(&dir),
    }
}

fn scan_dir(dir: &Path) -> Result<Vec<SegmentScan>> {
    let segments =
        list_segments(dir).with_context(|| format!("Failed to list {}", dir.display()))?;
    segments
        .iter()
        .map(|(_, path)| {
            SegmentScan::scan(path).with_context(|| format!("Failed to scan {}", path.display()))
        })
        .collect()
}

/// 显示统计信息
fn cmd_stats(dir: &Path) -> Result<()> {
    let scans = scan_dir(dir)?;

    println!("Segments in {}:", dir.display());
    println!(
        "  {:>10}  {:<10} {:>8}  {:>6} {:>6} {:>6} {:>6} {:>6}  {:>7}  {:>21}  {:>12}",
        "id",
        "state",
        "records",
        "stereo",
        "ctrl",
        "state",
        "status",
        "imu",
        "dropped",
        "time span",
        "bytes"
    );

    let mut total_records = 0u64;
    let mut total_drops = 0u64;
    let mut total_bytes = 0u64;
    let mut incomplete = 0usize;

    for scan in &scans {
        let state = match &scan.footer {
            Some(footer) if footer.is_partial_shutdown() => "partial",
            Some(footer) if footer.is_recovered() => "recovered",
            Some(_) => "complete",
            None => {
                incomplete += 1;
                "open"
            }
        };
        let counts = scan.type_counts();
        let drops = scan.footer.as_ref().map(|footer| footer.total_drops());
        let span = match scan.time_span() {
            Some((start, end)) => format!("{:.3}..{:.3}", start, end),
            None => "-".to_string(),
        };

        println!(
            "  {:>10}  {:<10} {:>8}  {:>6} {:>6} {:>6} {:>6} {:>6}  {:>7}  {:>21}  {:>12}",
            scan.segment_id(),
            state,
            scan.record_count(),
            counts[RecordType::StereoFrame.index()],
            counts[RecordType::DriveCtrl.index()],
            counts[RecordType::DriveState.index()],
            counts[RecordType::DriveStatus.index()],
            counts[RecordType::Imu.index()],
            drops.map_or_else(|| "-".to_string(), |n| n.to_string()),
            span,
            scan.file_len
        );

        total_records += scan.record_count();
        total_drops += drops.unwrap_or(0);
        total_bytes += scan.file_len;
    }

    println!(
        "\n{} segments, {} records, {} dropped in buffers, {:.1} MB",
        scans.len(),
        total_records,
        total_drops,
        total_bytes as f64 / (1024.0 * 1024.0)
    );
    if incomplete > 0 {
        println!("{} segment(s) without footer (active or crashed)", incomplete);
    }
    Ok(())
}

/// 逐帧打印
fn cmd_dump(dir: &Path, limit: Option<usize>) -> Result<()> {
    let scans = scan_dir(dir)?;
    let limit = limit.unwrap_or(usize::MAX);
    let mut printed = 0usize;

    'outer: for scan in &scans {
        println!(
            "# segment {:010} ({})",
            scan.segment_id(),
            if scan.is_complete() { "complete" } else { "open" }
        );
        for frame in &scan.frames {
            if printed >= limit {
                break 'outer;
            }
            let kind = match frame.kind {
                FrameKind::Record(rt) => rt.name(),
                FrameKind::RecoveryMarker => "<recovery>",
                FrameKind::ShutdownMarker => "<shutdown>",
            };
            println!(
                "{:>12} {:<14} {:>16.6} @{}",
                frame.sequence, kind, frame.timestamp, frame.offset
            );
            printed += 1;
        }
        if scan.trailing_bytes() > 0 {
            println!("# {} trailing bytes", scan.trailing_bytes());
        }
    }
    Ok(())
}

fn cmd_recover(dir: &Path) -> Result<()> {
    let report =
        recover_dir(dir).with_context(|| format!("Failed to recover {}", dir.display()))?;

    if report.is_clean() {
        println!("{} segments scanned, nothing to recover", report.scanned);
        return Ok(());
    }
    println!(
        "{} segments scanned, {} recovered:",
        report.scanned,
        report.recovered.len()
    );
    for segment in &report.recovered {
        println!(
            "  {:010}: kept {} records, discarded {} bytes{}",
            segment.segment_id,
            segment.recovered_frames,
            segment.discarded_bytes,
            if segment.header_rewritten {
                " (header rewritten)"
            } else {
                ""
            }
        );
    }
    Ok(())
}
