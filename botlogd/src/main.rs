//! botlogd - 机器人遥测日志守护进程
//!
//! 三个子命令:
//! 1. run: 启动守护进程，用合成数据驱动全部通道，Ctrl+C 后排空并定稿
//! 2. export: 把段目录导出为每类型一个二进制文件加 CSV 索引
//! 3. config: 打印默认配置 JSON，可作为 `run --config` 的模板

mod export;
mod run;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use botlog::DaemonConfig;
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

const DEFAULT_EXPORT_DIR: &str = "botlog_export";

#[derive(Parser)]
#[command(name = "botlogd")]
#[command(about = "Robot telemetry logging daemon - multiplex sensor channels into segment files")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// 详细输出
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// 运行守护进程
    Run {
        /// 配置 JSON 文件路径
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// 日志目录（覆盖配置文件中的 dir）
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// 运行时长（秒），不指定则一直运行到 Ctrl+C
        #[arg(short = 't', long)]
        duration: Option<u64>,

        /// 不产生双目图像帧
        #[arg(long)]
        no_camera: bool,
    },

    /// 导出已定稿的段
    Export {
        /// 日志目录
        #[arg(short, long, default_value = "./botlog")]
        dir: PathBuf,

        /// 导出目录（会自动创建）
        #[arg(short = 'D', long = "out-dir", default_value = DEFAULT_EXPORT_DIR)]
        out_dir: PathBuf,
    },

    /// 打印默认配置
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 设置日志
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
        Commands::Run {
            config,
            dir,
            duration,
            no_camera,
        } => {
            let mut daemon_config = match &config {
                Some(path) => {
                    info!("botlogd: Loading config from {}", path.display());
                    DaemonConfig::from_file(path)
                        .with_context(|| format!("load config {}", path.display()))?
                }
                None => DaemonConfig::default(),
            };
            if let Some(dir) = dir {
                daemon_config.dir = dir;
            }
            run::run_daemon(run::RunOptions {
                config: daemon_config,
                duration: duration.map(Duration::from_secs),
                camera: !no_camera,
            })
            .await?;
        }
        Commands::Export { dir, out_dir } => {
            info!("botlogd: Export mode, input: {}", dir.display());
            info!("botlogd: Export dir: {}", out_dir.display());
            export::run_export(export::ExportOptions {
                dir: &dir,
                output_dir: &out_dir,
            })?;
        }
        Commands::Config => {
            println!("{}", DaemonConfig::default().to_json()?);
        }
    }

    Ok(())
}
