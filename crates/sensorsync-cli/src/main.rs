//! Sensorsync CLI
//!
//! 命令行客户端：发现传感器、连接并同步其时钟

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use sensorsync_core::SyncSettings;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sensorsync", version, about = "发现传感器并同步时钟")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 扫描附近的传感器
    Scan {
        /// 扫描时长 (秒)
        #[arg(short, long, default_value = "10")]
        duration: u64,
        /// 回放录制的扫描结果 (JSON)，不使用蓝牙适配器
        #[arg(long)]
        replay: Option<PathBuf>,
    },
    /// 对本地回环服务演示发现、连接和时钟同步
    Demo {
        /// 回放录制的扫描结果 (JSON)，不使用蓝牙适配器
        #[arg(long)]
        replay: Option<PathBuf>,
        /// 要连接的设备地址 (默认: 第一个发现的设备)
        #[arg(short, long)]
        address: Option<String>,
        /// 回环服务分配的序列号 (默认: 从名称中提取)
        #[arg(short, long)]
        serial: Option<String>,
    },
    /// 查看当前设置
    Settings {
        /// 写入设置文件
        #[arg(long)]
        save: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = SyncSettings::load();

    // sensorsync-core 通过 log crate 输出日志
    let _ = tracing_log::LogTracer::init();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(settings.log_level.filter_directive())),
        )
        .with_writer(std::io::stderr)
        .try_init();
    tracing::debug!(
        "Settings from {}",
        SyncSettings::config_path().display()
    );

    match cli.command {
        Commands::Scan { duration, replay } => {
            commands::scan(&settings, duration, replay.as_deref()).await?;
        }
        Commands::Demo {
            replay,
            address,
            serial,
        } => {
            commands::demo(&settings, replay.as_deref(), address, serial).await?;
        }
        Commands::Settings { save } => {
            println!("# {}", SyncSettings::config_path().display());
            print!("{}", describe(&settings));
            if save {
                settings.save()?;
                println!("✅ 设置已保存");
            }
        }
    }

    Ok(())
}

fn describe(settings: &SyncSettings) -> String {
    format!(
        "name_prefix = {:?}\nuri_scheme = {:?}\ntime_resource = {:?}\nmin_rssi = {}\nservice_uuids = {:?}\nlog_level = {:?}\n",
        settings.name_prefix,
        settings.uri_scheme,
        settings.time_resource,
        settings
            .min_rssi
            .map_or_else(|| "(none)".to_string(), |r| r.to_string()),
        settings
            .service_uuids
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>(),
        settings.log_level.name(),
    )
}
