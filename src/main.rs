use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, Command};
use tracing::{error, info, warn};

use pipeline_scheduler::app::Application;
use pipeline_scheduler::runnables::builtin_runnables;
use pipeline_scheduler::shutdown::{wait_for_signal, ShutdownManager};
use scheduler_core::{init_logging, AppConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("scheduler")
        .version(env!("CARGO_PKG_VERSION"))
        .about("数据集成管道调度守护进程")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径，未指定时按默认路径查找"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别，覆盖配置文件")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式，覆盖配置文件")
                .value_parser(["json", "pretty", "compact"]),
        )
        .arg(
            Arg::new("check")
                .long("check")
                .help("只校验配置与管道目录后退出")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").map(String::as_str);
    let mut config = AppConfig::load(config_path).context("加载配置失败")?;
    if let Some(level) = matches.get_one::<String>("log-level") {
        config.logging.level = level.clone();
    }
    if let Some(format) = matches.get_one::<String>("log-format") {
        config.logging.format = format.clone();
    }

    init_logging(&config.logging)?;
    info!("启动管道调度守护进程 v{}", env!("CARGO_PKG_VERSION"));
    info!("管道配置: {}", config.scheduler.pipelines_path);

    let app = Application::new(config, builtin_runnables()).await?;
    if matches.get_flag("check") {
        info!("配置校验通过");
        return Ok(());
    }

    let shutdown_manager = ShutdownManager::new();
    let app = Arc::new(app);
    let mut app_handle = {
        let app = Arc::clone(&app);
        let shutdown_rx = shutdown_manager.subscribe().await;
        tokio::spawn(async move { app.run(shutdown_rx).await })
    };

    // 启动失败时 run 会提前返回
    tokio::select! {
        _ = wait_for_signal() => {
            info!("收到关闭信号，开始优雅关闭...");
            shutdown_manager.shutdown().await;
        }
        result = &mut app_handle => {
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(anyhow::anyhow!("守护进程任务异常退出: {e}")),
            };
        }
    }

    match tokio::time::timeout(Duration::from_secs(60), app_handle).await {
        Ok(Ok(Ok(()))) => info!("守护进程已优雅关闭"),
        Ok(Ok(Err(e))) => error!("守护进程关闭时发生错误: {e:#}"),
        Ok(Err(e)) => error!("守护进程任务异常退出: {e}"),
        Err(_) => warn!("关闭超时，强制退出"),
    }
    Ok(())
}
