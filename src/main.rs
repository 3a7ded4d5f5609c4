use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use batchpool_config::{AppConfig, LogLevel, OutputFormat};
use clap::{Arg, ArgMatches, Command};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod app;
mod shutdown;
mod task_feed;

use app::Application;
use shutdown::GracefulShutdown;

/// 收到关闭信号后等待作业取消完成的时间
const SHUTDOWN_GRACE: Duration = Duration::from_secs(60);

fn cli() -> Command {
    Command::new("batchpool")
        .version(env!("CARGO_PKG_VERSION"))
        .about("持久化Worker集群执行控制器 (Slurm/PBS/SGE/LSF)")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径，未指定时按默认位置查找")
                .global(true),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别，默认取配置文件中的值")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .global(true),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式，默认取配置文件中的值")
                .value_parser(["json", "pretty"])
                .global(true),
        )
        .arg(
            Arg::new("tasks")
                .short('t')
                .long("tasks")
                .value_name("FILE")
                .help("JSON任务文件")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .subcommand(Command::new("check").about("校验配置并打印每个池的Worker提交脚本"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();

    let config_path = matches.get_one::<String>("config");
    let config = AppConfig::load(config_path.map(String::as_str)).with_context(|| {
        format!(
            "加载配置失败: {}",
            config_path.map(String::as_str).unwrap_or("默认位置")
        )
    })?;

    let log_level = match matches.get_one::<String>("log-level") {
        Some(level) => level.parse::<LogLevel>().map_err(anyhow::Error::msg)?,
        None => config.observability.log_level,
    };
    let log_format = match matches.get_one::<String>("log-format") {
        Some(format) => format.parse::<OutputFormat>().map_err(anyhow::Error::msg)?,
        None => config.observability.log_format,
    };
    init_logging(log_level, log_format)?;

    let app = Application::new(config.clone())?;

    if matches.subcommand_matches("check").is_some() {
        return run_check(&app);
    }

    let failed = run_tasks(&app, &config, &matches).await?;
    if failed {
        std::process::exit(1);
    }
    Ok(())
}

fn run_check(app: &Application) -> Result<()> {
    for (pool, script) in app.check()? {
        println!("# ---- pool {pool} ({}) ----", script.job_name);
        println!("{}", script.text);
    }
    info!("配置校验通过");
    Ok(())
}

/// 执行任务文件，返回是否有任务失败
async fn run_tasks(app: &Application, config: &AppConfig, matches: &ArgMatches) -> Result<bool> {
    let tasks_path = matches
        .get_one::<PathBuf>("tasks")
        .context("需要通过 --tasks 指定任务文件")?;
    let tasks = task_feed::load_tasks(tasks_path).await?;

    if let Some(listen) = &config.observability.metrics_listen {
        install_metrics_exporter(listen)?;
    }

    let graceful = GracefulShutdown::new(SHUTDOWN_GRACE);
    let run = app.run(tasks, graceful.subscribe());
    let Some(result) = graceful.run(run, shutdown::wait_for_signal()).await else {
        return Ok(true);
    };

    let summary = result?;
    info!(
        completed = summary.completed,
        failed = summary.failed,
        cancelled = summary.cancelled,
        "运行结束"
    );
    Ok(summary.has_failures() || summary.cancelled > 0)
}

fn install_metrics_exporter(listen: &str) -> Result<()> {
    let addr: SocketAddr = listen
        .parse()
        .with_context(|| format!("无效的指标监听地址: {listen}"))?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("启动Prometheus指标导出器失败")?;
    info!("Prometheus指标导出器监听 {}", addr);
    Ok(())
}

/// 初始化日志系统
fn init_logging(log_level: LogLevel, log_format: OutputFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));

    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format {
        OutputFormat::Json => {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .context("初始化JSON日志格式失败")?;
        }
        OutputFormat::Pretty => {
            registry
                .with(tracing_subscriber::fmt::layer().pretty())
                .try_init()
                .context("初始化Pretty日志格式失败")?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_check_subcommand() {
        let matches = cli()
            .try_get_matches_from(["batchpool", "--config", "pools.toml", "check"])
            .unwrap();
        assert_eq!(
            matches.get_one::<String>("config").map(String::as_str),
            Some("pools.toml")
        );
        assert!(matches.subcommand_matches("check").is_some());
    }

    #[test]
    fn test_cli_rejects_unknown_log_format() {
        assert!(cli()
            .try_get_matches_from(["batchpool", "--log-format", "xml"])
            .is_err());
    }

    #[test]
    fn test_cli_tasks_path() {
        let matches = cli()
            .try_get_matches_from(["batchpool", "-t", "tasks.json", "-l", "debug"])
            .unwrap();
        assert_eq!(
            matches.get_one::<PathBuf>("tasks"),
            Some(&PathBuf::from("tasks.json"))
        );
        assert_eq!(
            matches.get_one::<String>("log-level").map(String::as_str),
            Some("debug")
        );
    }
}
