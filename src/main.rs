use anyhow::{Context, Result};
use messaging_hub::{
    cli::{Cli, Commands},
    config::{self, HubConfig},
    logging, HubServer,
};
use std::fs;
use std::process;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<()> {
    // 加载 .env 文件（如果存在）
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    if let Some(command) = &cli.command {
        return match command {
            Commands::GenerateConfig { path } => generate_config(path),
            Commands::ValidateConfig { path } => validate_config(path),
            Commands::ShowConfig => show_config(&cli),
        };
    }

    // 快速读取配置文件的 [logging] 段（不加载完整配置）
    let early_log = config::load_early_logging_config(cli.config_file.as_deref());

    // 合并日志配置（优先级：CLI > 配置文件 > 默认值）
    let log_level = cli
        .get_log_level()
        .or(early_log.level)
        .unwrap_or_else(|| "info".to_string());
    let log_format = cli.get_log_format().or(early_log.format);
    let log_file = cli.log_file.clone().or(early_log.file);

    let _log_guard =
        logging::init_logging(&log_level, log_format.as_deref(), log_file.as_deref(), cli.quiet)?;

    tracing::info!("🚀 Messaging Hub starting...");

    // 加载配置（按优先级：命令行 > 环境变量 > 配置文件 > 默认值）
    let config = HubConfig::load(&cli).context("加载配置失败")?;
    if cli.dev {
        tracing::info!("🔧 开发模式已启用");
    }

    let server = match HubServer::new(config).await {
        Ok(server) => server,
        Err(e) => {
            tracing::error!("❌ 服务初始化失败: {}", e);
            tracing::error!("💡 请检查 Redis、Kafka 与目录服务配置后重试");
            process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("收到 Ctrl+C，开始关闭...");
        }
        let _ = shutdown_tx.send(true);
    });

    if let Err(e) = server.run(shutdown_rx).await {
        tracing::error!("❌ 服务运行失败: {}", e);
        process::exit(1);
    }

    Ok(())
}

/// 生成默认配置文件
fn generate_config(path: &str) -> Result<()> {
    fs::write(path, config::DEFAULT_CONFIG_TOML)
        .with_context(|| format!("无法写入配置文件: {}", path))?;
    println!("✅ 配置文件已生成: {}", path);
    Ok(())
}

/// 验证配置文件
fn validate_config(path: &str) -> Result<()> {
    let config =
        HubConfig::from_toml_file(path).with_context(|| format!("配置文件验证失败: {}", path))?;
    config.validate()?;

    println!("✅ 配置文件有效: {}", path);
    println!("📊 配置摘要:");
    println!("  - Listen: {}{}", config.server.bind_address(), config.server.ws_path);
    println!("  - Redis: {}", config.redis.is_some());
    println!("  - Kafka: {}", config.kafka.enabled);
    println!("  - Pending TTL: {}s", config.hub.pending_ttl_secs);
    Ok(())
}

/// 显示最终配置（合并后的配置）
fn show_config(cli: &Cli) -> Result<()> {
    let _guard = logging::init_logging("info", None, None, false)?;

    let config = HubConfig::load(cli).context("加载配置失败")?;
    println!("📊 最终配置（合并后的配置）:");
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
