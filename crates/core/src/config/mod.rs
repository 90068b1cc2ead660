//! 应用配置
//!
//! 配置按以下顺序叠加，后者覆盖前者：
//! 1. 内置默认值（[`AppConfig::default`]）
//! 2. TOML 配置文件
//! 3. `SCHEDULER_` 前缀的环境变量，层级用双下划线分隔，
//!    例如 `SCHEDULER_SCHEDULER__MISFIRE_GRACE_SECONDS=600`

pub mod models;

use std::path::Path;

use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

pub use models::{
    ApiConfig, DatabaseConfig, LogConfig, ObservabilityConfig, SchedulerConfig,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub logging: LogConfig,
    pub api: ApiConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder().add_source(
            ConfigBuilder::try_from(&AppConfig::default()).context("构建默认配置失败")?,
        );

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = [
                "config/scheduler.toml",
                "scheduler.toml",
                "/etc/scheduler/config.toml",
            ];
            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("SCHEDULER")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    pub fn validate(&self) -> Result<()> {
        self.database.validate()?;
        self.scheduler.validate()?;
        self.logging.validate()?;
        self.api.validate()?;
        self.observability.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scheduler.misfire_grace_seconds, 300);
        assert_eq!(config.scheduler.heartbeat_stale_after_seconds(), 30);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = AppConfig::from_toml(
            r#"
            [database]
            url = "sqlite::memory:"

            [scheduler]
            misfire_grace_seconds = 60
            allow_multiple_instances = true
            "#,
        )
        .unwrap();

        assert_eq!(config.database.url, "sqlite::memory:");
        assert_eq!(config.database.max_connections, 5);
        assert_eq!(config.scheduler.misfire_grace_seconds, 60);
        assert!(config.scheduler.allow_multiple_instances);
        assert_eq!(config.scheduler.poll_interval_ms, 1000);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let bad_jitter = AppConfig::from_toml(
            r#"
            [scheduler]
            retry_jitter_factor = 1.5
            "#,
        );
        assert!(bad_jitter.is_err());

        let bad_db = AppConfig::from_toml(
            r#"
            [database]
            url = "postgresql://localhost/scheduler"
            "#,
        );
        assert!(bad_db.is_err());

        let bad_format = AppConfig::from_toml(
            r#"
            [logging]
            format = "xml"
            "#,
        );
        assert!(bad_format.is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
            [scheduler]
            pipelines_path = "/tmp/pipelines.toml"
            heartbeat_interval_seconds = 5
            "#
        )
        .unwrap();

        let config = AppConfig::load(file.path().to_str()).unwrap();
        assert_eq!(config.scheduler.pipelines_path, "/tmp/pipelines.toml");
        assert_eq!(config.scheduler.heartbeat_interval_seconds, 5);
    }

    #[test]
    fn test_load_missing_file_fails() {
        assert!(AppConfig::load(Some("/nonexistent/scheduler.toml")).is_err());
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = AppConfig::default();
        let text = config.to_toml().unwrap();
        let parsed = AppConfig::from_toml(&text).unwrap();
        assert_eq!(parsed.scheduler.claim_ttl_seconds, config.scheduler.claim_ttl_seconds);
    }
}
