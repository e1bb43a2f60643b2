//! 数据库连接管理模块
//!
//! 提供 PostgreSQL 连接池管理，支持健康检查和嵌入式迁移。

use crate::config::DatabaseConfig;
use crate::error::{NotifyError, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument};

/// 编译期嵌入的迁移脚本（crates/shared/migrations）
static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// 数据库连接池包装
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// 创建数据库连接池
    #[instrument(skip(config))]
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        info!("正在连接数据库...");

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
            .connect(&config.url)
            .await?;

        info!(
            max_connections = config.max_connections,
            "数据库连接池已创建"
        );

        Ok(Self { pool })
    }

    /// 获取连接池引用
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// 健康检查
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(NotifyError::from)
    }

    /// 关闭连接池
    pub async fn close(&self) {
        self.pool.close().await;
        info!("数据库连接池已关闭");
    }

    /// 执行嵌入的迁移，已执行过的版本会被跳过
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<()> {
        info!("正在执行数据库迁移...");
        MIGRATOR.run(&self.pool).await?;
        info!("数据库迁移完成");
        Ok(())
    }
}
