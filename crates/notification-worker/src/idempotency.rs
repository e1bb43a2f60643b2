//! 幂等保护
//!
//! 持久化的"已处理"标记以通知 id 为主键，写入一次后不再变更。
//! 跨进程的并发重复由存储的原子条件插入兜底；同一进程内的并发重复由在途认领集合拦截，
//! 保证两个工作协程不会同时投递同一条通知。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use notify_shared::error::NotifyError;
use notify_shared::events::ProcessedMarker;
use sqlx::PgPool;
use tracing::debug;

use crate::error::DispatchError;

// ---------------------------------------------------------------------------
// 存储抽象
// ---------------------------------------------------------------------------

/// 幂等标记存储
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// 标记是否存在
    async fn exists(&self, notification_id: &str) -> Result<bool, NotifyError>;

    /// 写入标记，返回是否为新插入；已存在不视为错误
    async fn insert(
        &self,
        notification_id: &str,
        processed_at: DateTime<Utc>,
    ) -> Result<bool, NotifyError>;
}

/// PostgreSQL 实现，表结构见 migrations/
pub struct PgIdempotencyStore {
    pool: PgPool,
}

impl PgIdempotencyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdempotencyStore for PgIdempotencyStore {
    async fn exists(&self, notification_id: &str) -> Result<bool, NotifyError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM processed_notifications WHERE notification_id = $1)",
        )
        .bind(notification_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn insert(
        &self,
        notification_id: &str,
        processed_at: DateTime<Utc>,
    ) -> Result<bool, NotifyError> {
        let result = sqlx::query(
            r#"
            INSERT INTO processed_notifications (notification_id, processed_at)
            VALUES ($1, $2)
            ON CONFLICT (notification_id) DO NOTHING
            "#,
        )
        .bind(notification_id)
        .bind(processed_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

/// 内存实现，用于测试与本地运行
#[derive(Default)]
pub struct InMemoryIdempotencyStore {
    markers: DashMap<String, DateTime<Utc>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, notification_id: &str) -> bool {
        self.markers.contains_key(notification_id)
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    pub fn markers(&self) -> Vec<ProcessedMarker> {
        self.markers
            .iter()
            .map(|entry| ProcessedMarker {
                notification_id: entry.key().clone(),
                processed_at: *entry.value(),
            })
            .collect()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn exists(&self, notification_id: &str) -> Result<bool, NotifyError> {
        Ok(self.markers.contains_key(notification_id))
    }

    async fn insert(
        &self,
        notification_id: &str,
        processed_at: DateTime<Utc>,
    ) -> Result<bool, NotifyError> {
        let mut inserted = false;
        self.markers
            .entry(notification_id.to_string())
            .or_insert_with(|| {
                inserted = true;
                processed_at
            });
        Ok(inserted)
    }
}

// ---------------------------------------------------------------------------
// IdempotencyGuard
// ---------------------------------------------------------------------------

/// 幂等守卫
pub struct IdempotencyGuard {
    store: Arc<dyn IdempotencyStore>,
    in_flight: Arc<DashMap<String, ()>>,
}

/// 在途认领，drop 时释放
pub struct InFlightClaim {
    notification_id: String,
    in_flight: Arc<DashMap<String, ()>>,
}

impl Drop for InFlightClaim {
    fn drop(&mut self) {
        self.in_flight.remove(&self.notification_id);
    }
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn IdempotencyStore>) -> Self {
        Self {
            store,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    /// 认领一条通知的处理权，已被其他工作协程认领时返回 None
    pub fn claim(&self, notification_id: &str) -> Option<InFlightClaim> {
        use dashmap::mapref::entry::Entry;

        match self.in_flight.entry(notification_id.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(());
                Some(InFlightClaim {
                    notification_id: notification_id.to_string(),
                    in_flight: self.in_flight.clone(),
                })
            }
        }
    }

    pub async fn is_processed(&self, notification_id: &str) -> Result<bool, DispatchError> {
        self.store
            .exists(notification_id)
            .await
            .map_err(DispatchError::Store)
    }

    /// 写入已处理标记，重复写入视为成功
    pub async fn mark_processed(&self, notification_id: &str) -> Result<(), DispatchError> {
        let inserted = self
            .store
            .insert(notification_id, Utc::now())
            .await
            .map_err(DispatchError::Store)?;
        if !inserted {
            debug!(notification_id, "幂等标记已存在，忽略重复写入");
        }
        Ok(())
    }

    #[cfg(test)]
    fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_insert_is_conditional() {
        let store = InMemoryIdempotencyStore::new();
        let now = Utc::now();

        assert!(!store.exists("n1").await.unwrap());
        assert!(store.insert("n1", now).await.unwrap());
        assert!(!store.insert("n1", Utc::now()).await.unwrap());
        assert!(store.exists("n1").await.unwrap());

        // 首次写入的时间不会被覆盖
        let markers = store.markers();
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].processed_at, now);
    }

    #[tokio::test]
    async fn test_mark_processed_treats_duplicate_as_success() {
        let mut store = MockIdempotencyStore::new();
        store.expect_insert().times(1).returning(|_, _| Ok(false));

        let guard = IdempotencyGuard::new(Arc::new(store));
        assert!(guard.mark_processed("n1").await.is_ok());
    }

    #[tokio::test]
    async fn test_store_errors_surface() {
        let mut store = MockIdempotencyStore::new();
        store
            .expect_exists()
            .returning(|_| Err(NotifyError::Database(sqlx::Error::PoolTimedOut)));

        let guard = IdempotencyGuard::new(Arc::new(store));
        let err = guard.is_processed("n1").await.unwrap_err();
        assert_eq!(err.code(), "STORE_ERROR");
        assert!(err.is_retryable());
    }

    #[test]
    fn test_claim_is_exclusive_until_dropped() {
        let guard = IdempotencyGuard::new(Arc::new(InMemoryIdempotencyStore::new()));

        let claim = guard.claim("n1").unwrap();
        assert!(guard.claim("n1").is_none());
        assert!(guard.claim("n2").is_some());
        assert_eq!(guard.in_flight_count(), 1);

        drop(claim);
        assert_eq!(guard.in_flight_count(), 0);
        assert!(guard.claim("n1").is_some());
    }
}
