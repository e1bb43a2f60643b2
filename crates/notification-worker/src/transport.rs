//! 出站连接池
//!
//! 预先建立并认证固定数量的连接，多个发送任务复用。池只是缓存而非并发上限：
//! 没有空闲连接时按需新建，归还时超出容量的连接被关闭。
//! 一个连接在被取出期间只属于持有它的发送任务。

use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use lettre::address::Envelope;
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::transport::smtp::client::{AsyncSmtpConnection, TlsParameters};
use lettre::transport::smtp::extension::ClientId;
use notify_shared::config::SmtpConfig;
use notify_shared::events::ChannelType;
use notify_shared::observability::metrics;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::DispatchError;

// ---------------------------------------------------------------------------
// 连接抽象
// ---------------------------------------------------------------------------

/// 已认证的出站连接
#[async_trait]
pub trait MailConnection: Send {
    /// 执行一次完整的投递事务（发件人、收件人、正文）
    async fn transact(&mut self, envelope: &Envelope, payload: &[u8]) -> Result<(), DispatchError>;

    /// 发送协议层的退出指令并关闭连接
    async fn quit(&mut self);

    /// 连接是否已不可复用
    fn is_broken(&self) -> bool;
}

/// 建立并认证新连接
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Conn: MailConnection + 'static;

    async fn connect(&self) -> Result<Self::Conn, DispatchError>;
}

// ---------------------------------------------------------------------------
// ConnectionPool
// ---------------------------------------------------------------------------

/// 有界连接缓存
pub struct ConnectionPool<C: Connector> {
    connector: C,
    idle: Mutex<Vec<C::Conn>>,
    capacity: usize,
}

impl<C: Connector> ConnectionPool<C> {
    /// 并发建立 `size` 个连接
    ///
    /// 任一连接失败则关闭已建立的连接并整体失败。
    pub async fn new(connector: C, size: usize) -> Result<Self, DispatchError> {
        let results = join_all((0..size).map(|_| connector.connect())).await;

        let mut opened = Vec::with_capacity(size);
        let mut first_error = None;
        for result in results {
            match result {
                Ok(conn) => opened.push(conn),
                Err(e) if first_error.is_none() => first_error = Some(e),
                Err(_) => {}
            }
        }

        if let Some(err) = first_error {
            warn!(
                opened = opened.len(),
                requested = size,
                error = %err,
                "连接池初始化失败，关闭已建立的连接"
            );
            for mut conn in opened {
                conn.quit().await;
            }
            return Err(DispatchError::TransportUnavailable(format!(
                "连接池初始化失败: {err}"
            )));
        }

        info!(size, "出站连接池已就绪");
        Ok(Self {
            connector,
            idle: Mutex::new(opened),
            capacity: size,
        })
    }

    /// 取出一个连接，没有空闲连接时按需新建
    pub async fn acquire(&self) -> Result<C::Conn, DispatchError> {
        let pooled = { self.idle.lock().pop() };
        if let Some(conn) = pooled {
            return Ok(conn);
        }

        debug!("无空闲连接，按需新建");
        self.connector.connect().await
    }

    /// 归还连接
    ///
    /// 已损坏或超出容量的连接直接关闭，其余放回池中。
    pub async fn release(&self, mut conn: C::Conn) {
        if conn.is_broken() {
            debug!("连接已损坏，关闭而不放回");
            conn.quit().await;
            return;
        }

        let rejected = {
            let mut idle = self.idle.lock();
            if idle.len() < self.capacity {
                idle.push(conn);
                None
            } else {
                Some(conn)
            }
        };

        if let Some(mut conn) = rejected {
            debug!(capacity = self.capacity, "连接池已满，关闭多余连接");
            conn.quit().await;
        }
    }

    #[cfg(test)]
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 关闭所有空闲连接
    pub async fn close(&self) {
        let drained: Vec<C::Conn> = { self.idle.lock().drain(..).collect() };
        let count = drained.len();
        for mut conn in drained {
            conn.quit().await;
        }
        info!(closed = count, "出站连接池已关闭");
    }
}

// ---------------------------------------------------------------------------
// SMTP 实现
// ---------------------------------------------------------------------------

/// 基于 lettre 的 SMTP 连接器
///
/// 建连顺序：TCP → STARTTLS（必须）→ AUTH。
pub struct SmtpConnector {
    host: String,
    port: u16,
    hello: ClientId,
    credentials: Credentials,
    timeout: Duration,
}

impl SmtpConnector {
    pub fn from_config(config: &SmtpConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            hello: ClientId::Domain(config.helo_name.clone()),
            credentials: Credentials::new(config.username.clone(), config.password.clone()),
            timeout: config.connect_timeout(),
        }
    }

    /// STARTTLS 升级后认证，失败时连接处于半开状态
    async fn secure(&self, conn: &mut AsyncSmtpConnection) -> Result<(), DispatchError> {
        let tls = TlsParameters::new(self.host.clone())
            .map_err(|e| unavailable("TLS 参数无效", e))?;
        conn.starttls(tls, &self.hello)
            .await
            .map_err(|e| unavailable("STARTTLS 失败", e))?;

        conn.auth(&[Mechanism::Plain, Mechanism::Login], &self.credentials)
            .await
            .map_err(|e| unavailable("SMTP 认证失败", e))?;
        Ok(())
    }
}

fn unavailable(stage: &str, err: impl std::fmt::Display) -> DispatchError {
    DispatchError::TransportUnavailable(format!("{stage}: {err}"))
}

#[async_trait]
impl Connector for SmtpConnector {
    type Conn = SmtpConnection;

    async fn connect(&self) -> Result<SmtpConnection, DispatchError> {
        let mut conn = AsyncSmtpConnection::connect_tokio1(
            (self.host.as_str(), self.port),
            Some(self.timeout),
            &self.hello,
            None,
            None,
        )
        .await
        .map_err(|e| unavailable("SMTP 连接失败", e))?;

        if !conn.can_starttls() {
            conn.abort().await;
            return Err(DispatchError::TransportUnavailable(format!(
                "SMTP 服务器 {} 不支持 STARTTLS",
                self.host
            )));
        }

        if let Err(err) = self.secure(&mut conn).await {
            conn.abort().await;
            return Err(err);
        }

        metrics::record_smtp_connection_opened();
        debug!(host = %self.host, port = self.port, "SMTP 连接已认证");

        Ok(SmtpConnection {
            inner: conn,
            broken: false,
        })
    }
}

/// 已认证的 SMTP 连接
pub struct SmtpConnection {
    inner: AsyncSmtpConnection,
    broken: bool,
}

#[async_trait]
impl MailConnection for SmtpConnection {
    async fn transact(&mut self, envelope: &Envelope, payload: &[u8]) -> Result<(), DispatchError> {
        match self.inner.send(envelope, payload).await {
            Ok(_) => Ok(()),
            Err(e) => {
                // 事务中途失败后会话状态不可信
                self.broken = true;
                Err(DispatchError::SendFailed {
                    channel: ChannelType::Email,
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn quit(&mut self) {
        if let Err(e) = self.inner.quit().await {
            debug!(error = %e, "SMTP QUIT 失败，直接断开");
            self.inner.abort().await;
        }
        metrics::record_smtp_connection_closed();
    }

    fn is_broken(&self) -> bool {
        self.broken || self.inner.has_broken()
    }
}

// ---------------------------------------------------------------------------
// 测试
// ---------------------------------------------------------------------------
