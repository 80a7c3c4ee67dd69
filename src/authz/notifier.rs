//! 策略版本通知
//!
//! 每次授权变更后发布 `(tenant_id, version)`，其他实例收到后按需重新加载矩阵。
//! 投递语义为至少一次，处理器必须幂等；格式错误的消息确认后丢弃。

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{pin_mut, StreamExt};
use lapin::{
    options::*,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::matrix::Enforcer;
use crate::{
    config::NotifierConfig,
    error::{AppError, Result},
};

/// 元数据中的租户字段名
pub const TENANT_HEADER: &str = "tenant_id";

/// 关闭时等待订阅任务退出的上限
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// 版本变更消息体
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionChange {
    pub tenant_id: String,
    pub version: i64,
}

impl VersionChange {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let change: VersionChange = serde_json::from_slice(payload)
            .map_err(|e| AppError::InvalidArgument(format!("malformed version payload: {}", e)))?;
        if change.tenant_id.is_empty() {
            return Err(AppError::InvalidArgument(
                "version payload has empty tenant_id".to_string(),
            ));
        }
        Ok(change)
    }
}

/// 订阅方回调
#[async_trait]
pub trait VersionHandler: Send + Sync {
    async fn handle(&self, tenant_id: &str, version: i64) -> Result<()>;
}

#[async_trait]
pub trait VersionNotifier: Send + Sync {
    async fn publish(&self, tenant_id: &str, version: i64) -> Result<()>;

    /// 在后台任务中把消息交给 `handler`，直到 `close` 被调用
    async fn subscribe(&self, handler: Arc<dyn VersionHandler>) -> Result<()>;

    /// 幂等
    async fn close(&self) -> Result<()>;

    async fn health_check(&self) -> bool;
}

/// 订阅任务的生命周期
struct Lifetime {
    cancel: CancellationToken,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Lifetime {
    fn new(parent: Option<&CancellationToken>) -> Self {
        Self {
            cancel: parent.map(|p| p.child_token()).unwrap_or_default(),
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// 第一次调用返回 true
    async fn shutdown(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.cancel.cancel();

        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(CLOSE_GRACE, task).await.is_err() {
                warn!("Subscriber task did not stop in time, aborting");
                abort.abort();
            }
        }
        true
    }
}

// ==================== In-process ====================

#[derive(Debug, Clone)]
pub struct VersionMessage {
    pub message_id: Uuid,
    pub metadata: HashMap<String, String>,
    pub payload: Vec<u8>,
}

/// 单进程部署与测试使用的 broadcast 通知器
pub struct InProcessNotifier {
    sender: broadcast::Sender<VersionMessage>,
    lifetime: Lifetime,
}

impl InProcessNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            lifetime: Lifetime::new(None),
        }
    }

    pub fn with_lifetime(capacity: usize, parent: &CancellationToken) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            lifetime: Lifetime::new(Some(parent)),
        }
    }

    /// 直接投递原始消息（用于注入异常消息）
    pub fn send_raw(&self, message: VersionMessage) {
        let _ = self.sender.send(message);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for InProcessNotifier {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl VersionNotifier for InProcessNotifier {
    async fn publish(&self, tenant_id: &str, version: i64) -> Result<()> {
        if self.lifetime.is_closed() {
            return Err(AppError::Unavailable("notifier is closed".to_string()));
        }

        let payload = serde_json::to_vec(&VersionChange {
            tenant_id: tenant_id.to_string(),
            version,
        })
        .map_err(|e| AppError::Internal(format!("failed to encode version change: {}", e)))?;

        let message = VersionMessage {
            message_id: Uuid::new_v4(),
            metadata: HashMap::from([(TENANT_HEADER.to_string(), tenant_id.to_string())]),
            payload,
        };

        // 没有订阅者时 send 返回错误，这不算失败
        let receivers = self.sender.send(message).unwrap_or(0);
        debug!(tenant_id = %tenant_id, version, receivers, "Published policy version");
        Ok(())
    }

    async fn subscribe(&self, handler: Arc<dyn VersionHandler>) -> Result<()> {
        if self.lifetime.is_closed() {
            return Err(AppError::Unavailable("notifier is closed".to_string()));
        }

        let mut receiver = self.sender.subscribe();
        let cancel = self.lifetime.cancel.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = receiver.recv() => match received {
                        Ok(message) => {
                            let _ = dispatch(handler.as_ref(), &message.payload).await;
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Policy version subscriber lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            debug!("In-process policy version subscriber stopped");
        });

        self.lifetime.tasks.lock().await.push(task);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.lifetime.shutdown().await;
        Ok(())
    }

    async fn health_check(&self) -> bool {
        !self.lifetime.is_closed()
    }
}

/// 解码后交给处理器
///
/// 返回 `Ok(false)` 表示消息格式错误已丢弃；`Err` 表示处理器失败，可重投。
async fn dispatch(handler: &dyn VersionHandler, payload: &[u8]) -> Result<bool> {
    let change = match VersionChange::decode(payload) {
        Ok(change) => change,
        Err(e) => {
            warn!(error = %e, "Dropping malformed policy version message");
            return Ok(false);
        }
    };

    handler
        .handle(&change.tenant_id, change.version)
        .await
        .map_err(|e| {
            tracing::error!(
                tenant_id = %change.tenant_id,
                version = change.version,
                error = %e,
                "Policy version handler failed"
            );
            e
        })?;
    Ok(true)
}

// ==================== RabbitMQ ====================

/// RabbitMQ 通知器
///
/// 持久化 topic 交换机，路由键 `policy.version.{tenant}`。
/// 所有实例消费同一个持久化队列，共同构成消费组。
pub struct RabbitMqNotifier {
    config: Arc<NotifierConfig>,
    connection: Arc<Connection>,
    channel: Arc<Channel>,
    lifetime: Lifetime,
}

impl RabbitMqNotifier {
    pub async fn connect(config: NotifierConfig, parent: &CancellationToken) -> Result<Self> {
        let amqp_url = config.amqp_url.expose_secret();
        info!("Connecting to RabbitMQ for policy notifications");

        let conn = Connection::connect(amqp_url, ConnectionProperties::default())
            .await
            .map_err(|e| AppError::Unavailable(format!("failed to connect to RabbitMQ: {}", e)))?;

        let channel = conn
            .create_channel()
            .await
            .map_err(|e| AppError::Unavailable(format!("failed to create channel: {}", e)))?;

        // 发布者确认
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| AppError::Unavailable(format!("failed to enable confirms: {}", e)))?;

        declare_exchange(&channel, &config.exchange).await?;
        info!(exchange = %config.exchange, "RabbitMQ policy notifier ready");

        Ok(Self {
            config: Arc::new(config),
            connection: Arc::new(conn),
            channel: Arc::new(channel),
            lifetime: Lifetime::new(Some(parent)),
        })
    }

    fn routing_key(tenant_id: &str) -> String {
        format!("policy.version.{}", tenant_id)
    }
}

async fn declare_exchange(channel: &Channel, exchange: &str) -> Result<()> {
    channel
        .exchange_declare(
            exchange,
            ExchangeKind::Topic,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| AppError::Unavailable(format!("failed to declare exchange {}: {}", exchange, e)))
}

#[async_trait]
impl VersionNotifier for RabbitMqNotifier {
    async fn publish(&self, tenant_id: &str, version: i64) -> Result<()> {
        if self.lifetime.is_closed() {
            return Err(AppError::Unavailable("notifier is closed".to_string()));
        }

        let payload = serde_json::to_vec(&VersionChange {
            tenant_id: tenant_id.to_string(),
            version,
        })
        .map_err(|e| AppError::Internal(format!("failed to encode version change: {}", e)))?;

        let mut headers = FieldTable::default();
        headers.insert(
            ShortString::from(TENANT_HEADER),
            AMQPValue::LongString(LongString::from(tenant_id)),
        );

        let routing_key = Self::routing_key(tenant_id);
        let confirm = self
            .channel
            .basic_publish(
                &self.config.exchange,
                &routing_key,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default()
                    .with_delivery_mode(2) // 持久化
                    .with_content_type("application/json".into())
                    .with_message_id(Uuid::new_v4().to_string().into())
                    .with_headers(headers),
            )
            .await
            .map_err(|e| AppError::Unavailable(format!("publish failed: {}", e)))?
            .await
            .map_err(|e| AppError::Unavailable(format!("publish confirm failed: {}", e)))?;

        if !confirm.is_ack() {
            return Err(AppError::Unavailable(format!(
                "broker did not acknowledge version {} for {}",
                version, tenant_id
            )));
        }

        debug!(tenant_id = %tenant_id, version, "Published policy version");
        Ok(())
    }

    async fn subscribe(&self, handler: Arc<dyn VersionHandler>) -> Result<()> {
        if self.lifetime.is_closed() {
            return Err(AppError::Unavailable("notifier is closed".to_string()));
        }

        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| AppError::Unavailable(format!("failed to create consumer channel: {}", e)))?;

        // 每次只取一条，处理完再确认
        channel
            .basic_qos(1, BasicQosOptions::default())
            .await
            .map_err(|e| AppError::Unavailable(format!("failed to set QoS: {}", e)))?;

        declare_exchange(&channel, &self.config.exchange).await?;

        channel
            .queue_declare(
                &self.config.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| AppError::Unavailable(format!("failed to declare queue: {}", e)))?;

        channel
            .queue_bind(
                &self.config.queue,
                &self.config.exchange,
                "policy.version.#",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| AppError::Unavailable(format!("failed to bind queue: {}", e)))?;

        let consumer = channel
            .basic_consume(
                &self.config.queue,
                &self.config.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| AppError::Unavailable(format!("failed to start consumer: {}", e)))?;

        info!(queue = %self.config.queue, "Started consuming policy version messages");

        let cancel = self.lifetime.cancel.clone();
        let task = tokio::spawn(async move {
            pin_mut!(consumer);

            loop {
                let delivery = tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = consumer.next() => match next {
                        Some(Ok(delivery)) => delivery,
                        Some(Err(e)) => {
                            tracing::error!(error = %e, "Policy version consumer error");
                            continue;
                        }
                        None => break,
                    }
                };

                let tag = delivery.delivery_tag;
                let message_id = delivery
                    .properties
                    .message_id()
                    .as_ref()
                    .map(|id| id.as_str().to_string())
                    .unwrap_or_default();

                match dispatch(handler.as_ref(), &delivery.data).await {
                    Ok(_) => {
                        if let Err(e) = channel.basic_ack(tag, BasicAckOptions::default()).await {
                            tracing::error!(message_id = %message_id, error = %e, "Failed to ack message");
                        }
                    }
                    Err(_) => {
                        let requeue = BasicNackOptions {
                            requeue: true,
                            ..Default::default()
                        };
                        if let Err(e) = channel.basic_nack(tag, requeue).await {
                            tracing::error!(message_id = %message_id, error = %e, "Failed to nack message");
                        }
                    }
                }
            }

            if let Err(e) = channel.close(200, "subscriber closed").await {
                debug!(error = %e, "Consumer channel close failed");
            }
            info!("Policy version subscriber stopped");
        });

        self.lifetime.tasks.lock().await.push(task);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.lifetime.shutdown().await {
            if let Err(e) = self.connection.close(200, "shutdown").await {
                debug!(error = %e, "RabbitMQ connection close failed");
            }
            info!("RabbitMQ policy notifier closed");
        }
        Ok(())
    }

    async fn health_check(&self) -> bool {
        if self.lifetime.is_closed() {
            return false;
        }
        match self
            .channel
            .exchange_declare(
                &self.config.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "RabbitMQ health check failed");
                false
            }
        }
    }
}

// ==================== Handler ====================

/// 收到更新的版本时重新加载矩阵
///
/// 记录每个租户已处理的最高版本，重复或过期的消息直接忽略。
pub struct PolicySyncHandler {
    enforcer: Arc<dyn Enforcer>,
    seen: DashMap<String, i64>,
}

impl PolicySyncHandler {
    pub fn new(enforcer: Arc<dyn Enforcer>) -> Self {
        Self {
            enforcer,
            seen: DashMap::new(),
        }
    }

    /// 本地写入后记录版本，避免收到自己的消息时重复加载
    pub fn observe(&self, tenant_id: &str, version: i64) {
        let mut entry = self.seen.entry(tenant_id.to_string()).or_insert(0);
        if version > *entry {
            *entry = version;
        }
    }

    pub fn last_seen(&self, tenant_id: &str) -> Option<i64> {
        self.seen.get(tenant_id).map(|v| *v)
    }
}

#[async_trait]
impl VersionHandler for PolicySyncHandler {
    async fn handle(&self, tenant_id: &str, version: i64) -> Result<()> {
        if self.last_seen(tenant_id).is_some_and(|seen| version <= seen) {
            debug!(tenant_id = %tenant_id, version, "Ignoring stale policy version");
            return Ok(());
        }

        self.enforcer.load_policy().await?;
        self.observe(tenant_id, version);
        info!(tenant_id = %tenant_id, version, "Reloaded policy after version change");
        Ok(())
    }
}
