//! Redis Streams-backed queue (durable, at-least-once delivery).
//!
//! One stream per job family, consumed through a single consumer group:
//!
//! - **Send**: `XADD <queue> * body <json>`
//! - **Receive**: idle pending entries are reclaimed first with
//!   `XAUTOCLAIM <queue> <group> <consumer> <visibility-ms>`; otherwise new
//!   entries are read with `XREADGROUP ... BLOCK <wait-ms> ... >`
//! - **Receive count**: the delivery counter reported by `XPENDING`
//! - **Acknowledge**: `XACK` + `XDEL`, in one script that first checks with
//!   `XPENDING` that the entry is still pending for the receiving consumer at
//!   the same delivery count. A receipt from an earlier delivery is stale once
//!   the entry has been reclaimed.
//! - **Dead-letter**: entries whose delivery counter exceeds the maximum are
//!   copied to `<queue>:dlq` and acknowledged

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tracing::{debug, instrument, warn};

use super::{JobQueue, MessageId, QueueError, QueueSettings, Receipt, ReceivedMessage};

const DEFAULT_GROUP: &str = "forgegen-workers";
const BODY_FIELD: &str = "body";

/// KEYS[1] stream; ARGV group, entry id, consumer, delivery count. Returns 1 if removed.
const ACKNOWLEDGE_SCRIPT: &str = r#"
local pending = redis.call('XPENDING', KEYS[1], ARGV[1], ARGV[2], ARGV[2], 1)
local entry = pending[1]
if not entry or entry[2] ~= ARGV[3] or tostring(entry[4]) ~= ARGV[4] then
  return 0
end
redis.call('XACK', KEYS[1], ARGV[1], ARGV[2])
redis.call('XDEL', KEYS[1], ARGV[2])
return 1
"#;

#[derive(Debug, Clone)]
pub struct RedisStreamsQueue {
    client: redis::Client,
    stream_key: String,
    dlq_key: String,
    group: String,
    consumer: String,
    settings: QueueSettings,
}

/// One delivery of a stream entry, as carried in its [`Receipt`]:
/// `<entry id>|<delivery count>|<consumer>`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Delivery {
    entry_id: String,
    count: u32,
    consumer: String,
}

impl Delivery {
    fn receipt(&self) -> Receipt {
        Receipt::new(format!("{}|{}|{}", self.entry_id, self.count, self.consumer))
    }

    fn parse(receipt: &Receipt) -> Option<Self> {
        let mut parts = receipt.as_str().splitn(3, '|');
        let entry_id = parts.next().filter(|id| !id.is_empty())?.to_string();
        let count = parts.next()?.parse().ok()?;
        let consumer = parts.next().filter(|c| !c.is_empty())?.to_string();
        Some(Self {
            entry_id,
            count,
            consumer,
        })
    }
}

/// Entry parsed from a stream reply: `[id, [field, value, ...]]`.
#[derive(Debug)]
struct StreamEntry {
    id: String,
    fields: HashMap<String, String>,
}

impl RedisStreamsQueue {
    pub fn new(
        redis_url: impl AsRef<str>,
        stream_key: impl Into<String>,
        settings: QueueSettings,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(unavailable)?;
        let stream_key = stream_key.into();

        Ok(Self {
            client,
            dlq_key: format!("{stream_key}:dlq"),
            stream_key,
            group: DEFAULT_GROUP.to_string(),
            consumer: format!("consumer-{}", uuid::Uuid::now_v7()),
            settings,
        })
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = consumer.into();
        self
    }

    pub fn dlq_key(&self) -> &str {
        &self.dlq_key
    }

    async fn connection(&self) -> Result<MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(unavailable)
    }

    /// Create the consumer group (and stream) if missing. Idempotent.
    pub async fn ensure_consumer_group(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match created {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(command("XGROUP CREATE", e)),
        }
    }

    /// Entries of the dead-letter stream, oldest first, as `(original id, body)`.
    pub async fn dead_letters(&self, count: usize) -> Result<Vec<(String, String)>, QueueError> {
        let mut conn = self.connection().await?;
        let reply: redis::Value = redis::cmd("XRANGE")
            .arg(&self.dlq_key)
            .arg("-")
            .arg("+")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(|e| command("XRANGE", e))?;

        Ok(parse_entries(&reply)?
            .into_iter()
            .map(|mut e| {
                let original = e.fields.remove("original_message_id").unwrap_or(e.id);
                (original, e.fields.remove(BODY_FIELD).unwrap_or_default())
            })
            .collect())
    }

    async fn reclaim_idle(
        &self,
        conn: &mut MultiplexedConnection,
        max: usize,
    ) -> Result<Vec<StreamEntry>, QueueError> {
        let reply: redis::Value = redis::cmd("XAUTOCLAIM")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(self.settings.visibility_timeout.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(max)
            .query_async(conn)
            .await
            .map_err(|e| command("XAUTOCLAIM", e))?;

        // [next-cursor, [entries...], [deleted ids...]]
        match reply {
            redis::Value::Bulk(parts) if parts.len() >= 2 => parse_entries(&parts[1]),
            other => Err(QueueError::Protocol(format!("unexpected XAUTOCLAIM reply: {other:?}"))),
        }
    }

    async fn read_new(
        &self,
        conn: &mut MultiplexedConnection,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<StreamEntry>, QueueError> {
        let reply: redis::Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(max)
            .arg("BLOCK")
            .arg(wait.as_millis().max(1) as u64)
            .arg("STREAMS")
            .arg(&self.stream_key)
            .arg(">")
            .query_async(conn)
            .await
            .map_err(|e| command("XREADGROUP", e))?;

        // Nil on timeout, otherwise [[stream, [entries...]]]
        match reply {
            redis::Value::Nil => Ok(Vec::new()),
            redis::Value::Bulk(streams) => {
                let mut entries = Vec::new();
                for stream in streams {
                    if let redis::Value::Bulk(pair) = stream {
                        if let Some(list) = pair.get(1) {
                            entries.extend(parse_entries(list)?);
                        }
                    }
                }
                Ok(entries)
            }
            other => Err(QueueError::Protocol(format!("unexpected XREADGROUP reply: {other:?}"))),
        }
    }

    async fn delivery_count(&self, conn: &mut MultiplexedConnection, id: &str) -> Result<u32, QueueError> {
        let pending: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(id)
            .arg(id)
            .arg(1)
            .query_async(conn)
            .await
            .map_err(|e| command("XPENDING", e))?;

        Ok(pending.first().map_or(1, |(_, _, _, count)| *count as u32))
    }

    async fn dead_letter(
        &self,
        conn: &mut MultiplexedConnection,
        entry: &StreamEntry,
        receive_count: u32,
    ) -> Result<(), QueueError> {
        let body = entry.fields.get(BODY_FIELD).map(String::as_str).unwrap_or_default();
        let _: String = redis::cmd("XADD")
            .arg(&self.dlq_key)
            .arg("*")
            .arg("original_message_id")
            .arg(&entry.id)
            .arg("receive_count")
            .arg(receive_count)
            .arg("failed_at")
            .arg(chrono::Utc::now().to_rfc3339())
            .arg(BODY_FIELD)
            .arg(body)
            .query_async(conn)
            .await
            .map_err(|e| command("XADD (dlq)", e))?;

        self.remove(conn, &entry.id).await?;
        warn!(
            queue = %self.stream_key,
            message_id = %entry.id,
            receive_count,
            "message moved to dead-letter queue"
        );
        Ok(())
    }

    async fn remove(&self, conn: &mut MultiplexedConnection, id: &str) -> Result<(), QueueError> {
        let _: u64 = redis::cmd("XACK")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(id)
            .query_async(conn)
            .await
            .map_err(|e| command("XACK", e))?;
        let _: u64 = redis::cmd("XDEL")
            .arg(&self.stream_key)
            .arg(id)
            .query_async(conn)
            .await
            .map_err(|e| command("XDEL", e))?;
        Ok(())
    }
}

#[async_trait]
impl JobQueue for RedisStreamsQueue {
    fn name(&self) -> &str {
        &self.stream_key
    }

    #[instrument(skip(self, body), fields(queue = %self.stream_key), err)]
    async fn send(&self, body: String) -> Result<MessageId, QueueError> {
        let mut conn = self.connection().await?;
        redis::cmd("XADD")
            .arg(&self.stream_key)
            .arg("*")
            .arg(BODY_FIELD)
            .arg(body)
            .query_async(&mut conn)
            .await
            .map_err(|e| command("XADD", e))
    }

    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<ReceivedMessage>, QueueError> {
        let max = max.max(1);
        let mut conn = self.connection().await?;

        let mut entries = self.reclaim_idle(&mut conn, max).await?;
        if entries.is_empty() {
            entries = self.read_new(&mut conn, max, wait).await?;
        } else {
            debug!(queue = %self.stream_key, count = entries.len(), "reclaimed idle messages");
        }

        let mut delivered = Vec::with_capacity(entries.len());
        for entry in entries {
            let receive_count = self.delivery_count(&mut conn, &entry.id).await?;
            if receive_count > self.settings.max_receive_count {
                self.dead_letter(&mut conn, &entry, receive_count).await?;
                continue;
            }

            let Some(body) = entry.fields.get(BODY_FIELD).cloned() else {
                warn!(queue = %self.stream_key, message_id = %entry.id, "stream entry without body; removing");
                self.remove(&mut conn, &entry.id).await?;
                continue;
            };

            let delivery = Delivery {
                entry_id: entry.id.clone(),
                count: receive_count,
                consumer: self.consumer.clone(),
            };
            delivered.push(ReceivedMessage {
                receipt: delivery.receipt(),
                message_id: entry.id,
                body,
                receive_count,
            });
        }
        Ok(delivered)
    }

    async fn acknowledge(&self, receipt: &Receipt) -> Result<(), QueueError> {
        let delivery =
            Delivery::parse(receipt).ok_or_else(|| QueueError::StaleReceipt(receipt.clone()))?;
        let mut conn = self.connection().await?;

        let removed: i64 = redis::Script::new(ACKNOWLEDGE_SCRIPT)
            .key(&self.stream_key)
            .arg(&self.group)
            .arg(&delivery.entry_id)
            .arg(&delivery.consumer)
            .arg(delivery.count)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| command("acknowledge script", e))?;

        if removed == 1 {
            Ok(())
        } else {
            Err(QueueError::StaleReceipt(receipt.clone()))
        }
    }
}

fn unavailable(e: redis::RedisError) -> QueueError {
    QueueError::Unavailable(e.to_string())
}

fn command(name: &str, e: redis::RedisError) -> QueueError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_timeout() {
        QueueError::Unavailable(format!("{name} failed: {e}"))
    } else {
        QueueError::Protocol(format!("{name} failed: {e}"))
    }
}

fn bulk_string(value: &redis::Value) -> Option<String> {
    match value {
        redis::Value::Data(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        redis::Value::Status(s) => Some(s.clone()),
        _ => None,
    }
}

/// Parse a list of stream entries. Nil entries (deleted while pending) are skipped.
fn parse_entries(value: &redis::Value) -> Result<Vec<StreamEntry>, QueueError> {
    let list = match value {
        redis::Value::Bulk(list) => list,
        redis::Value::Nil => return Ok(Vec::new()),
        other => return Err(QueueError::Protocol(format!("expected entry list, got {other:?}"))),
    };

    let mut entries = Vec::with_capacity(list.len());
    for item in list {
        let redis::Value::Bulk(parts) = item else {
            continue;
        };
        let (Some(id), Some(redis::Value::Bulk(raw_fields))) = (parts.first().and_then(bulk_string), parts.get(1))
        else {
            continue;
        };

        let fields = raw_fields
            .chunks(2)
            .filter_map(|kv| match kv {
                [k, v] => Some((bulk_string(k)?, bulk_string(v)?)),
                _ => None,
            })
            .collect();
        entries.push(StreamEntry { id, fields });
    }
    Ok(entries)
}
