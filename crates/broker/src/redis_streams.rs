//! Redis Streams broker.
//!
//! Each task queue is a stream read through one consumer group shared by all
//! workers. A delivery is settled by acknowledging and deleting its entry;
//! requeue and dead-letter append a copy (to the same stream, or to the
//! dead-letter stream) in the same script, and only when the acknowledgment
//! found the entry still pending. A consumer settling late, after its delivery
//! was reclaimed, changes nothing, so a message is never lost or duplicated.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use enrich_core::{Error, Result};
use redis::aio::ConnectionManager;
use redis::streams::{StreamId, StreamRangeReply, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, RedisError, Script, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::message::{field, DeadLetter, DeadLetterRecord, Delivery, DeliveryState, Requeue};
use crate::queues::QueueTopology;
use crate::transport::MessageBroker;

/// Entries claimed per reclaim sweep.
const RECLAIM_BATCH: usize = 100;

type Fields = HashMap<String, Vec<u8>>;

/// KEYS: queue, target stream. ARGV: group, id, then the copy's field/value
/// pairs (none for a plain ack). Returns 1 if the entry was pending.
const SETTLE: &str = r#"
if redis.call('XACK', KEYS[1], ARGV[1], ARGV[2]) == 0 then
    return 0
end
redis.call('XDEL', KEYS[1], ARGV[2])
if #ARGV > 2 then
    redis.call('XADD', KEYS[2], '*', unpack(ARGV, 3))
end
return 1
"#;

fn broker_err(e: RedisError) -> Error {
    Error::broker(e.to_string())
}

/// [`MessageBroker`] over Redis Streams.
pub struct RedisStreamBroker {
    client: redis::Client,
    conn: ConnectionManager,
    /// Blocking reads get their own connection per queue so they never stall
    /// acks and publishes queued behind them.
    readers: Mutex<HashMap<String, ConnectionManager>>,
    settle_script: Script,
    group: String,
    consumer: String,
}

impl RedisStreamBroker {
    /// Connects to Redis. Fails if the first connection cannot be made.
    pub async fn connect(config: &BrokerConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| Error::config(format!("invalid broker url: {}", e)))?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(broker_err)?;

        info!(
            group = %config.group,
            consumer = %config.consumer,
            "Connected to Redis Streams broker"
        );

        Ok(Self {
            client,
            conn,
            readers: Mutex::new(HashMap::new()),
            settle_script: Script::new(SETTLE),
            group: config.group.clone(),
            consumer: config.consumer.clone(),
        })
    }

    async fn reader(&self, queue: &str) -> Result<ConnectionManager> {
        let mut readers = self.readers.lock().await;
        if let Some(conn) = readers.get(queue) {
            return Ok(conn.clone());
        }

        let conn = ConnectionManager::new(self.client.clone())
            .await
            .map_err(broker_err)?;
        readers.insert(queue.to_string(), conn.clone());
        Ok(conn)
    }

    fn delivery(&self, topology: &QueueTopology, id: String, mut fields: Fields) -> Delivery {
        let state = DeliveryState::from_fields(&fields).unwrap_or_else(|e| {
            warn!(
                id = %id,
                queue = %topology.queue,
                error = %e,
                "Unreadable delivery metadata, treating as first attempt"
            );
            DeliveryState::fresh(Utc::now())
        });
        let body = fields.remove(field::BODY).unwrap_or_default();

        Delivery {
            id,
            queue: topology.queue.clone(),
            kind: topology.kind,
            body: Bytes::from(body),
            state,
        }
    }

    /// Acks and deletes `delivery`, appending `copy` to `target` in the same
    /// script. False if the delivery was no longer pending; nothing is
    /// written then.
    async fn settle(
        &self,
        delivery: &Delivery,
        target: &str,
        copy: &[(&str, Vec<u8>)],
    ) -> Result<bool> {
        let mut conn = self.conn.clone();
        let mut invocation = self.settle_script.key(&delivery.queue);
        invocation.key(target).arg(&self.group).arg(&delivery.id);
        for (name, value) in copy {
            invocation.arg(*name).arg(value.as_slice());
        }
        let settled: u64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(broker_err)?;
        if settled == 0 {
            warn!(
                id = %delivery.id,
                queue = %delivery.queue,
                "Settling a delivery no longer pending"
            );
        }
        Ok(settled == 1)
    }
}

fn xadd(stream: &str, fields: &[(&str, Vec<u8>)]) -> redis::Cmd {
    let mut cmd = redis::cmd("XADD");
    cmd.arg(stream).arg("*");
    for (name, value) in fields {
        cmd.arg(*name).arg(value.as_slice());
    }
    cmd
}

fn stream_fields(entry: StreamId) -> Fields {
    entry
        .map
        .into_iter()
        .filter_map(|(name, value)| {
            redis::from_redis_value::<Vec<u8>>(&value)
                .ok()
                .map(|raw| (name, raw))
        })
        .collect()
}

/// Parses an `XAUTOCLAIM` reply into `(id, fields)` pairs.
///
/// Shape: `[next_cursor, [[id, [k1, v1, ...]], ...], deleted_ids?]`. Entries
/// deleted while pending come back as nil and are skipped.
pub(crate) fn parse_claimed(reply: Value) -> Vec<(String, Fields)> {
    let mut out = Vec::new();

    let Value::Array(parts) = reply else { return out };
    let Some(Value::Array(entries)) = parts.into_iter().nth(1) else {
        return out;
    };

    for entry in entries {
        let Value::Array(pair) = entry else { continue };
        let mut pair = pair.into_iter();
        let (Some(Value::BulkString(id)), Some(Value::Array(kv))) = (pair.next(), pair.next())
        else {
            continue;
        };

        let mut fields = Fields::new();
        let mut kv = kv.into_iter();
        while let (Some(Value::BulkString(name)), Some(Value::BulkString(value))) =
            (kv.next(), kv.next())
        {
            fields.insert(String::from_utf8_lossy(&name).into_owned(), value);
        }
        out.push((String::from_utf8_lossy(&id).into_owned(), fields));
    }

    out
}

#[async_trait]
impl MessageBroker for RedisStreamBroker {
    async fn declare(&self, topology: &QueueTopology) -> Result<()> {
        let mut conn = self.conn.clone();
        let created: std::result::Result<(), RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&topology.queue)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match created {
            Ok(()) => {
                info!(queue = %topology.queue, group = %self.group, "Created consumer group");
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(broker_err(e)),
        }
    }

    async fn receive(
        &self,
        topology: &QueueTopology,
        block: Duration,
    ) -> Result<Option<Delivery>> {
        let mut conn = self.reader(&topology.queue).await?;
        let options = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(1)
            .block(block.as_millis() as usize);

        let reply: Option<StreamReadReply> = conn
            .xread_options(&[topology.queue.as_str()], &[">"], &options)
            .await
            .map_err(broker_err)?;

        let entry = reply
            .and_then(|r| r.keys.into_iter().next())
            .and_then(|k| k.ids.into_iter().next());

        Ok(entry.map(|entry| {
            let id = entry.id.clone();
            self.delivery(topology, id, stream_fields(entry))
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.settle(delivery, &delivery.queue, &[]).await?;
        Ok(())
    }

    async fn requeue(&self, delivery: &Delivery, requeue: Requeue) -> Result<()> {
        let state = delivery.state.after(&requeue);
        let mut fields = vec![(field::BODY, delivery.body.to_vec())];
        fields.extend(state.to_fields()?);

        if !self.settle(delivery, &delivery.queue, &fields).await? {
            return Ok(());
        }

        debug!(
            id = %delivery.id,
            queue = %delivery.queue,
            attempt = state.attempt,
            consumed = requeue.consumes_attempt(),
            "Requeued"
        );
        Ok(())
    }

    async fn dead_letter(
        &self,
        topology: &QueueTopology,
        delivery: &Delivery,
        record: &DeadLetterRecord,
    ) -> Result<()> {
        let fields = [
            (field::RECORD, serde_json::to_vec(record)?),
            (field::BODY, delivery.body.to_vec()),
        ];

        if !self.settle(delivery, &topology.dead_letter, &fields).await? {
            return Ok(());
        }

        warn!(
            id = %delivery.id,
            queue = %delivery.queue,
            dead_letter = %topology.dead_letter,
            reason = %record.reason,
            attempts = record.attempts,
            "Dead-lettered"
        );
        Ok(())
    }

    async fn publish(&self, queue: &str, body: &[u8]) -> Result<String> {
        let state = DeliveryState::fresh(Utc::now());
        let mut fields = vec![(field::BODY, body.to_vec())];
        fields.extend(state.to_fields()?);

        let mut conn = self.conn.clone();
        let id: String = xadd(queue, &fields)
            .query_async(&mut conn)
            .await
            .map_err(broker_err)?;
        Ok(id)
    }

    async fn reclaim(&self, topology: &QueueTopology, idle: Duration) -> Result<usize> {
        let mut conn = self.conn.clone();
        let reply: Value = redis::cmd("XAUTOCLAIM")
            .arg(&topology.queue)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(idle.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(RECLAIM_BATCH)
            .query_async(&mut conn)
            .await
            .map_err(broker_err)?;

        let claimed = parse_claimed(reply);
        let count = claimed.len();
        for (id, fields) in claimed {
            let delivery = self.delivery(topology, id, fields);
            warn!(
                id = %delivery.id,
                queue = %topology.queue,
                attempt = delivery.state.attempt,
                "Reclaiming abandoned delivery"
            );
            self.requeue(&delivery, Requeue::retry("abandoned by consumer before settling"))
                .await?;
        }
        Ok(count)
    }

    async fn depth(&self, queue: &str) -> Result<u64> {
        // Settled entries are deleted, so the stream length is what is left
        let mut conn = self.conn.clone();
        conn.xlen(queue).await.map_err(broker_err)
    }

    async fn dead_letters(
        &self,
        topology: &QueueTopology,
        limit: usize,
    ) -> Result<Vec<DeadLetter>> {
        let mut conn = self.conn.clone();
        let reply: StreamRangeReply = conn
            .xrange_count(&topology.dead_letter, "-", "+", limit)
            .await
            .map_err(broker_err)?;

        reply
            .ids
            .into_iter()
            .map(|entry| -> Result<DeadLetter> {
                let id = entry.id.clone();
                let mut fields = stream_fields(entry);
                let record = fields
                    .get(field::RECORD)
                    .ok_or_else(|| Error::broker(format!("dead letter {} has no record", id)))?;
                Ok(DeadLetter {
                    record: serde_json::from_slice(record)?,
                    body: Bytes::from(fields.remove(field::BODY).unwrap_or_default()),
                    id,
                })
            })
            .collect()
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(broker_err)?;
        Ok(())
    }
}
