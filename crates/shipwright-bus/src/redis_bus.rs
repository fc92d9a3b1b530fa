//! Redis implementation of the MessageBus port
//!
//! Live delivery uses pub/sub; durability uses stream mirrors consumed
//! through consumer groups (XREADGROUP/XACK). All publishes go through one
//! `ConnectionManager`, which serializes commands and therefore preserves
//! per-key publish order.

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::bus::{BusMessage, MessageBus, Subscription};
use crate::error::BusError;

/// Field names used in stream mirror entries
const PAYLOAD_FIELD: &str = "payload";
const ROUTING_KEY_FIELD: &str = "key";

/// How long one XREADGROUP call blocks waiting for entries
const READ_BLOCK_MS: usize = 1_000;
const READ_BATCH: usize = 16;

/// Redis-backed message bus
#[derive(Clone)]
pub struct RedisBus {
    client: redis::Client,
    publisher: ConnectionManager,
}

impl RedisBus {
    pub async fn connect(redis_url: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(redis_url).map_err(BusError::Redis)?;
        let publisher = ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, publisher })
    }

    async fn ensure_group(
        conn: &mut ConnectionManager,
        stream: &str,
        group: &str,
    ) -> Result<(), BusError> {
        let created: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(conn)
            .await;

        match created {
            Ok(()) => Ok(()),
            // Group already exists; fine
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(BusError::Redis(e)),
        }
    }
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn publish(
        &self,
        topic: &str,
        _routing_key: &str,
        payload: &[u8],
    ) -> Result<u64, BusError> {
        let mut conn = self.publisher.clone();
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(topic)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(receivers.max(0) as u64)
    }

    async fn publish_durable(
        &self,
        topic: &str,
        stream: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<u64, BusError> {
        let mut conn = self.publisher.clone();

        // Mirror first: a group consumer must never see a live message that
        // is missing from the stream.
        let _id: String = redis::cmd("XADD")
            .arg(stream)
            .arg("*")
            .arg(ROUTING_KEY_FIELD)
            .arg(routing_key)
            .arg(PAYLOAD_FIELD)
            .arg(payload)
            .query_async(&mut conn)
            .await?;

        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(topic)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(receivers.max(0) as u64)
    }

    async fn subscribe_group(&self, stream: &str, group: &str) -> Result<Subscription, BusError> {
        let mut conn = ConnectionManager::new(self.client.clone()).await?;
        Self::ensure_group(&mut conn, stream, group).await?;

        let consumer = format!("{group}-{}", Uuid::new_v4().simple());
        let (tx, rx) = mpsc::channel(256);

        let stream_name = stream.to_string();
        let group_name = group.to_string();

        let driver = tokio::spawn(async move {
            let opts = StreamReadOptions::default()
                .group(&group_name, &consumer)
                .block(READ_BLOCK_MS)
                .count(READ_BATCH);

            loop {
                let reply: Result<StreamReadReply, redis::RedisError> = conn
                    .xread_options(&[stream_name.as_str()], &[">"], &opts)
                    .await;

                let reply = match reply {
                    Ok(reply) => reply,
                    Err(e) => {
                        error!(stream = %stream_name, error = %e, "stream read failed; retrying");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                        continue;
                    }
                };

                for key in reply.keys {
                    for entry in key.ids {
                        let payload = entry
                            .map
                            .get(PAYLOAD_FIELD)
                            .and_then(|v| redis::from_redis_value::<Vec<u8>>(v).ok());

                        if let Some(payload) = payload {
                            let message = BusMessage {
                                topic: stream_name.clone(),
                                payload,
                            };
                            if tx.send(message).await.is_err() {
                                debug!(stream = %stream_name, "subscriber dropped; stopping reader");
                                return;
                            }
                        } else {
                            warn!(stream = %stream_name, id = %entry.id, "stream entry without payload field");
                        }

                        // Ack after forwarding; a crash before this point
                        // re-delivers, which the exactly-once pipeline absorbs.
                        let acked: Result<i64, redis::RedisError> =
                            conn.xack(&stream_name, &group_name, &[&entry.id]).await;
                        if let Err(e) = acked {
                            warn!(stream = %stream_name, id = %entry.id, error = %e, "ack failed");
                        }
                    }
                }
            }
        });

        Ok(Subscription::new(rx, Some(driver)))
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(topic).await?;

        let (tx, rx) = mpsc::channel(256);
        let topic_name = topic.to_string();

        let driver = tokio::spawn(async move {
            let mut messages = pubsub.on_message();
            while let Some(msg) = messages.next().await {
                let payload: Vec<u8> = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(topic = %topic_name, error = %e, "undecodable pub/sub payload");
                        continue;
                    }
                };
                let message = BusMessage {
                    topic: topic_name.clone(),
                    payload,
                };
                if tx.send(message).await.is_err() {
                    break;
                }
            }
        });

        Ok(Subscription::new(rx, Some(driver)))
    }
}
