use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::util::Timeout;
use rdkafka::{ClientConfig, Message, Offset, TopicPartitionList};
use tracing::{debug, info, warn};

use crate::{
    AdapterError, KafkaSettings, LineAck, LinePublisher, LineSource, OffsetTracker, RawLine,
};

const RECEIVE_RETRY_DELAY: Duration = Duration::from_secs(1);
const SEND_QUEUE_TIMEOUT: Duration = Duration::from_secs(30);

/// Creates the topic if it does not exist yet.
pub async fn ensure_topic(settings: &KafkaSettings, partitions: i32) -> Result<(), AdapterError> {
    let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
        .set("bootstrap.servers", settings.bootstrap_servers())
        .create()?;
    // -1 lets the broker pick its default replication factor.
    let topic = NewTopic::new(&settings.topic, partitions, TopicReplication::Fixed(-1));
    let results = admin.create_topics([&topic], &AdminOptions::new()).await?;
    for result in results {
        match result {
            Ok(name) => info!(topic = %name, "created topic"),
            Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => {
                debug!(topic = %name, "topic already exists")
            }
            Err((name, code)) => {
                return Err(AdapterError::Topic {
                    topic: name,
                    reason: code.to_string(),
                })
            }
        }
    }
    Ok(())
}

pub struct KafkaPublisher {
    producer: FutureProducer,
    topic: String,
}

impl KafkaPublisher {
    pub fn new(settings: &KafkaSettings) -> Result<Self, AdapterError> {
        let producer = ClientConfig::new()
            .set("bootstrap.servers", settings.bootstrap_servers())
            .set("message.timeout.ms", "30000")
            .create()?;
        Ok(Self {
            producer,
            topic: settings.topic.clone(),
        })
    }
}

#[async_trait]
impl LinePublisher for KafkaPublisher {
    async fn publish(&self, batch: &[Vec<u8>]) -> Result<(), AdapterError> {
        let deliveries = batch.iter().map(|line| {
            self.producer.send(
                FutureRecord::<(), [u8]>::to(&self.topic).payload(line.as_slice()),
                Timeout::After(SEND_QUEUE_TIMEOUT),
            )
        });
        for delivery in futures::future::join_all(deliveries).await {
            delivery.map_err(|(err, _message)| AdapterError::Kafka(err))?;
        }
        Ok(())
    }
}

/// Consumer-group subscription delivering each message as one line.
///
/// Offsets are committed by librdkafka on an interval, but only offsets stored
/// through a line's [`LineAck`] are eligible. A message that is dropped, fails,
/// or is still queued at shutdown keeps its partition's commit point behind it,
/// so the group redelivers it.
pub struct KafkaLineSource {
    consumer: Arc<StreamConsumer>,
    offsets: Arc<OffsetTracker>,
    source_id: String,
    delivered: u64,
}

impl KafkaLineSource {
    pub fn subscribe(settings: &KafkaSettings) -> Result<Self, AdapterError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", settings.bootstrap_servers())
            .set("group.id", &settings.consumer_group)
            .set("enable.auto.commit", "true")
            .set(
                "auto.commit.interval.ms",
                settings.commit_interval.as_millis().to_string(),
            )
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "earliest")
            .create()?;
        consumer.subscribe(&[settings.topic.as_str()])?;
        info!(topic = %settings.topic, group = %settings.consumer_group, "subscribed");
        Ok(Self {
            consumer: Arc::new(consumer),
            offsets: Arc::new(OffsetTracker::new()),
            source_id: format!("kafka:{}", settings.topic),
            delivered: 0,
        })
    }

    fn ack_for(&self, topic: String, partition: i32, offset: i64) -> LineAck {
        let consumer = self.consumer.clone();
        let offsets = self.offsets.clone();
        LineAck::new(move || settle(&consumer, &offsets, &topic, partition, offset))
    }
}

/// Completes one offset and stores the partition's new commit point, if any.
fn settle(
    consumer: &StreamConsumer,
    offsets: &OffsetTracker,
    topic: &str,
    partition: i32,
    offset: i64,
) -> Result<(), AdapterError> {
    let Some(done) = offsets.complete(topic, partition, offset) else {
        return Ok(());
    };
    // The stored offset is the next one the group should read.
    let mut position = TopicPartitionList::new();
    position.add_partition_offset(topic, partition, Offset::Offset(done + 1))?;
    consumer.store_offsets(&position)?;
    Ok(())
}

#[async_trait]
impl LineSource for KafkaLineSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    /// Never returns `None`; callers stop it through cancellation.
    async fn next_line(&mut self) -> Result<Option<RawLine>, AdapterError> {
        loop {
            let received = self.consumer.recv().await.map(|message| {
                (
                    message.topic().to_string(),
                    message.partition(),
                    message.offset(),
                    message.payload().unwrap_or_default().to_vec(),
                )
            });
            let (topic, partition, offset, payload) = match received {
                Ok(delivery) => delivery,
                Err(err) => {
                    warn!(error = %err, "kafka receive failed");
                    tokio::time::sleep(RECEIVE_RETRY_DELAY).await;
                    continue;
                }
            };

            self.delivered += 1;
            self.offsets.track(&topic, partition, offset);
            if payload.iter().all(u8::is_ascii_whitespace) {
                settle(&self.consumer, &self.offsets, &topic, partition, offset)?;
                continue;
            }
            return Ok(Some(RawLine {
                number: self.delivered,
                bytes: payload,
                ack: Some(self.ack_for(topic, partition, offset)),
            }));
        }
    }
}
