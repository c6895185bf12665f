// Copyright ⓒ 2025 Peter Morgan <peter.james.morgan@gmail.com>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Broker clients over librdkafka.
//!
//! Delivery reports are routed to the callback given with each send by the
//! producer context, rebalance events to the [`Rebalance`] callbacks by the
//! consumer context. Both only run while the client is polled.

use std::{
    sync::{Mutex, PoisonError},
    time::{Duration, Instant},
};

use bytes::Bytes;
use rdkafka::{
    ClientContext, Message as _, TopicPartitionList,
    consumer::{
        self, BaseConsumer, CommitMode, Consumer as _, ConsumerContext, ConsumerGroupMetadata,
    },
    error::{KafkaError, RDKafkaErrorCode},
    message::BorrowedMessage,
    producer::{BaseProducer, BaseRecord, DeliveryResult, Producer as _, ProducerContext},
    util::Timeout,
};
use tracing::{debug, error, warn};

use crate::{
    client::{
        Connector, Consumer, DeliveryCallback, Error, Message, OutboundMessage, Producer,
        Rebalance, Result,
    },
    config::ClientConfig,
    partition::{ClusterMetadata, Offset, PartitionPosition, TopicPartition, Watermark},
};

fn client_error(error: KafkaError) -> Error {
    match error.rdkafka_error_code() {
        Some(RDKafkaErrorCode::Fenced | RDKafkaErrorCode::ProducerFenced) => {
            Error::Fenced(error.to_string())
        }

        Some(RDKafkaErrorCode::Authentication | RDKafkaErrorCode::SaslAuthenticationFailed) => {
            Error::Authentication(error.to_string())
        }

        Some(
            RDKafkaErrorCode::MessageTimedOut
            | RDKafkaErrorCode::OperationTimedOut
            | RDKafkaErrorCode::RequestTimedOut,
        ) => Error::Timeout,

        Some(RDKafkaErrorCode::AllBrokersDown | RDKafkaErrorCode::BrokerTransportFailure) => {
            Error::Transport(error.to_string())
        }

        _otherwise => Error::Kafka(error),
    }
}

impl From<Offset> for rdkafka::Offset {
    fn from(value: Offset) -> Self {
        match value {
            Offset::Beginning => Self::Beginning,
            Offset::End => Self::End,
            Offset::Stored => Self::Stored,
            Offset::Invalid => Self::Invalid,
            Offset::At(offset) => Self::Offset(offset),
        }
    }
}

impl From<rdkafka::Offset> for Offset {
    fn from(value: rdkafka::Offset) -> Self {
        match value {
            rdkafka::Offset::Beginning => Self::Beginning,
            rdkafka::Offset::End => Self::End,
            rdkafka::Offset::Stored => Self::Stored,
            rdkafka::Offset::Offset(offset) => Self::At(offset),
            rdkafka::Offset::Invalid | rdkafka::Offset::OffsetTail(_) => Self::Invalid,
        }
    }
}

fn partition_list<'a>(positions: impl IntoIterator<Item = &'a PartitionPosition>) -> Result<TopicPartitionList> {
    let mut list = TopicPartitionList::new();

    for position in positions {
        list.add_partition_offset(position.topic(), position.partition(), position.offset().into())
            .map_err(client_error)?;
    }

    Ok(list)
}

fn positions(list: &TopicPartitionList) -> Vec<PartitionPosition> {
    list.elements()
        .iter()
        .map(|element| TopicPartition::new(element.topic(), element.partition()).at(element.offset().into()))
        .collect()
}

fn client_config(config: &ClientConfig) -> rdkafka::config::ClientConfig {
    let mut client = rdkafka::config::ClientConfig::new();

    for (key, value) in config.iter() {
        _ = client.set(key, value);
    }

    client
}

/// Builds librdkafka backed clients.
#[derive(Copy, Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct KafkaConnector;

impl Connector for KafkaConnector {
    type Producer = KafkaProducer;
    type Consumer = KafkaConsumer;

    fn producer(&self, config: &ClientConfig) -> Result<Self::Producer> {
        client_config(config)
            .create_with_context(ProducerCallbacks)
            .map(|producer| KafkaProducer { producer })
            .map_err(client_error)
    }

    fn consumer(&self, config: &ClientConfig) -> Result<Self::Consumer> {
        client_config(config)
            .create_with_context(ConsumerCallbacks::default())
            .map(|consumer| KafkaConsumer { consumer })
            .map_err(client_error)
    }
}

#[derive(Debug)]
pub struct ProducerCallbacks;

impl ClientContext for ProducerCallbacks {
    fn error(&self, error: KafkaError, reason: &str) {
        error!(?error, reason);
    }
}

impl ProducerContext for ProducerCallbacks {
    type DeliveryOpaque = Box<DeliveryCallback>;

    fn delivery(&self, delivery_result: &DeliveryResult<'_>, delivery_opaque: Self::DeliveryOpaque) {
        let outcome = match delivery_result {
            Ok(message) => Ok(TopicPartition::new(message.topic(), message.partition())
                .at(Offset::At(message.offset()))),

            Err((error, message)) => {
                debug!(topic = message.topic(), ?error);
                Err(client_error(error.clone()))
            }
        };

        let callback: DeliveryCallback = *delivery_opaque;
        callback(outcome)
    }
}

pub struct KafkaProducer {
    producer: BaseProducer<ProducerCallbacks>,
}

impl Producer for KafkaProducer {
    type GroupMetadata = ConsumerGroupMetadata;

    fn send(&self, message: OutboundMessage, delivery: DeliveryCallback) -> Result<()> {
        let record: BaseRecord<'_, [u8], [u8], Box<DeliveryCallback>> =
            BaseRecord::with_opaque_to(message.topic.as_str(), Box::new(delivery))
                .payload(&message.payload[..]);

        let record = match message.key.as_deref() {
            Some(key) => record.key(key),
            None => record,
        };

        self.producer
            .send(record)
            .map_err(|(error, _record)| client_error(error))
    }

    fn poll(&self, timeout: Duration) -> Result<()> {
        self.producer.poll(timeout);
        Ok(())
    }

    fn flush(&self, timeout: Option<Duration>) -> Result<()> {
        self.producer.flush(timeout).map_err(client_error)
    }

    fn init_transactions(&self, timeout: Option<Duration>) -> Result<()> {
        self.producer.init_transactions(timeout).map_err(client_error)
    }

    fn begin_transaction(&self) -> Result<()> {
        self.producer.begin_transaction().map_err(client_error)
    }

    fn send_offsets_to_transaction(
        &self,
        offsets: &[PartitionPosition],
        group: &Self::GroupMetadata,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let offsets = partition_list(offsets)?;

        self.producer
            .send_offsets_to_transaction(&offsets, group, timeout)
            .map_err(client_error)
    }

    fn commit_transaction(&self, timeout: Option<Duration>) -> Result<()> {
        self.producer.commit_transaction(timeout).map_err(client_error)
    }

    fn abort_transaction(&self, timeout: Option<Duration>) -> Result<()> {
        self.producer.abort_transaction(timeout).map_err(client_error)
    }
}

#[derive(Default)]
pub struct ConsumerCallbacks {
    rebalance: Mutex<Rebalance>,
}

impl ConsumerCallbacks {
    fn rebalance(&self) -> Rebalance {
        self.rebalance
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ClientContext for ConsumerCallbacks {
    fn error(&self, error: KafkaError, reason: &str) {
        error!(?error, reason);
    }
}

impl ConsumerContext for ConsumerCallbacks {
    fn pre_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &consumer::Rebalance<'_>) {
        match rebalance {
            consumer::Rebalance::Revoke(partitions) => {
                let partitions = positions(partitions);

                if base_consumer.assignment_lost() {
                    (self.rebalance().on_lost)(&partitions)
                } else {
                    (self.rebalance().on_revoke)(&partitions)
                }
            }

            consumer::Rebalance::Error(error) => warn!(?error),

            consumer::Rebalance::Assign(_) => (),
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &consumer::Rebalance<'_>) {
        if let consumer::Rebalance::Assign(partitions) = rebalance {
            (self.rebalance().on_assign)(&positions(partitions))
        }
    }
}

pub struct KafkaConsumer {
    consumer: BaseConsumer<ConsumerCallbacks>,
}

/// Poll until `max` items are collected or `timeout` has elapsed.
///
/// The consumer is always polled at least once, so that a zero timeout
/// returns whatever is immediately available and serves rebalance events.
fn drain<T>(max: usize, timeout: Option<Duration>, mut poll: impl FnMut(Option<Duration>) -> Option<T>) -> Vec<T> {
    let deadline = timeout.map(|timeout| Instant::now() + timeout);
    let mut polled = Vec::new();

    while polled.len() < max {
        let remaining = deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()));

        match poll(remaining) {
            Some(item) => polled.push(item),
            None if remaining.is_some_and(|remaining| remaining.is_zero()) => break,
            None => (),
        }
    }

    polled
}

impl KafkaConsumer {
    fn message(message: &BorrowedMessage<'_>) -> Message {
        Message {
            topic: message.topic().into(),
            partition: message.partition(),
            offset: message.offset(),
            timestamp: message.timestamp().to_millis(),
            key: message.key().map(Bytes::copy_from_slice),
            payload: message.payload().map(Bytes::copy_from_slice),
        }
    }
}

impl Consumer for KafkaConsumer {
    type GroupMetadata = ConsumerGroupMetadata;

    fn subscribe(&self, topics: &[String], rebalance: Rebalance) -> Result<()> {
        *self
            .consumer
            .context()
            .rebalance
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = rebalance;

        self.consumer
            .subscribe(&topics.iter().map(String::as_str).collect::<Vec<_>>())
            .map_err(client_error)
    }

    fn assign(&self, positions: &[PartitionPosition]) -> Result<()> {
        partition_list(positions)
            .and_then(|assignment| self.consumer.assign(&assignment).map_err(client_error))
    }

    fn assignment(&self) -> Result<Vec<PartitionPosition>> {
        self.consumer
            .assignment()
            .map(|assignment| positions(&assignment))
            .map_err(client_error)
    }

    fn consume(&self, max: usize, timeout: Option<Duration>) -> Result<Vec<Result<Message>>> {
        Ok(drain(max, timeout, |remaining| {
            self.consumer.poll(remaining).map(|polled| {
                polled
                    .map(|message| Self::message(&message))
                    .map_err(client_error)
            })
        }))
    }

    fn commit_message(&self, message: &Message) -> Result<()> {
        partition_list([&message.topic_partition().at(Offset::At(message.offset + 1))])
            .and_then(|offsets| {
                self.consumer
                    .commit(&offsets, CommitMode::Sync)
                    .map_err(client_error)
            })
    }

    fn commit(&self) -> Result<()> {
        self.consumer
            .commit_consumer_state(CommitMode::Sync)
            .map_err(client_error)
    }

    fn position(&self, partitions: &[TopicPartition]) -> Result<Vec<PartitionPosition>> {
        let current = self.consumer.position().map_err(client_error)?;

        Ok(partitions
            .iter()
            .map(|topic_partition| {
                let offset = current
                    .find_partition(topic_partition.topic(), topic_partition.partition())
                    .map_or(Offset::Invalid, |element| element.offset().into());

                topic_partition.clone().at(offset)
            })
            .collect())
    }

    fn seek(&self, positions: &[PartitionPosition]) -> Result<()> {
        let (seekable, skipped): (Vec<_>, Vec<_>) = positions
            .iter()
            .partition(|position| !matches!(position.offset(), Offset::Stored | Offset::Invalid));

        for position in skipped {
            debug!(%position, "no offset to seek to");
        }

        if seekable.is_empty() {
            return Ok(());
        }

        let sought = self
            .consumer
            .seek_partitions(partition_list(seekable)?, Timeout::Never)
            .map_err(client_error)?;

        for element in sought.elements() {
            element.error().map_err(client_error)?;
        }

        Ok(())
    }

    fn committed(
        &self,
        partitions: &[TopicPartition],
        timeout: Option<Duration>,
    ) -> Result<Vec<PartitionPosition>> {
        let mut list = TopicPartitionList::new();

        for topic_partition in partitions {
            _ = list.add_partition(topic_partition.topic(), topic_partition.partition());
        }

        self.consumer
            .committed_offsets(list, timeout)
            .map(|committed| positions(&committed))
            .map_err(client_error)
    }

    fn watermarks(&self, partition: &TopicPartition, timeout: Option<Duration>) -> Result<Watermark> {
        self.consumer
            .fetch_watermarks(partition.topic(), partition.partition(), timeout)
            .map(|(low, high)| Watermark { low, high })
            .map_err(client_error)
    }

    fn offset_for_time(
        &self,
        partition: &TopicPartition,
        timestamp_ms: i64,
        timeout: Option<Duration>,
    ) -> Result<PartitionPosition> {
        let mut list = TopicPartitionList::new();
        list.add_partition_offset(
            partition.topic(),
            partition.partition(),
            rdkafka::Offset::Offset(timestamp_ms),
        )
        .map_err(client_error)?;

        let found = self
            .consumer
            .offsets_for_times(list, timeout)
            .map_err(client_error)?;

        let offset = found
            .find_partition(partition.topic(), partition.partition())
            .map(|element| Offset::from(element.offset()))
            .filter(Offset::is_concrete)
            .unwrap_or(Offset::End);

        Ok(partition.clone().at(offset))
    }

    fn metadata(&self, timeout: Option<Duration>) -> Result<ClusterMetadata> {
        let metadata = self
            .consumer
            .fetch_metadata(None, timeout)
            .map_err(client_error)?;

        Ok(metadata
            .topics()
            .iter()
            .filter(|topic| {
                topic
                    .error()
                    .inspect(|error| warn!(topic = topic.name(), ?error))
                    .is_none()
            })
            .fold(ClusterMetadata::default(), |metadata, topic| {
                metadata.topic(
                    topic.name(),
                    topic.partitions().iter().map(|partition| partition.id()),
                )
            }))
    }

    fn group_metadata(&self) -> Option<Self::GroupMetadata> {
        self.consumer.group_metadata()
    }

    fn close(&self) -> Result<()> {
        self.consumer.unsubscribe();
        self.consumer.unassign().map_err(client_error)
    }
}
