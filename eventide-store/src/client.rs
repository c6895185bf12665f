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

//! The seam between a record store and the messaging system.
//!
//! A [`Connector`] builds the producers and the consumer owned by a store.
//! Each backend provides one implementation, selected when the store is
//! constructed.

use std::{fmt, sync::Arc, time::Duration};

use bytes::Bytes;
use tracing::info;

use crate::{
    config::ClientConfig,
    partition::{ClusterMetadata, PartitionPosition, TopicPartition, Watermark, partitions_summary},
};

#[derive(thiserror::Error, Clone, Debug)]
pub enum Error {
    Authentication(String),
    Config { key: String, message: String },
    Fenced(String),

    #[cfg(feature = "kafka")]
    Kafka(#[from] rdkafka::error::KafkaError),

    Message(String),
    State(String),
    Timeout,
    Transport(String),
    UnknownTopicOrPartition(TopicPartition),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Message(message) => write!(f, "{message}"),
            error => write!(f, "{error:?}"),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A record on its way to a topic.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct OutboundMessage {
    pub topic: String,
    pub key: Option<Bytes>,
    pub payload: Bytes,
}

/// A message returned by a consumer.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Message {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub timestamp: Option<i64>,
    pub key: Option<Bytes>,
    pub payload: Option<Bytes>,
}

impl Message {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.as_str(), self.partition)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]:{}", self.topic, self.partition, self.offset)
    }
}

/// Invoked once with the outcome of a send, on whichever thread polls the
/// producer.
pub type DeliveryCallback = Box<dyn FnOnce(Result<PartitionPosition>) + Send + Sync>;

pub type RebalanceCallback = Arc<dyn Fn(&[PartitionPosition]) + Send + Sync>;

/// Partition assignment callbacks for a group managed subscription.
///
/// These run synchronously on the consumer's own poll, they must not block
/// or perform long running work.
#[derive(Clone)]
pub struct Rebalance {
    pub on_assign: RebalanceCallback,
    pub on_revoke: RebalanceCallback,
    pub on_lost: RebalanceCallback,
}

impl Default for Rebalance {
    fn default() -> Self {
        Self {
            on_assign: Arc::new(|partitions: &[PartitionPosition]| {
                info!(assigned = partitions_summary(partitions));
            }),
            on_revoke: Arc::new(|partitions: &[PartitionPosition]| {
                info!(revoked = partitions_summary(partitions));
            }),
            on_lost: Arc::new(|partitions: &[PartitionPosition]| {
                info!(lost = partitions_summary(partitions));
            }),
        }
    }
}

impl fmt::Debug for Rebalance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(stringify!(Rebalance)).finish_non_exhaustive()
    }
}

/// A producer client.
///
/// Sends are asynchronous: the delivery callback only fires when the
/// producer is polled or flushed. `None` timeouts wait indefinitely.
pub trait Producer: Send + Sync + 'static {
    type GroupMetadata;

    fn send(&self, message: OutboundMessage, delivery: DeliveryCallback) -> Result<()>;

    /// Serve queued sends and delivery callbacks.
    fn poll(&self, timeout: Duration) -> Result<()>;

    fn flush(&self, timeout: Option<Duration>) -> Result<()>;

    /// Register the transactional id with the coordinator, fencing any
    /// previous producer holding the same id.
    fn init_transactions(&self, timeout: Option<Duration>) -> Result<()>;

    fn begin_transaction(&self) -> Result<()>;

    fn send_offsets_to_transaction(
        &self,
        offsets: &[PartitionPosition],
        group: &Self::GroupMetadata,
        timeout: Option<Duration>,
    ) -> Result<()>;

    fn commit_transaction(&self, timeout: Option<Duration>) -> Result<()>;

    fn abort_transaction(&self, timeout: Option<Duration>) -> Result<()>;
}

/// A consumer group client.
pub trait Consumer: Send + Sync + 'static {
    type GroupMetadata;

    fn subscribe(&self, topics: &[String], rebalance: Rebalance) -> Result<()>;

    fn assign(&self, positions: &[PartitionPosition]) -> Result<()>;

    /// The current assignment, with the offset each partition was assigned at.
    fn assignment(&self) -> Result<Vec<PartitionPosition>>;

    /// Up to `max` messages, waiting at most `timeout`.
    ///
    /// The outer error is a failure of the poll itself, inner errors are
    /// reported by the broker for individual messages.
    fn consume(&self, max: usize, timeout: Option<Duration>) -> Result<Vec<Result<Message>>>;

    /// Synchronously commit the offset following this message.
    fn commit_message(&self, message: &Message) -> Result<()>;

    /// Synchronously commit the current position of every assigned partition.
    fn commit(&self) -> Result<()>;

    fn position(&self, partitions: &[TopicPartition]) -> Result<Vec<PartitionPosition>>;

    /// Move the position of assigned partitions. A partition given an
    /// offset that is not concrete is read again from where it started when
    /// assigned.
    fn seek(&self, positions: &[PartitionPosition]) -> Result<()>;

    fn committed(
        &self,
        partitions: &[TopicPartition],
        timeout: Option<Duration>,
    ) -> Result<Vec<PartitionPosition>>;

    fn watermarks(&self, partition: &TopicPartition, timeout: Option<Duration>) -> Result<Watermark>;

    /// The earliest offset whose timestamp is at or after `timestamp_ms`.
    fn offset_for_time(
        &self,
        partition: &TopicPartition,
        timestamp_ms: i64,
        timeout: Option<Duration>,
    ) -> Result<PartitionPosition>;

    fn metadata(&self, timeout: Option<Duration>) -> Result<ClusterMetadata>;

    fn group_metadata(&self) -> Option<Self::GroupMetadata>;

    fn close(&self) -> Result<()>;
}

/// Builds the clients of a record store.
pub trait Connector: Send + Sync + 'static {
    type Producer: Producer;
    type Consumer: Consumer<GroupMetadata = <Self::Producer as Producer>::GroupMetadata>;

    fn producer(&self, config: &ClientConfig) -> Result<Self::Producer>;

    fn consumer(&self, config: &ClientConfig) -> Result<Self::Consumer>;
}
