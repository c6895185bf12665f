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

//! An in-memory, single process broker.
//!
//! The broker keeps partition logs, a transaction coordinator and consumer
//! groups behind a single lock, and implements [`Connector`] so that a
//! [`RecordStore`](crate::RecordStore) can run against it without a Kafka
//! cluster. Transactions follow the same rules as Kafka: records written in
//! a transaction are only visible to `read_committed` consumers after the
//! commit marker, producers are fenced by epoch, and transactions open for
//! longer than their timeout are aborted by the coordinator.
//!
//! The broker also exposes fault injection used to exercise error paths:
//! disconnecting clients, appending raw records and failing the next fetch.

use std::{
    collections::{BTreeMap, HashSet, VecDeque, hash_map::DefaultHasher},
    hash::{Hash, Hasher},
    sync::{
        Arc, Condvar, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
    thread::{self, ThreadId},
    time::{Duration, Instant},
};

use bytes::Bytes;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    client::{Connector, Error, Result},
    config::{
        AUTO_OFFSET_RESET, CLIENT_ID, ClientConfig, ENABLE_IDEMPOTENCE, GROUP_ID, ISOLATION_LEVEL,
        SASL_MECHANISM, SASL_PASSWORD, SASL_USERNAME, TRANSACTION_TIMEOUT_MS, TRANSACTIONAL_ID,
    },
    partition::{ClusterMetadata, TopicPartition, Watermark},
};

mod consumer;
mod group;
mod log;
mod producer;
mod txn;

pub use consumer::MemoryConsumer;
pub use producer::MemoryProducer;

use group::Group;
use log::{Entry, Isolation, Log, Txn, now_ms};
use txn::{Coordinator, TxnDetail, TxnState};

const DEFAULT_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(60);

/// Identifies a consumer within its group, sent with the offsets of a
/// transaction.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct GroupMetadata {
    group_id: String,
    member_id: String,
    generation: i32,
}

impl GroupMetadata {
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn member_id(&self) -> &str {
        &self.member_id
    }

    pub fn generation(&self) -> i32 {
        self.generation
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
enum Reset {
    Earliest,
    #[default]
    Latest,
}

#[derive(Debug)]
struct Cluster {
    connected: bool,
    auto_create_topics: bool,
    default_partitions: i32,
    credentials: Option<(String, String)>,
    topics: BTreeMap<String, Vec<Log>>,
    coordinator: Coordinator,
    groups: BTreeMap<String, Group>,
    faults: VecDeque<Error>,
    next_producer_id: i64,
}

impl Cluster {
    fn ensure_connected(&self) -> Result<()> {
        if self.connected {
            Ok(())
        } else {
            Err(Error::Transport("all brokers are down".into()))
        }
    }

    fn authenticate(&self, config: &ClientConfig) -> Result<()> {
        let Some((ref username, ref password)) = self.credentials else {
            return Ok(());
        };

        if config.get(SASL_MECHANISM) == Some("PLAIN")
            && config.get(SASL_USERNAME) == Some(username.as_str())
            && config.get(SASL_PASSWORD) == Some(password.as_str())
        {
            Ok(())
        } else {
            Err(Error::Authentication(format!(
                "SASL/PLAIN authentication failed for {:?}",
                config.get(SASL_USERNAME)
            )))
        }
    }

    fn partition_count(&self, topic: &str) -> Option<i32> {
        self.topics.get(topic).map(|partitions| partitions.len() as i32)
    }

    fn create_topic(&mut self, topic: &str, partitions: i32) -> Result<()> {
        if self.topics.contains_key(topic) {
            return Err(Error::State(format!("topic {topic} already exists")));
        }

        if partitions < 1 {
            return Err(Error::Config {
                key: "num.partitions".into(),
                message: format!("{partitions} must be at least 1"),
            });
        }

        debug!(topic, partitions);

        _ = self
            .topics
            .insert(topic.to_owned(), vec![Log::default(); partitions as usize]);

        Ok(())
    }

    /// The number of partitions in a topic, creating it when permitted.
    fn partitions_for_produce(&mut self, topic: &str) -> Result<i32> {
        if let Some(count) = self.partition_count(topic) {
            return Ok(count);
        }

        if self.auto_create_topics {
            self.create_topic(topic, self.default_partitions)?;
            Ok(self.default_partitions)
        } else {
            Err(Error::UnknownTopicOrPartition(TopicPartition::new(topic, -1)))
        }
    }

    fn log(&self, topic_partition: &TopicPartition) -> Result<&Log> {
        self.topics
            .get(topic_partition.topic())
            .and_then(|partitions| partitions.get(usize::try_from(topic_partition.partition()).ok()?))
            .ok_or_else(|| Error::UnknownTopicOrPartition(topic_partition.clone()))
    }

    fn log_mut(&mut self, topic_partition: &TopicPartition) -> Result<&mut Log> {
        self.topics
            .get_mut(topic_partition.topic())
            .and_then(|partitions| {
                partitions.get_mut(usize::try_from(topic_partition.partition()).ok()?)
            })
            .ok_or_else(|| Error::UnknownTopicOrPartition(topic_partition.clone()))
    }

    fn txn_state(&self, id: u64) -> TxnState {
        self.coordinator.state(id)
    }

    fn watermark(&self, topic_partition: &TopicPartition, isolation: Isolation) -> Result<Watermark> {
        self.log(topic_partition)
            .map(|log| log.watermark(isolation, |id| self.txn_state(id)))
    }

    /// Write the control markers of an ended transaction, committing its
    /// consumer offsets if it was committed.
    ///
    /// The outcome is recorded on the transaction's entries, after which the
    /// coordinator no longer tracks it.
    fn txn_end(&mut self, detail: TxnDetail, committed: bool) {
        let timestamp = now_ms();
        let outcome = if committed {
            TxnState::Committed
        } else {
            TxnState::Aborted
        };

        for topic_partition in &detail.produces {
            match self.log_mut(topic_partition) {
                Ok(log) => {
                    log.resolve(detail.id, outcome);

                    let offset = log.append(Entry::Marker {
                        timestamp,
                        txn: detail.id,
                    });
                    debug!(%topic_partition, offset, committed);
                }

                Err(error) => warn!(%topic_partition, ?error),
            }
        }

        self.coordinator.forget(detail.id);

        if committed {
            for (group_id, offsets) in detail.offsets {
                self.groups.entry(group_id).or_default().commit(offsets);
            }
        }
    }

    fn expire_transactions(&mut self) {
        for detail in self.coordinator.expire(Instant::now()) {
            self.txn_end(detail, false);
        }
    }

    fn metadata(&self) -> ClusterMetadata {
        self.topics
            .iter()
            .fold(ClusterMetadata::default(), |metadata, (topic, partitions)| {
                metadata.topic(topic.as_str(), 0..partitions.len() as i32)
            })
    }
}

#[derive(Debug, Default)]
struct Stats {
    producers: AtomicUsize,
    consumers: AtomicUsize,
    pollers: Mutex<HashSet<ThreadId>>,
}

#[derive(Debug)]
struct Shared {
    cluster: Mutex<Cluster>,
    changed: Condvar,
    stats: Stats,
}

/// A handle on an in-memory broker, cheap to clone.
#[derive(Clone, Debug)]
pub struct Broker {
    shared: Arc<Shared>,
}

impl Broker {
    pub fn builder() -> Builder {
        Builder::default()
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            broker: self.clone(),
        }
    }

    // the cluster is never left inconsistent by a panic while locked
    fn cluster(&self) -> MutexGuard<'_, Cluster> {
        self.shared
            .cluster
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(
        &self,
        cluster: MutexGuard<'a, Cluster>,
        timeout: Option<Duration>,
    ) -> MutexGuard<'a, Cluster> {
        match timeout {
            Some(timeout) => self
                .shared
                .changed
                .wait_timeout(cluster, timeout)
                .map(|(cluster, _)| cluster)
                .unwrap_or_else(|poison| poison.into_inner().0),

            None => self
                .shared
                .changed
                .wait(cluster)
                .unwrap_or_else(PoisonError::into_inner),
        }
    }

    fn notify(&self) {
        self.shared.changed.notify_all();
    }

    fn polled(&self) {
        _ = self
            .shared
            .stats
            .pollers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(thread::current().id());
    }

    pub fn create_topic(&self, topic: &str, partitions: i32) -> Result<()> {
        self.cluster().create_topic(topic, partitions)
    }

    pub fn delete_topic(&self, topic: &str) -> Result<()> {
        self.cluster()
            .topics
            .remove(topic)
            .map(|_| self.notify())
            .ok_or_else(|| Error::UnknownTopicOrPartition(TopicPartition::new(topic, -1)))
    }

    /// Append a record outside of any producer, the payload is not
    /// required to be a valid encoding.
    pub fn append_raw(
        &self,
        topic_partition: &TopicPartition,
        key: Option<Bytes>,
        payload: Option<Bytes>,
        timestamp: Option<i64>,
    ) -> Result<i64> {
        let offset = self.cluster().log_mut(topic_partition).map(|log| {
            log.append(Entry::Data {
                key,
                payload,
                timestamp: timestamp.unwrap_or_else(now_ms),
                txn: None,
            })
        })?;

        self.notify();
        Ok(offset)
    }

    /// The next consume by any consumer returns this error in place of a
    /// message.
    pub fn fail_next_fetch(&self, error: Error) {
        self.cluster().faults.push_back(error);
        self.notify();
    }

    /// Every client operation fails with a transport error until
    /// reconnected.
    pub fn disconnect(&self) {
        self.cluster().connected = false;
        self.notify();
    }

    pub fn reconnect(&self) {
        self.cluster().connected = true;
        self.notify();
    }

    pub fn watermark(&self, topic_partition: &TopicPartition) -> Result<Watermark> {
        self.cluster()
            .watermark(topic_partition, Isolation::ReadUncommitted)
    }

    pub fn committed(&self, group_id: &str, topic_partition: &TopicPartition) -> Option<i64> {
        self.cluster()
            .groups
            .get(group_id)
            .and_then(|group| group.committed(topic_partition))
    }

    pub fn metadata(&self) -> ClusterMetadata {
        self.cluster().metadata()
    }

    pub fn producers_created(&self) -> usize {
        self.shared.stats.producers.load(Ordering::Relaxed)
    }

    pub fn consumers_created(&self) -> usize {
        self.shared.stats.consumers.load(Ordering::Relaxed)
    }

    /// The number of distinct threads that have polled a producer.
    pub fn polling_threads(&self) -> usize {
        self.shared
            .stats
            .pollers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[derive(Clone, Debug)]
pub struct Builder {
    auto_create_topics: bool,
    default_partitions: i32,
    credentials: Option<(String, String)>,
    topics: Vec<(String, i32)>,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            auto_create_topics: true,
            default_partitions: 1,
            credentials: None,
            topics: Vec::new(),
        }
    }
}

impl Builder {
    pub fn auto_create_topics(self, auto_create_topics: bool) -> Self {
        Self {
            auto_create_topics,
            ..self
        }
    }

    pub fn default_partitions(self, default_partitions: i32) -> Self {
        Self {
            default_partitions: default_partitions.max(1),
            ..self
        }
    }

    /// Require SASL/PLAIN authentication with these credentials.
    pub fn sasl_plain(self, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            credentials: Some((username.into(), password.into())),
            ..self
        }
    }

    pub fn topic(mut self, topic: impl Into<String>, partitions: i32) -> Self {
        self.topics.push((topic.into(), partitions.max(1)));
        self
    }

    pub fn build(self) -> Broker {
        let topics = self
            .topics
            .into_iter()
            .map(|(topic, partitions)| (topic, vec![Log::default(); partitions as usize]))
            .collect();

        Broker {
            shared: Arc::new(Shared {
                cluster: Mutex::new(Cluster {
                    connected: true,
                    auto_create_topics: self.auto_create_topics,
                    default_partitions: self.default_partitions,
                    credentials: self.credentials,
                    topics,
                    coordinator: Coordinator::default(),
                    groups: BTreeMap::new(),
                    faults: VecDeque::new(),
                    next_producer_id: 1,
                }),
                changed: Condvar::new(),
                stats: Stats::default(),
            }),
        }
    }
}

fn config_value<T>(
    config: &ClientConfig,
    key: &str,
    parse: impl FnOnce(&str) -> Option<T>,
) -> Result<Option<T>> {
    config
        .get(key)
        .map(|value| {
            parse(value).ok_or_else(|| Error::Config {
                key: key.into(),
                message: format!("unsupported value: {value}"),
            })
        })
        .transpose()
}

/// Default partitioner: a hash of the key, or round robin without one.
fn partition_for(key: Option<&[u8]>, partitions: i32, round_robin: &AtomicUsize) -> i32 {
    let partitions = partitions.max(1) as u64;

    let selector = match key {
        Some(key) => {
            let mut hasher = DefaultHasher::new();
            key.hash(&mut hasher);
            hasher.finish()
        }

        None => round_robin.fetch_add(1, Ordering::Relaxed) as u64,
    };

    (selector % partitions) as i32
}

#[derive(Clone, Debug)]
pub struct MemoryConnector {
    broker: Broker,
}

impl Connector for MemoryConnector {
    type Producer = MemoryProducer;
    type Consumer = MemoryConsumer;

    fn producer(&self, config: &ClientConfig) -> Result<Self::Producer> {
        let transaction_timeout = config_value(config, TRANSACTION_TIMEOUT_MS, |ms| {
            ms.parse().ok().map(Duration::from_millis)
        })?
        .unwrap_or(DEFAULT_TRANSACTION_TIMEOUT);

        let idempotent: bool = config_value(config, ENABLE_IDEMPOTENCE, |value| value.parse().ok())?
            .unwrap_or_default();

        let producer_id = {
            let mut cluster = self.broker.cluster();
            cluster.authenticate(config)?;

            let producer_id = cluster.next_producer_id;
            cluster.next_producer_id += 1;
            producer_id
        };

        debug!(producer_id, idempotent, client_id = config.get(CLIENT_ID));
        _ = self.broker.shared.stats.producers.fetch_add(1, Ordering::Relaxed);

        Ok(MemoryProducer::new(
            self.broker.clone(),
            producer_id,
            config.get(TRANSACTIONAL_ID).map(ToOwned::to_owned),
            transaction_timeout,
        ))
    }

    fn consumer(&self, config: &ClientConfig) -> Result<Self::Consumer> {
        let isolation = config_value(config, ISOLATION_LEVEL, |value| match value {
            "read_committed" => Some(Isolation::ReadCommitted),
            "read_uncommitted" => Some(Isolation::ReadUncommitted),
            _ => None,
        })?
        .unwrap_or_default();

        let reset = config_value(config, AUTO_OFFSET_RESET, |value| match value {
            "earliest" | "smallest" | "beginning" => Some(Reset::Earliest),
            "latest" | "largest" | "end" => Some(Reset::Latest),
            _ => None,
        })?
        .unwrap_or_default();

        self.broker.cluster().authenticate(config)?;

        let member_id = format!(
            "{}-{}",
            config.get(CLIENT_ID).unwrap_or(env!("CARGO_PKG_NAME")),
            Uuid::new_v4()
        );

        debug!(member_id, ?isolation, ?reset);
        _ = self.broker.shared.stats.consumers.fetch_add(1, Ordering::Relaxed);

        Ok(MemoryConsumer::new(
            self.broker.clone(),
            member_id,
            config.get(GROUP_ID).map(ToOwned::to_owned),
            isolation,
            reset,
        ))
    }
}
