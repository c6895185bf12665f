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

use std::{
    collections::BTreeMap,
    fmt::{self, Debug, Formatter},
    slice,
    sync::{
        Arc, LazyLock, Mutex, OnceLock, PoisonError,
        mpsc::{self, Receiver, RecvTimeoutError},
    },
    thread::JoinHandle,
    time::{Duration, UNIX_EPOCH},
};

use bytes::Bytes;
use opentelemetry::{KeyValue, metrics::Counter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    Error, METER, Operation, Record, Result, Serializer,
    client::{self, Connector, Consumer, Message, OutboundMessage, Producer, Rebalance},
    config::Configuration,
    partition::{Offset, PartitionPosition, TopicAssignment, TopicPartition, partitions_summary},
    poll::{self, Exit, PollLoop},
};

mod read;

pub use read::Read;

/// Bound on metadata, watermark and offset lookups.
const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

static RECORDS_WRITTEN: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("eventide_records_written")
        .with_description("records delivered to a topic")
        .build()
});

static DELIVERY_ERRORS: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("eventide_delivery_errors")
        .with_description("records that failed delivery")
        .build()
});

static TRANSACTIONS: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("eventide_transactions")
        .with_description("transactions completed, by outcome")
        .build()
});

struct Clients<C>
where
    C: Connector,
{
    transactional: Arc<C::Producer>,
    immediate: Arc<C::Producer>,
    consumer: C::Consumer,
}

/// A transactional record store.
///
/// The broker clients are constructed on first use, or by an explicit
/// [`initialize`](Self::initialize). The poll loop started at that point
/// runs until the store is closed, or until the thread that initialized
/// the store exits.
pub struct RecordStore<C, S>
where
    C: Connector,
{
    connector: C,
    serializer: S,
    configuration: Configuration,
    topics: Vec<String>,
    assignments: BTreeMap<String, TopicAssignment>,
    rebalance: Rebalance,
    init: Mutex<()>,
    clients: OnceLock<Clients<C>>,
    poller: Mutex<Option<JoinHandle<Exit>>>,
    in_transaction: Mutex<bool>,
    first_read: Mutex<BTreeMap<TopicPartition, i64>>,
    cancellation: CancellationToken,
}

impl<C, S> Debug for RecordStore<C, S>
where
    C: Connector,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct(stringify!(RecordStore))
            .field("configuration", &self.configuration)
            .field("topics", &self.topics)
            .field("assignments", &self.assignments)
            .field("initialized", &self.is_initialized())
            .field("in_transaction", &self.in_transaction())
            .finish()
    }
}

impl<C, S> RecordStore<C, S>
where
    C: Connector,
    S: Serializer,
{
    pub fn builder(connector: C, serializer: S, configuration: Configuration) -> Builder<C, S> {
        Builder {
            connector,
            serializer,
            configuration,
            topics: Vec::new(),
            assignments: BTreeMap::new(),
            rebalance: Rebalance::default(),
        }
    }

    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    /// Construct the producers and the consumer, and start the poll loop.
    ///
    /// Safe to call any number of times from any thread, the clients are
    /// only ever constructed once.
    pub fn initialize(&self) -> Result<()> {
        _ = self.clients()?;
        Ok(())
    }

    fn clients(&self) -> Result<&Clients<C>> {
        if let Some(clients) = self.clients.get() {
            return Ok(clients);
        }

        let _guard = self.init.lock()?;

        if let Some(clients) = self.clients.get() {
            debug!("already initialized");
            return Ok(clients);
        }

        if self.cancellation.is_cancelled() {
            return Err(Error::Closed);
        }

        let clients = self.connect()?;

        let poller = PollLoop {
            transactional: clients.transactional.clone(),
            immediate: clients.immediate.clone(),
            cancellation: self.cancellation.clone(),
            owner: poll::owner(),
            interval: self.configuration.poll_interval(),
            backoff: self.configuration.poll_backoff(),
        }
        .spawn()?;

        *self.poller.lock()? = Some(poller);

        info!(
            service_name = self.configuration.service_name(),
            transactional_id = self.configuration.transactional_id(),
            "initialized"
        );

        Ok(self.clients.get_or_init(|| clients))
    }

    fn connect(&self) -> Result<Clients<C>> {
        let config = self.configuration.transactional_producer();
        info!(?config, "transactional producer");

        let transactional = self
            .connector
            .producer(&config)
            .map_err(Error::client(Operation::Connect))?;

        // fences any previous producer with the same transactional id
        transactional
            .init_transactions(None)
            .map_err(Error::client(Operation::InitTransactions))?;

        let config = self.configuration.immediate_producer();
        info!(?config, "immediate producer");

        let immediate = self
            .connector
            .producer(&config)
            .map_err(Error::client(Operation::Connect))?;

        let config = self.configuration.consumer();
        info!(?config, "consumer");

        let consumer = self
            .connector
            .consumer(&config)
            .map_err(Error::client(Operation::Connect))?;

        if !self.topics.is_empty() {
            info!(topics = ?self.topics, "subscribe");

            consumer
                .subscribe(&self.topics, self.rebalance.clone())
                .map_err(Error::client(Operation::Subscribe))?;
        } else if !self.assignments.is_empty() {
            let positions = self.resolve_assignments(&consumer)?;
            info!(assign = partitions_summary(&positions));

            consumer
                .assign(&positions)
                .map_err(Error::client(Operation::Assign))?;
        } else {
            info!("no subscription or assignment");
        }

        Ok(Clients {
            transactional: Arc::new(transactional),
            immediate: Arc::new(immediate),
            consumer,
        })
    }

    /// Starting positions for manually assigned topics.
    ///
    /// Topics that are unknown to the cluster, or whose offsets do not match
    /// the partitions of the topic, are skipped.
    fn resolve_assignments(&self, consumer: &C::Consumer) -> Result<Vec<PartitionPosition>> {
        let metadata = consumer
            .metadata(Some(QUERY_TIMEOUT))
            .map_err(Error::client(Operation::Metadata))?;

        let mut positions = Vec::new();

        for (topic, assignment) in &self.assignments {
            let Some(partitions) = metadata.partitions(topic) else {
                warn!(topic, "topic not found");
                continue;
            };

            if let Some(offsets) = assignment.partition_offsets() {
                if offsets.len() != partitions.len() {
                    warn!(
                        topic,
                        partitions = partitions.len(),
                        offsets = offsets.len(),
                        "offsets do not match partitions"
                    );
                    continue;
                }

                for partition in partitions {
                    let topic_partition = TopicPartition::new(topic.as_str(), *partition);

                    match usize::try_from(*partition)
                        .ok()
                        .and_then(|index| offsets.get(index))
                    {
                        Some(offset) => {
                            let position = topic_partition.at(Offset::from(*offset));
                            info!(%position, "will assign");
                            positions.push(position);
                        }

                        None => warn!(%topic_partition, "no offset for partition"),
                    }
                }
            } else if let Some(since) = assignment.since_date() {
                let timestamp = since
                    .duration_since(UNIX_EPOCH)
                    .map_or(0, |elapsed| elapsed.as_millis() as i64);

                for partition in partitions {
                    let position = consumer
                        .offset_for_time(
                            &TopicPartition::new(topic.as_str(), *partition),
                            timestamp,
                            Some(QUERY_TIMEOUT),
                        )
                        .map_err(Error::client(Operation::OffsetForTime))?;

                    info!(%position, timestamp, "will assign");
                    positions.push(position);
                }
            } else {
                for partition in partitions {
                    warn!(topic, partition, "cannot assign without offset or since date");
                }
            }
        }

        Ok(positions)
    }

    /// Read up to `max_count` records, waiting at most `timeout`.
    ///
    /// Messages carrying a broker error are skipped. A message that cannot
    /// be decoded ends the read with an error. With `auto_ack` each message
    /// is committed once the caller asks for the record after it, so the
    /// iterator should be consumed to the end.
    pub fn read(&self, max_count: usize, timeout: Option<Duration>, auto_ack: bool) -> Result<Read<'_, C, S>> {
        let clients = self.clients()?;

        if self.topics.is_empty() && self.assignments.is_empty() {
            debug!("no topics to read");
            return Ok(Read::new(self, Vec::new(), auto_ack));
        }

        debug!(
            max_count,
            timeout_ms = timeout.map(|timeout| timeout.as_millis() as u64),
            assignment = clients
                .consumer
                .assignment()
                .map(|assignment| partitions_summary(&assignment))
                .unwrap_or_default()
        );

        let messages = clients
            .consumer
            .consume(max_count, timeout)
            .map_err(Error::client(Operation::Consume))?;

        debug!(messages = messages.len());

        {
            let mut first_read = self.first_read.lock()?;

            for message in messages.iter().flatten() {
                _ = first_read
                    .entry(message.topic_partition())
                    .or_insert(message.offset);
            }
        }

        Ok(Read::new(self, messages, auto_ack))
    }

    fn decode(&self, message: &Message) -> Result<Record> {
        self.serializer
            .decode(message.payload.as_deref().unwrap_or_default())
            .map_err(|error| Error::Decode {
                message: message.to_string(),
                error,
            })
    }

    fn commit_message(&self, message: &Message) -> Result<()> {
        self.clients()?
            .consumer
            .commit_message(message)
            .map_err(Error::client(Operation::Commit))
    }

    /// Whether every assigned partition has been read up to its high
    /// watermark.
    ///
    /// A partition that has not been read from yet is compared from where
    /// the consumer will start: its explicitly assigned offset, else the
    /// group's committed offset, else the beginning of the partition.
    /// Returns `false` when a position or watermark cannot be fetched.
    pub fn has_reached_end_of_topics(&self) -> Result<bool> {
        let consumer = &self.clients()?.consumer;

        let assignment = match consumer.assignment() {
            Ok(assignment) => assignment,
            Err(error) => {
                warn!(?error, "could not fetch assignment");
                return Ok(false);
            }
        };

        let partitions = assignment
            .iter()
            .map(|assigned| assigned.topic_partition().clone())
            .collect::<Vec<_>>();

        let positions = match consumer.position(&partitions) {
            Ok(positions) => positions,
            Err(error) => {
                warn!(?error, "could not fetch positions");
                return Ok(false);
            }
        };

        for (assigned, position) in assignment.iter().zip(positions) {
            let watermark = match consumer.watermarks(assigned.topic_partition(), Some(QUERY_TIMEOUT)) {
                Ok(watermark) => watermark,
                Err(error) => {
                    warn!(%assigned, ?error, "could not fetch watermark");
                    return Ok(false);
                }
            };

            let current = match (position.offset(), assigned.offset()) {
                (Offset::At(current), _) | (_, Offset::At(current)) => current,
                (_, Offset::Beginning) => watermark.low,
                (_, Offset::End) => watermark.high,

                (_, Offset::Stored | Offset::Invalid) => {
                    match consumer.committed(
                        slice::from_ref(assigned.topic_partition()),
                        Some(QUERY_TIMEOUT),
                    ) {
                        Ok(committed) => committed
                            .first()
                            .and_then(|committed| committed.offset().value())
                            .unwrap_or(watermark.low),

                        Err(error) => {
                            warn!(%assigned, ?error, "could not fetch committed offset");
                            return Ok(false);
                        }
                    }
                }
            };

            if current < watermark.high {
                debug!(%assigned, current, high = watermark.high);
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// Acknowledge every record read so far.
    ///
    /// In a transaction the consumer positions are sent to the transaction
    /// and only committed with it, otherwise they are committed directly.
    pub fn ack(&self, timeout: Option<Duration>) -> Result<()> {
        let clients = self.clients()?;
        let in_transaction = self.in_transaction.lock()?;

        if *in_transaction {
            self.send_offsets(clients, timeout)
        } else {
            info!("ack outside transaction");

            clients
                .consumer
                .commit()
                .map_err(Error::client(Operation::Commit))
        }
    }

    /// Acknowledge within the open transaction, failing outside of one.
    pub fn ack_in_transaction(&self, timeout: Option<Duration>) -> Result<()> {
        let clients = self.clients()?;
        let in_transaction = self.in_transaction.lock()?;

        if *in_transaction {
            self.send_offsets(clients, timeout)
        } else {
            Err(Error::NotInTransaction)
        }
    }

    fn send_offsets(&self, clients: &Clients<C>, timeout: Option<Duration>) -> Result<()> {
        let consumer = &clients.consumer;

        let partitions = consumer
            .assignment()
            .map_err(Error::client(Operation::SendOffsetsToTransaction))?
            .into_iter()
            .map(|assigned| assigned.topic_partition().clone())
            .collect::<Vec<_>>();

        let positions = consumer
            .position(&partitions)
            .map_err(Error::client(Operation::SendOffsetsToTransaction))?
            .into_iter()
            .filter(|position| position.offset().is_concrete())
            .collect::<Vec<_>>();

        let group = consumer.group_metadata().ok_or(Error::NoGroupMetadata)?;

        info!(offsets = partitions_summary(&positions), "ack in transaction");

        clients
            .transactional
            .send_offsets_to_transaction(&positions, &group, timeout)
            .map_err(Error::client(Operation::SendOffsetsToTransaction))
    }

    fn enqueue(&self, producer: &C::Producer, record: &Record, topic: &str) -> Result<Receiver<client::Result<PartitionPosition>>> {
        let payload = self.serializer.encode(record).map_err(Error::Encode)?;
        let (sender, receiver) = mpsc::sync_channel(1);
        let span = record.span();

        producer
            .send(
                OutboundMessage {
                    topic: topic.into(),
                    key: record.partition_key().map(|key| Bytes::copy_from_slice(key.as_bytes())),
                    payload,
                },
                Box::new(move |outcome| {
                    let _entered = span.entered();
                    debug!(?outcome, "delivery");
                    _ = sender.send(outcome);
                }),
            )
            .map_err(Error::client(Operation::Send))?;

        Ok(receiver)
    }

    fn delivered(
        &self,
        record: &Record,
        topic: &str,
        receiver: Receiver<client::Result<PartitionPosition>>,
        timeout: Option<Duration>,
    ) -> Result<PartitionPosition> {
        let outcome = match timeout {
            Some(timeout) => receiver.recv_timeout(timeout).map_err(|error| match error {
                RecvTimeoutError::Timeout => Error::DeliveryTimeout(timeout),
                RecvTimeoutError::Disconnected => Error::DeliveryAbandoned,
            }),

            None => receiver.recv().map_err(|_| Error::DeliveryAbandoned),
        };

        record.span().in_scope(|| {
            outcome
                .and_then(|delivery| delivery.map_err(Error::Delivery))
                .inspect(|position| {
                    info!(qualified_name = record.qualified_name(), %position, "written");
                    RECORDS_WRITTEN.add(1, &[KeyValue::new("topic", topic.to_owned())]);
                })
                .inspect_err(|error| {
                    warn!(qualified_name = record.qualified_name(), topic, ?error);
                    DELIVERY_ERRORS.add(1, &[KeyValue::new("topic", topic.to_owned())]);
                })
        })
    }

    /// Write a record, within the open transaction if there is one.
    ///
    /// Blocks until the record is delivered, or `timeout` has elapsed.
    pub fn write(&self, record: &Record, topic: &str, timeout: Option<Duration>) -> Result<PartitionPosition> {
        let clients = self.clients()?;

        let receiver = {
            let in_transaction = self.in_transaction.lock()?;

            let producer = if *in_transaction {
                &clients.transactional
            } else {
                &clients.immediate
            };

            debug!(qualified_name = record.qualified_name(), topic, in_transaction = *in_transaction);
            self.enqueue(producer, record, topic)?
        };

        self.delivered(record, topic, receiver, timeout)
    }

    /// Write a record immediately, outside of any open transaction.
    pub fn write_now(&self, record: &Record, topic: &str, timeout: Option<Duration>) -> Result<PartitionPosition> {
        let clients = self.clients()?;

        debug!(qualified_name = record.qualified_name(), topic);
        let receiver = self.enqueue(&clients.immediate, record, topic)?;
        self.delivered(record, topic, receiver, timeout)
    }

    pub fn start_transaction(&self) -> Result<()> {
        let clients = self.clients()?;
        let mut in_transaction = self.in_transaction.lock()?;

        if *in_transaction {
            return Err(Error::AlreadyInTransaction);
        }

        clients
            .transactional
            .begin_transaction()
            .map_err(Error::client(Operation::BeginTransaction))?;

        *in_transaction = true;
        info!("transaction started");
        Ok(())
    }

    /// Commit the open transaction.
    ///
    /// The store stays in the transaction when the commit fails, so that it
    /// can be aborted.
    pub fn commit(&self, timeout: Option<Duration>) -> Result<()> {
        let clients = self.clients()?;
        let mut in_transaction = self.in_transaction.lock()?;

        if !*in_transaction {
            return Err(Error::NotInTransaction);
        }

        clients
            .transactional
            .commit_transaction(timeout)
            .map_err(Error::client(Operation::CommitTransaction))?;

        *in_transaction = false;
        info!("transaction committed");
        TRANSACTIONS.add(1, &[KeyValue::new("outcome", "commit")]);
        Ok(())
    }

    /// Abort the open transaction, discarding its writes and acknowledgements.
    pub fn abort(&self, timeout: Option<Duration>) -> Result<()> {
        let clients = self.clients()?;
        let mut in_transaction = self.in_transaction.lock()?;

        if !*in_transaction {
            return Err(Error::NotInTransaction);
        }

        clients
            .transactional
            .abort_transaction(timeout)
            .map_err(Error::client(Operation::AbortTransaction))?;

        *in_transaction = false;
        info!("transaction aborted");
        TRANSACTIONS.add(1, &[KeyValue::new("outcome", "abort")]);

        if let Err(error) = self.rewind(&clients.consumer) {
            warn!(?error, "could not rewind consumer");
        }

        Ok(())
    }

    /// Return the consumer to its committed offsets, so that records whose
    /// acknowledgement was discarded are read again.
    ///
    /// A partition without a committed offset returns to the first offset
    /// read from it.
    fn rewind(&self, consumer: &C::Consumer) -> Result<()> {
        let partitions = consumer
            .assignment()
            .map_err(Error::client(Operation::Seek))?
            .into_iter()
            .map(|assigned| assigned.topic_partition().clone())
            .collect::<Vec<_>>();

        if partitions.is_empty() {
            return Ok(());
        }

        let committed = consumer
            .committed(&partitions, Some(QUERY_TIMEOUT))
            .map_err(Error::client(Operation::Seek))?;

        let positions = {
            let first_read = self.first_read.lock()?;

            committed
                .into_iter()
                .map(|committed| {
                    if committed.offset().is_concrete() {
                        return committed;
                    }

                    match first_read.get(committed.topic_partition()) {
                        Some(offset) => committed.topic_partition().clone().at(Offset::At(*offset)),
                        None => committed,
                    }
                })
                .collect::<Vec<_>>()
        };

        debug!(rewind = partitions_summary(&positions));

        consumer
            .seek(&positions)
            .map_err(Error::client(Operation::Seek))
    }

    /// Run `f` in a transaction, committing when it succeeds and aborting
    /// when it fails.
    pub fn transaction<T, F>(&self, timeout: Option<Duration>, f: F) -> Result<T>
    where
        F: FnOnce(&Self) -> Result<T>,
    {
        self.start_transaction()?;

        match f(self) {
            Ok(value) => self.commit(timeout).map(|()| value),

            Err(error) => {
                if let Err(abort) = self.abort(timeout) {
                    warn!(?abort, ?error, "abort failed");
                }

                Err(error)
            }
        }
    }
}

impl<C, S> RecordStore<C, S>
where
    C: Connector,
{
    pub fn is_initialized(&self) -> bool {
        self.clients.get().is_some()
    }

    pub fn in_transaction(&self) -> bool {
        *self
            .in_transaction
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Close the consumer and stop the poll loop.
    ///
    /// Failures are logged, a closed store cannot be initialized again.
    pub fn close(&self) {
        self.cancellation.cancel();

        let Some(clients) = self.clients.get() else {
            return;
        };

        let Some(poller) = self
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };

        if let Err(error) = clients
            .consumer
            .close()
            .map_err(Error::client(Operation::Close))
        {
            warn!(?error);
        }

        match poller.join() {
            Ok(exit) => info!(?exit, "closed"),
            Err(_) => warn!("poll loop panicked"),
        }
    }
}

impl<C, S> Drop for RecordStore<C, S>
where
    C: Connector,
{
    fn drop(&mut self) {
        self.close();
    }
}

pub struct Builder<C, S> {
    connector: C,
    serializer: S,
    configuration: Configuration,
    topics: Vec<String>,
    assignments: BTreeMap<String, TopicAssignment>,
    rebalance: Rebalance,
}

impl<C, S> Debug for Builder<C, S> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct(stringify!(Builder))
            .field("configuration", &self.configuration)
            .field("topics", &self.topics)
            .field("assignments", &self.assignments)
            .finish()
    }
}

impl<C, S> Builder<C, S>
where
    C: Connector,
    S: Serializer,
{
    /// Topics read through a group managed subscription.
    pub fn subscribe(mut self, topics: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.topics.extend(topics.into_iter().map(Into::into));
        self
    }

    /// A manually assigned topic, only used when there is no subscription.
    pub fn assign(mut self, topic: impl Into<String>, assignment: TopicAssignment) -> Self {
        _ = self.assignments.insert(topic.into(), assignment);
        self
    }

    pub fn rebalance(self, rebalance: Rebalance) -> Self {
        Self { rebalance, ..self }
    }

    pub fn build(self) -> RecordStore<C, S> {
        RecordStore {
            connector: self.connector,
            serializer: self.serializer,
            configuration: self.configuration,
            topics: self.topics,
            assignments: self.assignments,
            rebalance: self.rebalance,
            init: Mutex::new(()),
            clients: OnceLock::new(),
            poller: Mutex::new(None),
            in_transaction: Mutex::new(false),
            first_read: Mutex::new(BTreeMap::new()),
            cancellation: CancellationToken::new(),
        }
    }
}
