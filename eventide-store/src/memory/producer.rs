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
    cmp,
    collections::VecDeque,
    fmt::{self, Debug, Formatter},
    sync::{Condvar, Mutex, MutexGuard, PoisonError, atomic::AtomicUsize},
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, instrument};

use crate::{
    client::{DeliveryCallback, Error, OutboundMessage, Producer, Result},
    partition::{Offset, PartitionPosition, TopicPartition},
};

use super::{Broker, Cluster, Entry, GroupMetadata, Txn, now_ms, partition_for};

const RETRY_INTERVAL: Duration = Duration::from_millis(10);

struct Pending {
    message: OutboundMessage,
    delivery: DeliveryCallback,
    txn: Option<u64>,
}

impl Debug for Pending {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct(stringify!(Pending))
            .field("message", &self.message)
            .field("txn", &self.txn)
            .finish()
    }
}

type Outcomes = Vec<(DeliveryCallback, Result<PartitionPosition>)>;

fn deliver(outcomes: Outcomes) {
    for (delivery, outcome) in outcomes {
        delivery(outcome);
    }
}

/// A producer of the in-memory broker.
///
/// Sends are queued and only appended to the log when the producer is
/// polled or flushed.
#[derive(Debug)]
pub struct MemoryProducer {
    broker: Broker,
    producer_id: i64,
    transactional_id: Option<String>,
    transaction_timeout: Duration,
    epoch: Mutex<Option<i16>>,
    queue: Mutex<VecDeque<Pending>>,
    queued: Condvar,
    round_robin: AtomicUsize,
}

impl MemoryProducer {
    pub(super) fn new(
        broker: Broker,
        producer_id: i64,
        transactional_id: Option<String>,
        transaction_timeout: Duration,
    ) -> Self {
        Self {
            broker,
            producer_id,
            transactional_id,
            transaction_timeout,
            epoch: Mutex::new(None),
            queue: Mutex::new(VecDeque::new()),
            queued: Condvar::new(),
            round_robin: AtomicUsize::new(0),
        }
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<Pending>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transactional_id(&self) -> Result<&str> {
        self.transactional_id
            .as_deref()
            .ok_or_else(|| Error::State("transactional.id is not configured".into()))
    }

    /// The transactional id with the epoch assigned by the coordinator.
    fn identity(&self) -> Result<(&str, i16)> {
        let transactional_id = self.transactional_id()?;

        self.epoch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .map(|epoch| (transactional_id, epoch))
            .ok_or_else(|| Error::State(format!("{transactional_id}: transactions not initialized")))
    }

    fn append(&self, cluster: &mut Cluster, pending: &Pending) -> Result<PartitionPosition> {
        let topic = pending.message.topic.as_str();
        let partitions = cluster.partitions_for_produce(topic)?;

        let topic_partition = TopicPartition::new(
            topic,
            partition_for(pending.message.key.as_deref(), partitions, &self.round_robin),
        );

        if let Some(id) = pending.txn {
            let (transactional_id, epoch) = self.identity()?;
            let detail = cluster
                .coordinator
                .current(transactional_id, self.producer_id, epoch)?;

            if detail.id != id {
                return Err(Error::State(format!(
                    "{transactional_id}: transaction {id} is no longer in progress"
                )));
            }

            _ = detail.produces.insert(topic_partition.clone());
        }

        let offset = cluster.log_mut(&topic_partition)?.append(Entry::Data {
            key: pending.message.key.clone(),
            payload: Some(pending.message.payload.clone()),
            timestamp: now_ms(),
            txn: pending.txn.map(Txn::Open),
        });

        Ok(topic_partition.at(Offset::At(offset)))
    }

    /// Append every queued send, waiting up to `wait` for one to arrive.
    fn serve(&self, wait: Duration) -> Result<()> {
        let outcomes = {
            let mut queue = self.queue();

            if queue.is_empty() && !wait.is_zero() {
                queue = self
                    .queued
                    .wait_timeout(queue, wait)
                    .map(|(queue, _)| queue)
                    .unwrap_or_else(|poison| poison.into_inner().0);
            }

            if queue.is_empty() {
                return Ok(());
            }

            let mut cluster = self.broker.cluster();
            cluster.ensure_connected()?;
            cluster.expire_transactions();

            queue
                .drain(..)
                .map(|pending| {
                    let outcome = self
                        .append(&mut cluster, &pending)
                        .inspect(|position| debug!(%position));

                    (pending.delivery, outcome)
                })
                .collect::<Outcomes>()
        };

        self.broker.notify();
        deliver(outcomes);
        Ok(())
    }

    /// Fail every queued send of a transaction that is being aborted.
    fn purge(&self) {
        let outcomes = self
            .queue()
            .drain(..)
            .map(|pending| {
                (
                    pending.delivery,
                    Err(Error::State("transaction aborted before delivery".into())),
                )
            })
            .collect::<Outcomes>();

        deliver(outcomes);
    }
}

impl Producer for MemoryProducer {
    type GroupMetadata = GroupMetadata;

    fn send(&self, message: OutboundMessage, delivery: DeliveryCallback) -> Result<()> {
        let txn = if self.transactional_id.is_some() {
            let (transactional_id, epoch) = self.identity()?;

            let mut cluster = self.broker.cluster();
            cluster.expire_transactions();

            cluster
                .coordinator
                .current(transactional_id, self.producer_id, epoch)
                .map(|detail| Some(detail.id))?
        } else {
            None
        };

        self.queue().push_back(Pending {
            message,
            delivery,
            txn,
        });

        self.queued.notify_all();
        Ok(())
    }

    fn poll(&self, timeout: Duration) -> Result<()> {
        self.broker.polled();
        self.serve(timeout)
    }

    fn flush(&self, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);

        loop {
            match self.serve(Duration::ZERO) {
                Err(Error::Transport(_)) => {
                    let pause = match deadline {
                        Some(deadline) => {
                            let remaining = deadline.saturating_duration_since(Instant::now());

                            if remaining.is_zero() {
                                return Err(Error::Timeout);
                            }

                            cmp::min(remaining, RETRY_INTERVAL)
                        }

                        None => RETRY_INTERVAL,
                    };

                    thread::sleep(pause);
                }

                otherwise => return otherwise,
            }
        }
    }

    #[instrument(skip(self), fields(producer_id = self.producer_id))]
    fn init_transactions(&self, _timeout: Option<Duration>) -> Result<()> {
        let transactional_id = self.transactional_id()?;

        let epoch = {
            let mut cluster = self.broker.cluster();
            cluster.ensure_connected()?;

            let (epoch, aborted) =
                cluster
                    .coordinator
                    .init(transactional_id, self.producer_id, self.transaction_timeout);

            if let Some(detail) = aborted {
                cluster.txn_end(detail, false);
            }

            epoch
        };

        self.broker.notify();
        *self.epoch.lock().unwrap_or_else(PoisonError::into_inner) = Some(epoch);
        Ok(())
    }

    fn begin_transaction(&self) -> Result<()> {
        let (transactional_id, epoch) = self.identity()?;

        let mut cluster = self.broker.cluster();
        cluster.expire_transactions();

        cluster
            .coordinator
            .begin(transactional_id, self.producer_id, epoch)
            .map(|id| debug!(transactional_id, id))
    }

    fn send_offsets_to_transaction(
        &self,
        offsets: &[PartitionPosition],
        group: &Self::GroupMetadata,
        _timeout: Option<Duration>,
    ) -> Result<()> {
        let (transactional_id, epoch) = self.identity()?;

        let mut cluster = self.broker.cluster();
        cluster.ensure_connected()?;
        cluster.expire_transactions();

        let detail = cluster
            .coordinator
            .current(transactional_id, self.producer_id, epoch)?;

        let pending = detail.offsets.entry(group.group_id.clone()).or_default();

        for position in offsets {
            if let Some(offset) = position.offset().value() {
                debug!(%position);
                _ = pending.insert(position.topic_partition().clone(), offset);
            }
        }

        Ok(())
    }

    fn commit_transaction(&self, timeout: Option<Duration>) -> Result<()> {
        let (transactional_id, epoch) = self.identity()?;
        self.flush(timeout)?;

        {
            let mut cluster = self.broker.cluster();
            cluster.ensure_connected()?;
            cluster.expire_transactions();

            if let Some(detail) =
                cluster
                    .coordinator
                    .end(transactional_id, self.producer_id, epoch, true)?
            {
                cluster.txn_end(detail, true);
            }
        }

        self.broker.notify();
        Ok(())
    }

    fn abort_transaction(&self, _timeout: Option<Duration>) -> Result<()> {
        let (transactional_id, epoch) = self.identity()?;
        self.purge();

        {
            let mut cluster = self.broker.cluster();
            cluster.ensure_connected()?;

            if let Some(detail) =
                cluster
                    .coordinator
                    .end(transactional_id, self.producer_id, epoch, false)?
            {
                cluster.txn_end(detail, false);
            }
        }

        self.broker.notify();
        Ok(())
    }
}
