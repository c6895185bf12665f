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

//! Transaction coordinator of the in-memory broker.

use std::{
    collections::{BTreeMap, BTreeSet},
    time::{Duration, Instant},
};

use tracing::{debug, warn};

use crate::{
    client::{Error, Result},
    partition::TopicPartition,
};

/// Transaction State
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub(crate) enum TxnState {
    Begin,
    Committed,
    Aborted,
}

/// Transaction detail
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct TxnDetail {
    pub(crate) id: u64,
    pub(crate) started_at: Instant,
    pub(crate) produces: BTreeSet<TopicPartition>,
    pub(crate) offsets: BTreeMap<String, BTreeMap<TopicPartition, i64>>,
}

#[derive(Clone, Debug)]
struct Txn {
    producer: i64,
    epoch: i16,
    timeout: Duration,
    current: Option<TxnDetail>,
    expired: bool,
}

#[derive(Debug, Default)]
pub(crate) struct Coordinator {
    transactions: BTreeMap<String, Txn>,
    states: BTreeMap<u64, TxnState>,
    next_id: u64,
}

fn fenced<'a>(
    transactions: &'a mut BTreeMap<String, Txn>,
    transactional_id: &str,
    producer: i64,
    epoch: i16,
) -> Result<&'a mut Txn> {
    let txn = transactions
        .get_mut(transactional_id)
        .ok_or_else(|| Error::State(format!("transactional id {transactional_id} is not initialized")))?;

    if txn.producer != producer || txn.epoch != epoch {
        Err(Error::Fenced(format!(
            "{transactional_id}: producer {producer}/{epoch} fenced by {}/{}",
            txn.producer, txn.epoch
        )))
    } else {
        Ok(txn)
    }
}

impl Coordinator {
    /// Register a producer for a transactional id, bumping the epoch.
    ///
    /// A transaction left open by a previous producer is aborted and
    /// returned so its partitions can be marked.
    pub(crate) fn init(
        &mut self,
        transactional_id: &str,
        producer: i64,
        timeout: Duration,
    ) -> (i16, Option<TxnDetail>) {
        let txn = self
            .transactions
            .entry(transactional_id.to_owned())
            .and_modify(|txn| {
                txn.producer = producer;
                txn.epoch = txn.epoch.saturating_add(1);
                txn.timeout = timeout;
                txn.expired = false;
            })
            .or_insert_with(|| Txn {
                producer,
                epoch: 0,
                timeout,
                current: None,
                expired: false,
            });

        let epoch = txn.epoch;
        let aborted = txn.current.take();

        if let Some(ref detail) = aborted {
            warn!(transactional_id, id = detail.id, "aborting transaction of fenced producer");
            _ = self.states.insert(detail.id, TxnState::Aborted);
        }

        debug!(transactional_id, producer, epoch);
        (epoch, aborted)
    }

    pub(crate) fn begin(&mut self, transactional_id: &str, producer: i64, epoch: i16) -> Result<u64> {
        let id = self.next_id;
        let txn = fenced(&mut self.transactions, transactional_id, producer, epoch)?;

        if txn.current.is_some() {
            return Err(Error::State(format!(
                "{transactional_id}: transaction already in progress"
            )));
        }

        txn.expired = false;
        txn.current = Some(TxnDetail {
            id,
            started_at: Instant::now(),
            produces: BTreeSet::new(),
            offsets: BTreeMap::new(),
        });

        self.next_id += 1;
        _ = self.states.insert(id, TxnState::Begin);

        Ok(id)
    }

    /// The transaction in progress for this producer.
    pub(crate) fn current(
        &mut self,
        transactional_id: &str,
        producer: i64,
        epoch: i16,
    ) -> Result<&mut TxnDetail> {
        let txn = fenced(&mut self.transactions, transactional_id, producer, epoch)?;

        if txn.expired {
            return Err(Error::State(format!(
                "{transactional_id}: transaction timed out and was aborted"
            )));
        }

        txn.current
            .as_mut()
            .ok_or_else(|| Error::State(format!("{transactional_id}: no transaction in progress")))
    }

    /// End the transaction in progress, returning it so the partitions it
    /// produced to can be marked.
    pub(crate) fn end(
        &mut self,
        transactional_id: &str,
        producer: i64,
        epoch: i16,
        committed: bool,
    ) -> Result<Option<TxnDetail>> {
        let txn = fenced(&mut self.transactions, transactional_id, producer, epoch)?;

        match txn.current.take() {
            Some(detail) => {
                txn.expired = false;

                let state = if committed {
                    TxnState::Committed
                } else {
                    TxnState::Aborted
                };

                debug!(transactional_id, id = detail.id, ?state);
                _ = self.states.insert(detail.id, state);
                Ok(Some(detail))
            }

            None if txn.expired && committed => Err(Error::State(format!(
                "{transactional_id}: transaction timed out and was aborted"
            ))),

            None if txn.expired => {
                txn.expired = false;
                Ok(None)
            }

            None => Err(Error::State(format!(
                "{transactional_id}: no transaction in progress"
            ))),
        }
    }

    /// Abort every transaction that has been open for longer than its
    /// timeout.
    pub(crate) fn expire(&mut self, now: Instant) -> Vec<TxnDetail> {
        let mut expired = Vec::new();

        for (transactional_id, txn) in self.transactions.iter_mut() {
            if txn
                .current
                .as_ref()
                .is_some_and(|detail| now.duration_since(detail.started_at) >= txn.timeout)
            {
                if let Some(detail) = txn.current.take() {
                    warn!(transactional_id, id = detail.id, timeout_ms = txn.timeout.as_millis() as u64, "transaction timed out");
                    _ = self.states.insert(detail.id, TxnState::Aborted);
                    txn.expired = true;
                    expired.push(detail);
                }
            }
        }

        expired
    }

    /// The state of a transaction that has not been resolved in the logs.
    pub(crate) fn state(&self, id: u64) -> TxnState {
        self.states.get(&id).copied().unwrap_or(TxnState::Aborted)
    }

    /// Stop tracking a transaction once its outcome is recorded in the logs.
    pub(crate) fn forget(&mut self, id: u64) {
        _ = self.states.remove(&id);
    }

    #[cfg(test)]
    pub(crate) fn tracked(&self) -> usize {
        self.states.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(60);

    #[test]
    fn commit() -> Result<()> {
        let mut coordinator = Coordinator::default();
        let (epoch, aborted) = coordinator.init("orders-1", 1, TIMEOUT);
        assert_eq!(0, epoch);
        assert!(aborted.is_none());

        let id = coordinator.begin("orders-1", 1, epoch)?;
        assert_eq!(TxnState::Begin, coordinator.state(id));

        _ = coordinator
            .current("orders-1", 1, epoch)?
            .produces
            .insert(TopicPartition::new("orders", 0));

        let detail = coordinator.end("orders-1", 1, epoch, true)?;
        assert_eq!(Some(1), detail.map(|detail| detail.produces.len()));
        assert_eq!(TxnState::Committed, coordinator.state(id));

        assert!(matches!(
            coordinator.end("orders-1", 1, epoch, true),
            Err(Error::State(_))
        ));

        Ok(())
    }

    #[test]
    fn begin_twice() -> Result<()> {
        let mut coordinator = Coordinator::default();
        let (epoch, _) = coordinator.init("orders-1", 1, TIMEOUT);

        _ = coordinator.begin("orders-1", 1, epoch)?;
        assert!(matches!(
            coordinator.begin("orders-1", 1, epoch),
            Err(Error::State(_))
        ));

        Ok(())
    }

    #[test]
    fn zombie_is_fenced() -> Result<()> {
        let mut coordinator = Coordinator::default();

        let (zombie, _) = coordinator.init("orders-1", 1, TIMEOUT);
        let id = coordinator.begin("orders-1", 1, zombie)?;

        let (epoch, aborted) = coordinator.init("orders-1", 2, TIMEOUT);
        assert_eq!(1, epoch);
        assert_eq!(Some(id), aborted.map(|detail| detail.id));
        assert_eq!(TxnState::Aborted, coordinator.state(id));

        assert!(matches!(
            coordinator.begin("orders-1", 1, zombie),
            Err(Error::Fenced(_))
        ));

        assert!(matches!(
            coordinator.end("orders-1", 1, zombie, true),
            Err(Error::Fenced(_))
        ));

        Ok(())
    }

    #[test]
    fn timeout_aborts() -> Result<()> {
        let mut coordinator = Coordinator::default();
        let (epoch, _) = coordinator.init("orders-1", 1, Duration::from_millis(10));
        let id = coordinator.begin("orders-1", 1, epoch)?;

        let expired = coordinator.expire(Instant::now() + Duration::from_secs(1));
        assert_eq!(vec![id], expired.iter().map(|detail| detail.id).collect::<Vec<_>>());
        assert_eq!(TxnState::Aborted, coordinator.state(id));

        assert!(matches!(
            coordinator.end("orders-1", 1, epoch, true),
            Err(Error::State(_))
        ));

        assert!(matches!(
            coordinator.end("orders-1", 1, epoch, true),
            Err(Error::State(_))
        ));

        assert_eq!(None, coordinator.end("orders-1", 1, epoch, false)?);

        assert!(matches!(
            coordinator.end("orders-1", 1, epoch, false),
            Err(Error::State(_))
        ));

        _ = coordinator.begin("orders-1", 1, epoch)?;
        Ok(())
    }

    #[test]
    fn forgotten_transactions_are_not_tracked() -> Result<()> {
        let mut coordinator = Coordinator::default();
        let (epoch, _) = coordinator.init("orders-1", 1, TIMEOUT);

        for _ in 0..3 {
            let id = coordinator.begin("orders-1", 1, epoch)?;
            _ = coordinator.end("orders-1", 1, epoch, true)?;
            coordinator.forget(id);
        }

        assert_eq!(0, coordinator.tracked());
        Ok(())
    }
}
