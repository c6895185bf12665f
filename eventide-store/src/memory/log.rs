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

//! Partition logs of the in-memory broker.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use crate::{
    client::Message,
    partition::{TopicPartition, Watermark},
};

use super::txn::TxnState;

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as i64)
}

#[derive(Copy, Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub(crate) enum Isolation {
    #[default]
    ReadCommitted,
    ReadUncommitted,
}

/// Transaction of a data entry.
///
/// Open entries refer to the coordinator for their outcome until the
/// transaction ends and the log is resolved.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Txn {
    Open(u64),
    Resolved(TxnState),
}

impl Txn {
    fn state(self, state: &impl Fn(u64) -> TxnState) -> TxnState {
        match self {
            Self::Open(id) => state(id),
            Self::Resolved(resolved) => resolved,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum Entry {
    Data {
        key: Option<Bytes>,
        payload: Option<Bytes>,
        timestamp: i64,
        txn: Option<Txn>,
    },

    /// Control record ending a transaction.
    Marker { timestamp: i64, txn: u64 },
}

impl Entry {
    fn timestamp(&self) -> i64 {
        match self {
            Self::Data { timestamp, .. } | Self::Marker { timestamp, .. } => *timestamp,
        }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct Log {
    entries: Vec<Entry>,
}

enum Visibility {
    Visible,
    Skip,
    Blocked,
}

impl Log {
    pub(crate) fn append(&mut self, entry: Entry) -> i64 {
        self.entries.push(entry);
        self.entries.len() as i64 - 1
    }

    pub(crate) fn high(&self) -> i64 {
        self.entries.len() as i64
    }

    /// Record the outcome of an ended transaction on its entries.
    pub(crate) fn resolve(&mut self, id: u64, outcome: TxnState) {
        for entry in self.entries.iter_mut() {
            match entry {
                Entry::Data {
                    txn: Some(txn), ..
                } if *txn == Txn::Open(id) => *txn = Txn::Resolved(outcome),

                _ => (),
            }
        }
    }

    /// The offset of the first record of a transaction still in progress,
    /// or the high watermark.
    pub(crate) fn last_stable_offset(&self, state: impl Fn(u64) -> TxnState) -> i64 {
        self.entries
            .iter()
            .position(|entry| {
                matches!(entry, Entry::Data { txn: Some(txn), .. } if txn.state(&state) == TxnState::Begin)
            })
            .map_or_else(|| self.high(), |offset| offset as i64)
    }

    pub(crate) fn watermark(&self, isolation: Isolation, state: impl Fn(u64) -> TxnState) -> Watermark {
        Watermark {
            low: 0,
            high: match isolation {
                Isolation::ReadCommitted => self.last_stable_offset(state),
                Isolation::ReadUncommitted => self.high(),
            },
        }
    }

    pub(crate) fn offset_for_time(&self, timestamp: i64) -> Option<i64> {
        self.entries
            .iter()
            .position(|entry| matches!(entry, Entry::Data { .. }) && entry.timestamp() >= timestamp)
            .map(|offset| offset as i64)
    }

    fn visibility(entry: &Entry, isolation: Isolation, state: &impl Fn(u64) -> TxnState) -> Visibility {
        match (entry, isolation) {
            (Entry::Marker { .. }, _) => Visibility::Skip,
            (Entry::Data { txn: None, .. }, _) | (_, Isolation::ReadUncommitted) => Visibility::Visible,
            (Entry::Data { txn: Some(txn), .. }, Isolation::ReadCommitted) => match txn.state(state) {
                TxnState::Committed => Visibility::Visible,
                TxnState::Aborted => Visibility::Skip,
                TxnState::Begin => Visibility::Blocked,
            },
        }
    }

    /// Up to `max` visible messages from `from`, with the offset to fetch
    /// from next.
    ///
    /// Control records and aborted records following the last message are
    /// stepped over, so that a consumer that has read everything visible is
    /// positioned at the end of the log.
    pub(crate) fn fetch(
        &self,
        topic_partition: &TopicPartition,
        from: i64,
        max: usize,
        isolation: Isolation,
        state: impl Fn(u64) -> TxnState,
    ) -> (Vec<Message>, i64) {
        let mut messages = Vec::new();
        let mut next = from.max(0);

        while let Some(entry) = self.entries.get(next as usize) {
            match Self::visibility(entry, isolation, &state) {
                Visibility::Blocked => break,
                Visibility::Skip => next += 1,

                Visibility::Visible if messages.len() < max => {
                    if let Entry::Data {
                        key,
                        payload,
                        timestamp,
                        ..
                    } = entry
                    {
                        messages.push(Message {
                            topic: topic_partition.topic().into(),
                            partition: topic_partition.partition(),
                            offset: next,
                            timestamp: Some(*timestamp),
                            key: key.clone(),
                            payload: payload.clone(),
                        });
                    }

                    next += 1;
                }

                Visibility::Visible => break,
            }
        }

        (messages, next)
    }
}
