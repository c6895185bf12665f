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
    collections::{BTreeMap, BTreeSet},
    sync::{Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use tracing::debug;

use crate::{
    client::{Consumer, Error, Message, Rebalance, Result},
    config::GROUP_ID,
    partition::{ClusterMetadata, Offset, PartitionPosition, TopicPartition, Watermark},
};

use super::{Broker, Cluster, GroupMetadata, Isolation, Log, Reset};

#[derive(Clone, Debug)]
struct Subscription {
    topics: Vec<String>,
    rebalance: Rebalance,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
struct Slot {
    assigned: Offset,
    position: Option<i64>,
}

#[derive(Debug, Default)]
struct State {
    subscription: Option<Subscription>,
    partitions: BTreeMap<TopicPartition, Slot>,
    missing: BTreeSet<String>,
    closed: bool,
}

struct Reassignment {
    rebalance: Rebalance,
    revoked: Vec<PartitionPosition>,
    assigned: Vec<PartitionPosition>,
}

impl Reassignment {
    fn notify(self) {
        if !self.revoked.is_empty() {
            (self.rebalance.on_revoke)(&self.revoked);
        }

        (self.rebalance.on_assign)(&self.assigned);
    }
}

/// A consumer of the in-memory broker.
#[derive(Debug)]
pub struct MemoryConsumer {
    broker: Broker,
    member_id: String,
    group_id: Option<String>,
    isolation: Isolation,
    reset: Reset,
    state: Mutex<State>,
}

impl MemoryConsumer {
    pub(super) fn new(
        broker: Broker,
        member_id: String,
        group_id: Option<String>,
        isolation: Isolation,
        reset: Reset,
    ) -> Self {
        Self {
            broker,
            member_id,
            group_id,
            isolation,
            reset,
            state: Mutex::new(State::default()),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, State>> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if state.closed {
            Err(Error::State(format!("{}: consumer is closed", self.member_id)))
        } else {
            Ok(state)
        }
    }

    fn group_id(&self) -> Result<&str> {
        self.group_id.as_deref().ok_or_else(|| Error::Config {
            key: GROUP_ID.into(),
            message: "required for group operations".into(),
        })
    }

    fn leave(&self, cluster: &mut Cluster) {
        if let Some(group) = self
            .group_id
            .as_deref()
            .and_then(|group_id| cluster.groups.get_mut(group_id))
        {
            group.leave(&self.member_id);
        }
    }

    /// Follow the group assignment of a subscription, which changes as
    /// members join and leave and as subscribed topics are created.
    fn reassign(&self, state: &mut State, cluster: &Cluster) -> Option<Reassignment> {
        let rebalance = state.subscription.as_ref()?.rebalance.clone();
        let group = cluster.groups.get(self.group_id.as_deref()?)?;

        let desired = group.assignment(&self.member_id, |topic| cluster.partition_count(topic));

        if desired.iter().eq(state.partitions.keys()) {
            return None;
        }

        let revoked = state
            .partitions
            .iter()
            .map(|(topic_partition, slot)| {
                topic_partition
                    .clone()
                    .at(slot.position.map_or(Offset::Invalid, Offset::At))
            })
            .collect();

        state.partitions = desired
            .into_iter()
            .map(|topic_partition| (topic_partition, Slot::default()))
            .collect();

        let assigned = state
            .partitions
            .keys()
            .map(|topic_partition| topic_partition.clone().at(Offset::Invalid))
            .collect();

        debug!(member_id = self.member_id, generation = group.generation());

        Some(Reassignment {
            rebalance,
            revoked,
            assigned,
        })
    }

    /// Where a partition is first read from.
    fn start(&self, assigned: Offset, topic_partition: &TopicPartition, log: &Log, cluster: &Cluster) -> i64 {
        let end = || {
            log.watermark(self.isolation, |id| cluster.txn_state(id))
                .high
        };

        match assigned {
            Offset::At(offset) => offset,
            Offset::Beginning => 0,
            Offset::End => end(),

            Offset::Stored | Offset::Invalid => self
                .group_id
                .as_deref()
                .and_then(|group_id| cluster.groups.get(group_id))
                .and_then(|group| group.committed(topic_partition))
                .unwrap_or_else(|| match self.reset {
                    Reset::Earliest => 0,
                    Reset::Latest => end(),
                }),
        }
    }

    fn fetch(&self, state: &mut State, cluster: &Cluster, max: usize, messages: &mut Vec<Result<Message>>) {
        let State {
            subscription,
            partitions,
            missing,
            ..
        } = state;

        if let Some(subscription) = subscription {
            for topic in &subscription.topics {
                if cluster.partition_count(topic).is_some() {
                    _ = missing.remove(topic);
                } else if missing.insert(topic.clone()) {
                    messages.push(Err(Error::UnknownTopicOrPartition(TopicPartition::new(
                        topic.as_str(),
                        -1,
                    ))));
                }
            }
        }

        for (topic_partition, slot) in partitions.iter_mut() {
            if messages.len() >= max {
                break;
            }

            let Ok(log) = cluster.log(topic_partition) else {
                if missing.insert(topic_partition.topic().to_owned()) {
                    messages.push(Err(Error::UnknownTopicOrPartition(topic_partition.clone())));
                }

                continue;
            };

            let from = slot
                .position
                .unwrap_or_else(|| self.start(slot.assigned, topic_partition, log, cluster));

            let (fetched, next) = log.fetch(
                topic_partition,
                from,
                max - messages.len(),
                self.isolation,
                |id| cluster.txn_state(id),
            );

            slot.position = Some(next);
            messages.extend(fetched.into_iter().map(Ok));
        }
    }
}

impl Consumer for MemoryConsumer {
    type GroupMetadata = GroupMetadata;

    fn subscribe(&self, topics: &[String], rebalance: Rebalance) -> Result<()> {
        let group_id = self.group_id()?;
        let mut state = self.state()?;

        {
            let mut cluster = self.broker.cluster();
            cluster.ensure_connected()?;

            let generation = cluster
                .groups
                .entry(group_id.to_owned())
                .or_default()
                .join(&self.member_id, topics);

            debug!(group_id, ?topics, generation);
        }

        state.subscription = Some(Subscription {
            topics: topics.to_vec(),
            rebalance,
        });

        self.broker.notify();
        Ok(())
    }

    fn assign(&self, positions: &[PartitionPosition]) -> Result<()> {
        let mut state = self.state()?;

        if state.subscription.take().is_some() {
            self.leave(&mut self.broker.cluster());
            self.broker.notify();
        }

        state.missing.clear();
        state.partitions = positions
            .iter()
            .map(|position| {
                (
                    position.topic_partition().clone(),
                    Slot {
                        assigned: position.offset(),
                        position: None,
                    },
                )
            })
            .collect();

        Ok(())
    }

    fn assignment(&self) -> Result<Vec<PartitionPosition>> {
        self.state().map(|state| {
            state
                .partitions
                .iter()
                .map(|(topic_partition, slot)| topic_partition.clone().at(slot.assigned))
                .collect()
        })
    }

    fn consume(&self, max: usize, timeout: Option<Duration>) -> Result<Vec<Result<Message>>> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = self.state()?;
        let mut messages = Vec::new();
        let mut cluster = self.broker.cluster();

        loop {
            if let Err(error) = cluster.ensure_connected() {
                return if messages.is_empty() {
                    Err(error)
                } else {
                    Ok(messages)
                };
            }

            cluster.expire_transactions();

            if let Some(reassignment) = self.reassign(&mut state, &cluster) {
                drop(cluster);
                reassignment.notify();
                cluster = self.broker.cluster();
                continue;
            }

            while messages.len() < max {
                let Some(fault) = cluster.faults.pop_front() else {
                    break;
                };

                messages.push(Err(fault));
            }

            self.fetch(&mut state, &cluster, max, &mut messages);

            if messages.len() >= max {
                break;
            }

            let remaining = deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()));

            if remaining.is_some_and(|remaining| remaining.is_zero()) {
                break;
            }

            cluster = self.broker.wait(cluster, remaining);
        }

        Ok(messages)
    }

    fn commit_message(&self, message: &Message) -> Result<()> {
        let group_id = self.group_id()?;
        let mut cluster = self.broker.cluster();
        cluster.ensure_connected()?;

        cluster
            .groups
            .entry(group_id.to_owned())
            .or_default()
            .commit([(message.topic_partition(), message.offset + 1)]);

        Ok(())
    }

    fn commit(&self) -> Result<()> {
        let group_id = self.group_id()?;
        let state = self.state()?;

        let mut cluster = self.broker.cluster();
        cluster.ensure_connected()?;

        cluster
            .groups
            .entry(group_id.to_owned())
            .or_default()
            .commit(state.partitions.iter().filter_map(|(topic_partition, slot)| {
                slot.position
                    .map(|position| (topic_partition.clone(), position))
            }));

        Ok(())
    }

    fn position(&self, partitions: &[TopicPartition]) -> Result<Vec<PartitionPosition>> {
        let state = self.state()?;

        Ok(partitions
            .iter()
            .map(|topic_partition| {
                topic_partition.clone().at(
                    state
                        .partitions
                        .get(topic_partition)
                        .and_then(|slot| slot.position)
                        .map_or(Offset::Invalid, Offset::At),
                )
            })
            .collect())
    }

    fn seek(&self, positions: &[PartitionPosition]) -> Result<()> {
        let mut state = self.state()?;

        for position in positions {
            match state.partitions.get_mut(position.topic_partition()) {
                Some(slot) => {
                    debug!(%position, "seek");
                    slot.position = position.offset().value();
                }

                None => {
                    return Err(Error::State(format!("{position} is not assigned")));
                }
            }
        }

        self.broker.notify();
        Ok(())
    }

    fn committed(
        &self,
        partitions: &[TopicPartition],
        _timeout: Option<Duration>,
    ) -> Result<Vec<PartitionPosition>> {
        let group_id = self.group_id()?;
        let cluster = self.broker.cluster();
        cluster.ensure_connected()?;

        let group = cluster.groups.get(group_id);

        Ok(partitions
            .iter()
            .map(|topic_partition| {
                topic_partition.clone().at(
                    group
                        .and_then(|group| group.committed(topic_partition))
                        .map_or(Offset::Invalid, Offset::At),
                )
            })
            .collect())
    }

    fn watermarks(&self, partition: &TopicPartition, _timeout: Option<Duration>) -> Result<Watermark> {
        let cluster = self.broker.cluster();
        cluster.ensure_connected()?;
        cluster.watermark(partition, self.isolation)
    }

    fn offset_for_time(
        &self,
        partition: &TopicPartition,
        timestamp_ms: i64,
        _timeout: Option<Duration>,
    ) -> Result<PartitionPosition> {
        let cluster = self.broker.cluster();
        cluster.ensure_connected()?;

        cluster.log(partition).map(|log| {
            partition.clone().at(
                log.offset_for_time(timestamp_ms)
                    .map_or(Offset::End, Offset::At),
            )
        })
    }

    fn metadata(&self, _timeout: Option<Duration>) -> Result<ClusterMetadata> {
        let cluster = self.broker.cluster();
        cluster.ensure_connected()?;
        Ok(cluster.metadata())
    }

    fn group_metadata(&self) -> Option<Self::GroupMetadata> {
        let group_id = self.group_id.as_deref()?;

        let generation = self
            .broker
            .cluster()
            .groups
            .get(group_id)
            .map_or(-1, |group| group.generation());

        Some(GroupMetadata {
            group_id: group_id.to_owned(),
            member_id: self.member_id.clone(),
            generation,
        })
    }

    fn close(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if state.closed {
            return Ok(());
        }

        if state.subscription.take().is_some() {
            self.leave(&mut self.broker.cluster());
        }

        state.partitions.clear();
        state.closed = true;

        debug!(member_id = self.member_id, "closed");
        self.broker.notify();
        Ok(())
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        _ = self.close();
    }
}
