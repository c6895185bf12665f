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

//! Consumer groups of the in-memory broker.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::partition::TopicPartition;

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct Group {
    generation: i32,
    members: BTreeMap<String, BTreeSet<String>>,
    committed: BTreeMap<TopicPartition, i64>,
}

impl Group {
    pub(crate) fn generation(&self) -> i32 {
        self.generation
    }

    pub(crate) fn join(&mut self, member_id: &str, topics: &[String]) -> i32 {
        _ = self
            .members
            .insert(member_id.to_owned(), topics.iter().cloned().collect());
        self.generation += 1;

        debug!(member_id, generation = self.generation);
        self.generation
    }

    pub(crate) fn leave(&mut self, member_id: &str) {
        if self.members.remove(member_id).is_some() {
            self.generation += 1;
            debug!(member_id, generation = self.generation);
        }
    }

    /// Range assignment: per topic, each subscribed member in member id
    /// order takes a contiguous run of partitions, earlier members taking
    /// one extra until the remainder is used up.
    pub(crate) fn assignment(
        &self,
        member_id: &str,
        partitions: impl Fn(&str) -> Option<i32>,
    ) -> BTreeSet<TopicPartition> {
        let Some(topics) = self.members.get(member_id) else {
            return BTreeSet::new();
        };

        topics
            .iter()
            .filter_map(|topic| partitions(topic).map(|count| (topic, count)))
            .flat_map(|(topic, count)| {
                let members = self
                    .members
                    .iter()
                    .filter(|(_, subscription)| subscription.contains(topic))
                    .map(|(member_id, _)| member_id)
                    .collect::<Vec<_>>();

                let index = members
                    .iter()
                    .position(|candidate| candidate.as_str() == member_id)
                    .unwrap_or_default() as i32;

                let (allocation, remainder) = {
                    let members = members.len().max(1) as i32;
                    (count / members, count % members)
                };

                let start = index * allocation + index.min(remainder);
                let end = start + allocation + i32::from(index < remainder);

                (start..end).map(move |partition| TopicPartition::new(topic.as_str(), partition))
            })
            .collect()
    }

    pub(crate) fn commit(&mut self, offsets: impl IntoIterator<Item = (TopicPartition, i64)>) {
        for (topic_partition, offset) in offsets {
            debug!(%topic_partition, offset);
            _ = self.committed.insert(topic_partition, offset);
        }
    }

    pub(crate) fn committed(&self, topic_partition: &TopicPartition) -> Option<i64> {
        self.committed.get(topic_partition).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partitions(topic: &str) -> Option<i32> {
        match topic {
            "orders" => Some(5),
            "audit" => Some(1),
            _ => None,
        }
    }

    fn assigned(group: &Group, member_id: &str) -> Vec<String> {
        group
            .assignment(member_id, partitions)
            .iter()
            .map(ToString::to_string)
            .collect()
    }

    #[test]
    fn range() {
        let mut group = Group::default();
        let topics = ["orders".to_owned(), "audit".to_owned()];

        assert_eq!(1, group.join("a", &topics));
        assert_eq!(vec!["audit[0]", "orders[0]", "orders[1]", "orders[2]", "orders[3]", "orders[4]"], assigned(&group, "a"));

        assert_eq!(2, group.join("b", &topics));
        assert_eq!(vec!["audit[0]", "orders[0]", "orders[1]", "orders[2]"], assigned(&group, "a"));
        assert_eq!(vec!["orders[3]", "orders[4]"], assigned(&group, "b"));

        group.leave("a");
        assert_eq!(3, group.generation());
        assert_eq!(vec!["audit[0]", "orders[0]", "orders[1]", "orders[2]", "orders[3]", "orders[4]"], assigned(&group, "b"));
        assert!(assigned(&group, "a").is_empty());
    }

    #[test]
    fn unknown_topic_is_not_assigned() {
        let mut group = Group::default();
        _ = group.join("a", &["missing".to_owned()]);

        assert!(assigned(&group, "a").is_empty());
    }

    #[test]
    fn committed() {
        let mut group = Group::default();
        let tp = TopicPartition::new("orders", 0);

        assert_eq!(None, group.committed(&tp));
        group.commit([(tp.clone(), 3)]);
        assert_eq!(Some(3), group.committed(&tp));
    }
}
