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

//! Topic, partition and offset value types.

use std::{
    collections::BTreeMap,
    fmt::{self, Display, Formatter},
    time::SystemTime,
};

/// Topic Partition
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TopicPartition {
    topic: String,
    partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        let topic = topic.into();
        Self { topic, partition }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn at(self, offset: Offset) -> PartitionPosition {
        PartitionPosition::new(self, offset)
    }
}

impl Display for TopicPartition {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.topic, self.partition)
    }
}

const OFFSET_BEGINNING: i64 = -2;
const OFFSET_END: i64 = -1;
const OFFSET_STORED: i64 = -1000;
const OFFSET_INVALID: i64 = -1001;

/// An offset within a partition, or one of the logical positions a client
/// may be assigned to.
#[derive(Copy, Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Offset {
    Beginning,
    End,
    Stored,
    #[default]
    Invalid,
    At(i64),
}

impl Offset {
    /// The offset, if this is a concrete position in the log.
    pub fn value(&self) -> Option<i64> {
        match self {
            Self::At(offset) => Some(*offset),
            _otherwise => None,
        }
    }

    pub fn is_concrete(&self) -> bool {
        self.value().is_some()
    }
}

impl From<i64> for Offset {
    fn from(value: i64) -> Self {
        match value {
            OFFSET_BEGINNING => Self::Beginning,
            OFFSET_END => Self::End,
            OFFSET_STORED => Self::Stored,
            offset if offset >= 0 => Self::At(offset),
            _otherwise => Self::Invalid,
        }
    }
}

impl From<Offset> for i64 {
    fn from(value: Offset) -> Self {
        match value {
            Offset::Beginning => OFFSET_BEGINNING,
            Offset::End => OFFSET_END,
            Offset::Stored => OFFSET_STORED,
            Offset::Invalid => OFFSET_INVALID,
            Offset::At(offset) => offset,
        }
    }
}

impl Display for Offset {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::At(offset) => write!(f, "{offset}"),
            otherwise => write!(f, "{otherwise:?}"),
        }
    }
}

/// A (topic, partition, offset) triple.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PartitionPosition {
    topic_partition: TopicPartition,
    offset: Offset,
}

impl PartitionPosition {
    pub fn new(topic_partition: TopicPartition, offset: Offset) -> Self {
        Self {
            topic_partition,
            offset,
        }
    }

    pub fn topic_partition(&self) -> &TopicPartition {
        &self.topic_partition
    }

    pub fn topic(&self) -> &str {
        self.topic_partition.topic()
    }

    pub fn partition(&self) -> i32 {
        self.topic_partition.partition()
    }

    pub fn offset(&self) -> Offset {
        self.offset
    }
}

impl Display for PartitionPosition {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic_partition, self.offset)
    }
}

/// Low and high watermark of a partition, the high watermark being the
/// offset of the next record to be appended.
#[derive(Copy, Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Watermark {
    pub low: i64,
    pub high: i64,
}

impl Watermark {
    pub fn is_empty(&self) -> bool {
        self.low >= self.high
    }
}

/// Where a manually assigned topic starts to be read from.
///
/// Explicit offsets, one per partition, take precedence over a since date.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TopicAssignment {
    since: Option<SystemTime>,
    offsets: Option<Vec<i64>>,
}

impl TopicAssignment {
    pub fn since(since: SystemTime) -> Self {
        Self {
            since: Some(since),
            offsets: None,
        }
    }

    pub fn offsets(offsets: impl IntoIterator<Item = i64>) -> Self {
        Self {
            since: None,
            offsets: Some(offsets.into_iter().collect()),
        }
    }

    pub fn since_date(&self) -> Option<SystemTime> {
        self.since
    }

    pub fn partition_offsets(&self) -> Option<&[i64]> {
        self.offsets.as_deref()
    }
}

/// Partitions known to the cluster, by topic.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ClusterMetadata {
    topics: BTreeMap<String, Vec<i32>>,
}

impl ClusterMetadata {
    pub fn topic(mut self, name: impl Into<String>, partitions: impl IntoIterator<Item = i32>) -> Self {
        _ = self
            .topics
            .insert(name.into(), partitions.into_iter().collect());
        self
    }

    pub fn partitions(&self, topic: &str) -> Option<&[i32]> {
        self.topics.get(topic).map(Vec::as_slice)
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.topics.keys().map(String::as_str)
    }
}

/// Summarise positions grouped by topic, e.g. `orders[0, 1], audit[0]`.
pub fn partitions_summary<'a>(positions: impl IntoIterator<Item = &'a PartitionPosition>) -> String {
    let mut topics: BTreeMap<&str, Vec<i32>> = BTreeMap::new();

    for position in positions {
        topics
            .entry(position.topic())
            .or_default()
            .push(position.partition());
    }

    topics
        .iter()
        .map(|(topic, partitions)| {
            let partitions = partitions
                .iter()
                .map(i32::to_string)
                .collect::<Vec<_>>()
                .join(", ");

            format!("{topic}[{partitions}]")
        })
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_offsets() {
        assert_eq!(Offset::Beginning, Offset::from(-2));
        assert_eq!(Offset::End, Offset::from(-1));
        assert_eq!(Offset::Stored, Offset::from(-1000));
        assert_eq!(Offset::Invalid, Offset::from(-1001));
        assert_eq!(Offset::Invalid, Offset::from(-7));
        assert_eq!(Offset::At(0), Offset::from(0));

        assert_eq!(-1001, i64::from(Offset::Invalid));
        assert_eq!(42, i64::from(Offset::At(42)));
    }

    #[test]
    fn display() {
        let position = TopicPartition::new("orders", 3).at(Offset::At(12));
        assert_eq!("orders[3]:12", position.to_string());

        let position = TopicPartition::new("orders", 0).at(Offset::Invalid);
        assert_eq!("orders[0]:Invalid", position.to_string());
    }

    #[test]
    fn summary() {
        let positions = [
            TopicPartition::new("orders", 0).at(Offset::At(1)),
            TopicPartition::new("audit", 0).at(Offset::Invalid),
            TopicPartition::new("orders", 1).at(Offset::At(7)),
        ];

        assert_eq!("audit[0], orders[0, 1]", partitions_summary(&positions));
        assert_eq!("", partitions_summary(&[] as &[PartitionPosition]));
    }

    #[test]
    fn explicit_offsets() {
        let assignment = TopicAssignment::offsets([3, 4]);
        assert_eq!(Some(&[3, 4][..]), assignment.partition_offsets());
        assert_eq!(None, assignment.since_date());
    }
}
