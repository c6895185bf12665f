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

use std::time::{Duration, SystemTime};

use common::{Result, SHORT, TIMEOUT, assigned, init_tracing, keys, order, read};
use eventide_store::{
    JsonSerializer, Serializer as _,
    memory::Broker,
    partition::{TopicAssignment, TopicPartition},
};
use pretty_assertions::assert_eq;

pub mod common;

fn append(broker: &Broker, topic_partition: &TopicPartition, key: &str, timestamp: i64) -> Result<i64> {
    let payload = JsonSerializer.encode(&order(key))?;

    broker
        .append_raw(topic_partition, None, Some(payload), Some(timestamp))
        .map_err(Into::into)
}

fn since(millis: u64) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_millis(millis)
}

#[test]
fn offset_per_partition() -> Result<()> {
    let _guard = init_tracing()?;

    let broker = Broker::builder().topic("orders", 2).build();
    let p0 = TopicPartition::new("orders", 0);
    let p1 = TopicPartition::new("orders", 1);

    _ = append(&broker, &p0, "o-1", 1_000)?;
    _ = append(&broker, &p0, "o-2", 2_000)?;
    _ = append(&broker, &p1, "o-3", 1_000)?;
    _ = append(&broker, &p1, "o-4", 2_000)?;

    let store = assigned(&broker, "audit", [("orders", TopicAssignment::offsets([1, 0]))])?;

    let mut records = keys(&read(&store, 3, TIMEOUT, false)?)
        .into_iter()
        .map(String::from)
        .collect::<Vec<_>>();
    records.sort();

    assert_eq!(vec!["o-2", "o-3", "o-4"], records);
    assert!(store.has_reached_end_of_topics()?);

    Ok(())
}

#[test]
fn offsets_must_match_partitions() -> Result<()> {
    let _guard = init_tracing()?;

    let broker = Broker::builder().topic("orders", 2).build();
    _ = append(&broker, &TopicPartition::new("orders", 0), "o-1", 1_000)?;

    let store = assigned(&broker, "audit", [("orders", TopicAssignment::offsets([0]))])?;

    assert!(read(&store, 1, SHORT, false)?.is_empty());
    assert!(store.has_reached_end_of_topics()?);

    Ok(())
}

#[test]
fn since_date() -> Result<()> {
    let _guard = init_tracing()?;

    let broker = Broker::builder().topic("orders", 1).topic("payments", 1).build();
    let orders = TopicPartition::new("orders", 0);
    let payments = TopicPartition::new("payments", 0);

    _ = append(&broker, &orders, "o-1", 1_000)?;
    _ = append(&broker, &orders, "o-2", 2_000)?;
    _ = append(&broker, &orders, "o-3", 3_000)?;
    _ = append(&broker, &payments, "p-1", 1_000)?;

    let store = assigned(
        &broker,
        "audit",
        [
            ("orders", TopicAssignment::since(since(2_000))),
            ("payments", TopicAssignment::since(since(5_000))),
        ],
    )?;

    assert_eq!(vec!["o-2", "o-3"], keys(&read(&store, 3, SHORT, false)?));

    _ = append(&broker, &payments, "p-2", 6_000)?;
    assert_eq!(vec!["p-2"], keys(&read(&store, 1, TIMEOUT, false)?));

    Ok(())
}

#[test]
fn unknown_topics_are_skipped() -> Result<()> {
    let _guard = init_tracing()?;

    let broker = Broker::builder().topic("orders", 1).topic("payments", 1).build();
    _ = append(&broker, &TopicPartition::new("orders", 0), "o-1", 1_000)?;

    let store = assigned(
        &broker,
        "audit",
        [
            ("missing", TopicAssignment::offsets([0])),
            ("orders", TopicAssignment::offsets([0])),
            ("payments", TopicAssignment::default()),
        ],
    )?;

    assert_eq!(vec!["o-1"], keys(&read(&store, 1, TIMEOUT, false)?));

    Ok(())
}

#[test]
fn deleted_topic_is_skipped() -> Result<()> {
    let _guard = init_tracing()?;

    let broker = Broker::builder().topic("orders", 1).topic("payments", 1).build();
    let store = assigned(
        &broker,
        "audit",
        [
            ("orders", TopicAssignment::offsets([0])),
            ("payments", TopicAssignment::offsets([0])),
        ],
    )?;

    store.initialize()?;
    broker.delete_topic("payments")?;

    _ = append(&broker, &TopicPartition::new("orders", 0), "o-1", 1_000)?;

    assert_eq!(vec!["o-1"], keys(&read(&store, 2, SHORT, false)?));

    Ok(())
}

#[test]
fn abort_returns_to_the_assigned_offset() -> Result<()> {
    let _guard = init_tracing()?;

    let broker = Broker::builder().topic("orders", 1).build();
    let p0 = TopicPartition::new("orders", 0);

    for (key, timestamp) in [("o-1", 1_000), ("o-2", 2_000), ("o-3", 3_000), ("o-4", 4_000)] {
        _ = append(&broker, &p0, key, timestamp)?;
    }

    let store = assigned(&broker, "audit", [("orders", TopicAssignment::offsets([2]))])?;

    store.start_transaction()?;
    assert_eq!(vec!["o-3", "o-4"], keys(&read(&store, 10, SHORT, false)?));
    store.abort(TIMEOUT)?;

    assert_eq!(None, broker.committed("audit", &p0));
    assert_eq!(vec!["o-3", "o-4"], keys(&read(&store, 10, SHORT, false)?));

    Ok(())
}
