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
    io,
    sync::{Arc, Barrier, Mutex, PoisonError},
    thread,
    time::{Duration, Instant},
};

use bytes::Bytes;
use common::{Error, Result, SHORT, TIMEOUT, init_tracing, keys, order, publisher, read, subscriber};
use eventide_store::{
    JsonSerializer, Operation, Record, RecordStore, Serializer as _,
    client,
    memory::Broker,
    partition::{TopicAssignment, TopicPartition},
};
use pretty_assertions::assert_eq;
use tracing::Level;

pub mod common;

#[test]
fn write_now_then_read() -> Result<()> {
    let _guard = init_tracing()?;

    let broker = Broker::builder().build();
    let writer = publisher(&broker, "checkout")?;
    let reader = subscriber(&broker, "fulfilment", &["orders"])?;

    let position = writer.write_now(
        &Record::builder("order.created")
            .correlation_id("c1")
            .partition_key("o-42")
            .build(),
        "orders",
        TIMEOUT,
    )?;

    assert_eq!("orders[0]:0", position.to_string());

    let records = read(&reader, 1, TIMEOUT, true)?;
    assert_eq!(vec!["o-42"], keys(&records));
    assert_eq!("c1", records[0].correlation_id());
    assert_eq!("order.created", records[0].qualified_name());

    let start = Instant::now();
    assert!(read(&reader, 1, SHORT, true)?.is_empty());
    assert!(start.elapsed() >= Duration::from_millis(200));

    assert_eq!(
        Some(1),
        broker.committed("fulfilment", &TopicPartition::new("orders", 0))
    );

    writer.close();
    reader.close();

    Ok(())
}

#[test]
fn read_is_bounded_by_max_count() -> Result<()> {
    let _guard = init_tracing()?;

    let broker = Broker::builder().topic("orders", 1).build();
    let writer = publisher(&broker, "checkout")?;
    let reader = subscriber(&broker, "fulfilment", &["orders"])?;

    for key in 0..8 {
        _ = writer.write_now(&order(&format!("o-{key}")), "orders", TIMEOUT)?;
    }

    assert_eq!(5, read(&reader, 5, TIMEOUT, false)?.len());
    reader.ack(TIMEOUT)?;

    assert_eq!(vec!["o-5", "o-6", "o-7"], keys(&read(&reader, 5, SHORT, false)?));

    Ok(())
}

#[test]
fn auto_ack_follows_the_caller() -> Result<()> {
    let _guard = init_tracing()?;

    let broker = Broker::builder().topic("orders", 1).build();
    let writer = publisher(&broker, "checkout")?;
    let reader = subscriber(&broker, "fulfilment", &["orders"])?;
    let tp = TopicPartition::new("orders", 0);

    _ = writer.write_now(&order("o-1"), "orders", TIMEOUT)?;
    _ = writer.write_now(&order("o-2"), "orders", TIMEOUT)?;

    let mut records = reader.read(2, TIMEOUT, true)?;

    assert_eq!(Some("o-1"), records.next().transpose()?.as_ref().and_then(Record::partition_key));
    assert_eq!(None, broker.committed("fulfilment", &tp));

    assert_eq!(Some("o-2"), records.next().transpose()?.as_ref().and_then(Record::partition_key));
    assert_eq!(Some(1), broker.committed("fulfilment", &tp));

    assert!(records.next().is_none());
    assert_eq!(Some(2), broker.committed("fulfilment", &tp));

    Ok(())
}

#[test]
fn undecodable_message_ends_the_read() -> Result<()> {
    let _guard = init_tracing()?;

    let broker = Broker::builder().topic("orders", 1).build();
    let tp = TopicPartition::new("orders", 0);

    _ = broker.append_raw(&tp, None, Some(Bytes::from_static(b"not json")), None)?;
    _ = broker.append_raw(&tp, None, Some(JsonSerializer.encode(&order("o-1"))?), None)?;

    let reader = subscriber(&broker, "fulfilment", &["orders"])?;
    let mut records = reader.read(2, TIMEOUT, false)?;

    assert!(matches!(
        records.next(),
        Some(Err(eventide_store::Error::Decode { .. }))
    ));
    assert!(records.next().is_none());

    Ok(())
}

#[test]
fn broker_reported_errors_are_skipped() -> Result<()> {
    let _guard = init_tracing()?;

    let broker = Broker::builder().topic("orders", 1).build();
    let writer = publisher(&broker, "checkout")?;
    let reader = subscriber(&broker, "fulfilment", &["orders"])?;

    reader.initialize()?;
    _ = writer.write_now(&order("o-1"), "orders", TIMEOUT)?;
    broker.fail_next_fetch(client::Error::Message("corrupt message".into()));

    assert_eq!(vec!["o-1"], keys(&read(&reader, 2, SHORT, false)?));

    Ok(())
}

#[test]
fn nothing_to_read_without_topics() -> Result<()> {
    let _guard = init_tracing()?;

    let broker = Broker::builder().build();
    let store = publisher(&broker, "checkout")?;

    let start = Instant::now();
    assert!(read(&store, 10, TIMEOUT, true)?.is_empty());
    assert!(start.elapsed() < Duration::from_secs(1));

    Ok(())
}

#[test]
fn end_of_topics() -> Result<()> {
    let _guard = init_tracing()?;

    let broker = Broker::builder().topic("orders", 1).build();
    let writer = publisher(&broker, "checkout")?;

    for key in ["o-1", "o-2", "o-3"] {
        _ = writer.write_now(&order(key), "orders", TIMEOUT)?;
    }

    let reader = common::assigned(&broker, "audit", [("orders", TopicAssignment::offsets([0]))])?;
    reader.initialize()?;

    assert!(!reader.has_reached_end_of_topics()?);

    assert_eq!(3, read(&reader, 3, TIMEOUT, false)?.len());
    assert!(reader.has_reached_end_of_topics()?);

    writer.start_transaction()?;
    _ = writer.write(&order("o-4"), "orders", TIMEOUT)?;
    assert!(reader.has_reached_end_of_topics()?);

    writer.commit(TIMEOUT)?;
    assert!(!reader.has_reached_end_of_topics()?);

    assert_eq!(vec!["o-4"], keys(&read(&reader, 1, TIMEOUT, false)?));
    assert!(reader.has_reached_end_of_topics()?);

    Ok(())
}

#[test]
fn end_of_topics_before_first_read() -> Result<()> {
    let _guard = init_tracing()?;

    let broker = Broker::builder().topic("orders", 1).build();
    let reader = common::assigned(&broker, "audit", [("orders", TopicAssignment::offsets([-2]))])?;

    assert!(reader.has_reached_end_of_topics()?);

    _ = publisher(&broker, "checkout")?.write_now(&order("o-1"), "orders", TIMEOUT)?;
    assert!(!reader.has_reached_end_of_topics()?);

    Ok(())
}

#[test]
fn initialize_once_from_many_threads() -> Result<()> {
    let _guard = init_tracing()?;

    const THREADS: usize = 8;

    let broker = Broker::builder().build();
    let store = subscriber(&broker, "fulfilment", &["orders"])?;

    let initialized = Barrier::new(THREADS + 1);
    let release = Barrier::new(THREADS + 1);

    thread::scope(|scope| {
        let handles = (0..THREADS)
            .map(|_| {
                scope.spawn(|| {
                    let outcome = store.initialize();
                    _ = initialized.wait();
                    _ = release.wait();
                    outcome
                })
            })
            .collect::<Vec<_>>();

        _ = initialized.wait();
        thread::sleep(Duration::from_millis(100));

        let counts = (
            broker.producers_created(),
            broker.consumers_created(),
            broker.polling_threads(),
        );

        _ = release.wait();

        for handle in handles {
            handle
                .join()
                .map_err(|_| Error::Message("initialize panicked".into()))??;
        }

        assert_eq!((2, 1, 1), counts);
        Ok::<(), Error>(())
    })?;

    assert!(store.is_initialized());

    Ok(())
}

#[test]
fn close_is_idempotent() -> Result<()> {
    let _guard = init_tracing()?;

    let broker = Broker::builder().build();

    let store = subscriber(&broker, "fulfilment", &["orders"])?;
    store.initialize()?;
    store.close();
    store.close();

    let store = subscriber(&broker, "fulfilment", &["orders"])?;
    store.close();
    assert!(matches!(store.initialize(), Err(eventide_store::Error::Closed)));

    Ok(())
}

#[test]
fn poll_loop_stops_with_its_owner() -> Result<()> {
    let _guard = init_tracing()?;

    let broker = Broker::builder().build();
    let store = publisher(&broker, "checkout")?;

    thread::scope(|scope| scope.spawn(|| store.initialize()).join())
        .map_err(|_| Error::Message("initialize panicked".into()))??;

    thread::sleep(Duration::from_millis(50));

    assert!(matches!(
        store.write_now(&order("o-1"), "orders", SHORT),
        Err(eventide_store::Error::DeliveryTimeout(_))
    ));

    Ok(())
}

#[test]
fn delivery_resumes_after_reconnect() -> Result<()> {
    let _guard = init_tracing()?;

    let broker = Broker::builder().build();
    let store = publisher(&broker, "checkout")?;
    store.initialize()?;

    broker.disconnect();

    assert!(matches!(
        store.write_now(&order("o-1"), "orders", SHORT),
        Err(eventide_store::Error::DeliveryTimeout(_))
    ));

    broker.reconnect();

    let position = store.write_now(&order("o-2"), "orders", TIMEOUT)?;
    assert_eq!("orders[0]:1", position.to_string());

    Ok(())
}

#[test]
fn sasl_plain() -> Result<()> {
    let _guard = init_tracing()?;

    let broker = Broker::builder().sasl_plain("alice", "secret").build();

    let configuration = common::configuration("checkout")?;
    let unauthenticated = RecordStore::builder(broker.connector(), JsonSerializer, configuration).build();

    assert!(matches!(
        unauthenticated.initialize(),
        Err(eventide_store::Error::Client {
            operation: Operation::Connect,
            error: client::Error::Authentication(_),
        })
    ));

    let configuration = url::Url::parse("tcp://localhost:9092").map(|bootstrap| {
        eventide_store::config::Configuration::builder()
            .service_name("checkout")
            .bootstrap_servers([bootstrap])
            .sasl(Some("alice".into()), Some("secret".into()))
            .build()
    })?;

    let store = RecordStore::builder(broker.connector(), JsonSerializer, configuration).build();
    store.initialize()?;

    assert_eq!(
        "orders[0]:0",
        store.write_now(&order("o-1"), "orders", TIMEOUT)?.to_string()
    );

    Ok(())
}

#[test]
fn read_fails_when_the_broker_is_down() -> Result<()> {
    let _guard = init_tracing()?;

    let broker = Broker::builder().topic("orders", 1).build();
    let store = subscriber(&broker, "fulfilment", &["orders"])?;
    store.initialize()?;

    broker.disconnect();

    assert!(matches!(
        store.read(1, SHORT, true),
        Err(eventide_store::Error::Client {
            operation: Operation::Consume,
            error: client::Error::Transport(_),
        })
    ));

    Ok(())
}

#[test]
fn delivery_errors_are_returned() -> Result<()> {
    let _guard = init_tracing()?;

    let broker = Broker::builder().auto_create_topics(false).build();
    let store = publisher(&broker, "checkout")?;

    assert!(matches!(
        store.write_now(&order("o-1"), "orders", TIMEOUT),
        Err(eventide_store::Error::Delivery(client::Error::UnknownTopicOrPartition(_)))
    ));

    assert!(matches!(
        store.write(&order("o-2"), "orders", TIMEOUT),
        Err(eventide_store::Error::Delivery(client::Error::UnknownTopicOrPartition(_)))
    ));

    Ok(())
}

#[test]
fn auto_ack_failure_ends_the_read() -> Result<()> {
    let _guard = init_tracing()?;

    let broker = Broker::builder().topic("orders", 1).build();
    let writer = publisher(&broker, "checkout")?;

    for key in ["o-1", "o-2"] {
        _ = writer.write_now(&order(key), "orders", TIMEOUT)?;
    }

    let reader = subscriber(&broker, "fulfilment", &["orders"])?;
    let mut records = reader.read(2, TIMEOUT, true)?;

    assert_eq!(
        Some("o-1"),
        records.next().transpose()?.as_ref().and_then(Record::partition_key)
    );

    broker.disconnect();

    assert!(matches!(
        records.next(),
        Some(Err(eventide_store::Error::Client {
            operation: Operation::Commit,
            error: client::Error::Transport(_),
        }))
    ));
    assert!(records.next().is_none());

    assert_eq!(None, broker.committed("fulfilment", &TopicPartition::new("orders", 0)));

    Ok(())
}

#[test]
fn ack_fails_when_the_broker_is_down() -> Result<()> {
    let _guard = init_tracing()?;

    let broker = Broker::builder().topic("orders", 1).build();
    let store = subscriber(&broker, "fulfilment", &["orders"])?;
    store.initialize()?;

    assert!(matches!(
        store.ack_in_transaction(TIMEOUT),
        Err(eventide_store::Error::NotInTransaction)
    ));

    broker.disconnect();

    assert!(matches!(
        store.ack(TIMEOUT),
        Err(eventide_store::Error::Client {
            operation: Operation::Commit,
            error: client::Error::Transport(_),
        })
    ));

    Ok(())
}

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.0.lock().unwrap_or_else(PoisonError::into_inner))
            .lines()
            .map(String::from)
            .collect()
    }
}

impl io::Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn delivery_is_logged_with_the_correlation_id() -> Result<()> {
    let captured = Captured::default();
    let writer = captured.clone();

    let _guard = tracing::subscriber::set_default(
        tracing_subscriber::fmt()
            .with_max_level(Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish(),
    );

    let broker = Broker::builder().build();
    let store = publisher(&broker, "checkout")?;

    _ = store.write_now(
        &Record::builder("order.created")
            .correlation_id("c-42")
            .partition_key("o-1")
            .build(),
        "orders",
        TIMEOUT,
    )?;

    let written = captured
        .lines()
        .into_iter()
        .filter(|line| line.contains("eventide_store::store: written"))
        .collect::<Vec<_>>();

    assert_eq!(1, written.len());
    assert!(written[0].contains("correlation_id=c-42"), "{written:?}");

    Ok(())
}
