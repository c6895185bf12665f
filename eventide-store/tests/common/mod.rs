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

#![allow(dead_code)]

use std::{fmt, time::Duration};

use eventide_store::{
    JsonSerializer, Record, RecordStore,
    config::Configuration,
    memory::{Broker, MemoryConnector},
    partition::TopicAssignment,
};
use rand::{distr::Alphanumeric, prelude::*, rng};
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::EnvFilter;
use url::Url;

#[derive(thiserror::Error, Debug)]
pub(crate) enum Error {
    Client(#[from] eventide_store::client::Error),
    Directive(#[from] tracing_subscriber::filter::ParseError),
    Message(String),
    Record(#[from] eventide_record::Error),
    Store(#[from] eventide_store::Error),
    Url(#[from] url::ParseError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;

pub(crate) type MemoryStore = RecordStore<MemoryConnector, JsonSerializer>;

pub(crate) const TIMEOUT: Option<Duration> = Some(Duration::from_secs(5));
pub(crate) const SHORT: Option<Duration> = Some(Duration::from_millis(200));

pub(crate) fn init_tracing() -> Result<DefaultGuard> {
    Ok(tracing::subscriber::set_default(
        tracing_subscriber::fmt()
            .with_level(true)
            .with_line_number(true)
            .with_thread_names(true)
            .with_env_filter(
                EnvFilter::from_default_env()
                    .add_directive(format!("{}=debug", env!("CARGO_CRATE_NAME")).parse()?)
                    .add_directive("eventide_store=debug".parse()?),
            )
            .with_test_writer()
            .finish(),
    ))
}

pub(crate) fn alphanumeric_string(length: usize) -> String {
    rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

pub(crate) fn configuration(service_name: &str) -> Result<Configuration> {
    Url::parse("tcp://localhost:9092")
        .map(|bootstrap| {
            Configuration::builder()
                .service_name(service_name)
                .bootstrap_servers([bootstrap])
                .client_id(Some(alphanumeric_string(8)))
                .poll_interval(Duration::from_millis(1))
                .poll_backoff(Duration::from_millis(10))
                .build()
        })
        .map_err(Into::into)
}

pub(crate) fn publisher(broker: &Broker, service_name: &str) -> Result<MemoryStore> {
    configuration(service_name)
        .map(|configuration| RecordStore::builder(broker.connector(), JsonSerializer, configuration).build())
}

pub(crate) fn subscriber(broker: &Broker, service_name: &str, topics: &[&str]) -> Result<MemoryStore> {
    configuration(service_name).map(|configuration| {
        RecordStore::builder(broker.connector(), JsonSerializer, configuration)
            .subscribe(topics.iter().copied())
            .build()
    })
}

pub(crate) fn assigned(
    broker: &Broker,
    service_name: &str,
    assignments: impl IntoIterator<Item = (&'static str, TopicAssignment)>,
) -> Result<MemoryStore> {
    configuration(service_name).map(|configuration| {
        assignments.into_iter().fold(
            RecordStore::builder(broker.connector(), JsonSerializer, configuration),
            |builder, (topic, assignment)| builder.assign(topic, assignment),
        )
    })
    .map(|builder| builder.build())
}

pub(crate) fn order(key: &str) -> Record {
    Record::builder("order.created")
        .correlation_id(alphanumeric_string(6))
        .partition_key(key)
        .build()
}

/// Every record of one read, driving the iterator to the end.
pub(crate) fn read(
    store: &MemoryStore,
    max_count: usize,
    timeout: Option<Duration>,
    auto_ack: bool,
) -> Result<Vec<Record>> {
    store
        .read(max_count, timeout, auto_ack)?
        .collect::<eventide_store::Result<Vec<_>>>()
        .map_err(Into::into)
}

pub(crate) fn keys(records: &[Record]) -> Vec<&str> {
    records.iter().filter_map(Record::partition_key).collect()
}
