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

//! Eventide Store
//!
//! A transactional record store over a partitioned log messaging system.
//!
//! [`RecordStore`] owns a transactional producer, an immediate (idempotent)
//! producer and a consumer, together with a background thread polling both
//! producers. Records read and written while a transaction is open are
//! delivered exactly once: the writes and the consumer offsets become visible
//! together when the transaction commits, and are discarded if it aborts.
//! Outside a transaction records are written immediately and
//! acknowledgements commit the consumer directly.
//!
//! ```
//! # use eventide_store::{Error, JsonSerializer, Record, RecordStore, config::Configuration, memory::Broker};
//! # use std::time::Duration;
//! # use url::Url;
//! # fn main() -> Result<(), Error> {
//! let broker = Broker::builder().build();
//!
//! let configuration = Configuration::builder()
//!     .service_name("orders")
//!     .bootstrap_servers([Url::parse("tcp://localhost:9092")?])
//!     .build();
//!
//! let store = RecordStore::builder(broker.connector(), JsonSerializer, configuration)
//!     .subscribe(["orders"])
//!     .build();
//!
//! let timeout = Some(Duration::from_secs(5));
//!
//! store.start_transaction()?;
//! _ = store.write(&Record::builder("order.created").partition_key("o-42").build(), "orders", timeout)?;
//! store.commit(timeout)?;
//!
//! for record in store.read(1, timeout, true)? {
//!     assert_eq!(Some("o-42"), record?.partition_key());
//! }
//!
//! store.close();
//! # Ok(())
//! # }
//! ```

use std::{
    fmt, io, result,
    sync::{Arc, LazyLock, PoisonError},
    time::Duration,
};

use opentelemetry::{InstrumentationScope, global, metrics::Meter};
use opentelemetry_semantic_conventions::SCHEMA_URL;

pub mod client;
pub mod config;

#[cfg(feature = "kafka")]
pub mod kafka;

pub mod memory;
pub mod partition;

mod poll;
mod store;

pub use eventide_record::{JsonSerializer, Record, Serializer};
pub use store::{Builder, Read, RecordStore};

/// The broker operation that failed.
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Operation {
    AbortTransaction,
    Assign,
    BeginTransaction,
    Close,
    Commit,
    CommitTransaction,
    Connect,
    Consume,
    InitTransactions,
    Metadata,
    OffsetForTime,
    Seek,
    Send,
    SendOffsetsToTransaction,
    Subscribe,
}

/// Messaging Errors
///
/// Every failure of a record store operation surfaces as one of these:
/// broker client errors are wrapped with the operation that failed,
/// transaction state violations are detected before any broker call.
#[derive(thiserror::Error, Clone, Debug)]
pub enum Error {
    AlreadyInTransaction,
    Closed,

    Client {
        operation: Operation,
        #[source]
        error: client::Error,
    },

    Decode {
        message: String,
        #[source]
        error: eventide_record::Error,
    },

    Delivery(client::Error),
    DeliveryAbandoned,
    DeliveryTimeout(Duration),
    Encode(eventide_record::Error),
    Io(Arc<io::Error>),
    NoGroupMetadata,
    NotInTransaction,
    Poison,
    UnknownClientRole(String),
    Url(#[from] url::ParseError),
}

impl Error {
    pub(crate) fn client(operation: Operation) -> impl FnOnce(client::Error) -> Self {
        move |error| Self::Client { operation, error }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl<T> From<PoisonError<T>> for Error {
    fn from(_value: PoisonError<T>) -> Self {
        Self::Poison
    }
}

pub type Result<T, E = Error> = result::Result<T, E>;

pub(crate) static METER: LazyLock<Meter> = LazyLock::new(|| {
    global::meter_with_scope(
        InstrumentationScope::builder(env!("CARGO_PKG_NAME"))
            .with_version(env!("CARGO_PKG_VERSION"))
            .with_schema_url(SCHEMA_URL)
            .build(),
    )
});
