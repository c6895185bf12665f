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

//! Eventide Record
//!
//! The domain unit of work carried through a record store, together with the
//! [`Serializer`] contract used to turn a [`Record`] into bytes and back.
//!
//! ```
//! # use eventide_record::{Error, JsonSerializer, Record, Serializer as _};
//! # use serde_json::json;
//! # fn main() -> Result<(), Error> {
//! let record = Record::builder("order.created")
//!     .correlation_id("c1")
//!     .partition_key("o-42")
//!     .data(json!({"amount": 42}))
//!     .build();
//!
//! let encoded = JsonSerializer.encode(&record)?;
//! assert_eq!(record, JsonSerializer.decode(&encoded[..])?);
//! # Ok(())
//! # }
//! ```

use std::{fmt, result, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{Level, Span, span};
use uuid::Uuid;

mod serializer;

pub use serializer::{JsonSerializer, Serializer};

#[derive(thiserror::Error, Clone, Debug)]
pub enum Error {
    EmptyPayload,
    SerdeJson(Arc<serde_json::Error>),
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::SerdeJson(Arc::new(value))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

pub type Result<T, E = Error> = result::Result<T, E>;

fn correlation() -> String {
    Uuid::new_v4().to_string()
}

/// An immutable domain record.
///
/// The correlation id scopes logging for the duration of processing, the
/// partition key routes the record within a topic.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Record {
    #[serde(default = "Uuid::new_v4")]
    id: Uuid,

    qualified_name: String,

    #[serde(default = "correlation")]
    correlation_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    partition_key: Option<String>,

    #[serde(default)]
    data: Value,
}

impl Record {
    pub fn builder(qualified_name: impl Into<String>) -> Builder {
        Builder {
            qualified_name: qualified_name.into(),
            correlation_id: None,
            partition_key: None,
            data: Value::Null,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn qualified_name(&self) -> &str {
        &self.qualified_name
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn partition_key(&self) -> Option<&str> {
        self.partition_key.as_deref()
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    /// A span carrying this record's correlation id.
    ///
    /// Everything logged while the span is entered is attributed to the
    /// record, including delivery reports fired on another thread.
    pub fn span(&self) -> Span {
        span!(
            Level::INFO,
            "record",
            correlation_id = %self.correlation_id,
            qualified_name = %self.qualified_name,
        )
    }
}

/// Builds a [`Record`], generating its id and, unless given, its
/// correlation id.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Builder {
    qualified_name: String,
    correlation_id: Option<String>,
    partition_key: Option<String>,
    data: Value,
}

impl Builder {
    pub fn correlation_id(self, correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            ..self
        }
    }

    pub fn partition_key(self, partition_key: impl Into<String>) -> Self {
        Self {
            partition_key: Some(partition_key.into()),
            ..self
        }
    }

    pub fn data(self, data: Value) -> Self {
        Self { data, ..self }
    }

    pub fn build(self) -> Record {
        Record {
            id: Uuid::new_v4(),
            qualified_name: self.qualified_name,
            correlation_id: self.correlation_id.unwrap_or_else(correlation),
            partition_key: self.partition_key,
            data: self.data,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn builder() {
        let record = Record::builder("order.created")
            .correlation_id("c1")
            .partition_key("o-42")
            .data(json!({"amount": 42}))
            .build();

        assert_eq!("order.created", record.qualified_name());
        assert_eq!("c1", record.correlation_id());
        assert_eq!(Some("o-42"), record.partition_key());
        assert_eq!(&json!({"amount": 42}), record.data());
    }

    #[test]
    fn generated_identity() {
        let first = Record::builder("order.created").build();
        let second = Record::builder("order.created").build();

        assert_ne!(first.id(), second.id());
        assert_ne!(first.correlation_id(), second.correlation_id());
        assert_eq!(None, first.partition_key());
        assert_eq!(&Value::Null, first.data());
    }

    #[test]
    fn missing_optional_fields() -> Result<()> {
        let record: Record = serde_json::from_value(json!({
            "qualified_name": "order.shipped",
        }))?;

        assert_eq!("order.shipped", record.qualified_name());
        assert!(Uuid::parse_str(record.correlation_id()).is_ok());
        assert_eq!(None, record.partition_key());

        Ok(())
    }
}
