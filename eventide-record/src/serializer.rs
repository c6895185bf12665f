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

use bytes::Bytes;
use tracing::debug;

use crate::{Error, Record, Result};

/// Encode a [`Record`] into bytes and back.
///
/// Decoding must fail on malformed input: a record store treats a decode
/// failure as fatal for the batch being read.
pub trait Serializer: Send + Sync + 'static {
    fn encode(&self, record: &Record) -> Result<Bytes>;

    fn decode(&self, encoded: &[u8]) -> Result<Record>;
}

#[derive(Copy, Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn encode(&self, record: &Record) -> Result<Bytes> {
        serde_json::to_vec(record)
            .map(Bytes::from)
            .inspect(|encoded| debug!(len = encoded.len()))
            .map_err(Into::into)
    }

    fn decode(&self, encoded: &[u8]) -> Result<Record> {
        if encoded.is_empty() {
            return Err(Error::EmptyPayload);
        }

        serde_json::from_slice(encoded).map_err(Into::into)
    }
}
