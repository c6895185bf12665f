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

use std::time::Duration;

use clap::Args;
use eventide_store::{Builder, JsonSerializer, RecordStore, client::Connector};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::Result;

#[derive(Clone, Debug, Args)]
pub(super) struct Arg {
    /// Topic the records are read from
    #[arg(long)]
    source: String,

    /// Topic the records are written to
    #[arg(long)]
    destination: String,

    /// Most records relayed by one transaction
    #[arg(long, default_value = "100")]
    max_count: usize,

    /// How long one read waits for records, and each write for delivery
    #[arg(long, default_value = "1000")]
    timeout_ms: u64,

    /// Stop once the source has been read to its end
    #[arg(long)]
    until_end: bool,
}

impl Arg {
    pub(super) fn run<C>(self, store: Builder<C, JsonSerializer>, token: &CancellationToken) -> Result<u64>
    where
        C: Connector,
    {
        let store = store.subscribe([self.source.as_str()]).build();
        let timeout = Some(Duration::from_millis(self.timeout_ms));
        let mut relayed = 0;

        while !token.is_cancelled() {
            relayed += self.batch(&store, timeout)?;

            if self.until_end && store.has_reached_end_of_topics()? {
                debug!("reached end of source");
                break;
            }
        }

        info!(source = %self.source, destination = %self.destination, relayed);
        store.close();
        Ok(relayed)
    }

    /// Read a batch and write it to the destination, acknowledging the
    /// source records in the same transaction.
    fn batch<C>(&self, store: &RecordStore<C, JsonSerializer>, timeout: Option<Duration>) -> Result<u64>
    where
        C: Connector,
    {
        let records = store
            .read(self.max_count, timeout, false)?
            .collect::<eventide_store::Result<Vec<_>>>()?;

        if records.is_empty() {
            return Ok(0);
        }

        store
            .transaction(timeout, |store| {
                for record in &records {
                    let position = store.write(record, &self.destination, timeout)?;
                    debug!(id = %record.id(), %position);
                }

                store.ack(timeout)
            })
            .map(|()| records.len() as u64)
            .map_err(Into::into)
    }
}
