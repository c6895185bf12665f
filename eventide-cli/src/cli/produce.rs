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

use std::{io::BufRead, time::Duration};

use clap::Args;
use eventide_store::{JsonSerializer, RecordStore, Serializer as _, client::Connector};
use tracing::{debug, info};

use crate::Result;

#[derive(Clone, Debug, Args)]
pub(super) struct Arg {
    #[arg(long)]
    topic: String,

    /// Write every record in one transaction, committed once stdin is exhausted
    #[arg(long)]
    transaction: bool,

    /// How long to wait for each record to be delivered
    #[arg(long, default_value = "30000")]
    timeout_ms: u64,
}

impl Arg {
    pub(super) fn run<C>(self, store: RecordStore<C, JsonSerializer>, input: &mut impl BufRead) -> Result<u64>
    where
        C: Connector,
    {
        let timeout = Some(Duration::from_millis(self.timeout_ms));

        let written = if self.transaction {
            store.transaction(timeout, |store| write(store, &self.topic, input, timeout))?
        } else {
            write(&store, &self.topic, input, timeout)?
        };

        info!(topic = %self.topic, written);
        store.close();
        Ok(written)
    }
}

fn write<C>(
    store: &RecordStore<C, JsonSerializer>,
    topic: &str,
    input: &mut impl BufRead,
    timeout: Option<Duration>,
) -> eventide_store::Result<u64>
where
    C: Connector,
{
    let mut written = 0;
    let mut line = String::new();

    while input.read_line(&mut line)? > 0 {
        let trimmed = line.trim();

        if !trimmed.is_empty() {
            let record = JsonSerializer
                .decode(trimmed.as_bytes())
                .map_err(|error| eventide_store::Error::Decode {
                    message: trimmed.to_owned(),
                    error,
                })?;

            let position = if store.in_transaction() {
                store.write(&record, topic, timeout)?
            } else {
                store.write_now(&record, topic, timeout)?
            };

            debug!(%position);
            written += 1;
        }

        line.clear();
    }

    Ok(written)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use eventide_store::{
        config::Configuration,
        memory::Broker,
        partition::{TopicPartition, Watermark},
    };
    use pretty_assertions::assert_eq;
    use url::Url;

    use super::*;

    fn arg(transaction: bool) -> Arg {
        Arg {
            topic: "orders".into(),
            transaction,
            timeout_ms: 5_000,
        }
    }

    fn store(broker: &Broker) -> Result<RecordStore<eventide_store::memory::MemoryConnector, JsonSerializer>> {
        Url::parse("tcp://localhost:9092")
            .map(|bootstrap| {
                let configuration = Configuration::builder()
                    .service_name("checkout")
                    .bootstrap_servers([bootstrap])
                    .poll_interval(Duration::from_millis(1))
                    .build();

                RecordStore::builder(broker.connector(), JsonSerializer, configuration).build()
            })
            .map_err(Into::into)
    }

    const INPUT: &str = r#"{"qualified_name": "order.created", "partition_key": "o-1"}

{"qualified_name": "order.created", "partition_key": "o-2", "data": {"total": 12}}
"#;

    #[test]
    fn immediate() -> Result<()> {
        let broker = Broker::builder().topic("orders", 1).build();

        assert_eq!(2, arg(false).run(store(&broker)?, &mut Cursor::new(INPUT))?);
        assert_eq!(
            Some(Watermark { low: 0, high: 2 }),
            broker.watermark(&TopicPartition::new("orders", 0)).ok()
        );

        Ok(())
    }

    #[test]
    fn transactional() -> Result<()> {
        let broker = Broker::builder().topic("orders", 1).build();

        assert_eq!(2, arg(true).run(store(&broker)?, &mut Cursor::new(INPUT))?);

        // two records and the commit marker
        assert_eq!(
            Some(Watermark { low: 0, high: 3 }),
            broker.watermark(&TopicPartition::new("orders", 0)).ok()
        );

        Ok(())
    }

    #[test]
    fn invalid_json_aborts_the_transaction() -> Result<()> {
        let broker = Broker::builder().topic("orders", 1).build();
        let input = format!("{INPUT}not json\n");

        assert!(arg(true).run(store(&broker)?, &mut Cursor::new(input)).is_err());

        // two aborted records and the abort marker
        assert_eq!(
            Some(Watermark { low: 0, high: 3 }),
            broker.watermark(&TopicPartition::new("orders", 0)).ok()
        );

        Ok(())
    }
}
