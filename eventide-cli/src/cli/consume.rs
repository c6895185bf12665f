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

use std::{io::Write, str::FromStr, time::{Duration, SystemTime}};

use chrono::DateTime;
use clap::{ArgGroup, Args};
use eventide_store::{Builder, JsonSerializer, client::Connector, partition::TopicAssignment};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{Error, Result};

#[derive(Clone, Debug, Args)]
#[command(group(ArgGroup::new("source").required(true).args(["topic", "assign"])))]
pub(super) struct Arg {
    /// Subscribe to this topic as a member of the consumer group
    #[arg(long)]
    topic: Vec<String>,

    /// Assign every partition of a topic, from a date with topic@2025-01-31T00:00:00Z
    /// or from an offset per partition with topic=12,0,7
    #[arg(long)]
    assign: Vec<Assignment>,

    /// Most records returned by one read
    #[arg(long, default_value = "100")]
    max_count: usize,

    /// How long one read waits for records
    #[arg(long, default_value = "1000")]
    timeout_ms: u64,

    /// Do not commit offsets of the records printed
    #[arg(long)]
    no_ack: bool,

    /// Stop once every assigned partition has been read to its end
    #[arg(long)]
    until_end: bool,
}

/// A topic with where to start reading each of its partitions.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(super) struct Assignment {
    topic: String,
    assignment: TopicAssignment,
}

impl FromStr for Assignment {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some((topic, since)) = s.split_once('@') {
            DateTime::parse_from_rfc3339(since)
                .map(SystemTime::from)
                .map(|since| Self {
                    topic: topic.to_owned(),
                    assignment: TopicAssignment::since(since),
                })
                .map_err(Into::into)
        } else if let Some((topic, offsets)) = s.split_once('=') {
            offsets
                .split(',')
                .map(|offset| offset.trim().parse::<i64>())
                .collect::<Result<Vec<_>, _>>()
                .map(|offsets| Self {
                    topic: topic.to_owned(),
                    assignment: TopicAssignment::offsets(offsets),
                })
                .map_err(Into::into)
        } else {
            Err(Error::Config(format!(
                "{s}: expecting topic@date or topic=offset,..."
            )))
        }
    }
}

impl Arg {
    pub(super) fn run<C>(
        self,
        store: Builder<C, JsonSerializer>,
        output: &mut impl Write,
        token: &CancellationToken,
    ) -> Result<u64>
    where
        C: Connector,
    {
        let store = if self.topic.is_empty() {
            store
        } else {
            store.subscribe(self.topic.iter().cloned())
        };

        let store = self
            .assign
            .iter()
            .cloned()
            .fold(store, |store, Assignment { topic, assignment }| {
                store.assign(topic, assignment)
            })
            .build();

        let timeout = Some(Duration::from_millis(self.timeout_ms));
        let mut printed = 0;

        while !token.is_cancelled() {
            for record in store.read(self.max_count, timeout, !self.no_ack)? {
                serde_json::to_writer(&mut *output, &record?)?;
                writeln!(output)?;
                printed += 1;
            }

            output.flush()?;

            if self.until_end && store.has_reached_end_of_topics()? {
                debug!("reached end of topics");
                break;
            }
        }

        info!(printed);
        store.close();
        Ok(printed)
    }
}

#[cfg(test)]
mod tests {
    use eventide_store::{
        Record, RecordStore,
        config::Configuration,
        memory::{Broker, MemoryConnector},
        partition::TopicPartition,
    };
    use pretty_assertions::assert_eq;
    use url::Url;

    use super::*;

    const TIMEOUT: Option<Duration> = Some(Duration::from_secs(5));

    fn builder(broker: &Broker, service_name: &str) -> Result<Builder<MemoryConnector, JsonSerializer>> {
        Url::parse("tcp://localhost:9092")
            .map(|bootstrap| {
                let configuration = Configuration::builder()
                    .service_name(service_name)
                    .bootstrap_servers([bootstrap])
                    .poll_interval(Duration::from_millis(1))
                    .build();

                RecordStore::builder(broker.connector(), JsonSerializer, configuration)
            })
            .map_err(Into::into)
    }

    fn seed(broker: &Broker) -> Result<()> {
        let store = builder(broker, "checkout")?.build();

        for key in ["o-1", "o-2", "o-3"] {
            _ = store.write_now(&Record::builder("order.created").partition_key(key).build(), "orders", TIMEOUT)?;
        }

        Ok(())
    }

    fn arg(topic: Vec<String>, assign: Vec<Assignment>, no_ack: bool) -> Arg {
        Arg {
            topic,
            assign,
            max_count: 10,
            timeout_ms: 100,
            no_ack,
            until_end: true,
        }
    }

    fn keys(output: &[u8]) -> Result<Vec<String>> {
        output
            .split(|byte| *byte == b'\n')
            .filter(|line| !line.is_empty())
            .map(|line| {
                serde_json::from_slice::<Record>(line)
                    .map(|record| record.partition_key().map(String::from).unwrap_or_default())
                    .map_err(Into::into)
            })
            .collect()
    }

    #[test]
    fn assignment() -> Result<()> {
        assert_eq!(
            Assignment {
                topic: "orders".into(),
                assignment: TopicAssignment::offsets([12, 0, 7]),
            },
            "orders=12,0,7".parse()?
        );

        assert_eq!(
            Assignment {
                topic: "orders".into(),
                assignment: TopicAssignment::since(
                    SystemTime::UNIX_EPOCH + Duration::from_secs(1_738_281_600)
                ),
            },
            "orders@2025-01-31T00:00:00Z".parse()?
        );

        assert!(matches!("orders".parse::<Assignment>(), Err(Error::Config(_))));
        assert!(matches!("orders=x".parse::<Assignment>(), Err(Error::ParseInt(_))));
        assert!(matches!("orders@yesterday".parse::<Assignment>(), Err(Error::Chrono(_))));

        Ok(())
    }

    #[test]
    fn subscribed_until_end() -> Result<()> {
        let broker = Broker::builder().topic("orders", 1).build();
        seed(&broker)?;

        let mut output = Vec::new();
        let printed = arg(vec!["orders".into()], Vec::new(), false).run(
            builder(&broker, "audit")?,
            &mut output,
            &CancellationToken::new(),
        )?;

        assert_eq!(3, printed);
        assert_eq!(vec!["o-1", "o-2", "o-3"], keys(&output)?);
        assert_eq!(Some(3), broker.committed("audit", &TopicPartition::new("orders", 0)));

        Ok(())
    }

    #[test]
    fn assigned_without_ack() -> Result<()> {
        let broker = Broker::builder().topic("orders", 1).build();
        seed(&broker)?;

        let mut output = Vec::new();
        let printed = arg(Vec::new(), vec!["orders=1".parse()?], true).run(
            builder(&broker, "audit")?,
            &mut output,
            &CancellationToken::new(),
        )?;

        assert_eq!(2, printed);
        assert_eq!(vec!["o-2", "o-3"], keys(&output)?);
        assert_eq!(None, broker.committed("audit", &TopicPartition::new("orders", 0)));

        Ok(())
    }

    #[test]
    fn cancelled() -> Result<()> {
        let broker = Broker::builder().topic("orders", 1).build();
        let token = CancellationToken::new();
        token.cancel();

        let mut output = Vec::new();
        let printed = arg(vec!["orders".into()], Vec::new(), false).run(
            builder(&broker, "audit")?,
            &mut output,
            &token,
        )?;

        assert_eq!(0, printed);
        assert!(output.is_empty());

        Ok(())
    }
}
