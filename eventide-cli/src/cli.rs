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

use std::{process, time::Duration};

use clap::{Args, Parser, Subcommand};
use eventide_store::{
    Builder, JsonSerializer, RecordStore,
    client::Connector,
    config::{ClientRole, Configuration},
};
use tokio::{
    signal::unix::{SignalKind, signal},
    task,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::{EnvVarExp, Error, Result, otel};

mod consume;
mod produce;
mod relay;

const DEFAULT_BROKER: &str = "tcp://localhost:9092";

#[derive(Clone, Debug, Parser)]
#[command(name = "eventide", version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,

    #[clap(flatten)]
    options: Options,
}

#[derive(Clone, Debug, Subcommand)]
enum Command {
    /// Write JSON records read from stdin, one per line
    Produce(produce::Arg),

    /// Print records as JSON, one per line
    Consume(consume::Arg),

    /// Copy records from one topic to another, exactly once
    Relay(relay::Arg),
}

impl Command {
    fn run<C>(self, store: Builder<C, JsonSerializer>, token: &CancellationToken) -> Result<u64>
    where
        C: Connector,
    {
        match self {
            Self::Produce(arg) => arg.run(store.build(), &mut std::io::stdin().lock()),
            Self::Consume(arg) => arg.run(store, &mut std::io::stdout().lock(), token),
            Self::Relay(arg) => arg.run(store, token),
        }
    }
}

/// Options shared by every command.
#[derive(Clone, Debug, Args)]
pub(crate) struct Options {
    /// Kafka bootstrap servers
    #[arg(
        long,
        global = true,
        env = "BOOTSTRAP_SERVERS",
        default_value = DEFAULT_BROKER,
        value_delimiter = ','
    )]
    bootstrap_server: Vec<EnvVarExp<Url>>,

    /// Names the consumer group and transactional id unless given explicitly
    #[arg(long, global = true, env = "SERVICE_NAME", default_value = env!("CARGO_PKG_NAME"))]
    service_name: String,

    #[arg(long, global = true, env = "GROUP_ID")]
    group_id: Option<String>,

    #[arg(long, global = true, env = "TRANSACTIONAL_ID")]
    transactional_id: Option<String>,

    #[arg(long, global = true, env = "TRANSACTION_TIMEOUT_MS")]
    transaction_timeout_ms: Option<u64>,

    #[arg(long, global = true, env = "SASL_USERNAME")]
    sasl_username: Option<String>,

    #[arg(long, global = true, env = "SASL_PASSWORD", hide_env_values = true)]
    sasl_password: Option<String>,

    /// Client configuration as role:key=value, the role being one of
    /// transactional, immediate or consumer
    #[arg(long = "config", global = true, value_parser = client_property)]
    client_properties: Vec<(ClientRole, String, String)>,

    /// OTEL Exporter OTLP endpoint
    #[arg(long, global = true, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    otlp_endpoint_url: Option<EnvVarExp<Url>>,
}

fn client_property(s: &str) -> Result<(ClientRole, String, String)> {
    let (role, property) = s
        .split_once(':')
        .ok_or_else(|| Error::Config(format!("{s}: expecting role:key=value")))?;

    let (key, value) = property
        .split_once('=')
        .filter(|(key, _)| !key.is_empty())
        .ok_or_else(|| Error::Config(format!("{s}: expecting role:key=value")))?;

    role.parse()
        .map(|role| (role, key.to_owned(), value.to_owned()))
        .map_err(Into::into)
}

impl Options {
    pub(crate) fn configuration(&self) -> Configuration {
        let builder = Configuration::builder()
            .service_name(self.service_name.as_str())
            .bootstrap_servers(
                self.bootstrap_server
                    .iter()
                    .cloned()
                    .map(EnvVarExp::into_inner),
            )
            .group_id(self.group_id.clone())
            .transactional_id(self.transactional_id.clone())
            .transaction_timeout(self.transaction_timeout_ms.map(Duration::from_millis))
            .sasl(self.sasl_username.clone(), self.sasl_password.clone());

        self.client_properties
            .iter()
            .fold(builder, |builder, (role, key, value)| {
                builder.extra(*role, [(key.as_str(), value.as_str())])
            })
            .build()
    }
}

impl Cli {
    pub async fn main() -> Result<()> {
        debug!(pid = process::id());

        let cli = Cli::parse();

        #[cfg(feature = "kafka")]
        {
            cli.run(eventide_store::kafka::KafkaConnector).await
        }

        #[cfg(not(feature = "kafka"))]
        {
            debug!(?cli);
            Err(Error::FeatureNotEnabled("kafka"))
        }
    }

    /// Run the command with clients built by `connector`, until it completes
    /// or the process is interrupted.
    pub async fn run<C>(self, connector: C) -> Result<()>
    where
        C: Connector,
    {
        let meter_provider = self
            .options
            .otlp_endpoint_url
            .clone()
            .map(|otlp_endpoint_url| {
                otel::meter_provider(otlp_endpoint_url.into_inner(), self.options.service_name.as_str())
            })
            .transpose()?;

        let store = RecordStore::builder(connector, JsonSerializer, self.options.configuration());

        let token = CancellationToken::new();
        let command = self.command;

        let mut worker = {
            let token = token.clone();
            task::spawn_blocking(move || command.run(store, &token))
        };

        let mut interrupt_signal = signal(SignalKind::interrupt())?;
        debug!(?interrupt_signal);

        let mut terminate_signal = signal(SignalKind::terminate())?;
        debug!(?terminate_signal);

        let outcome = tokio::select! {
            completed = &mut worker => completed?,

            interrupt = interrupt_signal.recv() => {
                debug!(?interrupt);
                token.cancel();
                worker.await?
            }

            terminate = terminate_signal.recv() => {
                debug!(?terminate);
                token.cancel();
                worker.await?
            }
        };

        if let Some(meter_provider) = meter_provider {
            meter_provider.shutdown()?;
        }

        outcome.map(|count| debug!(count))
    }
}
