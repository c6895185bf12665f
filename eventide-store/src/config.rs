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

//! Record store configuration and the client configurations derived from it.

use std::{
    collections::BTreeMap,
    env,
    fmt::{self, Debug, Formatter},
    marker::PhantomData,
    str::FromStr,
    time::Duration,
};

use tracing::debug;
use url::Url;
use uuid::Uuid;

use crate::{Error, Result};

const DEFAULT_PORT: u16 = 9092;
const DEFAULT_TRANSACTION_TIMEOUT: Duration = Duration::from_millis(60_000);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(5);
const DEFAULT_POLL_BACKOFF: Duration = Duration::from_secs(30);

const REDACTED: &str = "********";

pub const BOOTSTRAP_SERVERS: &str = "bootstrap.servers";
pub const CLIENT_ID: &str = "client.id";
pub const GROUP_ID: &str = "group.id";
pub const TRANSACTIONAL_ID: &str = "transactional.id";
pub const TRANSACTION_TIMEOUT_MS: &str = "transaction.timeout.ms";
pub const ENABLE_IDEMPOTENCE: &str = "enable.idempotence";
pub const ENABLE_AUTO_COMMIT: &str = "enable.auto.commit";
pub const AUTO_OFFSET_RESET: &str = "auto.offset.reset";
pub const ISOLATION_LEVEL: &str = "isolation.level";
pub const SECURITY_PROTOCOL: &str = "security.protocol";
pub const SASL_MECHANISM: &str = "sasl.mechanism";
pub const SASL_USERNAME: &str = "sasl.username";
pub const SASL_PASSWORD: &str = "sasl.password";

/// The three broker clients owned by a record store.
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ClientRole {
    TransactionalProducer,
    ImmediateProducer,
    Consumer,
}

impl FromStr for ClientRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transactional" | "transactional-producer" => Ok(Self::TransactionalProducer),
            "immediate" | "immediate-producer" => Ok(Self::ImmediateProducer),
            "consumer" => Ok(Self::Consumer),
            otherwise => Err(Error::UnknownClientRole(otherwise.to_owned())),
        }
    }
}

/// Configuration handed to a broker client on construction.
#[derive(Clone, Default, Eq, PartialEq)]
pub struct ClientConfig(BTreeMap<String, String>);

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        _ = self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn extend(&mut self, other: &ClientConfig) -> &mut Self {
        self.0
            .extend(other.0.iter().map(|(k, v)| (k.to_owned(), v.to_owned())));
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for ClientConfig
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl Debug for ClientConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.0.iter().map(|(k, v)| {
                if k == SASL_PASSWORD {
                    (k.as_str(), REDACTED)
                } else {
                    (k.as_str(), v.as_str())
                }
            }))
            .finish()
    }
}

#[derive(Clone, Eq, PartialEq)]
struct Credentials {
    username: String,
    password: String,
}

impl Debug for Credentials {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct(stringify!(Credentials))
            .field("username", &self.username)
            .field("password", &REDACTED)
            .finish()
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Configuration {
    service_name: String,
    bootstrap_servers: Vec<Url>,
    group_id: String,
    transactional_id: String,
    transaction_timeout: Duration,
    client_id: String,
    credentials: Option<Credentials>,
    extra: BTreeMap<ClientRole, ClientConfig>,
    poll_interval: Duration,
    poll_backoff: Duration,
}

impl Configuration {
    pub fn builder() -> Builder<PhantomData<String>, PhantomData<Vec<Url>>> {
        Builder::default()
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn transactional_id(&self) -> &str {
        &self.transactional_id
    }

    pub fn transaction_timeout(&self) -> Duration {
        self.transaction_timeout
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn poll_backoff(&self) -> Duration {
        self.poll_backoff
    }

    /// Bootstrap servers as a comma separated list of `host:port`.
    pub fn bootstrap_servers(&self) -> String {
        self.bootstrap_servers
            .iter()
            .map(|url| {
                url.host_str().map_or_else(
                    || url.to_string(),
                    |host| format!("{host}:{}", url.port().unwrap_or(DEFAULT_PORT)),
                )
            })
            .collect::<Vec<_>>()
            .join(",")
    }

    fn common(&self) -> ClientConfig {
        let mut config = ClientConfig::new();

        _ = config
            .set(BOOTSTRAP_SERVERS, self.bootstrap_servers())
            .set(CLIENT_ID, self.client_id.as_str());

        if let Some(ref credentials) = self.credentials {
            _ = config
                .set(SECURITY_PROTOCOL, "sasl_plaintext")
                .set(SASL_MECHANISM, "PLAIN")
                .set(SASL_USERNAME, credentials.username.as_str())
                .set(SASL_PASSWORD, credentials.password.as_str());
        }

        config
    }

    fn with_extra(&self, role: ClientRole, mut config: ClientConfig) -> ClientConfig {
        if let Some(extra) = self.extra.get(&role) {
            _ = config.extend(extra);
        }

        debug!(?role, ?config);
        config
    }

    pub fn transactional_producer(&self) -> ClientConfig {
        let mut config = self.common();

        _ = config
            .set(TRANSACTIONAL_ID, self.transactional_id.as_str())
            .set(
                TRANSACTION_TIMEOUT_MS,
                self.transaction_timeout.as_millis().to_string(),
            );

        self.with_extra(ClientRole::TransactionalProducer, config)
    }

    pub fn immediate_producer(&self) -> ClientConfig {
        let mut config = self.common();
        _ = config.set(ENABLE_IDEMPOTENCE, "true");

        self.with_extra(ClientRole::ImmediateProducer, config)
    }

    pub fn consumer(&self) -> ClientConfig {
        let mut config = self.common();

        _ = config
            .set(GROUP_ID, self.group_id.as_str())
            .set(ENABLE_AUTO_COMMIT, "false")
            .set(AUTO_OFFSET_RESET, "earliest")
            .set(ISOLATION_LEVEL, "read_committed");

        self.with_extra(ClientRole::Consumer, config)
    }
}

fn default_client_id() -> String {
    env::var("HOSTNAME")
        .ok()
        .filter(|hostname| !hostname.is_empty())
        .unwrap_or_else(|| env!("CARGO_PKG_NAME").into())
}

#[derive(Clone, Debug)]
pub struct Builder<S, B> {
    service_name: S,
    bootstrap_servers: B,
    group_id: Option<String>,
    transactional_id: Option<String>,
    transaction_timeout: Option<Duration>,
    client_id: Option<String>,
    credentials: Option<Credentials>,
    extra: BTreeMap<ClientRole, ClientConfig>,
    poll_interval: Duration,
    poll_backoff: Duration,
}

impl Default for Builder<PhantomData<String>, PhantomData<Vec<Url>>> {
    fn default() -> Self {
        Self {
            service_name: Default::default(),
            bootstrap_servers: Default::default(),
            group_id: None,
            transactional_id: None,
            transaction_timeout: None,
            client_id: None,
            credentials: None,
            extra: BTreeMap::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            poll_backoff: DEFAULT_POLL_BACKOFF,
        }
    }
}

impl<S, B> Builder<S, B> {
    pub fn service_name(self, service_name: impl Into<String>) -> Builder<String, B> {
        Builder {
            service_name: service_name.into(),
            bootstrap_servers: self.bootstrap_servers,
            group_id: self.group_id,
            transactional_id: self.transactional_id,
            transaction_timeout: self.transaction_timeout,
            client_id: self.client_id,
            credentials: self.credentials,
            extra: self.extra,
            poll_interval: self.poll_interval,
            poll_backoff: self.poll_backoff,
        }
    }

    pub fn bootstrap_servers(self, bootstrap_servers: impl IntoIterator<Item = Url>) -> Builder<S, Vec<Url>> {
        Builder {
            service_name: self.service_name,
            bootstrap_servers: bootstrap_servers.into_iter().collect(),
            group_id: self.group_id,
            transactional_id: self.transactional_id,
            transaction_timeout: self.transaction_timeout,
            client_id: self.client_id,
            credentials: self.credentials,
            extra: self.extra,
            poll_interval: self.poll_interval,
            poll_backoff: self.poll_backoff,
        }
    }

    pub fn group_id(self, group_id: Option<String>) -> Self {
        Self { group_id, ..self }
    }

    pub fn transactional_id(self, transactional_id: Option<String>) -> Self {
        Self {
            transactional_id,
            ..self
        }
    }

    pub fn transaction_timeout(self, transaction_timeout: Option<Duration>) -> Self {
        Self {
            transaction_timeout,
            ..self
        }
    }

    pub fn client_id(self, client_id: Option<String>) -> Self {
        Self { client_id, ..self }
    }

    /// SASL/PLAIN credentials, applied to every client when both are present.
    pub fn sasl(self, username: Option<String>, password: Option<String>) -> Self {
        let credentials = username
            .zip(password)
            .map(|(username, password)| Credentials { username, password });

        Self {
            credentials,
            ..self
        }
    }

    /// Extra configuration for one client role, merged over the derived defaults.
    pub fn extra<K, V>(mut self, role: ClientRole, config: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        for (key, value) in config {
            _ = self.extra.entry(role).or_default().set(key, value);
        }

        self
    }

    pub fn poll_interval(self, poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            ..self
        }
    }

    pub fn poll_backoff(self, poll_backoff: Duration) -> Self {
        Self {
            poll_backoff,
            ..self
        }
    }
}

impl Builder<String, Vec<Url>> {
    pub fn build(self) -> Configuration {
        let transactional_id = self
            .transactional_id
            .unwrap_or_else(|| format!("{}-{}", self.service_name, Uuid::new_v4()));

        Configuration {
            group_id: self
                .group_id
                .unwrap_or_else(|| self.service_name.clone()),
            service_name: self.service_name,
            bootstrap_servers: self.bootstrap_servers,
            transactional_id,
            transaction_timeout: self
                .transaction_timeout
                .unwrap_or(DEFAULT_TRANSACTION_TIMEOUT),
            client_id: self.client_id.unwrap_or_else(default_client_id),
            credentials: self.credentials,
            extra: self.extra,
            poll_interval: self.poll_interval,
            poll_backoff: self.poll_backoff,
        }
    }
}
