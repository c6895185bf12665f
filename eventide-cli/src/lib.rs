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

//! Command line producer, consumer and relay over a record store.

use std::{collections::HashMap, env::vars, fmt, io, num::ParseIntError, result, str::FromStr, sync::Arc};

use regex::{Regex, Replacer};

mod cli;
mod otel;

pub use cli::Cli;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    Chrono(#[from] chrono::ParseError),
    Config(String),
    DotEnv(#[from] dotenv::Error),
    ExporterBuild(#[from] opentelemetry_otlp::ExporterBuildError),
    FeatureNotEnabled(&'static str),
    Io(Arc<io::Error>),
    Join(#[from] tokio::task::JoinError),
    Json(Arc<serde_json::Error>),
    OtelSdk(#[from] opentelemetry_sdk::error::OTelSdkError),
    ParseInt(#[from] ParseIntError),
    Record(#[from] eventide_record::Error),
    Regex(#[from] regex::Error),
    Store(Box<eventide_store::Error>),
    Url(#[from] url::ParseError),
}

impl From<eventide_store::Error> for Error {
    fn from(value: eventide_store::Error) -> Self {
        Self::Store(Box::new(value))
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(Arc::new(value))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

pub type Result<T, E = Error> = result::Result<T, E>;

#[derive(Clone, Debug)]
pub struct VarRep(HashMap<String, String>);

impl From<HashMap<String, String>> for VarRep {
    fn from(value: HashMap<String, String>) -> Self {
        Self(value)
    }
}

impl VarRep {
    fn replace(&self, haystack: &str) -> Result<String> {
        Regex::new(r"\$\{(?<var>[^\}]+)\}")
            .map(|re| re.replace_all(haystack, self).into_owned())
            .map_err(Into::into)
    }
}

impl Replacer for &VarRep {
    fn replace_append(&mut self, caps: &regex::Captures<'_>, dst: &mut String) {
        if let Some(value) = caps
            .name("var")
            .and_then(|variable| self.0.get(variable.as_str()))
        {
            dst.push_str(value);
        }
    }
}

/// A command line value with `${VAR}` references expanded from the
/// environment before it is parsed.
#[derive(Clone, Debug)]
pub struct EnvVarExp<T>(T);

impl<T> EnvVarExp<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> FromStr for EnvVarExp<T>
where
    T: FromStr,
    Error: From<<T as FromStr>::Err>,
{
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        VarRep::from(vars().collect::<HashMap<_, _>>())
            .replace(s)
            .and_then(|s| T::from_str(&s).map_err(Into::into))
            .map(|t| Self(t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expansion() -> Result<()> {
        let rep = VarRep::from(HashMap::from([
            ("HOST".to_owned(), "kafka".to_owned()),
            ("PORT".to_owned(), "9092".to_owned()),
        ]));

        assert_eq!("tcp://kafka:9092", rep.replace("tcp://${HOST}:${PORT}")?);
        assert_eq!("tcp://:9092", rep.replace("tcp://${MISSING}:${PORT}")?);
        assert_eq!("tcp://localhost", rep.replace("tcp://localhost")?);

        Ok(())
    }
}
