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

use std::{
    fmt::{self, Debug, Formatter},
    sync::LazyLock,
    vec,
};

use opentelemetry::{KeyValue, metrics::Counter};
use tracing::{debug, error, info, span::EnteredSpan};

use crate::{
    METER, Record, Result, Serializer,
    client::{self, Connector, Message},
};

use super::RecordStore;

static RECORDS_READ: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("eventide_records_read")
        .with_description("records read from a topic")
        .build()
});

/// The records of one [`RecordStore::read`].
///
/// Each record is yielded with its correlation scoped span entered, until
/// the next call to [`next`](Iterator::next). With auto ack, a message is
/// committed when the record following it is asked for, the last one when
/// the iterator is exhausted. The iterator ends after the first error.
pub struct Read<'a, C, S>
where
    C: Connector,
{
    store: &'a RecordStore<C, S>,
    messages: vec::IntoIter<client::Result<Message>>,
    auto_ack: bool,
    unacked: Option<Message>,
    entered: Option<EnteredSpan>,
    done: bool,
}

impl<C, S> Debug for Read<'_, C, S>
where
    C: Connector,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct(stringify!(Read))
            .field("remaining", &self.messages.len())
            .field("auto_ack", &self.auto_ack)
            .field("unacked", &self.unacked)
            .field("done", &self.done)
            .finish()
    }
}

impl<'a, C, S> Read<'a, C, S>
where
    C: Connector,
    S: Serializer,
{
    pub(super) fn new(
        store: &'a RecordStore<C, S>,
        messages: Vec<client::Result<Message>>,
        auto_ack: bool,
    ) -> Self {
        Self {
            store,
            messages: messages.into_iter(),
            auto_ack,
            unacked: None,
            entered: None,
            done: false,
        }
    }

    fn fail(&mut self, error: crate::Error) -> Option<Result<Record>> {
        self.done = true;
        Some(Err(error))
    }
}

impl<C, S> Iterator for Read<'_, C, S>
where
    C: Connector,
    S: Serializer,
{
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        _ = self.entered.take();

        if self.done {
            return None;
        }

        if let Some(message) = self.unacked.take() {
            debug!(%message, "auto ack");

            if let Err(error) = self.store.commit_message(&message) {
                return self.fail(error);
            }
        }

        loop {
            let Some(message) = self.messages.next() else {
                self.done = true;
                return None;
            };

            let message = match message {
                Ok(message) => message,
                Err(error) => {
                    error!(?error, "skipping message");
                    continue;
                }
            };

            let record = match self.store.decode(&message) {
                Ok(record) => record,
                Err(error) => return self.fail(error),
            };

            self.entered = Some(record.span().entered());

            info!(qualified_name = record.qualified_name(), %message, "new record");
            RECORDS_READ.add(1, &[KeyValue::new("topic", message.topic.clone())]);

            if self.auto_ack {
                self.unacked = Some(message);
            }

            return Some(Ok(record));
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.done {
            (0, Some(0))
        } else {
            (0, Some(self.messages.len()))
        }
    }
}
