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

//! Background polling of the producers owned by a record store.
//!
//! Producers only make progress on buffered sends, and only fire delivery
//! callbacks, when polled. The loop runs on a dedicated thread until the
//! store is closed or the thread that initialized the store has gone.

use std::{
    cmp, io,
    sync::{Arc, LazyLock, Weak},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use opentelemetry::metrics::Counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{METER, client::Producer};

const BACKOFF_SLICE: Duration = Duration::from_millis(100);

thread_local! {
    static OWNER: Arc<()> = Arc::new(());
}

/// A token that stays alive for as long as the calling thread.
pub(crate) fn owner() -> Weak<()> {
    OWNER.with(Arc::downgrade)
}

static POLL_ERRORS: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("eventide_poll_errors")
        .with_description("producer poll errors")
        .build()
});

#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub(crate) enum Exit {
    Cancelled,
    OwnerGone,
}

#[derive(Debug)]
pub(crate) struct PollLoop<P> {
    pub(crate) transactional: Arc<P>,
    pub(crate) immediate: Arc<P>,
    pub(crate) cancellation: CancellationToken,
    pub(crate) owner: Weak<()>,
    pub(crate) interval: Duration,
    pub(crate) backoff: Duration,
}

impl<P> PollLoop<P>
where
    P: Producer,
{
    pub(crate) fn spawn(self) -> io::Result<JoinHandle<Exit>> {
        let id = Uuid::new_v4().simple().to_string();
        let name = format!("eventide-poll-{}", &id[id.len() - 6..]);
        debug!(name);

        thread::Builder::new().name(name).spawn(move || self.run())
    }

    fn exit(&self) -> Option<Exit> {
        if self.cancellation.is_cancelled() {
            Some(Exit::Cancelled)
        } else if self.owner.strong_count() == 0 {
            Some(Exit::OwnerGone)
        } else {
            None
        }
    }

    fn run(self) -> Exit {
        let exit = loop {
            if let Some(exit) = self.exit() {
                break exit;
            }

            if let Err(error) = self
                .immediate
                .poll(self.interval)
                .and_then(|()| self.transactional.poll(self.interval))
            {
                // usually transient, e.g. the broker is unavailable
                warn!(?error, backoff_ms = self.backoff.as_millis() as u64);
                POLL_ERRORS.add(1, &[]);
                self.sleep();
            }
        };

        warn!(?exit, "poll loop stopped");
        exit
    }

    fn sleep(&self) {
        let deadline = Instant::now() + self.backoff;

        while self.exit().is_none() {
            let remaining = deadline.saturating_duration_since(Instant::now());

            if remaining.is_zero() {
                break;
            }

            thread::sleep(cmp::min(remaining, BACKOFF_SLICE));
        }
    }
}
