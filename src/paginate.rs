use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::clock::Clock;
use crate::domain::{Record, SessionHandle};
use crate::error::KiraError;

/// One page of a server-side result set.
pub trait PageSource {
    fn fetch_page(
        &self,
        session: &SessionHandle,
        offset: usize,
        page_size: usize,
    ) -> Result<Value, KiraError>;
}

/// Fixed pause between consecutive requests; the first request goes out immediately.
pub struct RateLimiter {
    interval: Duration,
    clock: Arc<dyn Clock>,
    started: bool,
}

impl RateLimiter {
    pub fn per_second(requests: u32, clock: Arc<dyn Clock>) -> Self {
        let interval = if requests == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs(1) / requests
        };
        Self {
            interval,
            clock,
            started: false,
        }
    }

    pub fn pace(&mut self) {
        if self.started {
            self.clock.sleep(self.interval);
        }
        self.started = true;
    }
}

/// Lazily walks `[0, session.count)` one page at a time.
///
/// Single pass: yielded records are not cached, so the caller persists them as
/// they arrive. The total comes from the session and is never re-queried.
pub struct Paginator<'a, S, P>
where
    S: PageSource,
    P: FnMut(&Value) -> Vec<Record>,
{
    source: &'a S,
    session: SessionHandle,
    page_size: usize,
    offset: usize,
    limiter: RateLimiter,
    parser: P,
    buffered: VecDeque<Record>,
    requests: usize,
    failed: bool,
}

impl<'a, S, P> Paginator<'a, S, P>
where
    S: PageSource,
    P: FnMut(&Value) -> Vec<Record>,
{
    pub fn new(
        source: &'a S,
        session: SessionHandle,
        page_size: usize,
        limiter: RateLimiter,
        parser: P,
    ) -> Self {
        Self {
            source,
            session,
            page_size: page_size.max(1),
            offset: 0,
            limiter,
            parser,
            buffered: VecDeque::new(),
            requests: 0,
            failed: false,
        }
    }

    pub fn requests(&self) -> usize {
        self.requests
    }

    /// Fraction of the result set requested so far.
    pub fn progress(&self) -> f64 {
        if self.session.count == 0 {
            return 1.0;
        }
        (self.offset.min(self.session.count)) as f64 / self.session.count as f64
    }
}

impl<S, P> Iterator for Paginator<'_, S, P>
where
    S: PageSource,
    P: FnMut(&Value) -> Vec<Record>,
{
    type Item = Result<Record, KiraError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.buffered.pop_front() {
                return Some(Ok(record));
            }
            if self.failed || self.offset >= self.session.count {
                return None;
            }
            self.limiter.pace();
            let offset = self.offset;
            self.offset += self.page_size;
            self.requests += 1;
            tracing::debug!(offset, page_size = self.page_size, total = self.session.count, "fetching page");
            match self.source.fetch_page(&self.session, offset, self.page_size) {
                Ok(page) => self.buffered.extend((self.parser)(&page)),
                Err(err) => {
                    self.failed = true;
                    return Some(Err(err));
                }
            }
        }
    }
}
