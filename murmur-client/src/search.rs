//! Paged full-text search within one room
//!
//! A [`SearchContext`] is bound to a single search term: `search` sets it
//! and fetches the first page, `next` resumes from the server's
//! continuation cursor. Each hit is returned with its surrounding context
//! as one time-ordered list of events.

use tracing::debug;

use murmur_protocol::{now_millis, Event, HitContext, SearchHit, SearchResponse, SearchResult};
use murmur_utils::{MurmurError, Result};

use crate::connection::SharedClient;
use crate::session::ConnectionGate;

/// Default number of context events requested on each side of a hit
pub const DEFAULT_SEARCH_LIMIT: usize = 15;

pub struct SearchContext {
    client: SharedClient,
    gate: ConnectionGate,
    room_id: String,
    search_term: Option<String>,
    /// Continuation cursor; empty before the first page and once exhausted
    current_batch: String,
    count: u64,
    exhausted: bool,
    page_limit: usize,
}

impl SearchContext {
    pub fn new(client: SharedClient, gate: ConnectionGate, room_id: impl Into<String>) -> Self {
        Self {
            client,
            gate,
            room_id: room_id.into(),
            search_term: None,
            current_batch: String::new(),
            count: 0,
            exhausted: false,
            page_limit: DEFAULT_SEARCH_LIMIT,
        }
    }

    /// Context size used by [`Self::search_default`] and [`Self::next_default`]
    pub fn with_page_limit(mut self, limit: usize) -> Self {
        self.page_limit = limit;
        self
    }

    /// Configured context size for each side of a hit
    pub fn page_limit(&self) -> usize {
        self.page_limit
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn search_term(&self) -> Option<&str> {
        self.search_term.as_deref()
    }

    pub fn current_batch(&self) -> &str {
        &self.current_batch
    }

    /// Total hit count reported by the first page
    pub fn count(&self) -> u64 {
        self.count
    }

    /// No further pages remain
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Set the term and fetch the first page of hits.
    ///
    /// The term can be set only once per context.
    pub async fn search(&mut self, term: &str, limit: usize) -> Result<Vec<SearchResult>> {
        if let Some(existing) = &self.search_term {
            return Err(MurmurError::SearchTermAlreadySet(existing.clone()));
        }
        self.gate.ensure_connected()?;
        self.search_term = Some(term.to_string());

        let response = self.request(term, "", limit).await?;
        self.count = response
            .as_ref()
            .filter(|r| !r.results.is_empty())
            .map_or(0, |r| r.count);
        let results = self.accept(response);
        debug!(room_id = %self.room_id, term, hits = results.len(), total = self.count, "search started");
        Ok(results)
    }

    /// [`Self::search`] with the configured context size
    pub async fn search_default(&mut self, term: &str) -> Result<Vec<SearchResult>> {
        self.search(term, self.page_limit).await
    }

    /// [`Self::next`] with the configured context size
    pub async fn next_default(&mut self) -> Result<Vec<SearchResult>> {
        self.next(self.page_limit).await
    }

    /// Fetch the page after the last one returned.
    ///
    /// Once the cursor is exhausted this returns an empty list without
    /// contacting the server.
    pub async fn next(&mut self, limit: usize) -> Result<Vec<SearchResult>> {
        let term = self.search_term.clone().ok_or(MurmurError::SearchNotStarted)?;
        if self.exhausted {
            return Ok(Vec::new());
        }
        self.gate.ensure_connected()?;

        let batch = self.current_batch.clone();
        let response = self.request(&term, &batch, limit).await?;
        let results = self.accept(response);
        debug!(room_id = %self.room_id, hits = results.len(), exhausted = self.exhausted, "search page loaded");
        Ok(results)
    }

    async fn request(&self, term: &str, batch: &str, limit: usize) -> Result<Option<SearchResponse>> {
        self.client
            .search(&self.room_id, term, batch, limit, limit)
            .await
            .map_err(MurmurError::into_search_failed)
    }

    /// Advance the cursor past `response` and merge its hits
    fn accept(&mut self, response: Option<SearchResponse>) -> Vec<SearchResult> {
        let Some(response) = response.filter(|r| !r.results.is_empty()) else {
            self.current_batch.clear();
            self.exhausted = true;
            return Vec::new();
        };

        match response.next_batch {
            Some(batch) if !batch.is_empty() => {
                self.current_batch = batch;
                self.exhausted = false;
            }
            _ => {
                self.current_batch.clear();
                self.exhausted = true;
            }
        }

        let now = now_millis();
        response
            .results
            .into_iter()
            .map(|hit| merge_hit(hit, now))
            .collect()
    }
}

/// Flatten a hit into `before ++ [hit] ++ after`, stamped and time-ordered
fn merge_hit(hit: SearchHit, now: i64) -> SearchResult {
    let SearchHit {
        event,
        context: HitContext { before, after },
        token,
    } = hit;

    let mut events = Vec::with_capacity(before.len() + 1 + after.len());
    events.extend(sorted(before, now));
    let mut matched = event.stamped(now);
    matched.matched = true;
    events.push(matched);
    events.extend(sorted(after, now));

    SearchResult { events, token }
}

fn sorted(events: Vec<Event>, now: i64) -> Vec<Event> {
    let mut events: Vec<Event> = events.into_iter().map(|e| e.stamped(now)).collect();
    events.sort_by_key(Event::timestamp);
    events
}
