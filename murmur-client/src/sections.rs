//! Event section grouping
//!
//! Turns a flat event sequence into display sections: runs of events that
//! share a `content.msgtype` and sit within the debounce duration of their
//! neighbour. Sections are ordered newest first.
//!
//! Live events enter through [`SectionGrouper::append`] and grow the front
//! of the list; history pages enter through [`SectionGrouper::prepend`] and
//! grow the back.

use murmur_protocol::{Event, EventSection};
use serde::Serialize;

/// Default maximum gap between two events of one section
pub const DEFAULT_DEBOUNCE_MS: u64 = 60_000;

/// Pure grouping rules, parameterised by the debounce duration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionGrouper {
    debounce_ms: u64,
}

impl Default for SectionGrouper {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE_MS)
    }
}

impl SectionGrouper {
    pub fn new(debounce_ms: u64) -> Self {
        Self { debounce_ms }
    }

    pub fn debounce_ms(&self) -> u64 {
        self.debounce_ms
    }

    /// Change the debounce duration for subsequent grouping calls.
    ///
    /// Sections built earlier are not regrouped.
    pub fn set_debounce_duration(&mut self, debounce_ms: u64) {
        self.debounce_ms = debounce_ms;
    }

    fn joins(&self, event: &Event, boundary: &Event) -> bool {
        let gap = (event.timestamp() - boundary.timestamp()).unsigned_abs();
        gap <= self.debounce_ms && event.msgtype() == boundary.msgtype()
    }

    /// Add newer events to the front of `sections`.
    ///
    /// Each event is compared with the newest event of section 0. On a merge
    /// the event becomes that section's first element and the section key
    /// moves to the event's timestamp.
    pub fn append<I>(&self, events: I, mut sections: Vec<EventSection>) -> Vec<EventSection>
    where
        I: IntoIterator<Item = Event>,
    {
        for event in events {
            let merges = sections
                .first()
                .and_then(EventSection::first)
                .is_some_and(|boundary| self.joins(&event, boundary));

            if merges {
                let newest = &mut sections[0];
                newest.key = event.timestamp();
                newest.data.insert(0, event);
            } else {
                sections.insert(0, EventSection::new(event));
            }
        }
        sections
    }

    /// Add older events to the back of `sections`.
    ///
    /// Each event is compared with the oldest event of the last section. On a
    /// merge the event is pushed to the end of that section; the key keeps
    /// naming the section's newest event.
    pub fn prepend<I>(&self, events: I, mut sections: Vec<EventSection>) -> Vec<EventSection>
    where
        I: IntoIterator<Item = Event>,
    {
        for event in events {
            match sections.last_mut() {
                Some(oldest) if oldest.last().is_some_and(|b| self.joins(&event, b)) => {
                    oldest.data.push(event);
                }
                _ => sections.push(EventSection::new(event)),
            }
        }
        sections
    }
}

/// Sections of one room timeline, grown from both ends
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct EventStream {
    #[serde(skip)]
    grouper: SectionGrouper,
    sections: Vec<EventSection>,
}

impl EventStream {
    pub fn new(grouper: SectionGrouper) -> Self {
        Self {
            grouper,
            sections: Vec::new(),
        }
    }

    pub fn with_debounce(debounce_ms: u64) -> Self {
        Self::new(SectionGrouper::new(debounce_ms))
    }

    /// Group newly received live events into the stream
    pub fn append<I>(&mut self, events: I) -> &[EventSection]
    where
        I: IntoIterator<Item = Event>,
    {
        let sections = std::mem::take(&mut self.sections);
        self.sections = self.grouper.append(events, sections);
        &self.sections
    }

    /// Group a page of older history into the stream
    pub fn prepend<I>(&mut self, events: I) -> &[EventSection]
    where
        I: IntoIterator<Item = Event>,
    {
        let sections = std::mem::take(&mut self.sections);
        self.sections = self.grouper.prepend(events, sections);
        &self.sections
    }

    pub fn sections(&self) -> &[EventSection] {
        &self.sections
    }

    pub fn set_debounce_duration(&mut self, debounce_ms: u64) {
        self.grouper.set_debounce_duration(debounce_ms);
    }

    pub fn debounce_ms(&self) -> u64 {
        self.grouper.debounce_ms()
    }

    /// Number of sections
    pub fn len(&self) -> usize {
        self.sections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// Number of events across all sections
    pub fn event_count(&self) -> usize {
        self.sections.iter().map(EventSection::len).sum()
    }

    pub fn into_sections(self) -> Vec<EventSection> {
        self.sections
    }
}
