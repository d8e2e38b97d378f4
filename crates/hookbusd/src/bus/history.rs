//! Bounded chronological event history.

use std::collections::VecDeque;

use hookbus_core::{channel_matches, Envelope, WILDCARD_CHANNEL};

/// Default number of events kept for replay.
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

/// An envelope together with the channel it was published on.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub channel: String,
    pub envelope: Envelope,
}

/// Fixed-capacity ring of published events, oldest evicted first.
#[derive(Debug)]
pub struct HistoryBuffer {
    entries: VecDeque<HistoryEntry>,
    capacity: usize,
}

impl HistoryBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(DEFAULT_HISTORY_CAPACITY)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends an event, evicting the oldest when full.
    pub fn push(&mut self, channel: String, envelope: Envelope) {
        if self.capacity == 0 {
            return;
        }
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(HistoryEntry { channel, envelope });
    }

    /// Returns the most recent `limit` events (all when `None`), oldest first.
    ///
    /// `channel` restricts the result to events published on that channel;
    /// `*` or `None` means every channel.
    pub fn snapshot(&self, limit: Option<usize>, channel: Option<&str>) -> Vec<Envelope> {
        let channel = channel.filter(|c| *c != WILDCARD_CHANNEL);
        let matching: Vec<&HistoryEntry> = self
            .entries
            .iter()
            .filter(|e| channel.map_or(true, |c| e.channel == c))
            .collect();
        take_tail(&matching, limit)
    }

    /// Returns every buffered event visible to a subscriber of `channels`.
    pub fn replay_for<'a, I>(&self, channels: I) -> Vec<Envelope>
    where
        I: IntoIterator<Item = &'a String> + Clone,
    {
        self.entries
            .iter()
            .filter(|e| {
                channels
                    .clone()
                    .into_iter()
                    .any(|sub| channel_matches(sub, &e.channel))
            })
            .map(|e| e.envelope.clone())
            .collect()
    }
}

fn take_tail(entries: &[&HistoryEntry], limit: Option<usize>) -> Vec<Envelope> {
    let skip = limit.map_or(0, |n| entries.len().saturating_sub(n));
    entries
        .iter()
        .skip(skip)
        .map(|e| e.envelope.clone())
        .collect()
}
