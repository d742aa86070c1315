use std::collections::HashMap;

use time::OffsetDateTime;

use crate::header::Header;

/// At most one header per identity, last write wins.
#[derive(Debug, Clone, Default)]
pub struct HeaderSet {
    headers: HashMap<String, Header>,
}

impl HeaderSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts the header, replacing any previous header with the same identity.
    pub fn add_header(&mut self, header: Header) {
        drop(self.headers.insert(header.id(), header));
    }

    pub fn header_count(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// Headers in no particular order.
    pub fn headers(&self) -> impl Iterator<Item = &Header> {
        self.headers.values()
    }

    /// Headers ordered by identity.
    pub fn sorted_headers(&self) -> Vec<&Header> {
        let mut entries: Vec<(&String, &Header)> = self.headers.iter().collect();
        entries.sort_unstable_by(|(a, _), (b, _)| a.cmp(b));
        entries.into_iter().map(|(_, header)| header).collect()
    }

    /// Drops every header stamped strictly before `cutoff`, returns how many went.
    pub fn remove_headers_older_than(&mut self, cutoff: OffsetDateTime) -> usize {
        let before = self.headers.len();
        self.headers.retain(|_, header| header.timestamp >= cutoff);
        before - self.headers.len()
    }
}
