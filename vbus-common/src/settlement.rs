use crate::header::Header;
use crate::header_set::HeaderSet;

enum State {
    Settling {
        header_set: HeaderSet,
        countdown: usize,
    },
    Settled,
}

/// Decides when the set of distinct packet identities on a stream has
/// stopped growing.
///
/// Every header that introduces a new identity resets a countdown to twice
/// the number of identities known so far. Headers that repeat a known
/// identity decrement it. The first repeat observed with the countdown at
/// zero settles the detector: the accumulated header set is handed back once
/// and the detector ignores all further input.
///
/// A stream that keeps introducing identities never settles, neither does
/// an empty one.
pub struct SettlementDetector {
    state: State,
}

impl Default for SettlementDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl SettlementDetector {
    pub fn new() -> Self {
        Self {
            state: State::Settling {
                header_set: HeaderSet::new(),
                countdown: 0,
            },
        }
    }

    pub fn has_settled(&self) -> bool {
        matches!(self.state, State::Settled)
    }

    /// Remaining repeats before settlement, `None` once settled.
    pub fn countdown(&self) -> Option<usize> {
        match &self.state {
            State::Settling { countdown, .. } => Some(*countdown),
            State::Settled => None,
        }
    }

    /// Feeds one header. Returns the settled header set on the call that
    /// settles the detector, `None` otherwise.
    pub fn observe(&mut self, header: &Header) -> Option<HeaderSet> {
        let State::Settling {
            header_set,
            countdown,
        } = &mut self.state
        else {
            return None;
        };

        let count_before = header_set.header_count();
        header_set.add_header(header.clone());
        let count_after = header_set.header_count();

        if count_after != count_before {
            *countdown = count_after * 2;
            None
        } else if *countdown > 0 {
            *countdown -= 1;
            None
        } else {
            match std::mem::replace(&mut self.state, State::Settled) {
                State::Settling { header_set, .. } => Some(header_set),
                State::Settled => None,
            }
        }
    }
}
