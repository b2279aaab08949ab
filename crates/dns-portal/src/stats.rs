use crate::dispatch::{Disposition, DropReason};

/// Running totals, since the server was created.  Restarting the server
/// does not reset them.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct Stats {
    pub answered: u64,
    pub error_replies: u64,
    pub forwarded: u64,
    pub relayed: u64,
    /// Forwarded queries which evicted an unanswered one.
    pub overflows: u64,
    pub dropped: u64,
    pub duplicates: u64,
    pub out_of_window: u64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, disposition: &Disposition) {
        match disposition {
            Disposition::Answered => self.answered += 1,
            Disposition::ErrorReply(_) => self.error_replies += 1,
            Disposition::Forwarded { recycled } => {
                self.forwarded += 1;
                if *recycled {
                    self.overflows += 1;
                }
            }
            Disposition::Relayed => self.relayed += 1,
            Disposition::Dropped(reason) => {
                self.dropped += 1;
                match reason {
                    DropReason::Duplicate => self.duplicates += 1,
                    DropReason::OutOfWindow => self.out_of_window += 1,
                    _ => (),
                }
            }
        }
    }
}
