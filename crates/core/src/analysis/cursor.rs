//! Monotonic address cursor shared by the scanning passes.

/// Outcome of [`Cursor::visit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    Fresh,
    /// The address was at or before the last visited one; the cursor was
    /// pushed one byte past the last visit instead.
    Revisit,
}

/// Tracks the scan position and the last visited address inside `[start, end)`.
///
/// Invariant: every accepted visit is strictly greater than the previous one,
/// and `current` never moves backwards. Composite items (arrays, long
/// instructions) can otherwise hand the same address back to a pass forever.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    end: u64,
    current: u64,
    last: Option<u64>,
}

impl Cursor {
    pub fn new(start: u64, end: u64) -> Self {
        Self { end, current: start, last: None }
    }

    pub fn current(&self) -> u64 {
        self.current
    }

    pub fn is_exhausted(&self) -> bool {
        self.current >= self.end
    }

    /// Record a visit to `ea`, or force-advance past the last visit.
    pub fn visit(&mut self, ea: u64) -> Visit {
        match self.last {
            Some(last) if ea <= last => {
                self.current = self.current.max(last.saturating_add(1));
                Visit::Revisit
            }
            _ => {
                self.last = Some(ea);
                self.current = self.current.max(ea);
                Visit::Fresh
            }
        }
    }

    /// Move the scan position forward; never backwards.
    pub fn seek(&mut self, ea: u64) {
        self.current = self.current.max(ea);
    }

    /// Jump to the end of the range.
    pub fn finish(&mut self) {
        self.current = self.current.max(self.end);
    }
}
