//! Line length budgeting for batched protocol lines

/// Maximum protocol line length, CRLF included
pub const BUFSIZE: usize = 512;

/// Tracks how many bytes are left on the line being built
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineBudget {
    limit: usize,
    used: usize,
}

impl LineBudget {
    /// Budget of `limit` bytes with `reserved` already spoken for
    pub fn new(limit: usize, reserved: usize) -> Self {
        Self {
            limit,
            used: reserved.min(limit),
        }
    }

    /// Would `len` more bytes fit?
    pub fn fits(&self, len: usize) -> bool {
        self.used + len <= self.limit
    }

    /// Spend `len` bytes; false (and nothing spent) when they don't fit
    pub fn take(&mut self, len: usize) -> bool {
        if self.fits(len) {
            self.used += len;
            true
        } else {
            false
        }
    }

    pub fn remaining(&self) -> usize {
        self.limit - self.used
    }

    /// Start a fresh line with `reserved` bytes of header
    pub fn reset(&mut self, reserved: usize) {
        self.used = reserved.min(self.limit);
    }
}

/// Pack `items` into lines of at most `limit` bytes after a `header_len`
/// byte header, joining items with `sep`. An item longer than a whole line
/// gets a line of its own.
pub fn pack_items<'a, I>(items: I, header_len: usize, limit: usize, sep: char) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut lines = Vec::new();
    let mut current = String::new();
    let mut budget = LineBudget::new(limit, header_len);

    for item in items {
        let cost = item.len() + usize::from(!current.is_empty());
        if !current.is_empty() && !budget.take(cost) {
            lines.push(std::mem::take(&mut current));
            budget.reset(header_len);
        }
        if current.is_empty() {
            budget.take(item.len());
        } else {
            current.push(sep);
        }
        current.push_str(item);
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}
