//! Outbound line queue
//!
//! Handlers never touch sockets. Everything they send is queued here as a
//! rendered line addressed to a connection, and the event loop drains the
//! queue to the writer tasks once the handler returns.

use crate::client::ConnId;
use crate::Message;
use std::collections::VecDeque;

/// A line waiting to be written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub conn: ConnId,
    /// Rendered line without CRLF
    pub line: String,
}

/// Send statistics
#[derive(Debug, Default, Clone)]
pub struct SendStats {
    pub lines_queued: u64,
    pub user_lines: u64,
    pub server_lines: u64,
}

/// Queue of outbound lines
#[derive(Debug, Default)]
pub struct Outbox {
    queue: VecDeque<Outgoing>,
    stats: SendStats,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a line for a user connection
    pub fn to_user(&mut self, conn: ConnId, message: &Message) {
        self.stats.user_lines += 1;
        self.push(conn, message.to_string());
    }

    /// Queue a line for a server link
    pub fn to_server(&mut self, conn: ConnId, message: &Message) {
        self.stats.server_lines += 1;
        self.push(conn, message.to_string());
    }

    /// Queue an already rendered line
    pub fn push(&mut self, conn: ConnId, line: String) {
        self.stats.lines_queued += 1;
        self.queue.push_back(Outgoing { conn, line });
    }

    /// Take everything queued so far
    pub fn drain(&mut self) -> Vec<Outgoing> {
        self.queue.drain(..).collect()
    }

    /// Queued lines for one connection, oldest first (without draining)
    pub fn lines_for(&self, conn: ConnId) -> Vec<&str> {
        self.queue
            .iter()
            .filter(|o| o.conn == conn)
            .map(|o| o.line.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn stats(&self) -> &SendStats {
        &self.stats
    }
}
