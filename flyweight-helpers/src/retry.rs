use std::time::Duration;

use tokio::time::Instant;

/// How long to wait for a reply to a transmission, and how many times to try again.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub max_retries: u8,
}

impl RetryPolicy {
    pub fn new(timeout: Duration, max_retries: u8) -> Self {
        Self {
            timeout,
            max_retries,
        }
    }
}

/// What to do next with something awaiting a reply.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Verdict {
    /// Never transmitted.
    Send,
    /// Transmitted and still within the timeout.
    Wait,
    /// Timed out with retries remaining.
    Resend,
    /// Timed out with no retries remaining.
    Exhausted,
}

/// Transmission bookkeeping for one outstanding request.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Attempts {
    sent_at: Option<Instant>,
    retries: u8,
}

impl Attempts {
    pub fn new() -> Self {
        Default::default()
    }

    /// Bookkeeping for something that has just been transmitted for the first time.
    pub fn sent(now: Instant) -> Self {
        Self {
            sent_at: Some(now),
            retries: 0,
        }
    }

    pub fn sent_at(&self) -> Option<Instant> {
        self.sent_at
    }

    /// Number of retransmissions so far, not counting the first transmission.
    pub fn retries(&self) -> u8 {
        self.retries
    }

    pub fn verdict(&self, policy: &RetryPolicy, now: Instant) -> Verdict {
        match self.sent_at {
            None => Verdict::Send,
            Some(sent_at) if now <= sent_at + policy.timeout => Verdict::Wait,
            Some(_) if self.retries < policy.max_retries => Verdict::Resend,
            Some(_) => Verdict::Exhausted,
        }
    }

    pub fn mark_sent(&mut self, now: Instant) {
        if self.sent_at.is_some() {
            self.retries = self.retries.saturating_add(1);
        }
        self.sent_at = Some(now);
    }
}
