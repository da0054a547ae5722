//! Output stream multiplexing
//!
//! A single-producer/single-consumer queue of output lines with an explicit
//! completion sentinel. The producer is the subprocess reader task (or the
//! worker pool in parallel mode); the consumer is a poll loop that drains a
//! bounded batch per tick and never blocks.

#![allow(dead_code)]

use std::collections::VecDeque;
use tokio::sync::mpsc::{self, error::TryRecvError};

/// Lines drained per poll
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Lines retained by the consumer-side window
pub const DEFAULT_WINDOW_CAPACITY: usize = 1000;

/// One queue item
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutputEvent {
    Line(String),
    Completed,
}

/// Create a connected sender/receiver pair
pub fn channel() -> (OutputSender, OutputReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        OutputSender { tx },
        OutputReceiver {
            rx,
            completed: false,
            disconnected: false,
        },
    )
}

/// Producing end. Completing consumes it, so the sentinel is sent once.
#[derive(Debug)]
pub struct OutputSender {
    tx: mpsc::UnboundedSender<OutputEvent>,
}

impl OutputSender {
    pub fn line(&self, line: impl Into<String>) -> bool {
        self.tx.send(OutputEvent::Line(line.into())).is_ok()
    }

    /// Line-only handle for secondary producers (worker lanes)
    pub fn lines(&self) -> LineSender {
        LineSender {
            tx: self.tx.clone(),
        }
    }

    /// Append the completion sentinel
    pub fn complete(self) -> bool {
        self.tx.send(OutputEvent::Completed).is_ok()
    }
}

/// Clonable handle that can emit lines but never the sentinel
#[derive(Clone, Debug)]
pub struct LineSender {
    tx: mpsc::UnboundedSender<OutputEvent>,
}

impl LineSender {
    pub fn line(&self, line: impl Into<String>) -> bool {
        self.tx.send(OutputEvent::Line(line.into())).is_ok()
    }
}

/// Lines drained in one poll
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OutputBatch {
    pub lines: Vec<String>,
    pub completed: bool,
}

impl OutputBatch {
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty() && !self.completed
    }
}

/// Consuming end
#[derive(Debug)]
pub struct OutputReceiver {
    rx: mpsc::UnboundedReceiver<OutputEvent>,
    completed: bool,
    disconnected: bool,
}

impl OutputReceiver {
    /// Take up to `max` lines without waiting.
    ///
    /// `completed` is set on the batch in which the sentinel is observed.
    pub fn drain(&mut self, max: usize) -> OutputBatch {
        let mut batch = OutputBatch::default();
        if self.completed {
            return batch;
        }

        while batch.lines.len() < max {
            match self.rx.try_recv() {
                Ok(OutputEvent::Line(line)) => batch.lines.push(line),
                Ok(OutputEvent::Completed) => {
                    self.completed = true;
                    batch.completed = true;
                    break;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.disconnected = true;
                    break;
                }
            }
        }
        batch
    }

    /// Drain everything currently queued, in batches of `batch_size`
    pub fn drain_all(&mut self, batch_size: usize) -> OutputBatch {
        let mut all = OutputBatch::default();
        loop {
            let batch = self.drain(batch_size.max(1));
            let done = batch.lines.len() < batch_size.max(1) || batch.completed;
            all.lines.extend(batch.lines);
            all.completed |= batch.completed;
            if done {
                return all;
            }
        }
    }

    /// Throw away everything queued, returning the number of lines dropped
    pub fn discard(&mut self) -> usize {
        let mut dropped = 0;
        while let Ok(event) = self.rx.try_recv() {
            match event {
                OutputEvent::Line(_) => dropped += 1,
                OutputEvent::Completed => self.completed = true,
            }
        }
        dropped
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Every producer is gone without (yet observed) sentinel
    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }
}

/// Most recent output lines, oldest dropped first
#[derive(Clone, Debug)]
pub struct OutputWindow {
    lines: VecDeque<String>,
    capacity: usize,
}

impl OutputWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(DEFAULT_WINDOW_CAPACITY)),
            capacity: capacity.max(1),
        }
    }

    pub fn extend<I: IntoIterator<Item = String>>(&mut self, lines: I) {
        for line in lines {
            if self.lines.len() == self.capacity {
                self.lines.pop_front();
            }
            self.lines.push_back(line);
        }
    }

    pub fn lines(&self) -> impl Iterator<Item = &String> {
        self.lines.iter()
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }
}

impl Default for OutputWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_and_sentinel_under_small_batches() {
        let (tx, mut rx) = channel();
        tx.line("A");
        tx.line("B");
        tx.line("C");
        tx.complete();

        let mut seen = Vec::new();
        let mut completions = 0;
        for _ in 0..10 {
            let batch = rx.drain(2);
            seen.extend(batch.lines);
            if batch.completed {
                completions += 1;
            }
        }

        assert_eq!(seen, vec!["A", "B", "C"]);
        assert_eq!(completions, 1);
        assert!(rx.is_completed());
    }

    #[test]
    fn test_sentinel_only_after_all_lines() {
        let (tx, mut rx) = channel();
        tx.line("A");
        tx.line("B");
        tx.complete();

        let first = rx.drain(1);
        assert_eq!(first.lines, vec!["A"]);
        assert!(!first.completed);

        let second = rx.drain(1);
        assert_eq!(second.lines, vec!["B"]);
        assert!(!second.completed);

        let third = rx.drain(1);
        assert!(third.lines.is_empty());
        assert!(third.completed);
    }

    #[test]
    fn test_empty_drain_returns_immediately() {
        let (_tx, mut rx) = channel();
        let batch = rx.drain(DEFAULT_BATCH_SIZE);
        assert!(batch.is_empty());
        assert!(!rx.is_disconnected());
    }

    #[test]
    fn test_dropped_producer_is_detected() {
        let (tx, mut rx) = channel();
        tx.line("only");
        drop(tx);

        let batch = rx.drain(10);
        assert_eq!(batch.lines, vec!["only"]);
        assert!(!batch.completed);
        assert!(rx.is_disconnected());
    }

    #[test]
    fn test_line_sender_cannot_complete() {
        let (tx, mut rx) = channel();
        let lanes = tx.lines();
        lanes.line("lane output");
        tx.line("main output");
        tx.complete();
        drop(lanes);

        let batch = rx.drain_all(DEFAULT_BATCH_SIZE);
        assert_eq!(batch.lines, vec!["lane output", "main output"]);
        assert!(batch.completed);
    }

    #[test]
    fn test_drain_all_crosses_batches() {
        let (tx, mut rx) = channel();
        for i in 0..120 {
            tx.line(format!("line {i}"));
        }
        let batch = rx.drain_all(50);
        assert_eq!(batch.lines.len(), 120);
        assert_eq!(batch.lines[119], "line 119");
    }

    #[test]
    fn test_discard() {
        let (tx, mut rx) = channel();
        tx.line("x");
        tx.line("y");
        assert_eq!(rx.discard(), 2);
        assert!(rx.drain(10).is_empty());
    }

    #[test]
    fn test_window_keeps_most_recent() {
        let mut window = OutputWindow::new(3);
        window.extend((1..=5).map(|i| i.to_string()));
        assert_eq!(window.to_vec(), vec!["3", "4", "5"]);
        assert_eq!(window.len(), 3);

        window.clear();
        assert!(window.is_empty());
        assert_eq!(window.capacity(), 3);
    }
}
