use tokio::sync::mpsc::{self, error::TryRecvError};

/// Creates the unbounded FIFO that carries raw stdout lines to the poll loop.
///
/// The sender side is cloneable and never blocks; the receiver is the single consumer.
pub fn line_queue() -> (LineSender, LineReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (LineSender { tx }, LineReceiver { rx })
}

#[derive(Debug, Clone)]
pub struct LineSender {
    tx: mpsc::UnboundedSender<String>,
}

impl LineSender {
    /// Enqueues a line. Returns `false` once the receiver has been dropped.
    pub fn push(&self, line: String) -> bool {
        self.tx.send(line).is_ok()
    }
}

#[derive(Debug)]
pub struct LineReceiver {
    rx: mpsc::UnboundedReceiver<String>,
}

impl LineReceiver {
    /// Dequeues the oldest line without waiting.
    ///
    /// `None` means the queue is currently empty, or that every sender is gone and the queue has
    /// been drained.
    pub fn try_pop(&mut self) -> Option<String> {
        match self.rx.try_recv() {
            Ok(line) => Some(line),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }
}
