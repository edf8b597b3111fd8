use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::engine::models::{FileOutcome, Module, Operation};

// Everything the engine tells the UI while a bulk operation runs.
#[derive(Clone, Debug, PartialEq)]
pub enum ProgressEvent {
    OperationStarted {
        module: Module,
        operation: Operation,
        total_files: usize,
    },
    FileStarted {
        module: Module,
        file: String,
        index: usize,
        total_files: usize,
        size: u64,
    },
    Bytes {
        module: Module,
        file: String,
        downloaded: u64,
        total: Option<u64>,
        progress: f32,
    },
    FileFinished {
        module: Module,
        file: String,
        outcome: FileOutcome,
    },
    FileBroken {
        module: Module,
        file: String,
    },
    OperationFinished {
        module: Module,
        operation: Operation,
        success: bool,
    },
}

/// Receiver side of the progress channel. Fired from the worker running the operation.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

impl ProgressSink for mpsc::UnboundedSender<ProgressEvent> {
    fn emit(&self, event: ProgressEvent) {
        // A dropped receiver only means nobody is watching.
        let _ = self.send(event);
    }
}

/// Discards every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn emit(&self, _event: ProgressEvent) {}
}

/// Keeps every event in memory; handy for headless callers and tests.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl ProgressSink for RecordingSink {
    fn emit(&self, event: ProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
