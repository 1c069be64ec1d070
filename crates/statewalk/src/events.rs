use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RuntimeEvent {
    pub sequence_no: u64,
    pub timestamp: String,
    pub kind: RuntimeEventKind,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum RuntimeEventKind {
    Traversal(TraversalEvent),
    Node(NodeEvent),
    Task(TaskEvent),
    Progress(ProgressEvent),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TraversalEvent {
    Started {
        run_id: String,
        graph_id: String,
        node_count: usize,
    },
    Completed {
        run_id: String,
        graph_id: String,
        executed: usize,
        failed: usize,
    },
    Interrupted {
        run_id: String,
        graph_id: String,
    },
    Failed {
        run_id: String,
        graph_id: String,
        reason: String,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeEvent {
    Started {
        run_id: String,
        node: String,
    },
    Completed {
        run_id: String,
        node: String,
        status: String,
        notes: Option<String>,
    },
    Skipped {
        run_id: String,
        node: String,
    },
    Rerun {
        run_id: String,
        node: String,
        object: String,
    },
    Cleaned {
        run_id: String,
        node: String,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskEvent {
    Started {
        run_id: String,
        task: String,
        object: String,
        action: String,
    },
    Completed {
        run_id: String,
        task: String,
        object: String,
        status: String,
        notes: Option<String>,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgressEvent {
    Reported {
        run_id: String,
        finished: usize,
        total: usize,
    },
}

pub trait RuntimeEventObserver: Send + Sync {
    fn on_event(&self, event: &RuntimeEvent);
}

impl<F> RuntimeEventObserver for F
where
    F: Fn(&RuntimeEvent) + Send + Sync,
{
    fn on_event(&self, event: &RuntimeEvent) {
        self(event);
    }
}

pub type SharedRuntimeEventObserver = Arc<dyn RuntimeEventObserver>;
pub type RuntimeEventSender = mpsc::UnboundedSender<RuntimeEvent>;
pub type RuntimeEventReceiver = mpsc::UnboundedReceiver<RuntimeEvent>;

#[derive(Clone, Default)]
pub struct RuntimeEventSink {
    observer: Option<SharedRuntimeEventObserver>,
    sender: Option<RuntimeEventSender>,
}

impl RuntimeEventSink {
    pub fn with_observer(observer: SharedRuntimeEventObserver) -> Self {
        Self {
            observer: Some(observer),
            sender: None,
        }
    }

    pub fn with_sender(sender: RuntimeEventSender) -> Self {
        Self {
            observer: None,
            sender: Some(sender),
        }
    }

    pub fn observer(mut self, observer: SharedRuntimeEventObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn sender(mut self, sender: RuntimeEventSender) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.observer.is_some() || self.sender.is_some()
    }

    pub fn emit(&self, event: RuntimeEvent) {
        if let Some(observer) = self.observer.as_ref() {
            observer.on_event(&event);
        }
        if let Some(sender) = self.sender.as_ref() {
            let _ = sender.send(event);
        }
    }
}

pub fn runtime_event_channel() -> (RuntimeEventSender, RuntimeEventReceiver) {
    mpsc::unbounded_channel()
}

/// Stamps events of one run with a monotonically increasing sequence number.
pub(crate) struct EventEmitter {
    sink: RuntimeEventSink,
    sequence_no: u64,
}

impl EventEmitter {
    pub(crate) fn new(sink: RuntimeEventSink) -> Self {
        Self {
            sink,
            sequence_no: 0,
        }
    }

    pub(crate) fn emit(&mut self, kind: RuntimeEventKind) {
        if !self.sink.is_enabled() {
            return;
        }
        self.sequence_no += 1;
        self.sink.emit(RuntimeEvent {
            sequence_no: self.sequence_no,
            timestamp: timestamp_now(),
            kind,
        });
    }
}

fn timestamp_now() -> String {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!(
        "{}.{:03}Z",
        since_epoch.as_secs(),
        since_epoch.subsec_millis()
    )
}
