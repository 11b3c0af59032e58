//! Render Sink
//!
//! The render sink is the boundary between the engine and whatever surface
//! displays cell output. During a pass the scheduler emits, in plan order:
//!
//! 1. `begin_pass` with the plan,
//! 2. one [`RenderFrame`] per cell that rendered or failed,
//! 3. `end_pass` with the [`PassReport`].
//!
//! Payload content is opaque to the engine. Nothing is buffered or diffed:
//! a cell that runs is re-rendered unconditionally.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use super::scheduler::PassReport;

/// Display content produced by a cell's render action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "content", rename_all = "snake_case")]
pub enum RenderPayload {
    Text(String),
    Markdown(String),
    Html(String),
    /// Encoded image or plot, e.g. `image/png`.
    Image { mime: String, data: Vec<u8> },
    /// Structured data (tables, summaries) for the surface to lay out.
    Data(Value),
}

/// Shown in place of a cell's output when it did not run successfully.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ErrorMarker {
    /// The cell's own computation failed.
    Failed { message: String },
    /// The cell was not run because `upstream` failed earlier in the pass.
    Skipped { upstream: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderContent {
    Display(Vec<RenderPayload>),
    Error(ErrorMarker),
}

/// One cell's contribution to the display for one pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderFrame {
    pub pass: u64,
    /// Position of the frame within its pass, starting at 0.
    pub seq: usize,
    pub cell: String,
    pub content: RenderContent,
}

impl RenderFrame {
    pub fn is_error(&self) -> bool {
        matches!(self.content, RenderContent::Error(_))
    }
}

/// Receives display output from the scheduler.
pub trait RenderSink: Send {
    /// A pass is about to execute `plan` (cell names, in order).
    fn begin_pass(&mut self, _pass: u64, _plan: &[String]) {}

    fn render(&mut self, frame: RenderFrame);

    /// The pass has completed.
    fn end_pass(&mut self, _report: &PassReport) {}
}

impl<F> RenderSink for F
where
    F: FnMut(RenderFrame) + Send,
{
    fn render(&mut self, frame: RenderFrame) {
        self(frame)
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl RenderSink for NullSink {
    fn render(&mut self, _frame: RenderFrame) {}
}

/// Keeps every frame and report in memory.
///
/// Clones share the same buffers, so a clone can be handed to the engine
/// while the original is kept for inspection.
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    frames: Arc<Mutex<Vec<RenderFrame>>>,
    reports: Arc<Mutex<Vec<PassReport>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All frames received so far.
    pub fn frames(&self) -> Vec<RenderFrame> {
        self.frames.lock().clone()
    }

    /// Frames of one pass.
    pub fn frames_for_pass(&self, pass: u64) -> Vec<RenderFrame> {
        self.frames
            .lock()
            .iter()
            .filter(|f| f.pass == pass)
            .cloned()
            .collect()
    }

    /// Cell names in the order they were rendered.
    pub fn rendered_cells(&self) -> Vec<String> {
        self.frames.lock().iter().map(|f| f.cell.clone()).collect()
    }

    /// The most recent frame for `cell`.
    pub fn latest(&self, cell: &str) -> Option<RenderFrame> {
        self.frames
            .lock()
            .iter()
            .rev()
            .find(|f| f.cell == cell)
            .cloned()
    }

    /// Completed pass reports.
    pub fn reports(&self) -> Vec<PassReport> {
        self.reports.lock().clone()
    }

    /// Drain frames and reports.
    pub fn clear(&self) {
        self.frames.lock().clear();
        self.reports.lock().clear();
    }
}

impl RenderSink for RecordingSink {
    fn render(&mut self, frame: RenderFrame) {
        self.frames.lock().push(frame);
    }

    fn end_pass(&mut self, report: &PassReport) {
        self.reports.lock().push(report.clone());
    }
}

/// Event forwarded by [`ChannelSink`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SinkEvent {
    PassStarted { pass: u64, plan: Vec<String> },
    Frame(RenderFrame),
    PassFinished(PassReport),
}

/// Forwards everything to an async consumer over an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SinkEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: SinkEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("render channel closed; dropping event");
        }
    }
}

impl RenderSink for ChannelSink {
    fn begin_pass(&mut self, pass: u64, plan: &[String]) {
        self.send(SinkEvent::PassStarted {
            pass,
            plan: plan.to_vec(),
        });
    }

    fn render(&mut self, frame: RenderFrame) {
        self.send(SinkEvent::Frame(frame));
    }

    fn end_pass(&mut self, report: &PassReport) {
        self.send(SinkEvent::PassFinished(report.clone()));
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
