//! Operator alerts.
//!
//! Whenever the observation needs the operator (swing the telescope, flip
//! the calibration diode, retune the receiver) the driving loop dispatches an
//! ordered sequence of [`Alert`]s. Sequences run on their own worker threads
//! so a modal prompt never stalls sampling; when a sequence finishes, its
//! [`Completion`] is posted back over a channel and the loop applies the
//! follow-up on its own thread.

use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

/// Errors from presenting alerts.
#[derive(Error, Debug)]
pub enum AlertError {
    /// The prompt could not be shown or answered.
    #[error("Prompt I/O error: {0}")]
    Io(#[from] io::Error),

    /// The operator went away (input closed).
    #[error("Alert '{0}' was dismissed without confirmation")]
    Dismissed(String),

    /// No worker thread could be started.
    #[error("Failed to start alert worker: {0}")]
    Worker(String),
}

/// A single modal message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    /// Message text
    pub text: String,
    /// Label of the acknowledging button
    pub button: String,
}

impl Alert {
    /// Alert acknowledged with "Close".
    pub fn new(text: impl Into<String>) -> Self {
        Self::with_button(text, "Close")
    }

    /// Alert with a custom button.
    pub fn with_button(text: impl Into<String>, button: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            button: button.into(),
        }
    }
}

/// An instruction followed by a confirmation question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertMessage {
    /// Instruction text
    pub alert: String,
    /// Button acknowledging the instruction
    pub alert_button: String,
    /// Confirmation question
    pub confirmation: String,
    /// Button answering the question
    pub confirmation_button: String,
}

impl AlertMessage {
    /// Instruction with the default "Confirm?" / "Yes" follow-up.
    pub fn new(alert: impl Into<String>) -> Self {
        Self {
            alert: alert.into(),
            alert_button: "Close".to_string(),
            confirmation: "Confirm?".to_string(),
            confirmation_button: "Yes".to_string(),
        }
    }

    /// Replace the confirmation question.
    pub fn confirm(mut self, question: impl Into<String>) -> Self {
        self.confirmation = question.into();
        self
    }

    /// Replace the instruction's button label.
    pub fn button(mut self, label: impl Into<String>) -> Self {
        self.alert_button = label.into();
        self
    }

    /// The two alerts, instruction first.
    pub fn alerts(&self) -> [Alert; 2] {
        [
            Alert::with_button(&self.alert, &self.alert_button),
            Alert::with_button(&self.confirmation, &self.confirmation_button),
        ]
    }
}

/// Presents one alert and blocks until it is acknowledged.
pub trait Prompter: Send + Sync {
    /// Show `alert` and wait for acknowledgement.
    fn prompt(&self, alert: &Alert) -> Result<(), AlertError>;
}

/// Terminal prompter: prints the alert and waits for Enter.
///
/// Prompts from concurrent sequences are shown one at a time.
#[derive(Debug, Default)]
pub struct ConsolePrompter {
    terminal: Mutex<()>,
}

impl ConsolePrompter {
    /// New console prompter.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Prompter for ConsolePrompter {
    fn prompt(&self, alert: &Alert) -> Result<(), AlertError> {
        let _terminal = self.terminal.lock();
        let mut stdout = io::stdout().lock();
        writeln!(stdout)?;
        writeln!(stdout, ">>> {}", alert.text)?;
        write!(stdout, "    [{}] ", alert.button)?;
        stdout.flush()?;
        drop(stdout);

        let mut answer = String::new();
        if io::stdin().lock().read_line(&mut answer)? == 0 {
            return Err(AlertError::Dismissed(alert.text.clone()));
        }
        Ok(())
    }
}

/// Acknowledges everything immediately and remembers what was shown.
#[derive(Debug, Clone, Default)]
pub struct AutoPrompter {
    shown: Arc<Mutex<Vec<Alert>>>,
}

impl AutoPrompter {
    /// New prompter with an empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Alerts shown so far, in order.
    pub fn shown(&self) -> Vec<Alert> {
        self.shown.lock().clone()
    }

    /// Texts of the alerts shown so far.
    pub fn texts(&self) -> Vec<String> {
        self.shown.lock().iter().map(|a| a.text.clone()).collect()
    }
}

impl Prompter for AutoPrompter {
    fn prompt(&self, alert: &Alert) -> Result<(), AlertError> {
        debug!(text = %alert.text, "Auto-acknowledging alert");
        self.shown.lock().push(alert.clone());
        Ok(())
    }
}

/// Identifier of a dispatched sequence.
pub type SequenceId = u64;

/// A finished alert sequence.
#[derive(Debug)]
pub struct Completion<T> {
    /// Sequence identifier returned by [`AlertCoordinator::dispatch`]
    pub id: SequenceId,
    /// Caller-supplied follow-up
    pub tag: T,
    /// `Ok` when every alert was acknowledged
    pub outcome: Result<(), AlertError>,
}

/// Runs alert sequences off the tick loop and collects their completions.
pub struct AlertCoordinator<T> {
    prompter: Arc<dyn Prompter>,
    sender: UnboundedSender<Completion<T>>,
    receiver: UnboundedReceiver<Completion<T>>,
    next_id: SequenceId,
    in_flight: usize,
}

impl<T: Send + 'static> AlertCoordinator<T> {
    /// Coordinator presenting alerts through `prompter`.
    pub fn new(prompter: Arc<dyn Prompter>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            prompter,
            sender,
            receiver,
            next_id: 0,
            in_flight: 0,
        }
    }

    /// Start presenting `alerts` in order on a worker thread.
    ///
    /// Returns immediately. The completion carrying `tag` arrives through
    /// [`AlertCoordinator::drain`] or [`AlertCoordinator::next_completion`].
    pub fn dispatch(&mut self, alerts: Vec<Alert>, tag: T) -> Result<SequenceId, AlertError> {
        let id = self.next_id;
        self.next_id += 1;
        let prompter = Arc::clone(&self.prompter);
        let sender = self.sender.clone();
        let count = alerts.len();

        thread::Builder::new()
            .name(format!("alert-{}", id))
            .spawn(move || {
                let outcome = alerts.iter().try_for_each(|alert| prompter.prompt(alert));
                if let Err(err) = &outcome {
                    warn!(sequence = id, error = %err, "Alert sequence failed");
                }
                if sender.send(Completion { id, tag, outcome }).is_err() {
                    debug!(sequence = id, "Alert completion dropped, coordinator gone");
                }
            })
            .map_err(|err| AlertError::Worker(err.to_string()))?;

        self.in_flight += 1;
        info!(sequence = id, alerts = count, "Alert sequence dispatched");
        Ok(id)
    }

    /// Every completion that has arrived, without waiting.
    pub fn drain(&mut self) -> Vec<Completion<T>> {
        let mut done = Vec::new();
        while let Ok(completion) = self.receiver.try_recv() {
            done.push(completion);
        }
        self.in_flight -= done.len().min(self.in_flight);
        done
    }

    /// Wait for the next completion.
    pub async fn next_completion(&mut self) -> Option<Completion<T>> {
        let completion = self.receiver.recv().await;
        if completion.is_some() {
            self.in_flight = self.in_flight.saturating_sub(1);
        }
        completion
    }

    /// Sequences dispatched and not yet drained.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }
}

/// Outcome shown after a logged operator task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Still waiting
    Pending,
    /// Finished successfully
    Done,
    /// Finished unsuccessfully
    Failed,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending..."),
            TaskStatus::Done => write!(f, "done!"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Operator-facing log line whose status is filled in later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogTask {
    message: String,
    sidereal: Option<String>,
    status: Option<TaskStatus>,
}

impl LogTask {
    /// Task with no status shown yet.
    pub fn new(message: impl Into<String>, sidereal: Option<String>) -> Self {
        Self {
            message: message.into(),
            sidereal,
            status: None,
        }
    }

    /// Update the status suffix.
    pub fn set_status(&mut self, status: TaskStatus) {
        self.status = Some(status);
    }

    /// Update the sidereal prefix.
    pub fn set_sidereal(&mut self, sidereal: impl Into<String>) {
        self.sidereal = Some(sidereal.into());
    }

    /// Current status.
    pub fn status(&self) -> Option<TaskStatus> {
        self.status
    }

    /// `[HH:MM:SS] message status`
    pub fn line(&self) -> String {
        let mut line = String::new();
        if let Some(sidereal) = &self.sidereal {
            line.push_str(&format!("[{}] ", sidereal));
        }
        line.push_str(&self.message);
        if let Some(status) = self.status {
            line.push_str(&format!(" {}", status));
        }
        line
    }
}

impl std::fmt::Display for LogTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.line())
    }
}
