//! Execution-state machine of a debug session.
//!
//! Resume commands block in Delve until the target stops, so their replies
//! arrive asynchronously and can be overtaken by newer requests. Each
//! dispatched resume is tagged with `(class, epoch)`; only the completion of
//! the most recent dispatch is acted upon.

use godap_delve::types::{FATAL_THROW_ID, UNRECOVERED_PANIC_ID};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResumeClass {
    Continue,
    /// `next`, `step` and `stepOut`.
    Step,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NotStarted,
    Launching,
    Attaching,
    Running { class: ResumeClass, epoch: u64 },
    Halted,
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// The backend is connected and the target is parked.
    Launched,
    Dispatch(ResumeClass),
    Completed {
        class: ResumeClass,
        epoch: u64,
        exited: bool,
        breakpoint_id: Option<i64>,
    },
    /// A `halt` is about to be sent on behalf of `pause`. Any resume still
    /// in flight will be answered by the halt and is no longer reported.
    HaltRequested,
    /// The target stopped for a reason not tied to a resume command.
    Halted(String),
    ConnectionClosed,
    Disconnect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    ResetHandles,
    EmitStopped { reason: String },
    EmitContinued,
    EmitTerminated,
}

/// Stop reason for a completed `continue`.
pub fn stop_reason(breakpoint_id: Option<i64>) -> &'static str {
    match breakpoint_id {
        Some(UNRECOVERED_PANIC_ID) => "panic",
        Some(FATAL_THROW_ID) => "fatal error",
        _ => "breakpoint",
    }
}

pub const NEXT_CANCELLED: &str = "next cancelled";

#[derive(Debug)]
pub struct SessionFsm {
    state: SessionState,
    continue_epoch: u64,
    step_epoch: u64,
    skip_next_stop: bool,
    override_stop_reason: Option<String>,
}

impl Default for SessionFsm {
    fn default() -> Self {
        Self {
            state: SessionState::NotStarted,
            continue_epoch: 0,
            step_epoch: 0,
            skip_next_stop: false,
            override_stop_reason: None,
        }
    }
}

impl SessionFsm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn begin_launch(&mut self) {
        if self.state == SessionState::NotStarted {
            self.state = SessionState::Launching;
        }
    }

    pub fn begin_attach(&mut self) {
        if self.state == SessionState::NotStarted {
            self.state = SessionState::Attaching;
        }
    }

    /// The resume command currently in flight, if any.
    pub fn running(&self) -> Option<ResumeClass> {
        match self.state {
            SessionState::Running { class, .. } => Some(class),
            _ => None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running().is_some()
    }

    pub fn is_terminated(&self) -> bool {
        self.state == SessionState::Terminated
    }

    /// Epoch of the latest dispatch of `class`.
    pub fn epoch(&self, class: ResumeClass) -> u64 {
        match class {
            ResumeClass::Continue => self.continue_epoch,
            ResumeClass::Step => self.step_epoch,
        }
    }

    /// Prepares for a `halt` that interrupts a running target to edit
    /// breakpoints. The stop caused by an interrupted `continue` is not
    /// reported; an interrupted step is reported as cancelled.
    ///
    /// Returns the class that was running.
    pub fn prepare_breakpoint_halt(&mut self) -> Option<ResumeClass> {
        let class = self.running()?;
        match class {
            ResumeClass::Continue => self.skip_next_stop = true,
            ResumeClass::Step => self.override_stop_reason = Some(NEXT_CANCELLED.to_string()),
        }
        Some(class)
    }

    /// Forgets pending stop adjustments after a failed halt.
    pub fn clear_pending(&mut self) {
        self.skip_next_stop = false;
        self.override_stop_reason = None;
    }

    pub fn apply(&mut self, input: Input) -> Vec<Effect> {
        if self.state == SessionState::Terminated {
            return Vec::new();
        }

        match input {
            Input::Launched => {
                if matches!(
                    self.state,
                    SessionState::NotStarted | SessionState::Launching | SessionState::Attaching
                ) {
                    self.state = SessionState::Halted;
                }
                Vec::new()
            }
            Input::Dispatch(class) => {
                let epoch = match class {
                    ResumeClass::Continue => {
                        self.continue_epoch += 1;
                        self.continue_epoch
                    }
                    ResumeClass::Step => {
                        self.step_epoch += 1;
                        self.step_epoch
                    }
                };
                self.state = SessionState::Running { class, epoch };
                match class {
                    ResumeClass::Continue => Vec::new(),
                    ResumeClass::Step => vec![Effect::EmitContinued],
                }
            }
            Input::Completed {
                class,
                epoch,
                exited,
                breakpoint_id,
            } => {
                if self.state != (SessionState::Running { class, epoch }) {
                    tracing::debug!(
                        target: "godap.session",
                        ?class,
                        epoch,
                        state = ?self.state,
                        "ignoring stale resume completion"
                    );
                    return Vec::new();
                }
                if exited {
                    self.state = SessionState::Terminated;
                    self.clear_pending();
                    return vec![Effect::ResetHandles, Effect::EmitTerminated];
                }

                self.state = SessionState::Halted;
                let mut effects = vec![Effect::ResetHandles];
                if std::mem::take(&mut self.skip_next_stop) {
                    self.override_stop_reason = None;
                    return effects;
                }
                let reason = self.override_stop_reason.take().unwrap_or_else(|| match class {
                    ResumeClass::Continue => stop_reason(breakpoint_id).to_string(),
                    ResumeClass::Step => "step".to_string(),
                });
                effects.push(Effect::EmitStopped { reason });
                effects
            }
            Input::HaltRequested => {
                if self.is_running() {
                    self.state = SessionState::Halted;
                }
                Vec::new()
            }
            Input::Halted(reason) => {
                self.state = SessionState::Halted;
                self.clear_pending();
                vec![Effect::ResetHandles, Effect::EmitStopped { reason }]
            }
            Input::ConnectionClosed | Input::Disconnect => {
                self.state = SessionState::Terminated;
                vec![Effect::EmitTerminated]
            }
        }
    }
}
