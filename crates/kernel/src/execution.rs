//! Correlation of iopub traffic with an outstanding execute request.
//!
//! An execution moves `Idle -> Sent -> Streaming -> Complete`, or ends in
//! `Failed`. Only a `status: idle` message whose parent is the outstanding
//! request completes it; everything addressed to another request is dropped.

use std::{sync::LazyLock, time::Duration};

use regex::Regex;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace};

use crate::{
    config::ClientConfig,
    session::{Channels, Session, SessionError},
    status::{KernelStatus, StatusListeners},
    wire::Message,
};

static ANSI_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[;\d]*m").expect("ANSI escape pattern is valid"));

#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("execution did not finish within {0:?}")]
    DeadlineExceeded(Duration),
    #[error("kernel session was shut down during execution")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Idle,
    Sent,
    Streaming,
    Complete,
    Failed,
}

/// What an iopub message contributes to an execution.
#[derive(Debug, Clone, PartialEq)]
pub enum IopubEvent {
    Output(String),
    Status(KernelStatus),
    Ignored,
}

pub fn classify(message: &Message) -> IopubEvent {
    let content = &message.content;
    match message.msg_type() {
        "stream" => content
            .get("text")
            .and_then(Value::as_str)
            .map(|text| IopubEvent::Output(text.to_string()))
            .unwrap_or(IopubEvent::Ignored),
        "execute_result" | "display_data" => content
            .get("data")
            .map(|data| IopubEvent::Output(render_data(data)))
            .unwrap_or(IopubEvent::Ignored),
        "error" => content
            .get("traceback")
            .and_then(Value::as_array)
            .map(|lines| IopubEvent::Output(render_traceback(lines)))
            .unwrap_or(IopubEvent::Ignored),
        "status" => content
            .get("execution_state")
            .and_then(Value::as_str)
            .map(|state| IopubEvent::Status(KernelStatus::from_state(state)))
            .unwrap_or(IopubEvent::Ignored),
        _ => IopubEvent::Ignored,
    }
}

fn render_data(data: &Value) -> String {
    ["text/plain", "text/html"]
        .iter()
        .find_map(|mime| data.get(mime).and_then(Value::as_str))
        .map(str::to_string)
        .unwrap_or_else(|| data.to_string())
}

fn render_traceback(lines: &[Value]) -> String {
    lines
        .iter()
        .filter_map(Value::as_str)
        .map(|line| format!("{}\n", ANSI_ESCAPE.replace_all(line, "")))
        .collect()
}

pub fn execute_request(code: &str) -> Value {
    json!({
        "code": code,
        "silent": false,
        "store_history": true,
        "user_expressions": {},
        "allow_stdin": false,
    })
}

/// The request currently awaiting completion, and the output gathered for it.
#[derive(Debug)]
pub struct OutstandingRequest {
    msg_id: String,
    sent_at: Instant,
    output: String,
    warned: bool,
}

impl OutstandingRequest {
    pub fn new(msg_id: impl Into<String>) -> Self {
        Self {
            msg_id: msg_id.into(),
            sent_at: Instant::now(),
            output: String::new(),
            warned: false,
        }
    }

    pub fn msg_id(&self) -> &str {
        &self.msg_id
    }

    pub fn accepts(&self, message: &Message) -> bool {
        message.parent_msg_id() == Some(self.msg_id.as_str())
    }

    /// Folds one iopub message into the request. Returns `true` once the
    /// kernel reports it idle.
    pub fn absorb(&mut self, message: &Message, listeners: &StatusListeners) -> bool {
        if !self.accepts(message) {
            trace!(msg_type = message.msg_type(), "dropping message for another request");
            return false;
        }

        match classify(message) {
            IopubEvent::Output(text) => {
                self.append(&text);
                false
            }
            IopubEvent::Status(status) => {
                listeners.notify(&status);
                status == KernelStatus::Idle
            }
            IopubEvent::Ignored => false,
        }
    }

    pub fn warn_if_slow(&mut self, threshold: Duration) {
        if self.warned || self.sent_at.elapsed() <= threshold {
            return;
        }
        self.append(&format!(
            "[Warning: Execution is taking longer than expected (>{} seconds). Still running...]",
            threshold.as_secs()
        ));
        self.warned = true;
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn into_output(self) -> String {
        self.output.trim().to_string()
    }

    fn append(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.output.push_str(text);
        if !text.ends_with('\n') {
            self.output.push('\n');
        }
    }
}

/// Runs one piece of code to completion over a session.
pub struct ExecutionTask<'a, C> {
    session: &'a mut Session<C>,
    config: &'a ClientConfig,
    listeners: &'a StatusListeners,
    state: ExecutionState,
}

impl<'a, C: Channels> ExecutionTask<'a, C> {
    pub fn new(
        session: &'a mut Session<C>,
        config: &'a ClientConfig,
        listeners: &'a StatusListeners,
    ) -> Self {
        Self {
            session,
            config,
            listeners,
            state: ExecutionState::Idle,
        }
    }

    pub fn state(&self) -> ExecutionState {
        self.state
    }

    pub async fn run(&mut self, code: &str) -> Result<String, ExecutionError> {
        let result = self.drive(code).await;
        match &result {
            Ok(_) => self.transition(ExecutionState::Complete),
            Err(_) => self.transition(ExecutionState::Failed),
        }
        result
    }

    async fn drive(&mut self, code: &str) -> Result<String, ExecutionError> {
        self.session.drain_iopub(self.config.drain_limit).await;

        let msg_id = self
            .session
            .send_request("execute_request", execute_request(code))
            .await?;
        let mut request = OutstandingRequest::new(msg_id);
        let deadline = self
            .config
            .execution_deadline
            .map(|limit| (request.sent_at + limit, limit));
        self.transition(ExecutionState::Sent);

        match deadline {
            Some((at, limit)) => timeout_at(at, self.session.discard_shell_reply())
                .await
                .map_err(|_| ExecutionError::DeadlineExceeded(limit))??,
            None => self.session.discard_shell_reply().await?,
        }
        self.transition(ExecutionState::Streaming);

        loop {
            request.warn_if_slow(self.config.slow_execution_warning);
            if let Some((at, limit)) = deadline {
                if Instant::now() >= at {
                    return Err(ExecutionError::DeadlineExceeded(limit));
                }
            }

            let Some(message) = self.session.poll_iopub(self.config.poll_interval).await? else {
                continue;
            };
            if request.absorb(&message, self.listeners) {
                return Ok(request.into_output());
            }
        }
    }

    fn transition(&mut self, next: ExecutionState) {
        debug!(from = ?self.state, to = ?next, "execution state");
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        session::fake::{kernel_message, FakeChannels},
        wire::{Header, Signer},
    };
    use googletest::prelude::*;

    fn signer() -> Signer {
        Signer::new("hmac-sha256", "secret")
    }

    fn request_header() -> Header {
        Header::new("execute_request", "session", "user")
    }

    /// A kernel that evaluates everything to `2`.
    fn arithmetic_kernel() -> FakeChannels {
        FakeChannels::new(
            signer(),
            Box::new(|request: &Message| {
                if request.msg_type() != "execute_request" {
                    return Vec::new();
                }
                vec![
                    kernel_message(&request.header, "status", json!({"execution_state": "busy"})),
                    kernel_message(
                        &request.header,
                        "execute_result",
                        json!({"data": {"text/plain": "2"}, "execution_count": 1}),
                    ),
                    kernel_message(&request.header, "status", json!({"execution_state": "idle"})),
                ]
            }),
        )
    }

    #[googletest::test]
    fn stream_text_is_output() {
        let message = kernel_message(&request_header(), "stream", json!({"name": "stdout", "text": "hi\n"}));

        expect_that!(classify(&message), eq(IopubEvent::Output("hi\n".to_string())));
    }

    #[googletest::test]
    fn rich_results_prefer_plain_text_then_html_then_raw() {
        let parent = request_header();
        let plain = kernel_message(
            &parent,
            "execute_result",
            json!({"data": {"text/html": "<b>2</b>", "text/plain": "2"}}),
        );
        let html = kernel_message(&parent, "display_data", json!({"data": {"text/html": "<b>2</b>"}}));
        let raw = kernel_message(&parent, "display_data", json!({"data": {"image/png": "iVBO"}}));

        expect_that!(classify(&plain), eq(IopubEvent::Output("2".to_string())));
        expect_that!(classify(&html), eq(IopubEvent::Output("<b>2</b>".to_string())));
        expect_that!(
            classify(&raw),
            eq(IopubEvent::Output(r#"{"image/png":"iVBO"}"#.to_string()))
        );
    }

    #[googletest::test]
    fn traceback_is_stripped_of_colour_codes() {
        let message = kernel_message(
            &request_header(),
            "error",
            json!({
                "ename": "ZeroDivisionError",
                "evalue": "division by zero",
                "traceback": ["\u{1b}[0;31mZeroDivisionError\u{1b}[0m", "\u{1b}[1;32m1/0\u{1b}[0m"]
            }),
        );

        expect_that!(
            classify(&message),
            eq(IopubEvent::Output("ZeroDivisionError\n1/0\n".to_string()))
        );
    }

    #[googletest::test]
    fn unknown_types_are_ignored() {
        let message = kernel_message(&request_header(), "execute_input", json!({"code": "1+1"}));

        expect_that!(classify(&message), eq(IopubEvent::Ignored));
    }

    #[googletest::test]
    fn only_matching_parent_contributes_output() {
        let a = request_header();
        let b = request_header();
        let listeners = StatusListeners::default();
        let mut request = OutstandingRequest::new(a.msg_id.clone());

        for (parent, text) in [(&a, "a1"), (&b, "b1"), (&a, "a2"), (&b, "b2")] {
            let message = kernel_message(parent, "stream", json!({"text": text}));
            expect_that!(request.absorb(&message, &listeners), eq(false));
        }

        expect_that!(request.into_output(), eq("a1\na2"));
    }

    #[googletest::test]
    fn only_matching_idle_status_completes() {
        let a = request_header();
        let b = request_header();
        let listeners = StatusListeners::default();
        let mut subscription = listeners.subscribe();
        let mut request = OutstandingRequest::new(a.msg_id.clone());

        let busy = kernel_message(&a, "status", json!({"execution_state": "busy"}));
        let foreign_idle = kernel_message(&b, "status", json!({"execution_state": "idle"}));
        let idle = kernel_message(&a, "status", json!({"execution_state": "idle"}));

        expect_that!(request.absorb(&busy, &listeners), eq(false));
        expect_that!(request.absorb(&foreign_idle, &listeners), eq(false));
        expect_that!(request.absorb(&idle, &listeners), eq(true));

        expect_that!(subscription.try_recv(), some(eq(KernelStatus::Busy)));
        expect_that!(subscription.try_recv(), some(eq(KernelStatus::Idle)));
        expect_that!(subscription.try_recv(), none());
    }

    #[googletest::test]
    fn slow_warning_is_added_once() {
        let mut request = OutstandingRequest::new("a");

        request.warn_if_slow(Duration::ZERO);
        std::thread::sleep(Duration::from_millis(2));
        request.warn_if_slow(Duration::ZERO);

        expect_that!(request.output().matches("[Warning:").count(), eq(1));
    }

    #[googletest::test]
    #[tokio::test]
    async fn execution_completes_with_result_on_idle() {
        let mut session = Session::new(arithmetic_kernel(), signer(), "user");
        let config = ClientConfig::default().poll_interval(Duration::from_millis(10));
        let listeners = StatusListeners::default();
        let mut statuses = listeners.subscribe();

        let mut task = ExecutionTask::new(&mut session, &config, &listeners);
        let output = task.run("1+1").await.unwrap();

        expect_that!(output, eq("2"));
        expect_that!(task.state(), eq(ExecutionState::Complete));
        expect_that!(statuses.try_recv(), some(eq(KernelStatus::Busy)));
        expect_that!(statuses.try_recv(), some(eq(KernelStatus::Idle)));

        let sent = &session.channels().sent;
        assert_that!(sent.len(), eq(1));
        expect_that!(sent[0].msg_type(), eq("execute_request"));
        expect_that!(sent[0].content["code"], eq(json!("1+1")));
        expect_that!(sent[0].content["store_history"], eq(json!(true)));
    }

    #[googletest::test]
    #[tokio::test]
    async fn stale_backlog_is_drained_before_sending() {
        let mut channels = arithmetic_kernel();
        let aborted = request_header();
        channels.push_iopub(&kernel_message(&aborted, "stream", json!({"text": "stale 1"})));
        channels.push_iopub(&kernel_message(&aborted, "stream", json!({"text": "stale 2"})));
        let mut session = Session::new(channels, signer(), "user");
        let config = ClientConfig::default().poll_interval(Duration::from_millis(10));
        let listeners = StatusListeners::default();

        let output = ExecutionTask::new(&mut session, &config, &listeners)
            .run("1+1")
            .await
            .unwrap();

        expect_that!(session.channels().backlog_at_send, elements_are![eq(0)]);
        expect_that!(output, not(contains_substring("stale")));
    }

    #[googletest::test]
    #[tokio::test]
    async fn kernel_error_is_returned_as_output() {
        let channels = FakeChannels::new(
            signer(),
            Box::new(|request: &Message| {
                vec![
                    kernel_message(&request.header, "stream", json!({"text": "before\n"})),
                    kernel_message(
                        &request.header,
                        "error",
                        json!({"traceback": ["\u{1b}[0;31mNameError\u{1b}[0m: name 'x' is not defined"]}),
                    ),
                    kernel_message(&request.header, "status", json!({"execution_state": "idle"})),
                ]
            }),
        );
        let mut session = Session::new(channels, signer(), "user");
        let config = ClientConfig::default().poll_interval(Duration::from_millis(10));
        let listeners = StatusListeners::default();

        let output = ExecutionTask::new(&mut session, &config, &listeners)
            .run("x")
            .await
            .unwrap();

        expect_that!(output, eq("before\nNameError: name 'x' is not defined"));
    }

    #[googletest::test]
    #[tokio::test]
    async fn busy_kernel_fails_only_past_the_hard_deadline() {
        let channels = FakeChannels::new(
            signer(),
            Box::new(|request: &Message| {
                vec![kernel_message(&request.header, "status", json!({"execution_state": "busy"}))]
            }),
        );
        let mut session = Session::new(channels, signer(), "user");
        let config = ClientConfig::default()
            .poll_interval(Duration::from_millis(5))
            .execution_deadline(Some(Duration::from_millis(60)));
        let listeners = StatusListeners::default();

        let mut task = ExecutionTask::new(&mut session, &config, &listeners);
        let result = task.run("while True: pass").await;

        expect_that!(
            matches!(result, Err(ExecutionError::DeadlineExceeded(_))),
            eq(true)
        );
        expect_that!(task.state(), eq(ExecutionState::Failed));
    }

    #[googletest::test]
    #[tokio::test]
    async fn slow_execution_keeps_polling_after_warning() {
        let mut session = Session::new(arithmetic_kernel(), signer(), "user");
        let config = ClientConfig::default()
            .poll_interval(Duration::from_millis(5))
            .slow_execution_warning(Duration::ZERO);
        let listeners = StatusListeners::default();

        let output = ExecutionTask::new(&mut session, &config, &listeners)
            .run("1+1")
            .await
            .unwrap();

        expect_that!(output, starts_with("[Warning: Execution is taking longer"));
        expect_that!(output, ends_with("2"));
    }

    #[googletest::test]
    #[tokio::test]
    async fn closed_channels_fail_the_execution() {
        let mut session = Session::new(arithmetic_kernel(), signer(), "user");
        session.close().await;
        let config = ClientConfig::default();
        let listeners = StatusListeners::default();

        let mut task = ExecutionTask::new(&mut session, &config, &listeners);
        let result = task.run("1+1").await;

        expect_that!(
            matches!(result, Err(ExecutionError::Session(SessionError::Closed))),
            eq(true)
        );
        expect_that!(task.state(), eq(ExecutionState::Failed));
    }
}
