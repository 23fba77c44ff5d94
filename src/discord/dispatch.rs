use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, trace, warn};

use super::commands::CommandRegistry;
use super::gateway::Outbound;
use super::heartbeat::Heartbeat;
use super::payload::{decode, Frame, Opcode, Payload};
use super::session::{ConnectionState, Session};

const MESSAGE_CREATE: &str = "MESSAGE_CREATE";

/// Handles every inbound frame of one connection.
pub(crate) struct Dispatcher {
    session: Arc<Session>,
    commands: Arc<RwLock<CommandRegistry>>,
    heartbeat: Heartbeat,
    outbound: Outbound,
    prefix: Arc<str>,
}

impl Dispatcher {
    pub(crate) fn new(
        session: Arc<Session>,
        commands: Arc<RwLock<CommandRegistry>>,
        outbound: Outbound,
        prefix: Arc<str>,
    ) -> Self {
        Dispatcher {
            session,
            commands,
            heartbeat: Heartbeat::new(),
            outbound,
            prefix,
        }
    }

    pub(crate) async fn handle(&self, message: Message) {
        match decode(message) {
            Ok(Some(frame)) => self.handle_frame(frame).await,
            Ok(None) => {}
            Err(e) => warn!(error = %e, "dropping undecodable frame"),
        }
    }

    pub(crate) async fn handle_frame(&self, frame: Frame) {
        if let Some(sequence) = frame.s {
            self.session.observe_sequence(sequence).await;
        }

        let Some(op) = frame.opcode() else {
            warn!(op = %frame.op, "dropping frame with unknown opcode");
            return;
        };
        trace!(?op, t = frame.t.as_deref(), s = frame.s, "frame received");

        match op {
            Opcode::Hello => self.on_hello(&frame.d),
            Opcode::Dispatch => self.on_dispatch(frame.t.as_deref(), &frame.d),
            Opcode::Heartbeat => {
                let sequence = self.session.last_sequence().await;
                if let Err(e) = self.outbound.send(&Payload::heartbeat(sequence)).await {
                    warn!(error = %e, "requested heartbeat send failed");
                }
            }
            Opcode::HeartbeatACK => trace!("heartbeat acknowledged"),
            // No resume or re-identify is implemented; the caller reconnects.
            Opcode::Reconnect | Opcode::InvalidSession => {
                warn!(?op, "unhandled session opcode")
            }
            _ => debug!(?op, "ignoring opcode"),
        }
    }

    /// Stops the heartbeat. Called once the receive loop has exited.
    pub(crate) fn shutdown(&self) {
        self.heartbeat.stop();
    }

    #[cfg(test)]
    pub(crate) fn heartbeat(&self) -> &Heartbeat {
        &self.heartbeat
    }

    fn on_hello(&self, d: &Value) {
        #[derive(Deserialize)]
        struct Hello {
            heartbeat_interval: f64,
        }

        let millis = match Hello::deserialize(d) {
            Ok(hello) => hello.heartbeat_interval,
            Err(e) => {
                warn!(error = %e, "HELLO without a usable heartbeat_interval");
                return;
            }
        };
        let interval = match Duration::try_from_secs_f64(millis / 1000.0) {
            Ok(interval) if !interval.is_zero() => interval,
            _ => {
                warn!(millis, "HELLO heartbeat_interval out of range");
                return;
            }
        };

        if !self.session.set_heartbeat_interval(interval) {
            warn!("repeated HELLO on one connection ignored");
            return;
        }
        if !self
            .heartbeat
            .start(self.outbound.clone(), self.session.clone(), interval)
        {
            warn!(interval_ms = interval.as_millis() as u64, "heartbeat not started");
            return;
        }
        if self.session.state() == ConnectionState::Identified {
            self.session.set_state(ConnectionState::Connected);
        }
    }

    fn on_dispatch(&self, event: Option<&str>, d: &Value) {
        if event != Some(MESSAGE_CREATE) {
            trace!(event, "unhandled dispatch event");
            return;
        }
        let Some(content) = d.get("content").and_then(Value::as_str) else {
            return;
        };
        let Some(name) = command_name(content, &self.prefix) else {
            return;
        };

        // Clone the command out so the handler runs without the registry lock.
        let command = self
            .commands
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .lookup(&name)
            .cloned();
        if let Some(command) = command {
            debug!(command = command.name(), "invoking command");
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| command.invoke(d))) {
                error!(
                    command = command.name(),
                    panic = panic_message(&*panic),
                    "command handler panicked"
                );
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

/// The case-folded first token after `prefix`, if `content` starts with it.
fn command_name(content: &str, prefix: &str) -> Option<String> {
    content
        .strip_prefix(prefix)?
        .split_whitespace()
        .next()
        .map(str::to_lowercase)
}
