//! Inbound frame dispatch.
//!
//! Classification is a pure step: control frames (`ping`/`pong`) are turned
//! into instructions for the connection manager, everything else is handed
//! verbatim to the single registered consumer callback. The router itself
//! holds no state beyond that callback.

use std::sync::Arc;

use tracing::debug;

use crate::message::ServerFrame;

/// Callback invoked with every application frame, in arrival order.
pub type FrameCallback = Arc<dyn Fn(ServerFrame) + Send + Sync>;

/// What the connection manager must do after a frame was routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RouteOutcome {
    /// Server pinged us; reply with a pong immediately.
    ReplyPong,
    /// Our own ping was answered; refresh the liveness signal.
    HeartbeatAck,
    /// Frame was forwarded to the consumer.
    Delivered,
    /// Frame was dropped (unknown discriminant).
    Ignored,
}

/// Routes inbound frames to the single registered consumer.
pub struct FrameRouter {
    handler: FrameCallback,
}

impl FrameRouter {
    pub fn new(handler: FrameCallback) -> Self {
        Self { handler }
    }

    pub(crate) fn route(&self, frame: ServerFrame) -> RouteOutcome {
        match frame {
            ServerFrame::Ping => RouteOutcome::ReplyPong,
            ServerFrame::Pong => RouteOutcome::HeartbeatAck,
            ServerFrame::Unknown => {
                debug!("dropping frame with unknown discriminant");
                RouteOutcome::Ignored
            }
            frame => {
                (self.handler)(frame);
                RouteOutcome::Delivered
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageRef;
    use std::sync::Mutex;

    fn collecting_router() -> (FrameRouter, Arc<Mutex<Vec<ServerFrame>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let router = FrameRouter::new(Arc::new(move |frame| {
            sink.lock().unwrap().push(frame);
        }));
        (router, seen)
    }

    #[test]
    fn control_frames_never_reach_the_consumer() {
        let (router, seen) = collecting_router();
        assert_eq!(router.route(ServerFrame::Ping), RouteOutcome::ReplyPong);
        assert_eq!(router.route(ServerFrame::Pong), RouteOutcome::HeartbeatAck);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn application_frames_are_forwarded_in_order() {
        let (router, seen) = collecting_router();
        let first = ServerFrame::DeleteMessage {
            data: MessageRef {
                message_id: "m1".into(),
            },
        };
        let second = ServerFrame::DeleteMessage {
            data: MessageRef {
                message_id: "m2".into(),
            },
        };
        assert_eq!(router.route(first.clone()), RouteOutcome::Delivered);
        assert_eq!(router.route(second.clone()), RouteOutcome::Delivered);
        assert_eq!(*seen.lock().unwrap(), vec![first, second]);
    }

    #[test]
    fn unknown_frames_are_dropped() {
        let (router, seen) = collecting_router();
        assert_eq!(router.route(ServerFrame::Unknown), RouteOutcome::Ignored);
        assert!(seen.lock().unwrap().is_empty());
    }
}
