//! Per-run orchestration context.

use super::identity::RunIdentity;
use super::watch::PublishWatch;
use crate::cancellation::CancellationToken;
use crate::events::{EventSink, NoOpEventSink};
use serde_json::Value;
use std::sync::Arc;

/// Everything a step needs besides the state bag: identity, cancellation,
/// the event sink and the publish-watch flag.
///
/// Cheap to clone; clones observe the same cancellation and flag.
#[derive(Debug, Clone)]
pub struct RunContext {
    identity: RunIdentity,
    token: Arc<CancellationToken>,
    events: Arc<dyn EventSink>,
    publish_watch: PublishWatch,
}

impl RunContext {
    /// Creates a context with a fresh token and a no-op sink.
    #[must_use]
    pub fn new(build_name: impl Into<String>) -> Self {
        Self {
            identity: RunIdentity::new(build_name),
            token: Arc::new(CancellationToken::new()),
            events: Arc::new(NoOpEventSink),
            publish_watch: PublishWatch::new(),
        }
    }

    /// Uses an externally owned cancellation token.
    #[must_use]
    pub fn with_token(mut self, token: Arc<CancellationToken>) -> Self {
        self.token = token;
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Replaces the identity.
    #[must_use]
    pub fn with_identity(mut self, identity: RunIdentity) -> Self {
        self.identity = identity;
        self
    }

    /// Run identity.
    #[must_use]
    pub fn identity(&self) -> &RunIdentity {
        &self.identity
    }

    /// The cancellation token shared with the driver.
    #[must_use]
    pub fn token(&self) -> &Arc<CancellationToken> {
        &self.token
    }

    /// Requests cancellation of the run.
    pub fn cancel(&self, reason: impl Into<String>) {
        self.token.cancel(reason);
    }

    /// True once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The event sink.
    #[must_use]
    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    /// Emits an event tagged with the run id.
    pub fn emit(&self, event_type: &str, mut data: Value) {
        if let Value::Object(ref mut map) = data {
            map.insert(
                "run_id".to_string(),
                Value::String(self.identity.run_id.to_string()),
            );
        }
        self.events.try_emit(event_type, Some(data));
    }

    /// The publish-watch flag of this run.
    #[must_use]
    pub fn publish_watch(&self) -> &PublishWatch {
        &self.publish_watch
    }

    /// True while a content library publish is being watched.
    ///
    /// A shutdown handler checks this before interrupting the run.
    #[must_use]
    pub fn is_watching_publish(&self) -> bool {
        self.publish_watch.is_active()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;

    #[test]
    fn test_emit_tags_run_id() {
        let sink = Arc::new(CollectingEventSink::new());
        let ctx = RunContext::new("build").with_event_sink(sink.clone());

        ctx.emit("step.started", serde_json::json!({"step": "connect"}));

        let events = sink.events();
        let data = events[0].1.as_ref().unwrap();
        assert_eq!(data["run_id"], ctx.identity().run_id.to_string());
        assert_eq!(data["step"], "connect");
    }

    #[test]
    fn test_clones_share_cancellation() {
        let ctx = RunContext::new("build");
        let clone = ctx.clone();
        ctx.cancel("stop");
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_watch_flag_is_per_run() {
        let a = RunContext::new("a");
        let b = RunContext::new("b");
        let _guard = a.publish_watch().begin();
        assert!(a.is_watching_publish());
        assert!(!b.is_watching_publish());
    }
}
