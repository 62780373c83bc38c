use std::time::{Duration, Instant};

/// Correlation data for one converge invocation. Passed explicitly through
/// every phase; audit rows and events carry its `run_id`.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub profile: String,
    started: Instant,
    deadline: Option<Instant>,
}

impl RunContext {
    pub fn new(profile: impl Into<String>) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            profile: profile.into(),
            started: Instant::now(),
            deadline: None,
        }
    }

    /// Deadline relative to the start of the run. Zero means already expired.
    pub fn cancel_after(mut self, after: Option<Duration>) -> Self {
        self.deadline = after.map(|d| self.started + d);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// True once the deadline has been reached. Consulted only between phases.
    pub fn cancelled(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn span(&self) -> tracing::Span {
        tracing::info_span!("converge", run_id = %self.run_id, profile = %self.profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_deadline_is_already_cancelled() {
        let ctx = RunContext::new("local").cancel_after(Some(Duration::ZERO));
        assert!(ctx.cancelled());
        let open = RunContext::new("local").cancel_after(None);
        assert!(!open.cancelled());
        let far = RunContext::new("local").cancel_after(Some(Duration::from_secs(3600)));
        assert!(!far.cancelled());
    }

    #[test]
    fn run_ids_are_unique() {
        assert_ne!(RunContext::new("a").run_id, RunContext::new("a").run_id);
    }
}
