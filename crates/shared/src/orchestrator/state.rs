use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    Idle,
    Retrieving,
    Generating,
    Validating,
    Retrying,
    Succeeded,
    Fallback,
    Persisting,
    Done,
}

impl QueryState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Retrieving => "retrieving",
            Self::Generating => "generating",
            Self::Validating => "validating",
            Self::Retrying => "retrying",
            Self::Succeeded => "succeeded",
            Self::Fallback => "fallback",
            Self::Persisting => "persisting",
            Self::Done => "done",
        }
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        use QueryState::*;

        matches!(
            (self, next),
            (Idle, Retrieving)
                | (Retrieving, Generating)
                | (Generating, Validating)
                | (Generating, Retrying)
                | (Generating, Fallback)
                | (Generating, Done)
                | (Validating, Succeeded)
                | (Validating, Retrying)
                | (Validating, Fallback)
                | (Retrying, Generating)
                | (Succeeded, Persisting)
                | (Succeeded, Done)
                | (Fallback, Persisting)
                | (Fallback, Done)
                | (Persisting, Done)
        )
    }
}

/// Tracks one query through its states and logs every transition.
#[derive(Debug)]
pub(crate) struct QueryLifecycle<'a> {
    state: QueryState,
    attempt: u32,
    session_id: Option<&'a str>,
}

impl<'a> QueryLifecycle<'a> {
    pub(crate) fn new(session_id: Option<&'a str>) -> Self {
        Self {
            state: QueryState::Idle,
            attempt: 0,
            session_id,
        }
    }

    pub(crate) fn attempt(&self) -> u32 {
        self.attempt
    }

    pub(crate) fn begin_attempt(&mut self) -> u32 {
        self.attempt = self.attempt.saturating_add(1);
        self.advance(QueryState::Generating);
        self.attempt
    }

    pub(crate) fn advance(&mut self, next: QueryState) {
        if !self.state.can_transition_to(next) {
            warn!(
                session_id = self.session_id.unwrap_or("-"),
                from = self.state.as_str(),
                to = next.as_str(),
                "unexpected query state transition"
            );
        }

        debug!(
            session_id = self.session_id.unwrap_or("-"),
            attempt = self.attempt,
            from = self.state.as_str(),
            to = next.as_str(),
            "query state transition"
        );
        self.state = next;
    }
}
