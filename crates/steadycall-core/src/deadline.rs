//! Caller-side deadline and cancellation propagated into every suspension point.

use std::future::{pending, Future};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::failure::CallError;

/// Optional absolute deadline plus optional cooperative cancellation signal.
///
/// The default value never expires and is never cancelled.
#[derive(Debug, Clone, Default)]
pub struct Deadline {
    at: Option<Instant>,
    token: Option<CancellationToken>,
}

impl Deadline {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn after(budget: Duration) -> Self {
        Self {
            at: Some(Instant::now() + budget),
            token: None,
        }
    }

    pub fn at(instant: Instant) -> Self {
        Self {
            at: Some(instant),
            token: None,
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_some_and(|remaining| remaining.is_zero())
    }

    pub fn is_cancelled(&self) -> bool {
        self.token
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }

    /// Fails fast when the budget is already spent.
    pub fn check(&self) -> Result<(), CallError> {
        if self.is_cancelled() {
            return Err(cancelled_by_caller());
        }
        if self.is_expired() {
            return Err(deadline_exceeded());
        }
        Ok(())
    }

    /// Races `future` against the deadline and the cancellation token.
    pub async fn run<T, F>(&self, future: F) -> Result<T, CallError>
    where
        F: Future<Output = Result<T, CallError>>,
    {
        self.check()?;

        let cancelled = async {
            match &self.token {
                Some(token) => token.cancelled().await,
                None => pending::<()>().await,
            }
        };
        let expired = async {
            match self.at {
                Some(at) => tokio::time::sleep_until(at).await,
                None => pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancelled => Err(cancelled_by_caller()),
            _ = expired => Err(deadline_exceeded()),
            result = future => result,
        }
    }

    /// Non-blocking suspension that wakes early with an error if the budget runs out.
    pub async fn sleep(&self, duration: Duration) -> Result<(), CallError> {
        self.run(async {
            tokio::time::sleep(duration).await;
            Ok(())
        })
        .await
    }
}

fn cancelled_by_caller() -> CallError {
    CallError::cancelled("operation cancelled by caller")
}

fn deadline_exceeded() -> CallError {
    CallError::cancelled("deadline exceeded")
}
