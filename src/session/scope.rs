//! Nested session scopes and the unique-violation retry loop.

use std::thread;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use super::Session;
use crate::config::RetryPolicy;
use crate::error::{GraphError, Result};
use crate::store::Graph;

/// How a scope relates to an enclosing session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ScopeOptions {
    /// Reuse the enclosing session when one is passed in.
    pub can_inherit: bool,
    /// Fail unless an enclosing session is passed in.
    pub must_inherit: bool,
}

impl Default for ScopeOptions {
    fn default() -> Self {
        Self::inherit()
    }
}

impl ScopeOptions {
    /// Join the enclosing session if there is one, otherwise open one.
    pub fn inherit() -> Self {
        Self {
            can_inherit: true,
            must_inherit: false,
        }
    }

    /// Always open and own a fresh session.
    pub fn isolated() -> Self {
        Self {
            can_inherit: false,
            must_inherit: false,
        }
    }

    /// Only run inside an enclosing session.
    pub fn required() -> Self {
        Self {
            can_inherit: true,
            must_inherit: true,
        }
    }
}

impl Graph {
    /// Runs `f` inside a session scope.
    ///
    /// An inherited scope borrows `parent` and leaves commit and rollback
    /// to its owner; errors propagate unchanged. An owned scope opens a
    /// session, commits it when `f` succeeds and rolls it back when `f`
    /// fails.
    pub fn session_scope<'g, T, F>(
        &'g self,
        parent: Option<&mut Session<'g>>,
        options: ScopeOptions,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce(&mut Session<'g>) -> Result<T>,
    {
        if options.must_inherit && !options.can_inherit {
            return Err(GraphError::InvalidArgument(
                "a scope cannot both require and refuse an enclosing session".into(),
            ));
        }
        match parent {
            Some(parent) if options.can_inherit => {
                if !std::ptr::eq(parent.graph(), self) {
                    return Err(GraphError::InvalidArgument(
                        "enclosing session belongs to another graph".into(),
                    ));
                }
                debug!(session_id = parent.id(), "scope joined enclosing session");
                f(parent)
            }
            None if options.must_inherit => Err(GraphError::InvalidArgument(
                "scope requires an enclosing session".into(),
            )),
            _ => {
                let mut session = self.session()?;
                match f(&mut session) {
                    Ok(value) => {
                        session.commit()?;
                        Ok(value)
                    }
                    Err(err) => {
                        if let Err(undo) = session.rollback() {
                            warn!(error = %undo, "scope rollback failed");
                        }
                        Err(err)
                    }
                }
            }
        }
    }

    /// Runs `f` in its own session, retrying the whole scope on unique
    /// violations with the configured [`RetryPolicy`].
    pub fn transact<T, F>(&self, mut f: F) -> Result<T>
    where
        F: FnMut(&mut Session<'_>) -> Result<T>,
    {
        let policy = self.config().retry;
        let mut attempt = 0u32;
        loop {
            match self.session_scope(None, ScopeOptions::isolated(), |session| f(session)) {
                Err(err) if err.is_retryable() => {
                    if attempt >= policy.max_retries {
                        return Err(GraphError::RetriesExhausted {
                            attempts: attempt + 1,
                            last: Box::new(err),
                        });
                    }
                    let delay = backoff(&policy, attempt);
                    warn!(
                        attempt = attempt + 1,
                        max_retries = policy.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "unique violation, retrying"
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

/// Random sleep below a ceiling that shrinks linearly with each attempt.
fn backoff(policy: &RetryPolicy, attempt: u32) -> Duration {
    let max = u64::from(policy.max_retries.max(1));
    let left = max.saturating_sub(u64::from(attempt));
    let ceiling = policy.base_delay_ms.saturating_mul(left) / max;
    if ceiling == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling))
}
