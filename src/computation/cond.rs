// src/computation/cond.rs

//! Conditions that a suspended stage re-evaluates until satisfied.

use crate::errors::ComputationError;

/// Outcome of one condition check.
///
/// `state` is carried to the next check when `satisfied` is false, and becomes
/// the stage's value when it is true.
#[derive(Debug, Clone, PartialEq)]
pub struct CondResult<S> {
    pub state: S,
    pub satisfied: bool,
}

impl<S> CondResult<S> {
    pub fn satisfied(state: S) -> Self {
        Self {
            state,
            satisfied: true,
        }
    }

    pub fn pending(state: S) -> Self {
        Self {
            state,
            satisfied: false,
        }
    }

    pub fn is_satisfied(&self) -> bool {
        self.satisfied
    }
}

/// A re-evaluable predicate over some carried state.
///
/// Returning an error fails the suspended stage immediately.
pub trait SuspendCondition<S>: Send {
    fn check(&mut self, state: S) -> Result<CondResult<S>, ComputationError>;
}

impl<S, F> SuspendCondition<S> for F
where
    F: FnMut(S) -> Result<CondResult<S>, ComputationError> + Send,
{
    fn check(&mut self, state: S) -> Result<CondResult<S>, ComputationError> {
        self(state)
    }
}

/// Inverts the `satisfied` flag of the wrapped condition.
#[derive(Debug, Clone)]
pub struct Negate<C>(pub C);

impl<S, C> SuspendCondition<S> for Negate<C>
where
    C: SuspendCondition<S>,
{
    fn check(&mut self, state: S) -> Result<CondResult<S>, ComputationError> {
        let res = self.0.check(state)?;
        Ok(CondResult {
            state: res.state,
            satisfied: !res.satisfied,
        })
    }
}
