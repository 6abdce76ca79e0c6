//! Bounded retry for external calls: attempt, clean up after a failure,
//! then retry or give up. Independent of what is being retried so the policy
//! can be tested without a network or a JDK.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    pub number: u32,
    pub total: u32,
}

impl Attempt {
    pub fn is_last(&self) -> bool {
        self.number >= self.total
    }
}

impl fmt::Display for Attempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.number, self.total)
    }
}

/// Every attempt failed; `last` is the error of the final one.
#[derive(Debug)]
pub struct RetryExhausted<E> {
    pub attempts: u32,
    pub last: E,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    attempts: u32,
}

impl RetryPolicy {
    /// At least one attempt is always made.
    pub fn new(attempts: u32) -> Self {
        RetryPolicy {
            attempts: attempts.max(1),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Runs `op` until it succeeds or the budget is spent. `on_failure` runs
    /// after every failed attempt, including the last, and is where partial
    /// output gets removed.
    pub fn run<T, E, Op, OnFailure>(
        &self,
        mut op: Op,
        mut on_failure: OnFailure,
    ) -> Result<T, RetryExhausted<E>>
    where
        Op: FnMut(Attempt) -> Result<T, E>,
        OnFailure: FnMut(Attempt, &E),
    {
        let mut number = 1;
        loop {
            let attempt = Attempt {
                number,
                total: self.attempts,
            };
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(error) => {
                    on_failure(attempt, &error);
                    if attempt.is_last() {
                        return Err(RetryExhausted {
                            attempts: self.attempts,
                            last: error,
                        });
                    }
                }
            }
            number += 1;
        }
    }
}
