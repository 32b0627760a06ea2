//! Short-circuit chain for ordered fallible setup steps.
//!
//! Namespace construction is a sequence of roughly ten syscalls that must
//! run in order and abort on the first failure while still reporting which
//! step failed. `Chain` threads a `(code, label)` pair through a fluent
//! sequence of callables; once a step fails, later callables are never
//! invoked.

use nix::errno::Errno;

/// The failure half of a chain: a non-zero code and the static label of
/// the step that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainError {
    /// Positive errno-style code.
    pub code: i32,
    /// Label of the failing step.
    pub label: &'static str,
}

/// Result of running a chain to completion.
pub type ChainResult = Result<(), ChainError>;

/// What a single chain step evaluated to.
///
/// Steps come in two shapes: raw C-style return values (`0` ok, non-zero
/// failure with the code taken from errno) and already-labelled results
/// from nested chains. Both convert into this.
pub enum StepOutcome {
    /// Step succeeded.
    Ok,
    /// Step failed with a code; the enclosing `then` supplies the label.
    Code(i32),
    /// Step failed and already carries its own label.
    Labelled(ChainError),
}

impl From<i32> for StepOutcome {
    fn from(code: i32) -> Self {
        if code == 0 {
            StepOutcome::Ok
        } else {
            StepOutcome::Code(code)
        }
    }
}

impl From<()> for StepOutcome {
    fn from((): ()) -> Self {
        StepOutcome::Ok
    }
}

impl From<Result<(), Errno>> for StepOutcome {
    fn from(r: Result<(), Errno>) -> Self {
        match r {
            Ok(()) => StepOutcome::Ok,
            Err(e) => StepOutcome::Code(e as i32),
        }
    }
}

impl From<ChainResult> for StepOutcome {
    fn from(r: ChainResult) -> Self {
        match r {
            Ok(()) => StepOutcome::Ok,
            Err(e) => StepOutcome::Labelled(e),
        }
    }
}

/// Accumulator for ordered fallible steps.
#[derive(Debug, Default)]
#[must_use = "a chain reports its failure through finish()"]
pub struct Chain {
    err: Option<ChainError>,
}

impl Chain {
    /// Start a fresh chain in the "ok" state.
    pub fn new() -> Self {
        Chain { err: None }
    }

    /// Run `step` if the chain is still ok, labelling any failure with
    /// `label`.
    pub fn then<O, F>(mut self, label: &'static str, step: F) -> Self
    where
        O: Into<StepOutcome>,
        F: FnOnce() -> O,
    {
        if self.err.is_none() {
            self.err = match step().into() {
                StepOutcome::Ok => None,
                StepOutcome::Code(code) => Some(ChainError { code, label }),
                StepOutcome::Labelled(e) => Some(e),
            };
        }
        self
    }

    /// Run `step` only when `cond` holds; a false condition is not a
    /// failure.
    pub fn if_then<O, F>(self, label: &'static str, cond: bool, step: F) -> Self
    where
        O: Into<StepOutcome>,
        F: FnOnce() -> O,
    {
        if cond { self.then(label, step) } else { self }
    }

    /// Whether the chain is still in the "ok" state.
    pub fn ok(&self) -> bool {
        self.err.is_none()
    }

    /// Consume the chain, yielding `Err((code, label))` for the first
    /// failed step.
    pub fn finish(self) -> ChainResult {
        match self.err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_first_failure_only() {
        let ran = std::cell::RefCell::new(Vec::new());
        let res = Chain::new()
            .then("one", || {
                ran.borrow_mut().push(1);
                0
            })
            .then("two", || {
                ran.borrow_mut().push(2);
                libc::EINVAL
            })
            .then("three", || {
                ran.borrow_mut().push(3);
                0
            })
            .finish();
        assert_eq!(*ran.borrow(), vec![1, 2]);
        let err = res.unwrap_err();
        assert_eq!(err.label, "two");
        assert_eq!(err.code, libc::EINVAL);
    }

    #[test]
    fn conditional_steps_skip_without_failing() {
        let res = Chain::new()
            .if_then("skipped", false, || libc::EIO)
            .then("kept", || 0)
            .finish();
        assert!(res.is_ok());
    }

    #[test]
    fn nested_labels_pass_through() {
        let inner: ChainResult = Err(ChainError {
            code: libc::ENOENT,
            label: "inner_step",
        });
        let err = Chain::new()
            .then("outer", || inner)
            .finish()
            .unwrap_err();
        assert_eq!(err.label, "inner_step");
    }

    #[test]
    fn errno_results_convert() {
        let err = Chain::new()
            .then("mount_tmp", || Err(nix::errno::Errno::EPERM))
            .finish()
            .unwrap_err();
        assert_eq!(err.code, libc::EPERM);
        assert_eq!(err.label, "mount_tmp");
    }
}
