//! Named assertions over responses.
//!
//! A failing check never aborts the iteration. Each evaluation appends one
//! sample to the `checks` rate metric, tagged with the check's name.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::http::Response;
use crate::metrics::{Registry, TagSet, CHECKS};

type Predicate = dyn Fn(&Response) -> anyhow::Result<bool> + Send + Sync;

#[derive(Clone)]
pub struct Check {
    name: String,
    predicate: Arc<Predicate>,
}

impl Check {
    pub fn new<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&Response) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            predicate: Arc::new(move |r: &Response| -> anyhow::Result<bool> { Ok(predicate(r)) }),
        }
    }

    /// A predicate that may error; an error counts as a failed check.
    pub fn fallible<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&Response) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            predicate: Arc::new(predicate),
        }
    }

    pub fn status(expected: u16) -> Self {
        Self::new(format!("status is {expected}"), move |r| r.status == expected)
    }

    pub fn body_contains(name: impl Into<String>, needle: impl Into<String>) -> Self {
        let needle = needle.into();
        Self::new(name, move |r| r.body_contains(&needle))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the predicate. Panics and errors are reported as `false`.
    pub fn evaluate(&self, response: &Response) -> bool {
        match catch_unwind(AssertUnwindSafe(|| (self.predicate)(response))) {
            Ok(Ok(passed)) => passed,
            Ok(Err(err)) => {
                debug!(check = %self.name, error = %err, "check predicate returned an error");
                false
            }
            Err(panic) => {
                warn!(check = %self.name, panic = %panic_message(panic.as_ref()), "check predicate panicked");
                false
            }
        }
    }
}

impl fmt::Debug for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Check").field("name", &self.name).finish()
    }
}

/// Evaluate every check against `response`, recording one `checks` sample each.
///
/// Returns true only if all checks passed.
pub fn check(registry: &Registry, tags: &TagSet, response: &Response, checks: &[Check]) -> bool {
    let mut all = true;
    for c in checks {
        let passed = c.evaluate(response);
        all &= passed;
        let series = tags.clone().with("check", c.name());
        registry.add(CHECKS, &series, if passed { 1.0 } else { 0.0 });
    }
    all
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic".to_string()
    }
}
