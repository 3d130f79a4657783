use corral::JobPayload;
use serde::{Deserialize, Serialize};

/// Executor name every [`TestJob`] uses unless it routes explicitly.
pub const TEST_EXECUTOR: &str = "test";

/// Payload whose variant scripts what the [`crate::TestHandler`] does.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum TestJob {
    /// Succeed immediately with `value`.
    Echo { value: String },
    /// Sleep, then succeed with `value`.
    Sleep { ms: u64, value: String },
    /// Never finish.
    Hang,
    /// Fail with `error`.
    Fail { error: String },
    /// Succeed with `"{executor}:{value}"` on the named executor.
    Route { executor: String, value: String },
}

impl TestJob {
    pub fn echo(value: impl Into<String>) -> Self {
        TestJob::Echo {
            value: value.into(),
        }
    }

    pub fn sleep(ms: u64, value: impl Into<String>) -> Self {
        TestJob::Sleep {
            ms,
            value: value.into(),
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        TestJob::Fail {
            error: error.into(),
        }
    }

    pub fn route(executor: impl Into<String>, value: impl Into<String>) -> Self {
        TestJob::Route {
            executor: executor.into(),
            value: value.into(),
        }
    }
}

impl JobPayload for TestJob {
    type Output = String;

    fn executor(&self) -> &str {
        match self {
            TestJob::Route { executor, .. } => executor,
            _ => TEST_EXECUTOR,
        }
    }
}
