//! Identifier newtypes.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

string_id!(
    /// Thread ID - a persistent conversation/workflow instance.
    ThreadId
);

string_id!(
    /// Run ID - one execution attempt of a thread's workflow.
    ///
    /// May hold a thread id when the registry falls back, or a synthesized
    /// `fallback-*` placeholder when the service never reported one.
    RunId
);

string_id!(
    /// Message ID - stable identity of a conversation message.
    MessageId
);

string_id!(
    /// Assistant ID - which workflow graph to run.
    AssistantId
);

impl ThreadId {
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// A thread id reinterpreted as a run id (registry legacy fallback)
    pub fn as_run_id(&self) -> RunId {
        RunId(self.0.clone())
    }
}

const FALLBACK_PREFIX: &str = "fallback-";

impl RunId {
    /// Timestamp-derived placeholder used when no run id could be learned
    pub fn fallback() -> Self {
        Self(format!(
            "{}{}",
            FALLBACK_PREFIX,
            chrono::Utc::now().timestamp_millis()
        ))
    }

    pub fn is_fallback(&self) -> bool {
        self.0.starts_with(FALLBACK_PREFIX)
    }

    /// Equal to the given thread id (registry fallback or synthetic context)
    pub fn is_thread(&self, thread_id: &ThreadId) -> bool {
        self.0 == thread_id.0
    }
}

impl MessageId {
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_id_serialization() {
        let run_id = RunId::new("run-123");
        let json = serde_json::to_string(&run_id).unwrap();
        assert_eq!(json, "\"run-123\"");
        let back: RunId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, run_id);
    }

    #[test]
    fn test_fallback_run_id() {
        let id = RunId::fallback();
        assert!(id.is_fallback());
        assert!(id.as_str().len() > FALLBACK_PREFIX.len());
        assert!(!RunId::new("abc").is_fallback());
    }

    #[test]
    fn test_thread_as_run_id() {
        let thread = ThreadId::new("T1");
        assert!(thread.as_run_id().is_thread(&thread));
        assert!(!RunId::new("R1").is_thread(&thread));
    }
}
