//! Typed ID definitions.

use crate::{define_id, IdError, MAX_ID_LEN};

// =============================================================================
// Task and Job
// =============================================================================

define_id!(TaskId, "task id");
define_id!(JobId, "job id");

// =============================================================================
// Pools
// =============================================================================

define_id!(PoolId, "pool id");

impl PoolId {
    /// Derives the id of an externally managed pool from the job it serves.
    ///
    /// The result is `{prefix}_{job_id}`.
    pub fn for_job(prefix: &str, job_id: &JobId) -> Result<Self, IdError> {
        Self::parse(&format!("{prefix}_{job_id}"))
    }
}

pub(crate) fn validate(kind: &'static str, s: &str) -> Result<(), IdError> {
    if s.is_empty() {
        return Err(IdError::Empty { kind });
    }

    if s.len() > MAX_ID_LEN {
        return Err(IdError::TooLong {
            kind,
            max: MAX_ID_LEN,
            actual: s.len(),
        });
    }

    if let Some((position, ch)) = s
        .chars()
        .enumerate()
        .find(|(_, c)| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(IdError::InvalidCharacter { kind, ch, position });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_task_id_roundtrip() {
        let id: TaskId = "a1b2c3d4_0".parse().unwrap();
        assert_eq!(id.to_string(), "a1b2c3d4_0");
        assert_eq!(id.as_str(), "a1b2c3d4_0");
    }

    #[test]
    fn test_empty_id_rejected() {
        let err = TaskId::parse("").unwrap_err();
        assert!(err.is_empty());
    }

    #[test]
    fn test_invalid_character_rejected() {
        let err = JobId::parse("job/1").unwrap_err();
        assert_eq!(
            err,
            IdError::InvalidCharacter {
                kind: "job id",
                ch: '/',
                position: 3
            }
        );
    }

    #[test]
    fn test_too_long_rejected() {
        let long = "a".repeat(MAX_ID_LEN + 1);
        assert!(matches!(
            TaskId::parse(&long),
            Err(IdError::TooLong { actual: 65, .. })
        ));
    }

    #[test]
    fn test_pool_id_for_job() {
        let job_id = JobId::parse("JobId-1").unwrap();
        let pool_id = PoolId::for_job("TES", &job_id).unwrap();
        assert_eq!(pool_id.as_str(), "TES_JobId-1");
    }

    #[test]
    fn test_serde_validates() {
        let ok: TaskId = serde_json::from_str("\"task-1\"").unwrap();
        assert_eq!(ok.as_str(), "task-1");
        assert!(serde_json::from_str::<TaskId>("\"task 1\"").is_err());
        assert_eq!(serde_json::to_string(&ok).unwrap(), "\"task-1\"");
    }

    proptest! {
        #[test]
        fn prop_valid_ids_roundtrip(s in "[A-Za-z0-9_-]{1,64}") {
            let id = JobId::parse(&s).unwrap();
            let reparsed: JobId = id.to_string().parse().unwrap();
            prop_assert_eq!(id, reparsed);
        }
    }
}
