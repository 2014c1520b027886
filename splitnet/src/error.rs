use thiserror::Error;

pub type Result<T> = std::result::Result<T, SplitError>;

/// Every failure the splitting network and its statistics engine can report.
#[derive(Debug, Error)]
pub enum SplitError {
    #[error("region {region} does not exist (network has {num_regions} regions)")]
    UnknownRegion { region: usize, num_regions: usize },

    #[error("copy {copy} does not exist in region {region} ({num_copies} copies)")]
    UnknownCopy {
        region: usize,
        copy: usize,
        num_copies: usize,
    },

    #[error("split groups must both be non-empty")]
    EmptyGroup,

    #[error("task {task} appears more than once across the split groups")]
    OverlappingGroups { task: usize },

    #[error("task {task} is not assigned to copy {copy} of region {region}")]
    TaskNotOnCopy {
        task: usize,
        region: usize,
        copy: usize,
    },

    #[error("split groups cover {covered} of the {expected} tasks on copy {copy} of region {region}")]
    IncompletePartition {
        region: usize,
        copy: usize,
        covered: usize,
        expected: usize,
    },

    #[error("task index {task} out of range (num_tasks = {num_tasks})")]
    TaskOutOfRange { task: usize, num_tasks: usize },

    #[error("shape mismatch for {what}: expected {expected}, got {actual}")]
    ShapeMismatch {
        what: &'static str,
        expected: String,
        actual: String,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("forward cache is stale: network structure changed from version {cached} to {current}")]
    StaleForwardCache { cached: u64, current: u64 },

    #[error("checkpoint I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkpoint (de)serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
}

impl SplitError {
    /// True for the errors a caller gets from passing bad arguments to `split`.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(
            self,
            SplitError::UnknownRegion { .. }
                | SplitError::UnknownCopy { .. }
                | SplitError::EmptyGroup
                | SplitError::OverlappingGroups { .. }
                | SplitError::TaskNotOnCopy { .. }
                | SplitError::IncompletePartition { .. }
                | SplitError::TaskOutOfRange { .. }
        )
    }

    pub(crate) fn shape(what: &'static str, expected: impl ToString, actual: impl ToString) -> Self {
        SplitError::ShapeMismatch {
            what,
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}
