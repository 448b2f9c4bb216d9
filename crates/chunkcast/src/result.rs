use serde::{Deserialize, Serialize};

/// Outcome of processing one chunk.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    Failure(String),
}

/// The output a Worker produced for one chunk, addressed by its slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessedResult {
    pub sequence_index: usize,
    pub output_text: String,
    #[serde(flatten)]
    pub status: ResultStatus,
}

impl ProcessedResult {
    pub fn success(sequence_index: usize, output_text: impl Into<String>) -> Self {
        Self {
            sequence_index,
            output_text: output_text.into(),
            status: ResultStatus::Success,
        }
    }

    /// A failed chunk; its output is always empty.
    pub fn failure(sequence_index: usize, reason: impl Into<String>) -> Self {
        Self {
            sequence_index,
            output_text: String::new(),
            status: ResultStatus::Failure(reason.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, ResultStatus::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_flat() {
        let ok = serde_json::to_value(ProcessedResult::success(1, "hi")).unwrap();
        assert_eq!(
            ok,
            serde_json::json!({ "sequence_index": 1, "output_text": "hi", "status": "success" })
        );

        let failed = serde_json::to_value(ProcessedResult::failure(2, "boom")).unwrap();
        assert_eq!(
            failed,
            serde_json::json!({
                "sequence_index": 2,
                "output_text": "",
                "status": "failure",
                "reason": "boom"
            })
        );
    }
}
