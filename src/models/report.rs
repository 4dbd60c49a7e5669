use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A report served from the primary store.
///
/// Deserializable so that cached copies can be read back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub id: u64,
    pub title: String,
    pub owner: String,
    /// Summary figures keyed by metric name
    pub figures: Vec<(String, f64)>,
    pub generated_at: DateTime<Utc>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_report_json_shape() {
        let report = Report {
            id: 7,
            title: "Quarterly revenue".to_string(),
            owner: "finance".to_string(),
            figures: vec![("revenue".to_string(), 1250.5)],
            generated_at: DateTime::from_timestamp(1_705_315_800, 0).unwrap(),
        };

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["id"], 7);
        assert_eq!(json["figures"][0][0], "revenue");
        assert_eq!(json["generated_at"], "2024-01-15T10:50:00Z");
    }
}
