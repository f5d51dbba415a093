use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// How a finished attempt is judged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PassingCriteria {
    #[default]
    Everyone,
    Accuracy,
    Speed,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestLanguage {
    #[default]
    En,
    Ar,
}

/// A graded typing test as served by the school backend. Read-only to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestDefinition {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub language: TestLanguage,
    pub text: String,
    #[serde(default)]
    pub alternate_texts: Vec<String>,
    #[serde(default)]
    pub has_time_limit: bool,
    #[serde(default)]
    pub time_limit_minutes: Option<f64>,
    #[serde(default)]
    pub passing_criteria: PassingCriteria,
    #[serde(default)]
    pub min_accuracy: f64,
    #[serde(default)]
    pub min_speed: f64,
    #[serde(default)]
    pub disable_backspace: bool,
}

impl TestDefinition {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: String::new(),
            language: TestLanguage::default(),
            text: text.into(),
            alternate_texts: Vec::new(),
            has_time_limit: false,
            time_limit_minutes: None,
            passing_criteria: PassingCriteria::default(),
            min_accuracy: 0.0,
            min_speed: 0.0,
            disable_backspace: false,
        }
    }

    /// Time limit in whole seconds, if the test is timed.
    pub fn time_limit_secs(&self) -> Option<i64> {
        match (self.has_time_limit, self.time_limit_minutes) {
            (true, Some(minutes)) if minutes > 0.0 => Some((minutes * 60.0).round() as i64),
            _ => None,
        }
    }

    /// Picks the text for one attempt from the primary text and its alternates.
    pub fn select_text<R: Rng + ?Sized>(&self, rng: &mut R) -> String {
        let candidates: Vec<&String> = std::iter::once(&self.text)
            .chain(self.alternate_texts.iter())
            .filter(|t| !t.is_empty())
            .collect();

        candidates
            .choose(rng)
            .map(|t| t.to_string())
            .unwrap_or_else(|| self.text.clone())
    }
}

/// The student's previous graded result for this test, if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriorResult {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub speed: f64,
    #[serde(default)]
    pub accuracy: f64,
    #[serde(default)]
    pub passed: bool,
}

/// Response of `GET /tests/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchTestResponse {
    pub test: TestDefinition,
    #[serde(default)]
    pub result: Option<PriorResult>,
    pub can_attempt: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
