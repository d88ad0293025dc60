// Aptitude-round payloads for the exam-processing queue

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AptitudeAnswer {
    pub question_id: String,
    pub selected_option: String,
}

/// Grading data for one multiple-choice question, supplied by the exam store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerKeyEntry {
    pub question_id: String,
    pub correct_option: String,
    pub marks: f64,
    #[serde(default)]
    pub negative_marks: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamSubmission {
    pub exam_id: String,
    pub user_id: String,
    pub answers: Vec<AptitudeAnswer>,
    pub answer_key: Vec<AnswerKeyEntry>,
    #[serde(default)]
    pub negative_marking: bool,
    #[serde(default)]
    pub passing_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradedAnswer {
    pub question_id: String,
    pub selected_option: String,
    pub is_correct: bool,
    pub marks_obtained: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamReport {
    pub exam_id: String,
    pub user_id: String,
    pub answers: Vec<GradedAnswer>,
    pub total_score: f64,
    pub passed: bool,
}
