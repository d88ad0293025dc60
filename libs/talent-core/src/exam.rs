// Aptitude-round grading for the exam-processing queue

use std::collections::HashMap;
use talent_common::exam::{AnswerKeyEntry, ExamReport, ExamSubmission, GradedAnswer};

use crate::error::ProcessError;

/// Grade multiple-choice answers against the answer key.
///
/// Correct answers earn `marks`; wrong ones cost `negative_marks` only when the
/// exam uses negative marking. An answer to a question missing from the key
/// rejects the whole submission.
pub fn grade_aptitude(submission: &ExamSubmission) -> Result<ExamReport, ProcessError> {
    let key: HashMap<&str, &AnswerKeyEntry> = submission
        .answer_key
        .iter()
        .map(|entry| (entry.question_id.as_str(), entry))
        .collect();

    let mut total_score = 0.0;
    let mut answers = Vec::with_capacity(submission.answers.len());
    for answer in &submission.answers {
        let entry = key.get(answer.question_id.as_str()).ok_or_else(|| {
            ProcessError::InvalidPayload(format!("unknown question {}", answer.question_id))
        })?;

        let is_correct = entry.correct_option == answer.selected_option;
        let marks_obtained = if is_correct {
            entry.marks
        } else if submission.negative_marking {
            -entry.negative_marks
        } else {
            0.0
        };
        total_score += marks_obtained;

        answers.push(GradedAnswer {
            question_id: answer.question_id.clone(),
            selected_option: answer.selected_option.clone(),
            is_correct,
            marks_obtained,
        });
    }

    Ok(ExamReport {
        exam_id: submission.exam_id.clone(),
        user_id: submission.user_id.clone(),
        answers,
        total_score,
        passed: total_score >= submission.passing_score,
    })
}
