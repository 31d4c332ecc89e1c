use crate::models::attempt::{AnswerMap, QuestionResult, ScoreReport};
use crate::models::tryout::Subtest;

/// Zero-based option position to display label: A, B, C, ...
/// Past Z the label degrades to the 1-based position.
pub fn option_label(position: usize) -> String {
    if position < 26 {
        char::from(b'A' + position as u8).to_string()
    } else {
        (position + 1).to_string()
    }
}

/// Grades a finished pass against the tryout content. Pure: no clock, no
/// storage, same inputs always produce the same report.
///
/// Unanswered questions count toward the total and score as incorrect.
/// Labels come from option positions, selected and correct independently.
pub fn score_answers(subtests: &[Subtest], answers: &AnswerMap) -> ScoreReport {
    let mut question_results = Vec::new();
    let mut correct_answers_count = 0;
    let mut number = 0;

    for subtest in subtests {
        let chosen = answers.get(&subtest.id);
        for question in &subtest.questions {
            number += 1;
            let selected_id = chosen.and_then(|per_subtest| per_subtest.get(&question.id)).copied();
            let selected_label = selected_id
                .and_then(|id| question.options.iter().position(|option| option.id == id))
                .map(option_label);
            let correct_position = question.options.iter().position(|option| option.is_correct);
            let correct_label = correct_position.map(option_label);
            let is_correct = match (selected_id, correct_position) {
                (Some(selected), Some(position)) => question.options[position].id == selected,
                _ => false,
            };
            if is_correct {
                correct_answers_count += 1;
            }
            question_results.push(QuestionResult {
                subtest_id: subtest.id,
                question_id: question.id,
                number,
                selected_label,
                correct_label,
                is_correct,
            });
        }
    }

    let total_questions_count = question_results.len() as i32;
    let score = if total_questions_count == 0 {
        0
    } else {
        (f64::from(correct_answers_count) / f64::from(total_questions_count) * 100.0).round() as i32
    };

    ScoreReport {
        score,
        correct_answers_count,
        total_questions_count,
        question_results,
    }
}
