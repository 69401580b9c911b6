//! Prompt builders
//!
//! Each step of a turn has one builder returning the message list sent to the
//! language model. Builders are pure so routing and retry behaviour can be
//! tested without a model.

use crate::llm::Message;
use crate::retry::Attempt;
use sdk::ArtifactKind;

use super::types::{BadReason, QueryFeedback};

const DOMAIN: &str = "You work on a workshop maintenance database for the mining industry. \
It records maintenance cycles per unit, the hierarchy of systems, subsystems and \
components serviced in each cycle, and the jobs performed on each component.";

pub fn translate(text: &str, from: &str, to: &str) -> Vec<Message> {
    vec![
        Message::system(format!(
            "You translate chat messages from {} to {}. Keep the meaning and the context, \
            adapt the wording so it reads naturally. Reply with the translation only.",
            from, to
        )),
        Message::user(text),
    ]
}

pub fn to_request(context: &str, message: &str) -> Vec<Message> {
    vec![
        Message::system(format!(
            "{}\nExtract what the user is asking for from their message and the conversation \
            context. Drop greetings and filler, resolve references such as 'that unit' or \
            'the same chart' using the context. Reply with one concise request description.",
            DOMAIN
        )),
        Message::user(format!(
            "Conversation context: {}\nUser message: {}",
            context_or_none(context),
            message
        )),
    ]
}

pub fn classify(context: &str, request: &str) -> Vec<Message> {
    vec![
        Message::system(format!(
            "{}\nClassify the request:\n\
            - is_on_topic: the request can be answered with the maintenance database.\n\
            - is_context_sufficient: the request together with the context holds enough \
            detail to be answered.",
            DOMAIN
        )),
        Message::user(format!(
            "Conversation context: {}\nRequest: {}",
            context_or_none(context),
            request
        )),
    ]
}

pub fn plan(request: &str, available: &[ArtifactKind]) -> Vec<Message> {
    let available = if available.is_empty() {
        "none".to_string()
    } else {
        kinds_list(available)
    };

    vec![
        Message::system(format!(
            "{}\nDecide which actions the request requires:\n\
            - is_new_sql_query_needed: new data must be queried from the database.\n\
            - is_new_image_needed: a new chart must be drawn.\n\
            Previously produced artifacts can be reused when they already answer the request.",
            DOMAIN
        )),
        Message::user(format!(
            "Request: {}\nArtifacts available from the previous turn: {}",
            request, available
        )),
    ]
}

pub fn refusal(request: &str, reason: BadReason) -> Vec<Message> {
    let task = match reason {
        BadReason::OffTopic => {
            "The request is not related to the maintenance database. Politely say so, \
            mention that you answer workshop maintenance questions and invite the user to ask \
            one. Keep it short."
        }
        BadReason::InsufficientContext => {
            "The request lacks the detail needed to answer it. Say so briefly and suggest \
            which details the user could add."
        }
    };

    vec![
        Message::system(format!("{}\n{}", DOMAIN, task)),
        Message::user(request),
    ]
}

pub fn simplify_question(request: &str) -> Vec<Message> {
    vec![
        Message::system(
            "You are a business analyst. Rewrite the request as one simple question that a \
            single SELECT statement can answer. Do not answer it.",
        ),
        Message::user(request),
    ]
}

/// Query generation prompt
///
/// Every attempt states its index; retries carry the previous query and its
/// failure verbatim.
pub fn generate_sql(schema: &str, question: &str, attempt: &Attempt<QueryFeedback>) -> Vec<Message> {
    let mut messages = vec![
        Message::system(format!(
            "You are a SQLite expert. Write one read-only SELECT statement answering the \
            question. Reply with the SQL only, no explanation. Report durations in minutes. \
            Units are identified as T_XX, e.g. T_01.\n\nDatabase schema:\n{}",
            schema
        )),
        Message::user("I want to know how many maintenance cycles each unit has had."),
        Message::assistant(
            "SELECT UnitId, COUNT(*) AS maintenance_cycle_count FROM maintenance_cycle GROUP BY UnitId;",
        ),
    ];

    let mut question_text = format!(
        "Attempt {} of {}.\nQuestion: {}",
        attempt.index, attempt.max_attempts, question
    );
    if let Some(feedback) = &attempt.feedback {
        if feedback.query.is_empty() {
            question_text.push_str(&format!(
                "\nThe previous attempt failed with: {}",
                feedback.reason
            ));
        } else {
            question_text.push_str(&format!(
                "\nThe previous query failed:\n{}\nReason: {}",
                feedback.query, feedback.reason
            ));
        }
        question_text.push_str("\nWrite a different query that avoids this problem.");
    }
    messages.push(Message::user(question_text));
    messages
}

pub fn image_instructions(request: &str, sample: &str) -> Vec<Message> {
    vec![
        Message::system(
            "You are a business analyst. Turn the request into step by step chart drawing \
            instructions, one per line. The chart will be drawn from the attached file; the \
            sample only shows its structure. Reply with the instructions only.",
        ),
        Message::user(format!("Request: {}\nData sample:\n{}", request, sample)),
    ]
}

pub fn synthesize(request: &str, data: &str, previous_answer: Option<&str>) -> Vec<Message> {
    let mut content = format!("Request: {}\nData:\n{}", request, data);
    if let Some(previous) = previous_answer {
        content.push_str(&format!("\nThe previous answer was: {}", previous));
    }
    content.push_str("\nWrite the final answer for the user based on the request and the data.");

    vec![
        Message::system(
            "You are a business analyst explaining operational data to a client. Answer the \
            request using the data, clearly and concisely.",
        ),
        Message::user(content),
    ]
}

pub fn compact(
    prior_context: &str,
    request: &str,
    answer: &str,
    produced: &[ArtifactKind],
    word_budget: usize,
) -> Vec<Message> {
    let produced = if produced.is_empty() {
        "none".to_string()
    } else {
        kinds_list(produced)
    };

    vec![
        Message::system(format!(
            "You maintain the memory of a conversation. Merge the previous context with the \
            latest interaction into what must be remembered going forward, naming the most \
            recent artifacts. Reply in at most {} words.",
            word_budget
        )),
        Message::user(format!(
            "Previous context: {}\nUser request: {}\nAssistant answer: {}\nArtifacts created: {}",
            context_or_none(prior_context),
            request,
            answer,
            produced
        )),
    ]
}

fn context_or_none(context: &str) -> &str {
    if context.trim().is_empty() {
        "(none)"
    } else {
        context
    }
}

fn kinds_list(kinds: &[ArtifactKind]) -> String {
    kinds
        .iter()
        .map(|k| k.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_sql_includes_attempt_and_feedback() {
        let attempt = Attempt {
            index: 2,
            max_attempts: 3,
            feedback: Some(QueryFeedback::new(
                "SELECT UnitID2 FROM job",
                "no such column: UnitID2",
            )),
        };
        let messages = generate_sql("CREATE TABLE job (job_id INTEGER)", "How many jobs?", &attempt);
        let last = &messages.last().unwrap().content;

        assert!(last.contains("Attempt 2 of 3"));
        assert!(last.contains("The previous query failed:\nSELECT UnitID2 FROM job"));
        assert!(last.contains("Reason: no such column: UnitID2"));
        assert!(messages[0].content.contains("CREATE TABLE job"));
    }

    #[test]
    fn test_first_attempt_has_no_feedback() {
        let attempt = Attempt {
            index: 1,
            max_attempts: 3,
            feedback: None,
        };
        let messages = generate_sql("", "How many jobs?", &attempt);
        assert!(!messages.last().unwrap().content.contains("previous"));
    }

    #[test]
    fn test_failed_generation_feedback_has_no_query() {
        let attempt = Attempt {
            index: 2,
            max_attempts: 3,
            feedback: Some(QueryFeedback::new("", "query generation failed: Timeout")),
        };
        let messages = generate_sql("", "How many jobs?", &attempt);
        let last = &messages.last().unwrap().content;

        assert!(last.contains("The previous attempt failed with: query generation failed"));
        assert!(!last.contains("The previous query failed"));
    }

    #[test]
    fn test_compact_names_artifacts_and_budget() {
        let messages = compact(
            "",
            "count cycles",
            "There are 12.",
            &[ArtifactKind::Query, ArtifactKind::Table],
            30,
        );
        assert!(messages[0].content.contains("at most 30 words"));
        assert!(messages[1].content.contains("query, data"));
        assert!(messages[1].content.contains("Previous context: (none)"));
    }
}
