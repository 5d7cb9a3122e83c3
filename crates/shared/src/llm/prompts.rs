use std::fmt::Write as _;

use tracing::warn;

use super::generator::Prompt;
use crate::models::{ConversationTurn, FALLBACK_ANSWER_TEXT, RetrievedChunk, Role};
use crate::validation::answer_schema;

const NO_CONTEXT_TEXT: &str = "No relevant documents found.";

/// Builds the prompt for one attempt. Output depends only on the arguments.
pub fn build_prompt(
    question: &str,
    chunks: &[RetrievedChunk],
    history: &[ConversationTurn],
    retry_reason: Option<&str>,
) -> Prompt {
    let schema = match answer_schema() {
        Ok(schema) => schema.to_string(),
        Err(err) => {
            warn!(error = %err, "answer schema unavailable, prompting without it");
            String::new()
        }
    };
    let system = format!(
        "You are a secure AI assistant.\n\
         Answer the user question based ONLY on the following Context.\n\
         \n\
         Context:\n\
         {context}\n\
         \n\
         Rules:\n\
         1. If the answer is present, extract it and cite the sources you used. Set confidence to \"high\".\n\
         2. If the answer is missing, return exactly: \"{FALLBACK_ANSWER_TEXT}\" and set confidence to \"low\".\n\
         3. OUTPUT FORMAT: Return only a JSON object matching this schema: {schema}",
        context = render_context(chunks),
    );

    let mut user = String::new();
    if !history.is_empty() {
        user.push_str("Conversation so far:\n");
        for turn in history {
            let speaker = match turn.role() {
                Role::User => "User",
                Role::Assistant => "Assistant",
            };
            let _ = writeln!(user, "{speaker}: {}", turn.text());
        }
        user.push('\n');
    }
    let _ = write!(user, "Question: {question}");
    if let Some(reason) = retry_reason {
        let _ = write!(
            user,
            "\n\nYour previous answer was rejected: {reason}. Return a corrected JSON object."
        );
    }

    Prompt { system, user }
}

fn render_context(chunks: &[RetrievedChunk]) -> String {
    if chunks.is_empty() {
        return NO_CONTEXT_TEXT.to_string();
    }

    chunks
        .iter()
        .map(|chunk| format!("Source: {}\nContent: {}", chunk.source_id, chunk.text))
        .collect::<Vec<_>>()
        .join("\n\n")
}
