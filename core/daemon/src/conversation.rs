//! Threads raw editor prompts and generations into ordered conversation turns.

use chrono::{DateTime, Duration, Utc};
use companion_daemon_protocol::{ConversationTurn, TurnRole};
use std::collections::{HashMap, HashSet};

/// Assumed gap between a prompt and its generation when the prompt carries no
/// timestamp of its own.
pub const BACKFILL_OFFSET_SECS: i64 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPrompt {
    pub text: String,
    pub correlation_id: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawGeneration {
    pub text: String,
    pub correlation_id: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Pairs prompts with generations by correlation id.
///
/// The user turn of a conversation is always emitted before its assistant
/// turn. Prompts without an id get `"{workspace_id}-prompt-{index}"`.
pub fn thread_conversation(
    workspace_id: &str,
    prompts: &[RawPrompt],
    generations: &[RawGeneration],
) -> Vec<ConversationTurn> {
    let mut by_id: HashMap<&str, &RawGeneration> = HashMap::new();
    for generation in generations {
        if let Some(id) = generation.correlation_id.as_deref() {
            by_id.entry(id).or_insert(generation);
        }
    }

    let mut turns = Vec::with_capacity(prompts.len() * 2);
    for (index, prompt) in prompts.iter().enumerate() {
        let generation = prompt
            .correlation_id
            .as_deref()
            .and_then(|id| by_id.get(id).copied());

        let prompt_timestamp = prompt.timestamp.or_else(|| {
            generation
                .and_then(|generation| generation.timestamp)
                .map(|ts| ts - Duration::seconds(BACKFILL_OFFSET_SECS))
        });

        let conversation_id = prompt
            .correlation_id
            .clone()
            .unwrap_or_else(|| format!("{}-prompt-{}", workspace_id, index));

        turns.push(ConversationTurn {
            conversation_id: conversation_id.clone(),
            role: TurnRole::User,
            text: prompt.text.clone(),
            timestamp: prompt_timestamp,
            thinking_time_ms: None,
            workspace_id: workspace_id.to_string(),
        });

        if let Some(generation) = generation {
            let thinking_time_ms = match (prompt_timestamp, generation.timestamp) {
                (Some(asked), Some(answered)) => {
                    Some(answered.signed_duration_since(asked).num_milliseconds())
                }
                _ => None,
            };
            turns.push(ConversationTurn {
                conversation_id,
                role: TurnRole::Assistant,
                text: generation.text.clone(),
                timestamp: generation.timestamp,
                thinking_time_ms,
                workspace_id: workspace_id.to_string(),
            });
        }
    }

    turns
}

/// Remembers emitted turns so repeated pulls of an append-mostly source only
/// yield what is new.
#[derive(Debug, Default)]
pub struct ConversationThreader {
    emitted: HashSet<(String, TurnRole)>,
}

impl ConversationThreader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn thread(
        &mut self,
        workspace_id: &str,
        prompts: &[RawPrompt],
        generations: &[RawGeneration],
    ) -> Vec<ConversationTurn> {
        thread_conversation(workspace_id, prompts, generations)
            .into_iter()
            .filter(|turn| {
                self.emitted
                    .insert((turn_key(workspace_id, &turn.conversation_id), turn.role))
            })
            .collect()
    }

    pub fn emitted_count(&self) -> usize {
        self.emitted.len()
    }
}

fn turn_key(workspace_id: &str, conversation_id: &str) -> String {
    format!("{}|{}", workspace_id, conversation_id)
}
