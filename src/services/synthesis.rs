//! Conversational answer synthesis over the shared LLM provider.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::CapabilityError;
use crate::llm::{CompletionRequest, LlmProvider};
use crate::profile::UserProfile;
use crate::services::{llm_failure, SynthesisService};
use crate::store::ChatTurn;

/// Recent-history turns are clipped to keep the prompt bounded.
const MAX_TURN_CHARS: usize = 300;

/// Synthesis service backed by the shared LLM provider.
pub struct LlmSynthesis {
    llm: Arc<dyn LlmProvider>,
}

impl LlmSynthesis {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl SynthesisService for LlmSynthesis {
    async fn respond(
        &self,
        question: &str,
        context: &str,
        profile: &UserProfile,
        history: &[ChatTurn],
    ) -> Result<String, CapabilityError> {
        let request = CompletionRequest::new(
            "You are a careful health assistant for users in India. Give practical, \
             simple guidance suited to the user's profile. Be honest about uncertainty \
             and recommend seeing a doctor when symptoms are serious or persistent. \
             Do not add your own disclaimer line; one is appended separately.",
            build_user_prompt(question, context, profile, history),
        )
        .with_max_tokens(1024)
        .with_temperature(0.3);

        let answer = self
            .llm
            .complete(request)
            .await
            .map_err(|e| llm_failure("conversation", e))?;
        Ok(answer.trim().to_string())
    }
}

fn build_user_prompt(
    question: &str,
    context: &str,
    profile: &UserProfile,
    history: &[ChatTurn],
) -> String {
    let mut prompt = String::with_capacity(1024);
    prompt.push_str(&format!("User profile: {}\n", profile.summary()));

    if !history.is_empty() {
        prompt.push_str("\nRecent conversation:\n");
        for turn in history {
            let inbound: String = turn.inbound_text.chars().take(MAX_TURN_CHARS).collect();
            let outbound: String = turn.outbound_text.chars().take(MAX_TURN_CHARS).collect();
            prompt.push_str(&format!("User: {inbound}\nAssistant: {outbound}\n"));
        }
    }

    if !context.is_empty() {
        prompt.push_str(&format!("\nReference material:\n{context}\n"));
    }

    prompt.push_str(&format!("\nQuestion: {question}"));
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn turn(inbound: &str, outbound: &str) -> ChatTurn {
        ChatTurn {
            id: None,
            phone: "+911111111111".into(),
            inbound_text: inbound.into(),
            outbound_text: outbound.into(),
            language: "en".into(),
            handlers: vec![],
            safety_flags: vec![],
            created_at: Utc::now(),
        }
    }

    #[test]
    fn prompt_contains_profile_context_history_and_question() {
        let mut profile = UserProfile::new("+911111111111");
        profile.name = "Asha".into();
        profile.age = Some(34);
        let history = vec![turn("I have a headache", "Rest and hydrate.")];

        let prompt = build_user_prompt(
            "Should I take paracetamol?",
            "Paracetamol is a common analgesic.",
            &profile,
            &history,
        );
        assert!(prompt.contains("Asha"));
        assert!(prompt.contains("Reference material"));
        assert!(prompt.contains("common analgesic"));
        assert!(prompt.contains("I have a headache"));
        assert!(prompt.contains("Question: Should I take paracetamol?"));
    }

    #[test]
    fn prompt_omits_empty_sections() {
        let profile = UserProfile::new("+911111111111");
        let prompt = build_user_prompt("fever?", "", &profile, &[]);
        assert!(!prompt.contains("Reference material"));
        assert!(!prompt.contains("Recent conversation"));
    }

    #[test]
    fn long_history_turns_are_clipped() {
        let profile = UserProfile::new("+911111111111");
        let long = "x".repeat(1000);
        let history = vec![turn(&long, &long)];
        let prompt = build_user_prompt("q", "", &profile, &history);
        assert!(prompt.len() < 1200);
    }
}
