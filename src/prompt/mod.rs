//! System prompt templates
//!
//! Per-session prompts for the two translation directions, the first-message
//! AI identification per target language, and the strict per-response
//! override used by the text-input pipelines.

use once_cell::sync::Lazy;
use std::collections::HashMap;

use crate::types::{Call, CallMode};

/// AI identification, spoken as the very first outbound utterance once the
/// recipient answers. English source text; Session A renders it in the
/// target language.
pub static FIRST_MESSAGE_TEMPLATES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        (
            "ko",
            "안녕하세요. AI 통역 서비스를 이용해서 연락드렸습니다. \
             고객님을 대신해서 통화를 도와드리고 있어요.",
        ),
        (
            "en",
            "Hello, this is an AI translation assistant calling on behalf of \
             a customer. I'll relay their message shortly.",
        ),
    ])
});

pub fn first_message_for(target_language: &str) -> &'static str {
    FIRST_MESSAGE_TEMPLATES
        .get(target_language)
        .copied()
        .unwrap_or_else(|| FIRST_MESSAGE_TEMPLATES["en"])
}

fn politeness_rules(source: &str, target: &str) -> &'static str {
    match (source, target) {
        (_, "ko") => {
            "ALWAYS use polite Korean (해요체/존댓말). Use '사장님', '선생님' for addressing."
        }
        ("ko", "en") => "Use polite, professional English. Use 'sir', 'ma'am' when appropriate.",
        _ => "Use a polite, professional register throughout.",
    }
}

/// Session A system prompt (user -> recipient direction).
pub fn session_a_prompt(call: &Call) -> String {
    match call.mode {
        CallMode::Relay => format!(
            "You are a real-time phone translator.\n\
             You translate the user's speech from {src} to {tgt}.\n\n\
             ## Core Rules\n\
             1. Translate ONLY what the user says. Do NOT add your own words.\n\
             2. {politeness}\n\
             3. Output ONLY the direct translation. No commentary, no suggestions.\n\
             4. For place names, use the local name. Transliterate proper nouns \
             without local equivalents.\n\n\
             ## CRITICAL: You are a TRANSLATOR, not a conversationalist.\n\
             - Do NOT answer questions from the recipient on your own.\n\
             - Do NOT make decisions on behalf of the user.\n\
             - If the recipient asks something, translate it to the user and wait.",
            src = call.source_language,
            tgt = call.target_language,
            politeness = politeness_rules(&call.source_language, &call.target_language),
        ),
        CallMode::Agent => {
            let collected = serde_json::to_string_pretty(&call.collected_data)
                .unwrap_or_else(|_| "{}".to_string());
            format!(
                "You are an AI phone assistant making a call on behalf of a user \
                 who cannot speak.\n\n\
                 ## Core Rules\n\
                 1. Use polite {tgt} speech at all times.\n\
                 2. Complete the task based on the collected information below.\n\
                 3. If the recipient asks something you don't have the answer to, \
                 say a short hold-on phrase and wait for the user's text input.\n\
                 4. Keep responses concise and natural, like a real phone conversation.\n\n\
                 ## Collected Information\n{collected}\n\n\
                 ## Conversation Strategy\n\
                 1. Greet and state the purpose.\n\
                 2. Provide collected information as needed.\n\
                 3. Confirm details when asked.\n\
                 4. Thank and close when the task is complete.",
                tgt = call.target_language,
                collected = collected,
            )
        }
    }
}

/// Session B system prompt (recipient -> user direction).
pub fn session_b_prompt(call: &Call) -> String {
    format!(
        "You are a real-time translator.\n\
         You translate the recipient's speech from {tgt} to {src}.\n\n\
         ## Core Rules\n\
         1. Translate what the recipient says into natural {src}.\n\
         2. Output ONLY the direct translation.\n\
         3. Preserve the speaker's intent, tone, and urgency.\n\
         4. Never answer, never converse; only translate.",
        tgt = call.target_language,
        src = call.source_language,
    )
}

/// Per-response instruction override for text-input relay: force a bare
/// translation so the model does not answer the question conversationally.
pub fn strict_relay_instruction(source_language: &str, target_language: &str) -> String {
    format!(
        "Translate the user's message from {source_language} to {target_language} \
         and speak ONLY that translated sentence. Do NOT answer the question, \
         do NOT add any extra words, do NOT ask follow-up questions."
    )
}

/// Exact-utterance instruction for the first message in text-input modes,
/// so the greeting comes out verbatim without conversational expansion.
pub fn exact_utterance_instruction(text: &str) -> String {
    format!("Say exactly this and nothing else: \"{text}\"")
}

/// One-shot hold-on filler while the user is typing.
pub fn typing_filler(target_language: &str) -> &'static str {
    match target_language {
        "ko" => "잠시만 기다려 주세요, 확인 중입니다.",
        _ => "One moment please, they are typing a reply.",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CallStartRequest, CommunicationMode};

    fn call(mode: CallMode) -> Call {
        Call::new(&CallStartRequest {
            call_id: "c-1".to_string(),
            phone_number: "+14155552671".to_string(),
            mode,
            source_language: "en".to_string(),
            target_language: "ko".to_string(),
            collected_data: None,
            communication_mode: CommunicationMode::VoiceToVoice,
            system_prompt_override: None,
        })
    }

    #[test]
    fn test_relay_prompt_mentions_languages() {
        let prompt = session_a_prompt(&call(CallMode::Relay));
        assert!(prompt.contains("from en to ko"));
        assert!(prompt.contains("TRANSLATOR"));
    }

    #[test]
    fn test_agent_prompt_embeds_collected_data() {
        let mut c = call(CallMode::Agent);
        c.collected_data
            .insert("service".to_string(), serde_json::json!("restaurant"));
        let prompt = session_a_prompt(&c);
        assert!(prompt.contains("restaurant"));
    }

    #[test]
    fn test_session_b_direction_reversed() {
        let prompt = session_b_prompt(&call(CallMode::Relay));
        assert!(prompt.contains("from ko to en"));
    }

    #[test]
    fn test_first_message_fallback() {
        assert!(first_message_for("ko").contains("AI"));
        assert_eq!(first_message_for("xx"), first_message_for("en"));
    }

    #[test]
    fn test_strict_relay_instruction() {
        let text = strict_relay_instruction("en", "ko");
        assert!(text.contains("speak ONLY"));
    }
}
