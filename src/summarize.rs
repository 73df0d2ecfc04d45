use serde_json::json;
use tracing::{debug, info};

use crate::error::SourceError;
use crate::http::{HttpRequest, RetryPolicy, Transport};
use crate::record::{CanonicalRecord, Payload};

const CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";
/// Transcript length sent to the model.
const TRANSCRIPT_MAX_CHARS: usize = 4000;
const COMPLETION_MAX_TOKENS: u32 = 500;
const TEMPERATURE: f64 = 0.3;
const ELLIPSIS: &str = "...";

const SYSTEM_PROMPT: &str = "あなたはSlackメッセージの要約アシスタントです。\
以下のメッセージを要点を箇条書きで要約してください。最大500文字で、日本語で回答してください。\
重要な情報や決定事項、質問、回答などを中心にまとめてください。";

pub const NO_VALID_MESSAGES: &str = "有効なメッセージがありません。";

/// `[user]: text` per message with text, oldest first, cut to 4000 chars.
/// `None` when no message has any text.
pub fn transcript(records: &[CanonicalRecord]) -> Option<String> {
    let lines: Vec<String> = records
        .iter()
        .filter_map(|r| match &r.payload {
            Payload::Message(m) => m
                .text
                .as_deref()
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(|t| format!("[{}]: {}", m.user, t)),
            Payload::Product(_) => None,
        })
        .collect();
    if lines.is_empty() {
        return None;
    }
    Some(clip(&lines.join("\n"), TRANSCRIPT_MAX_CHARS, false))
}

/// At most `max_chars` chars. With `inside`, the ellipsis counts toward the
/// limit; otherwise it is appended past it.
fn clip(text: &str, max_chars: usize, inside: bool) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let keep = if inside {
        max_chars.saturating_sub(ELLIPSIS.len())
    } else {
        max_chars
    };
    let cut: String = text.chars().take(keep).collect();
    format!("{}{}", cut, ELLIPSIS)
}

/// Chat Completions call that turns a batch of messages into one short digest.
pub struct ChatSummarizer<'a, T> {
    transport: &'a T,
    policy: RetryPolicy,
    api_key: String,
    model: String,
    max_chars: usize,
}

impl<'a, T: Transport> ChatSummarizer<'a, T> {
    pub fn new(
        transport: &'a T,
        policy: RetryPolicy,
        api_key: impl Into<String>,
        model: impl Into<String>,
        max_chars: usize,
    ) -> Self {
        Self {
            transport,
            policy,
            api_key: api_key.into(),
            model: model.into(),
            max_chars,
        }
    }

    /// Bulleted Japanese digest, at most `max_chars` chars. Messages without
    /// text never reach the API.
    pub async fn summarize(&self, records: &[CanonicalRecord]) -> Result<String, SourceError> {
        let Some(text) = transcript(records) else {
            debug!("summary: {} message(s), none with text", records.len());
            return Ok(NO_VALID_MESSAGES.to_string());
        };

        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": format!("以下のSlackメッセージを要約してください：\n\n{}", text)},
            ],
            "max_tokens": COMPLETION_MAX_TOKENS,
            "temperature": TEMPERATURE,
        });
        let req = HttpRequest::post_json(CHAT_URL, body).bearer(&self.api_key);
        let resp = self.policy.send(self.transport, &req).await?;

        let value = resp
            .json()
            .map_err(|e| SourceError::Permanent(format!("chat completion: invalid JSON: {}", e)))?;
        let summary = value["choices"][0]["message"]["content"]
            .as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| SourceError::Permanent("chat completion had no content".into()))?;

        info!(
            "summary: {} message(s) -> {} chars ({})",
            records.len(),
            summary.chars().count(),
            self.model
        );
        Ok(clip(summary, self.max_chars, true))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{FixedOffset, TimeZone};

    use super::*;
    use crate::http::testing::ScriptedTransport;
    use crate::record::{Cursor, Message};

    fn message(ts: &str, user: &str, text: Option<&str>) -> CanonicalRecord {
        CanonicalRecord {
            key: ts.into(),
            rank: 1,
            position: Cursor::parse(ts).unwrap(),
            captured_at: FixedOffset::east_opt(9 * 3600)
                .unwrap()
                .with_ymd_and_hms(2025, 1, 15, 9, 0, 0)
                .unwrap(),
            source: "slack".into(),
            payload: Payload::Message(Message {
                channel: "general".into(),
                user: user.into(),
                text: text.map(str::to_string),
                permalink: None,
            }),
        }
    }

    fn completion(content: &str) -> String {
        json!({"choices": [{"message": {"role": "assistant", "content": content}}]}).to_string()
    }

    fn summarizer(t: &ScriptedTransport) -> ChatSummarizer<'_, ScriptedTransport> {
        ChatSummarizer::new(t, RetryPolicy::new(3, Duration::ZERO), "sk-test", "gpt-3.5-turbo", 500)
    }

    #[test]
    fn transcript_skips_empty_texts() {
        let records = vec![
            message("1.0", "U1", Some("hello")),
            message("2.0", "U2", Some("   ")),
            message("3.0", "U3", None),
            message("4.0", "U2", Some("deploy at 5pm")),
        ];
        assert_eq!(
            transcript(&records).as_deref(),
            Some("[U1]: hello\n[U2]: deploy at 5pm")
        );
        assert_eq!(transcript(&records[1..3]), None);
    }

    #[test]
    fn long_transcript_is_cut() {
        let records = vec![message("1.0", "U1", Some(&"あ".repeat(5000)))];
        let t = transcript(&records).unwrap();
        assert_eq!(t.chars().count(), TRANSCRIPT_MAX_CHARS + ELLIPSIS.len());
        assert!(t.ends_with("..."));
    }

    #[tokio::test]
    async fn posts_chat_request_and_trims_the_answer() {
        let t = ScriptedTransport::new()
            .on("chat/completions", 503, "")
            .on("chat/completions", 200, completion("\n・デプロイは17時\n"));
        let digest = summarizer(&t)
            .summarize(&[message("1.0", "U1", Some("deploy at 5pm"))])
            .await
            .unwrap();
        assert_eq!(digest, "・デプロイは17時");
        assert_eq!(t.calls_to("chat/completions"), 2);

        let reqs = t.requests.lock().unwrap();
        let body = reqs[1].json.as_ref().unwrap();
        assert_eq!(body["model"], "gpt-3.5-turbo");
        assert_eq!(body["max_tokens"], 500);
        assert_eq!(body["messages"][0]["role"], "system");
        assert!(body["messages"][1]["content"]
            .as_str()
            .unwrap()
            .ends_with("[U1]: deploy at 5pm"));
        assert!(reqs[1]
            .headers
            .contains(&("Authorization".to_string(), "Bearer sk-test".to_string())));
    }

    #[tokio::test]
    async fn long_answer_is_clipped_to_the_limit() {
        let t = ScriptedTransport::new().on("chat/completions", 200, completion(&"x".repeat(800)));
        let digest = summarizer(&t)
            .summarize(&[message("1.0", "U1", Some("hi"))])
            .await
            .unwrap();
        assert_eq!(digest.chars().count(), 500);
        assert!(digest.ends_with("..."));
    }

    #[tokio::test]
    async fn textless_batch_skips_the_api() {
        let t = ScriptedTransport::new();
        let digest = summarizer(&t)
            .summarize(&[message("1.0", "U1", None)])
            .await
            .unwrap();
        assert_eq!(digest, NO_VALID_MESSAGES);
        assert!(t.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_content_is_permanent() {
        let t = ScriptedTransport::new().on("chat/completions", 200, r#"{"choices": []}"#);
        let err = summarizer(&t)
            .summarize(&[message("1.0", "U1", Some("hi"))])
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Permanent(_)));
    }
}
