use serde_json::json;
use tracing::{info, warn};

use super::{AppendReport, Sink};
use crate::error::{SinkError, SourceError};
use crate::http::{HttpRequest, RetryPolicy, Transport};
use crate::record::{CanonicalRecord, Payload};

const PUSH_URL: &str = "https://api.line.me/v2/bot/message/push";
const BROADCAST_URL: &str = "https://api.line.me/v2/bot/message/broadcast";
const ELLIPSIS: &str = "...";
/// Headroom kept for the channel/user prefix when the body is cut.
const PREFIX_ALLOWANCE: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormattedText {
    pub text: String,
    pub truncated: bool,
}

/// `[#channel] user: text`, permalink on its own line. Bodies that push the
/// header line past `max_chars` are cut to `max_chars - 50` chars plus `...`.
pub fn format_message(
    channel: &str,
    user: &str,
    text: &str,
    permalink: Option<&str>,
    max_chars: usize,
) -> FormattedText {
    let header = format!("[#{}] {}: ", channel, user);
    let full_len = header.chars().count() + text.chars().count();

    let (body, truncated) = if full_len > max_chars {
        let keep = max_chars.saturating_sub(PREFIX_ALLOWANCE);
        let cut: String = text.chars().take(keep).collect();
        (format!("{}{}", cut, ELLIPSIS), true)
    } else {
        (text.to_string(), false)
    };

    let mut out = format!("{}{}", header, body);
    if let Some(link) = permalink.filter(|l| !l.is_empty()) {
        out.push('\n');
        out.push_str(link);
    }
    FormattedText { text: out, truncated }
}

/// Pushes one text message per record to a single LINE recipient, or to every
/// follower of the bot when there is no recipient.
pub struct LinePushSink<'a, T> {
    transport: &'a T,
    policy: RetryPolicy,
    token: String,
    to: Option<String>,
    max_chars: usize,
}

impl<'a, T: Transport> LinePushSink<'a, T> {
    pub fn new(
        transport: &'a T,
        policy: RetryPolicy,
        token: impl Into<String>,
        to: impl Into<String>,
        max_chars: usize,
    ) -> Self {
        Self {
            transport,
            policy,
            token: token.into(),
            to: Some(to.into()),
            max_chars,
        }
    }

    pub fn broadcast(
        transport: &'a T,
        policy: RetryPolicy,
        token: impl Into<String>,
        max_chars: usize,
    ) -> Self {
        Self {
            transport,
            policy,
            token: token.into(),
            to: None,
            max_chars,
        }
    }

    /// One text message, sent as is.
    pub async fn push_text(&self, text: &str) -> Result<(), SourceError> {
        let messages = json!([{"type": "text", "text": text}]);
        let req = match &self.to {
            Some(to) => HttpRequest::post_json(PUSH_URL, json!({"to": to, "messages": messages})),
            None => HttpRequest::post_json(BROADCAST_URL, json!({"messages": messages})),
        };
        self.policy
            .send(self.transport, &req.bearer(&self.token))
            .await
            .map(|_| ())
    }
}

impl<T: Transport> Sink for LinePushSink<'_, T> {
    async fn append(&mut self, records: &[CanonicalRecord]) -> Result<AppendReport, SinkError> {
        let mut report = AppendReport::default();

        for r in records {
            let Payload::Message(m) = &r.payload else {
                warn!("line: {} is not a message, skipped", r.key);
                report.failed += 1;
                continue;
            };
            let formatted = format_message(
                &m.channel,
                &m.user,
                m.text.as_deref().unwrap_or_default(),
                m.permalink.as_deref(),
                self.max_chars,
            );

            match self.push_text(&formatted.text).await {
                Ok(_) => {
                    report.succeeded += 1;
                    if formatted.truncated {
                        warn!("line: message {} truncated to {} chars", r.key, self.max_chars);
                        report.truncated += 1;
                    }
                }
                Err(e) => {
                    warn!("line: push failed for {}: {}", r.key, e);
                    report.failed += 1;
                }
            }
        }

        if report.succeeded > 0 {
            info!("line: pushed {} message(s)", report.succeeded);
        }
        Ok(report)
    }
}
