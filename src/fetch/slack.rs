use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{FetchBatch, Fetcher};
use crate::error::{RecordSkipped, SourceError};
use crate::http::{HttpRequest, RetryPolicy, Transport};
use crate::record::{Cursor, RawRecord};

const SLACK_API: &str = "https://slack.com/api";
const PAGE_SIZE: usize = 200;
const MAX_PAGES: usize = 20;

/// `conversations.history` for one channel (source id = channel id), strictly
/// newer than the cursor, oldest first. Every page of the window is read; at
/// most `limit` of the oldest messages are returned and the hint only covers
/// those, so the rest arrive on the next run.
pub struct SlackHistory<'a, T> {
    transport: &'a T,
    policy: RetryPolicy,
    token: String,
}

impl<'a, T: Transport> SlackHistory<'a, T> {
    pub fn new(transport: &'a T, policy: RetryPolicy, token: impl Into<String>) -> Self {
        Self {
            transport,
            policy,
            token: token.into(),
        }
    }

    fn request(&self, method: &str, params: &[(&str, String)]) -> HttpRequest {
        params.iter().fold(
            HttpRequest::get(format!("{}/{}", SLACK_API, method)).bearer(&self.token),
            |req, (k, v)| req.query(k, v.clone()),
        )
    }

    /// Web API call with `ok` checking. `ratelimited` bodies are retried like 429s.
    async fn call(&self, method: &str, params: &[(&str, String)]) -> Result<Value, SourceError> {
        let req = self.request(method, params);
        let attempts = self.policy.max_attempts.max(1);

        for attempt in 0..attempts {
            let resp = self.policy.send(self.transport, &req).await?;
            let body = resp.json().map_err(|e| {
                SourceError::Permanent(format!("{}: invalid JSON: {}", method, e))
            })?;
            if body["ok"].as_bool() == Some(true) {
                return Ok(body);
            }

            let error = body["error"].as_str().unwrap_or("unknown_error").to_string();
            if error != "ratelimited" {
                return Err(SourceError::Permanent(format!("{}: {}", method, error)));
            }
            if attempt + 1 < attempts {
                let backoff = self.policy.backoff(attempt);
                warn!("{} ratelimited, backing off {:.1}s", method, backoff.as_secs_f64());
                tokio::time::sleep(backoff).await;
            }
        }

        Err(SourceError::Unavailable {
            attempts,
            last: format!("{}: ratelimited", method),
        })
    }

    /// Display name of the channel, falling back to its id.
    pub async fn channel_name(&self, channel_id: &str) -> String {
        match self
            .call("conversations.info", &[("channel", channel_id.to_string())])
            .await
        {
            Ok(body) => body["channel"]["name"]
                .as_str()
                .unwrap_or(channel_id)
                .to_string(),
            Err(e) => {
                debug!("conversations.info failed for {}: {}", channel_id, e);
                channel_id.to_string()
            }
        }
    }

    /// Single attempt, empty on any failure.
    async fn permalink(&self, channel_id: &str, ts: &str) -> String {
        let req = self.request(
            "chat.getPermalink",
            &[
                ("channel", channel_id.to_string()),
                ("message_ts", ts.to_string()),
            ],
        );
        let Ok(resp) = self.transport.send(&req).await else {
            return String::new();
        };
        match resp.json() {
            Ok(body) if resp.is_success() && body["ok"].as_bool() == Some(true) => {
                body["permalink"].as_str().unwrap_or_default().to_string()
            }
            _ => String::new(),
        }
    }
}

impl<T: Transport> Fetcher for SlackHistory<'_, T> {
    async fn fetch(
        &mut self,
        channel_id: &str,
        since: Cursor,
        limit: usize,
    ) -> Result<FetchBatch, SourceError> {
        let mut base = vec![
            ("channel", channel_id.to_string()),
            ("limit", PAGE_SIZE.to_string()),
        ];
        if let Some(oldest) = since.as_oldest_param() {
            base.push(("oldest", oldest));
        }

        // Pages arrive newest first, so the whole (since, now] window is read
        // before the oldest `limit` messages are picked.
        let mut messages: Vec<Value> = Vec::new();
        let mut next_page: Option<String> = None;
        for page in 1..=MAX_PAGES {
            let mut params = base.clone();
            if let Some(c) = &next_page {
                params.push(("cursor", c.clone()));
            }
            let mut body = self.call("conversations.history", &params).await?;
            match body["messages"].take() {
                Value::Array(items) => messages.extend(items),
                _ => warn!("conversations.history for {} had no messages array", channel_id),
            }

            next_page = body["response_metadata"]["next_cursor"]
                .as_str()
                .filter(|c| !c.is_empty() && body["has_more"].as_bool() == Some(true))
                .map(str::to_string);
            if next_page.is_none() {
                break;
            }
            if page == MAX_PAGES {
                warn!(
                    "{}: stopped after {} pages of history, older messages are not included",
                    channel_id, MAX_PAGES
                );
            }
        }

        let mut batch = FetchBatch::default();
        let mut fresh: Vec<(Cursor, &str, &Value)> = Vec::new();
        for msg in &messages {
            // Joins, edits and bot posts are not mirrored
            if !msg["subtype"].is_null() || !msg["bot_id"].is_null() {
                continue;
            }
            let Some((ts_str, ts)) = msg["ts"]
                .as_str()
                .and_then(|s| Cursor::parse(s).map(|c| (s, c)))
            else {
                batch.skipped.push(RecordSkipped::new(
                    "fetch",
                    None,
                    format!("message without usable ts in {}", channel_id),
                ));
                continue;
            };
            if ts > since {
                fresh.push((ts, ts_str, msg));
            }
        }
        fresh.sort_by(|a, b| a.0.total_cmp(&b.0));

        for (ts, ts_str, msg) in fresh.into_iter().take(limit) {
            let permalink = self.permalink(channel_id, ts_str).await;
            let raw = RawRecord::from_value(json!({
                "ts": ts_str,
                "channel": channel_id,
                "user": msg["user"].as_str().unwrap_or("unknown"),
                "text": msg["text"].as_str().unwrap_or_default(),
                "permalink": permalink,
            }))
            .unwrap_or_default();
            batch.records.push(raw);
            batch.next_cursor_hint = Some(batch.next_cursor_hint.unwrap_or(since).max(ts));
        }

        for s in &batch.skipped {
            warn!("skipped {}", s);
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::http::testing::ScriptedTransport;

    fn fixture() -> String {
        std::fs::read_to_string("tests/fixtures/slack_history.json").unwrap()
    }

    fn transport() -> ScriptedTransport {
        ScriptedTransport::new()
            .on("conversations.history", 200, fixture())
            .on(
                "chat.getPermalink",
                200,
                r#"{"ok": true, "permalink": "https://team.slack.com/archives/C1/p1"}"#,
            )
            .on("conversations.info", 200, r#"{"ok": true, "channel": {"name": "general"}}"#)
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::ZERO)
    }

    #[tokio::test]
    async fn first_run_fetches_everything_oldest_first() {
        let t = transport();
        let mut slack = SlackHistory::new(&t, policy(), "xoxb-test");
        let batch = slack.fetch("C1", Cursor::ZERO, 50).await.unwrap();

        let ts: Vec<String> = batch.records.iter().filter_map(|r| r.text("ts")).collect();
        assert_eq!(
            ts,
            vec!["1726751000.000000", "1726752000.000100", "1726752100.000200"]
        );
        assert_eq!(batch.skipped.len(), 1);
        assert_eq!(batch.next_cursor_hint, Cursor::parse("1726752100.000200"));
        assert_eq!(
            batch.records[0].text("permalink").as_deref(),
            Some("https://team.slack.com/archives/C1/p1")
        );

        let reqs = t.requests.lock().unwrap();
        let history = reqs.iter().find(|r| r.url.contains("history")).unwrap();
        assert!(history.query.iter().all(|(k, _)| k != "oldest"));
        assert!(history
            .headers
            .contains(&("Authorization".to_string(), "Bearer xoxb-test".to_string())));
    }

    #[tokio::test]
    async fn cursor_filters_and_is_sent_as_oldest() {
        let t = transport();
        let mut slack = SlackHistory::new(&t, policy(), "xoxb-test");
        let since = Cursor::parse("1726751500").unwrap();
        let batch = slack.fetch("C1", since, 50).await.unwrap();
        assert_eq!(batch.records.len(), 2);

        let reqs = t.requests.lock().unwrap();
        let history = reqs.iter().find(|r| r.url.contains("history")).unwrap();
        assert!(history
            .query
            .contains(&("oldest".to_string(), "1726751500.000000".to_string())));
    }

    #[tokio::test]
    async fn rerun_at_latest_ts_is_empty() {
        let t = transport();
        let mut slack = SlackHistory::new(&t, policy(), "xoxb-test");
        let first = slack.fetch("C1", Cursor::ZERO, 50).await.unwrap();
        let latest = first.next_cursor_hint.unwrap();

        let second = slack.fetch("C1", latest, 50).await.unwrap();
        assert!(second.records.is_empty());
        assert_eq!(second.next_cursor_hint, None);
    }

    #[tokio::test]
    async fn api_refusal_is_permanent() {
        let t = ScriptedTransport::new().on(
            "conversations.history",
            200,
            r#"{"ok": false, "error": "invalid_auth"}"#,
        );
        let mut slack = SlackHistory::new(&t, policy(), "bad");
        let err = slack.fetch("C1", Cursor::ZERO, 50).await.unwrap_err();
        assert!(matches!(err, SourceError::Permanent(ref m) if m.contains("invalid_auth")));
        assert_eq!(t.calls_to("conversations.history"), 1);
    }

    #[tokio::test]
    async fn ratelimited_body_is_retried() {
        let t = ScriptedTransport::new()
            .on(
                "conversations.history",
                200,
                r#"{"ok": false, "error": "ratelimited"}"#,
            )
            .on("conversations.history", 200, r#"{"ok": true, "messages": []}"#);
        let mut slack = SlackHistory::new(&t, policy(), "xoxb-test");
        let batch = slack.fetch("C1", Cursor::ZERO, 50).await.unwrap();
        assert!(batch.records.is_empty());
        assert_eq!(t.calls_to("conversations.history"), 2);
    }

    #[tokio::test]
    async fn permalink_failure_keeps_message() {
        let t = ScriptedTransport::new()
            .on("conversations.history", 200, fixture())
            .on("chat.getPermalink", 500, "");
        let mut slack = SlackHistory::new(&t, policy(), "xoxb-test");
        let batch = slack.fetch("C1", Cursor::ZERO, 50).await.unwrap();
        assert_eq!(batch.records.len(), 3);
        assert_eq!(batch.records[0].text("permalink"), None);
    }

    fn paged_transport() -> ScriptedTransport {
        let page = |n: u8| {
            std::fs::read_to_string(format!("tests/fixtures/slack_history_page{}.json", n)).unwrap()
        };
        ScriptedTransport::new()
            .on("conversations.history", 200, page(1))
            .on("conversations.history", 200, page(2))
            .on("chat.getPermalink", 200, r#"{"ok": true, "permalink": "https://x/p"}"#)
    }

    #[tokio::test]
    async fn every_page_is_read_and_the_oldest_are_returned() {
        let t = paged_transport();
        let mut slack = SlackHistory::new(&t, policy(), "xoxb-test");
        let since = Cursor::parse("100").unwrap();
        let batch = slack.fetch("C1", since, 2).await.unwrap();

        let ts: Vec<String> = batch.records.iter().filter_map(|r| r.text("ts")).collect();
        assert_eq!(ts, vec!["150.000000", "200.000000"]);
        assert_eq!(batch.next_cursor_hint, Cursor::parse("200"));

        let reqs = t.requests.lock().unwrap();
        let pages: Vec<&HttpRequest> = reqs.iter().filter(|r| r.url.contains("history")).collect();
        assert_eq!(pages.len(), 2);
        assert!(pages[0].query.iter().all(|(k, _)| k != "cursor"));
        assert!(pages[1]
            .query
            .contains(&("cursor".to_string(), "bmV4dF90czoxNTA=".to_string())));
        assert!(pages[1]
            .query
            .contains(&("oldest".to_string(), "100.000000".to_string())));
    }

    #[tokio::test]
    async fn empty_next_cursor_stops_paging() {
        let t = ScriptedTransport::new().on(
            "conversations.history",
            200,
            r#"{"ok": true, "has_more": true, "messages": [], "response_metadata": {"next_cursor": ""}}"#,
        );
        let mut slack = SlackHistory::new(&t, policy(), "xoxb-test");
        let batch = slack.fetch("C1", Cursor::ZERO, 50).await.unwrap();
        assert!(batch.records.is_empty());
        assert_eq!(t.calls_to("conversations.history"), 1);
    }

    #[tokio::test]
    async fn channel_name_falls_back_to_id() {
        let t = transport();
        let slack = SlackHistory::new(&t, policy(), "xoxb-test");
        assert_eq!(slack.channel_name("C1").await, "general");

        let t = ScriptedTransport::new().on(
            "conversations.info",
            200,
            r#"{"ok": false, "error": "channel_not_found"}"#,
        );
        let slack = SlackHistory::new(&t, policy(), "xoxb-test");
        assert_eq!(slack.channel_name("C9").await, "C9");
    }
}
