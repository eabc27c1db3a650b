//! Fetch pipeline
//!
//! Turns raw candidates into tenant-visible messages. The server-side search
//! only approximates the grant, so every message is checked again here:
//! recency first (cheapest), then subject patterns, then recipients.

use chrono::{DateTime, Duration, TimeZone, Utc};
use mailparse::{DispositionType, MailHeaderMap, ParsedMail};
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

use crate::adapters::imap::{Mailbox, SearchQuery};
use crate::config::RetrievalConfig;
use crate::types::error::{RelayError, Result};
use crate::types::{Capability, Message, RawMessage};

/// What one retrieval call is allowed to return
pub struct Scope<'a> {
    /// Lower-cased permitted subject patterns
    pub patterns: &'a [String],
    pub capability: &'a Capability,
}

/// Structured view of one raw message, before any filtering
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedMessage {
    pub id: String,
    pub subject: String,
    pub from: String,
    pub to: String,
    pub text: Option<String>,
    pub html: Option<String>,
    pub date: Option<DateTime<Utc>>,
}

pub struct FetchPipeline {
    mailbox: Arc<dyn Mailbox>,
    freshness: Duration,
    max_candidates: usize,
}

impl FetchPipeline {
    pub fn new(mailbox: Arc<dyn Mailbox>, config: &RetrievalConfig) -> Self {
        Self {
            mailbox,
            freshness: config.freshness(),
            max_candidates: config.max_candidates,
        }
    }

    pub fn mailbox(&self) -> &Arc<dyn Mailbox> {
        &self.mailbox
    }

    pub async fn run(&self, query: &SearchQuery, scope: &Scope<'_>) -> Result<Vec<Message>> {
        let raws = self.mailbox.search_latest(query, self.max_candidates).await?;
        let fetched = raws.len();

        // Parsing is CPU-bound; keep it off the async workers.
        let patterns = scope.patterns.to_vec();
        let capability = scope.capability.clone();
        let freshness = self.freshness;
        let messages = tokio::task::spawn_blocking(move || {
            let scope = Scope {
                patterns: &patterns,
                capability: &capability,
            };
            process(raws, &scope, freshness, Utc::now())
        })
        .await
        .map_err(|e| RelayError::Parse(format!("Parse worker failed: {}", e)))?;

        info!(fetched, admitted = messages.len(), "Fetch pipeline finished");
        Ok(messages)
    }
}

/// Parse, filter, tag, deduplicate and order a batch.
///
/// Parsing runs in parallel; everything after it keeps transport order so
/// that "first occurrence wins" holds for duplicate ids.
pub fn process(
    raws: Vec<RawMessage>,
    scope: &Scope<'_>,
    freshness: Duration,
    now: DateTime<Utc>,
) -> Vec<Message> {
    let parsed: Vec<(u32, Result<ParsedMessage>)> = raws
        .par_iter()
        .map(|raw| (raw.uid, parse_raw(raw)))
        .collect();

    let mut seen = HashSet::new();
    let mut messages: Vec<Message> = parsed
        .into_iter()
        .filter_map(|(uid, result)| match result {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                debug!(uid, "Dropping unparseable message: {}", e);
                None
            }
        })
        .filter_map(|parsed| admit(parsed, scope, freshness, now))
        .filter(|message| seen.insert(message.id.clone()))
        .collect();

    messages.sort_by(|a, b| b.received_at.cmp(&a.received_at));
    messages
}

pub fn parse_raw(raw: &RawMessage) -> Result<ParsedMessage> {
    let mail = mailparse::parse_mail(&raw.bytes)
        .map_err(|e| RelayError::Parse(format!("uid {}: {}", raw.uid, e)))?;
    let headers = mail.headers.as_slice();

    let id = headers
        .get_first_value("Message-ID")
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| synthesize_id(raw));

    let date = headers
        .get_first_value("Date")
        .and_then(|value| mailparse::dateparse(&value).ok())
        .and_then(|ts| Utc.timestamp_opt(ts, 0).single());

    let mut text = None;
    let mut html = None;
    collect_bodies(&mail, &mut text, &mut html);

    Ok(ParsedMessage {
        id,
        subject: headers.get_first_value("Subject").unwrap_or_default(),
        from: headers.get_first_value("From").unwrap_or_default(),
        to: headers.get_first_value("To").unwrap_or_default(),
        text,
        html,
        date,
    })
}

/// Stable stand-in for a missing Message-ID: same bytes, same id.
fn synthesize_id(raw: &RawMessage) -> String {
    let digest = Sha256::digest(&raw.bytes);
    let short: String = digest.iter().take(8).map(|b| format!("{:02x}", b)).collect();
    format!("msg_{}_{}", raw.uid, short)
}

/// First non-attachment text/plain and text/html parts, depth first.
fn collect_bodies(part: &ParsedMail<'_>, text: &mut Option<String>, html: &mut Option<String>) {
    if !part.subparts.is_empty() {
        for sub in &part.subparts {
            collect_bodies(sub, text, html);
        }
        return;
    }

    if matches!(
        part.get_content_disposition().disposition,
        DispositionType::Attachment
    ) {
        return;
    }

    let mime = part.ctype.mimetype.to_ascii_lowercase();
    let slot = if mime == "text/plain" {
        text
    } else if mime == "text/html" {
        html
    } else {
        return;
    };

    if slot.is_none() {
        if let Ok(body) = part.get_body() {
            if !body.trim().is_empty() {
                *slot = Some(body);
            }
        }
    }
}

/// Apply recency, subject and recipient checks; build the message if all pass.
pub fn admit(
    parsed: ParsedMessage,
    scope: &Scope<'_>,
    freshness: Duration,
    now: DateTime<Utc>,
) -> Option<Message> {
    let received_at = parsed.date.unwrap_or(now);
    if now - received_at > freshness {
        debug!(id = %parsed.id, "Dropping stale message");
        return None;
    }

    let subject_lower = parsed.subject.to_lowercase();
    if !scope
        .patterns
        .iter()
        .any(|p| subject_lower.contains(p.as_str()))
    {
        debug!(id = %parsed.id, "Dropping message: subject outside grant");
        return None;
    }

    if !scope.capability.permits_recipient(&parsed.to.to_lowercase()) {
        debug!(id = %parsed.id, "Dropping message: recipient outside grant");
        return None;
    }

    let tag_text = parsed.text.as_deref().or(parsed.html.as_deref()).unwrap_or_default();
    let keyword_tags = extract_keywords(&parsed.subject, tag_text, scope.patterns);

    Some(Message {
        id: parsed.id,
        subject: parsed.subject,
        from_address: parsed.from,
        to_address: parsed.to,
        body: parsed.html.or(parsed.text).unwrap_or_default(),
        received_at,
        keyword_tags,
    })
}

/// Distinct permitted patterns found in subject and body. When none occur,
/// the lower-cased subject becomes the only tag.
pub fn extract_keywords(subject: &str, body: &str, patterns: &[String]) -> Vec<String> {
    let haystack = format!("{} {}", subject, body).to_lowercase();

    let mut tags: Vec<String> = Vec::new();
    for pattern in patterns {
        if haystack.contains(pattern.as_str()) && !tags.contains(pattern) {
            tags.push(pattern.clone());
        }
    }

    if tags.is_empty() && !subject.is_empty() {
        tags.push(subject.to_lowercase());
    }

    tags
}
