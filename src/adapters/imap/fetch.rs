use async_imap::types::Fetch;
use futures::StreamExt;
use tracing::{debug, warn};

use super::connection::{classify, ImapConnection};
use super::search::SearchQuery;
use crate::types::error::Result;
use crate::types::RawMessage;

/// Collects a FETCH stream tolerantly: responses that fail to parse are
/// logged and skipped so one odd message cannot sink the batch.
pub async fn collect_tolerant<E: std::fmt::Display>(
    stream: impl futures::Stream<Item = std::result::Result<Fetch, E>>,
    context: &str,
) -> Vec<Fetch> {
    futures::pin_mut!(stream);
    let mut items = Vec::new();
    while let Some(result) = stream.next().await {
        match result {
            Ok(fetch) => items.push(fetch),
            Err(e) => {
                warn!("Skipping unparseable IMAP response ({}): {}", context, e);
            }
        }
    }
    items
}

/// The newest `limit` UIDs, ascending. Servers hand back search hits in no
/// guaranteed order, so sort before taking the tail.
pub fn latest(uids: impl IntoIterator<Item = u32>, limit: usize) -> Vec<u32> {
    let mut uids: Vec<u32> = uids.into_iter().collect();
    uids.sort_unstable();
    uids.dedup();
    let skip = uids.len().saturating_sub(limit);
    uids.split_off(skip)
}

/// Search `folder` and fetch the full source of the newest `limit` hits.
///
/// Bodies are fetched with `BODY.PEEK[]` so nothing is marked seen.
pub async fn search_latest(
    conn: &mut ImapConnection,
    folder: &str,
    query: &SearchQuery,
    limit: usize,
) -> Result<Vec<RawMessage>> {
    conn.select_folder(folder).await?;

    let criteria = query.to_imap();
    debug!(folder = %folder, criteria = %criteria, "Running mailbox search");

    let hits = conn
        .session
        .uid_search(&criteria)
        .await
        .map_err(|e| classify("SEARCH", e))?;

    let total = hits.len();
    let uids = latest(hits, limit);
    if uids.is_empty() {
        debug!(folder = %folder, "Search matched nothing");
        return Ok(Vec::new());
    }

    let uid_set = uids
        .iter()
        .map(|u| u.to_string())
        .collect::<Vec<_>>()
        .join(",");

    let fetches = collect_tolerant(
        conn.session
            .uid_fetch(&uid_set, "(UID BODY.PEEK[])")
            .await
            .map_err(|e| classify("FETCH", e))?,
        folder,
    )
    .await;

    let raws: Vec<RawMessage> = fetches
        .iter()
        .filter_map(|fetch| {
            let bytes = fetch.body()?;
            Some(RawMessage {
                uid: fetch.uid.unwrap_or(fetch.message),
                bytes: bytes.to_vec(),
            })
        })
        .collect();

    debug!(
        folder = %folder,
        hits = total,
        fetched = raws.len(),
        "Fetched candidate messages"
    );

    Ok(raws)
}
