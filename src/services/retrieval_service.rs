use chrono::{Local, NaiveDate};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::fetch_pipeline::{FetchPipeline, Scope};
use super::PatternStore;
use crate::adapters::imap::{Mailbox, SearchQuery, SessionState};
use crate::config::RetrievalConfig;
use crate::types::error::{RelayError, Result};
use crate::types::{Capability, Message, Role, TenantId};

/// Entry point used by the outer layer (CLI, HTTP handlers).
///
/// Permissions are resolved before the mailbox is touched; a tenant whose
/// grant cannot be resolved simply sees nothing.
pub struct RetrievalService {
    store: Arc<dyn PatternStore>,
    pipeline: FetchPipeline,
    request_timeout: Duration,
}

/// Tenant grant resolved for a single call
struct Grant {
    patterns: Vec<String>,
    capability: Capability,
}

impl RetrievalService {
    pub fn new(
        store: Arc<dyn PatternStore>,
        mailbox: Arc<dyn Mailbox>,
        config: &RetrievalConfig,
    ) -> Self {
        Self {
            store,
            pipeline: FetchPipeline::new(mailbox, config),
            request_timeout: config.request_timeout(),
        }
    }

    pub async fn connect(&self) -> Result<()> {
        self.pipeline.mailbox().connect().await
    }

    pub async fn disconnect(&self) {
        self.pipeline.mailbox().disconnect().await
    }

    pub async fn status(&self) -> SessionState {
        self.pipeline.mailbox().state().await
    }

    /// Recent messages visible to the tenant, newest first.
    ///
    /// An empty result is a normal outcome; errors are reserved for mailbox
    /// and timeout failures.
    pub async fn list_messages(
        &self,
        tenant_id: TenantId,
        role: Role,
        search: Option<&str>,
    ) -> Result<Vec<Message>> {
        let Some(grant) = self.resolve_grant(tenant_id, role) else {
            return Ok(Vec::new());
        };

        let term = search.map(str::trim).filter(|t| !t.is_empty());
        let since = today();

        let query = match term {
            Some(term) => {
                if term.chars().any(char::is_control) {
                    warn!(tenant_id, "Search term contains control characters");
                    return Ok(Vec::new());
                }
                if !grant.capability.permits_search(term) {
                    info!(tenant_id, "Search term outside recipient grant");
                    return Ok(Vec::new());
                }
                SearchQuery::recipient(term, since)
            }
            None => match SearchQuery::listing(&grant.capability, &grant.patterns, since) {
                Some(query) => query,
                None => return Ok(Vec::new()),
            },
        };

        let mut messages = self.run(tenant_id, &query, &grant).await?;

        if let Some(term) = term {
            let needle = term.to_lowercase();
            messages.retain(|m| mentions(m, &needle));
        }

        info!(tenant_id, ?role, count = messages.len(), "Listed messages");
        Ok(messages)
    }

    /// One message by id, looked up among the tenant's current listing.
    pub async fn get_message(&self, tenant_id: TenantId, role: Role, id: &str) -> Result<Message> {
        let wanted = strip_brackets(id.trim());

        self.list_messages(tenant_id, role, None)
            .await?
            .into_iter()
            .find(|m| m.id == id || strip_brackets(&m.id) == wanted)
            .ok_or_else(|| RelayError::MessageNotFound(id.to_string()))
    }

    fn resolve_grant(&self, tenant_id: TenantId, role: Role) -> Option<Grant> {
        let patterns = match self.store.permitted_patterns(tenant_id, role) {
            Ok(patterns) => patterns,
            Err(e) => {
                warn!(tenant_id, "Pattern lookup failed: {}", e);
                return None;
            }
        };
        if patterns.is_empty() {
            debug!(tenant_id, "No permitted patterns");
            return None;
        }

        let recipients = match self.store.allowed_recipients(tenant_id) {
            Ok(recipients) => recipients,
            Err(e) => {
                warn!(tenant_id, "Recipient lookup failed: {}", e);
                return None;
            }
        };

        let capability = Capability::for_role(role, recipients);
        if capability.is_empty_grant() {
            debug!(tenant_id, "Empty recipient allowlist");
            return None;
        }

        Some(Grant {
            patterns,
            capability,
        })
    }

    async fn run(&self, tenant_id: TenantId, query: &SearchQuery, grant: &Grant) -> Result<Vec<Message>> {
        debug!(tenant_id, criteria = %query.to_imap(), "Dispatching tenant query");

        let scope = Scope {
            patterns: &grant.patterns,
            capability: &grant.capability,
        };

        match tokio::time::timeout(self.request_timeout, self.pipeline.run(query, &scope)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(tenant_id, "Mailbox request timed out");
                Err(RelayError::Timeout(self.request_timeout.as_secs()))
            }
        }
    }
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

fn strip_brackets(id: &str) -> &str {
    id.trim_start_matches('<').trim_end_matches('>')
}

fn mentions(message: &Message, needle: &str) -> bool {
    message.keyword_tags.iter().any(|t| t.contains(needle))
        || message.body.to_lowercase().contains(needle)
        || message.from_address.to_lowercase().contains(needle)
        || message.to_address.to_lowercase().contains(needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RawMessage;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FakeStore {
        patterns: Vec<String>,
        recipients: HashMap<TenantId, Vec<String>>,
        fail: bool,
    }

    impl FakeStore {
        fn new(recipients: &[(TenantId, &str)]) -> Self {
            Self {
                patterns: vec!["netflix: your sign-in code".to_string()],
                recipients: recipients
                    .iter()
                    .map(|(id, addr)| (*id, vec![addr.to_string()]))
                    .collect(),
                fail: false,
            }
        }
    }

    impl PatternStore for FakeStore {
        fn permitted_patterns(&self, _tenant_id: TenantId, _role: Role) -> Result<Vec<String>> {
            if self.fail {
                return Err(RelayError::Database("locked".to_string()));
            }
            Ok(self.patterns.clone())
        }

        fn allowed_recipients(&self, tenant_id: TenantId) -> Result<Vec<String>> {
            Ok(self.recipients.get(&tenant_id).cloned().unwrap_or_default())
        }
    }

    #[derive(Default)]
    struct FakeMailbox {
        messages: Vec<RawMessage>,
        queries: Mutex<Vec<String>>,
        calls: AtomicUsize,
        delay: Option<Duration>,
        error: Option<RelayError>,
    }

    #[async_trait]
    impl Mailbox for FakeMailbox {
        async fn connect(&self) -> Result<()> {
            Ok(())
        }

        async fn disconnect(&self) {}

        async fn state(&self) -> SessionState {
            SessionState::Connected
        }

        async fn search_latest(&self, query: &SearchQuery, limit: usize) -> Result<Vec<RawMessage>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.queries.lock().unwrap().push(query.to_imap());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(e) = &self.error {
                return Err(e.clone());
            }
            let skip = self.messages.len().saturating_sub(limit);
            Ok(self.messages[skip..].to_vec())
        }
    }

    fn sign_in(uid: u32, to: &str) -> RawMessage {
        let source = format!(
            "Message-ID: <m{}@netflix>\r\nFrom: info@account.netflix.com\r\nTo: {}\r\nSubject: Netflix: Your sign-in code\r\nDate: {}\r\n\r\nCode 4321\r\n",
            uid,
            to,
            (Utc::now() - chrono::Duration::minutes(i64::from(uid))).to_rfc2822()
        );
        RawMessage {
            uid,
            bytes: source.into_bytes(),
        }
    }

    fn service(store: FakeStore, mailbox: Arc<FakeMailbox>) -> RetrievalService {
        RetrievalService::new(Arc::new(store), mailbox, &RetrievalConfig::default())
    }

    fn inbox() -> FakeMailbox {
        FakeMailbox {
            messages: vec![sign_in(1, "alice@example.com"), sign_in(2, "bob@example.com")],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_user_sees_only_own_recipient() {
        let mailbox = Arc::new(inbox());
        let svc = service(FakeStore::new(&[(1, "alice@example.com")]), mailbox.clone());

        let messages = svc.list_messages(1, Role::User, None).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].to_address, "alice@example.com");
        assert_eq!(messages[0].keyword_tags, vec!["netflix: your sign-in code".to_string()]);

        let queries = mailbox.queries.lock().unwrap();
        assert!(queries[0].contains("TO \"alice@example.com\""));
        assert!(queries[0].contains("SUBJECT \"netflix: your sign-in code\""));
    }

    #[tokio::test]
    async fn test_admin_sees_all_recipients() {
        let mailbox = Arc::new(inbox());
        let svc = service(FakeStore::new(&[]), mailbox.clone());

        let messages = svc.list_messages(1, Role::Admin, None).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].id, "<m1@netflix>");
    }

    #[tokio::test]
    async fn test_empty_allowlist_never_touches_mailbox() {
        let mailbox = Arc::new(inbox());
        let svc = service(FakeStore::new(&[]), mailbox.clone());

        assert!(svc.list_messages(1, Role::User, None).await.unwrap().is_empty());
        assert_eq!(mailbox.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_search_outside_grant_never_touches_mailbox() {
        let mailbox = Arc::new(inbox());
        let svc = service(FakeStore::new(&[(1, "alice@example.com")]), mailbox.clone());

        let messages = svc
            .list_messages(1, Role::User, Some("bob@example.com"))
            .await
            .unwrap();
        assert!(messages.is_empty());
        assert_eq!(mailbox.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_search_with_line_breaks_never_touches_mailbox() {
        let mailbox = Arc::new(inbox());
        let svc = service(FakeStore::new(&[(1, "alice@example.com")]), mailbox.clone());

        let term = "alice@example.com\r\nA9 UID STORE 1:* +FLAGS (\\Deleted)\r\nA10 EXPUNGE";
        let messages = svc.list_messages(1, Role::User, Some(term)).await.unwrap();
        assert!(messages.is_empty());
        assert_eq!(mailbox.calls.load(Ordering::SeqCst), 0);
        assert!(mailbox.queries.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_search_uses_recipient_query_and_narrows() {
        let mailbox = Arc::new(inbox());
        let svc = service(FakeStore::new(&[]), mailbox.clone());

        let messages = svc.list_messages(1, Role::Admin, Some("Bob@")).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].to_address, "bob@example.com");
        assert!(mailbox.queries.lock().unwrap()[0].ends_with("TO \"Bob@\""));
    }

    #[tokio::test]
    async fn test_blank_search_is_a_listing() {
        let mailbox = Arc::new(inbox());
        let svc = service(FakeStore::new(&[(1, "alice@example.com")]), mailbox.clone());

        let messages = svc.list_messages(1, Role::User, Some("   ")).await.unwrap();
        assert_eq!(messages.len(), 1);
    }

    #[tokio::test]
    async fn test_failing_store_returns_empty() {
        let mailbox = Arc::new(inbox());
        let mut store = FakeStore::new(&[(1, "alice@example.com")]);
        store.fail = true;
        let svc = service(store, mailbox.clone());

        assert!(svc.list_messages(1, Role::User, None).await.unwrap().is_empty());
        assert_eq!(mailbox.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_listing_is_repeatable() {
        let mailbox = Arc::new(inbox());
        let svc = service(FakeStore::new(&[]), mailbox.clone());

        let first = svc.list_messages(1, Role::Admin, None).await.unwrap();
        let second = svc.list_messages(1, Role::Admin, None).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_get_message_by_id_with_or_without_brackets() {
        let mailbox = Arc::new(inbox());
        let svc = service(FakeStore::new(&[(1, "alice@example.com")]), mailbox.clone());

        let exact = svc.get_message(1, Role::User, "<m1@netflix>").await.unwrap();
        let bare = svc.get_message(1, Role::User, "m1@netflix").await.unwrap();
        assert_eq!(exact, bare);

        let hidden = svc.get_message(1, Role::User, "<m2@netflix>").await;
        assert!(matches!(hidden, Err(RelayError::MessageNotFound(_))));
    }

    #[tokio::test]
    async fn test_connection_failure_is_retryable() {
        let mailbox = Arc::new(FakeMailbox {
            error: Some(RelayError::Connection("reset by peer".to_string())),
            ..Default::default()
        });
        let svc = service(FakeStore::new(&[]), mailbox);

        let err = svc.list_messages(1, Role::Admin, None).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_rejected_query_is_an_error_not_an_empty_list() {
        let mailbox = Arc::new(FakeMailbox {
            error: Some(RelayError::Query("SEARCH rejected: BAD".to_string())),
            ..Default::default()
        });
        let svc = service(FakeStore::new(&[]), mailbox);

        let err = svc.list_messages(1, Role::Admin, None).await.unwrap_err();
        assert!(matches!(err, RelayError::Query(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_mailbox_times_out() {
        let mailbox = Arc::new(FakeMailbox {
            delay: Some(Duration::from_secs(120)),
            ..inbox()
        });
        let svc = service(FakeStore::new(&[]), mailbox);

        let err = svc.list_messages(1, Role::Admin, None).await.unwrap_err();
        assert_eq!(err, RelayError::Timeout(30));
        assert!(err.is_retryable());
    }
}
