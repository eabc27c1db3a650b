//! IMAP SEARCH compilation
//!
//! Permission data is kept as flat disjunctions (`AnyOf`) and only folded into
//! IMAP's binary `OR` when the criteria string is rendered. The server-side
//! match is a coarse prefilter; the fetch pipeline re-checks every message.

use chrono::NaiveDate;

use crate::types::Capability;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchField {
    Subject,
    To,
}

impl SearchField {
    fn keyword(self) -> &'static str {
        match self {
            SearchField::Subject => "SUBJECT",
            SearchField::To => "TO",
        }
    }
}

/// "field contains any of values"
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnyOf {
    pub field: SearchField,
    pub values: Vec<String>,
}

impl AnyOf {
    /// `None` for an empty value list, which would otherwise match nothing
    /// (or, worse, be dropped and match everything).
    pub fn new(field: SearchField, values: &[String]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        Some(Self {
            field,
            values: values.to_vec(),
        })
    }

    /// Left-leaning prefix fold: `OR OR K "a" K "b" K "c"`.
    ///
    /// `None` when a value cannot travel in a 7-bit quoted string. Dropping
    /// only that value would narrow the disjunction, so the whole key goes and
    /// the server match gets wider instead.
    fn render(&self) -> Option<String> {
        if !self.values.iter().all(|v| v.is_ascii()) {
            return None;
        }

        let mut terms = self
            .values
            .iter()
            .map(|v| format!("{} {}", self.field.keyword(), quote(v)));

        let first = terms.next()?;
        Some(terms.fold(first, |acc, term| format!("OR {} {}", acc, term)))
    }
}

/// One top-level search key; top-level keys are ANDed by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Criterion {
    AnyOf(AnyOf),
    Either(AnyOf, AnyOf),
}

impl Criterion {
    fn render(&self) -> Option<String> {
        match self {
            Criterion::AnyOf(any) => any.render(),
            Criterion::Either(left, right) => {
                Some(format!("OR ({}) ({})", left.render()?, right.render()?))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    /// Server-local day boundary; the real recency check is client-side
    pub since: NaiveDate,
    pub criteria: Vec<Criterion>,
}

impl SearchQuery {
    /// Listing query for a tenant.
    ///
    /// Returns `None` when no subject patterns are permitted, so a tenant
    /// without grants never reaches the mailbox.
    pub fn listing(capability: &Capability, patterns: &[String], since: NaiveDate) -> Option<Self> {
        let subjects = AnyOf::new(SearchField::Subject, patterns)?;

        let criteria = match capability {
            Capability::Privileged { watch } => match AnyOf::new(SearchField::To, watch) {
                Some(recipients) => vec![Criterion::Either(subjects, recipients)],
                None => vec![Criterion::AnyOf(subjects)],
            },
            Capability::Standard { allowed_recipients } => {
                let recipients = AnyOf::new(SearchField::To, allowed_recipients)?;
                vec![Criterion::AnyOf(recipients), Criterion::AnyOf(subjects)]
            }
        };

        Some(Self { since, criteria })
    }

    /// Recipient-targeted query for the free-text search path.
    pub fn recipient(term: &str, since: NaiveDate) -> Self {
        let criteria = AnyOf::new(SearchField::To, &[term.to_string()])
            .map(Criterion::AnyOf)
            .into_iter()
            .collect();
        Self { since, criteria }
    }

    /// Render as the argument of `UID SEARCH`.
    ///
    /// Criteria with non-ASCII values are left out; the fetch pipeline
    /// applies them client-side anyway.
    pub fn to_imap(&self) -> String {
        let mut parts = vec![format!("SINCE {}", self.since.format("%d-%b-%Y"))];
        parts.extend(self.criteria.iter().filter_map(Criterion::render));
        parts.join(" ")
    }
}

/// IMAP quoted string. Control characters are removed: a CR or LF would end
/// the command line and start a new command on the shared session.
fn quote(value: &str) -> String {
    let cleaned: String = value.chars().filter(|c| !c.is_control()).collect();
    let escaped = cleaned.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{}\"", escaped)
}
