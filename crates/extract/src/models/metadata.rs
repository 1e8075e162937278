use crate::consts::TITLE_TAG_REGEX;
use crate::models::TicketId;
use time::UtcDateTime;

/// What the ticketing system told us about a ticket, at the moment we asked.
///
/// Deliberately not cached between runs: tickets get moved between projects
/// and re-categorized upstream, and a stale answer files a document in the
/// wrong place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketMetadata {
    pub id: TicketId,
    pub project: String,
    pub category: String,
    pub title: String,
    /// Bracketed prefixes of the title, in order: `[A][B] Title` yields
    /// `["A", "B"]`. Teams commonly encode customer or site codes this way.
    pub tags: Vec<String>,
    pub fetched_at: UtcDateTime,
}

impl TicketMetadata {
    pub fn new(
        id: TicketId,
        project: impl Into<String>,
        category: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        let title = title.into();
        Self {
            tags: title_tags(&title),
            id,
            project: project.into(),
            category: category.into(),
            title,
            fetched_at: UtcDateTime::now(),
        }
    }

    /// The title with its leading `[tag]` prefixes removed.
    pub fn subject(&self) -> &str {
        let mut rest = self.title.as_str();
        while let Some(m) = TITLE_TAG_REGEX.find(rest) {
            rest = &rest[m.end()..];
        }
        rest.trim()
    }
}

/// Splits the leading `[tag]` groups off a ticket title.
pub fn title_tags(title: &str) -> Vec<String> {
    let mut tags = Vec::new();
    let mut rest = title;
    while let Some(captures) = TITLE_TAG_REGEX.captures(rest) {
        // Infallible: group 1 always participates in a match.
        let Some(tag) = captures.get(1) else { break };
        let tag = tag.as_str().trim();
        if !tag.is_empty() {
            tags.push(tag.to_string());
        }
        rest = &rest[captures.get(0).map_or(rest.len(), |m| m.end())..];
    }
    tags
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("[Nanya][G2128][AJ005422] Slow inspection", &["Nanya", "G2128", "AJ005422"], "Slow inspection")]
    #[case("[Acme] Invoice run", &["Acme"], "Invoice run")]
    #[case("No tags here", &[], "No tags here")]
    #[case("Trailing [tag] is not a prefix", &[], "Trailing [tag] is not a prefix")]
    #[case("[] [ok] empty brackets skipped", &["ok"], "empty brackets skipped")]
    fn test_title_tags(#[case] title: &str, #[case] tags: &[&str], #[case] subject: &str) {
        let metadata = TicketMetadata::new("1".parse().unwrap(), "P", "C", title);
        assert_eq!(metadata.tags, tags);
        assert_eq!(metadata.subject(), subject);
    }
}
