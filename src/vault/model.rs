use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorTag {
    #[serde(rename = "self")]
    Own,
    Other,
}

impl AuthorTag {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Own => "self",
            Self::Other => "other",
        }
    }

    pub fn parse(raw: &str) -> Self {
        if raw == "self" { Self::Own } else { Self::Other }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionCount {
    pub emoticon: String,
    pub count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionSummary {
    pub counts: Vec<ReactionCount>,
}

impl ReactionSummary {
    /// `None` when nothing countable is left, so empty summaries are never stored.
    pub fn non_empty(self) -> Option<Self> {
        if self.counts.is_empty() { None } else { Some(self) }
    }

    pub fn count_for(&self, emoticon: &str) -> u64 {
        self.counts
            .iter()
            .find(|c| c.emoticon == emoticon)
            .map(|c| c.count)
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkPreview {
    pub title: Option<String>,
    pub image: Option<String>,
    pub description: Option<String>,
    pub site_name: Option<String>,
    pub url: Option<String>,
}

/// Rendering hint only; never used for ordering or identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayGeometry {
    pub width: u32,
    pub height: u32,
}

/// One canonical archived unit, keyed by `(source_id, entry_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub source_id: String,
    pub entry_id: i64,
    pub captured_at: String,
    pub captured_ts: i64,
    pub attachment_path: Option<String>,
    pub attachment_list: Vec<String>,
    pub author_tag: AuthorTag,
    pub body_text: String,
    pub reply_target_id: Option<i64>,
    pub reaction_summary: Option<ReactionSummary>,
    pub link_preview: Option<LinkPreview>,
    pub display_geometry: Option<DisplayGeometry>,
}

/// A record exactly as the capture tool reported it, after typed decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub entry_id: i64,
    /// Empty for records that are not part of an album.
    pub group_id: String,
    pub sender_user_id: Option<i64>,
    pub text: String,
    pub file: Option<String>,
    pub date: i64,
    pub reply_to: Option<i64>,
    pub reactions: Option<ReactionSummary>,
}

#[cfg(test)]
impl RawRecord {
    pub fn new(entry_id: i64, date: i64) -> Self {
        Self {
            entry_id,
            group_id: String::new(),
            sender_user_id: None,
            text: String::new(),
            file: None,
            date,
            reply_to: None,
            reactions: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{AuthorTag, ReactionCount, ReactionSummary};

    #[test]
    fn author_tag_round_trips_through_text() {
        assert_eq!(AuthorTag::parse(AuthorTag::Own.as_str()), AuthorTag::Own);
        assert_eq!(AuthorTag::parse("anything"), AuthorTag::Other);
        assert_eq!(
            serde_json::to_string(&AuthorTag::Own).expect("json"),
            "\"self\""
        );
    }

    #[test]
    fn empty_reaction_summary_collapses_to_none() {
        assert!(ReactionSummary::default().non_empty().is_none());
        let summary = ReactionSummary {
            counts: vec![ReactionCount {
                emoticon: "👍".to_string(),
                count: 2,
            }],
        };
        assert_eq!(summary.count_for("👍"), 2);
        assert_eq!(summary.count_for("🔥"), 0);
    }
}
