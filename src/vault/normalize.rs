//! Turns tool records into canonical entries, collapsing albums.
//!
//! A run of consecutive records sharing a non-empty group id becomes one
//! entry. The head is the first record in the run with text (else the first
//! record); every attachment of the run, in record order, lands in the head's
//! `attachment_list`. Records with an empty group id stand alone and keep
//! their single `attachment_path`.

use crate::vault::model::{AuthorTag, DisplayGeometry, Entry, RawRecord};
use chrono::TimeZone;
use chrono_tz::Tz;

const GRID_CONTAINER_WIDTH: u32 = 500;
const GRID_MAX_PER_ROW: u32 = 3;
const GRID_GAP: u32 = 5;
const VIDEO_GEOMETRY: DisplayGeometry = DisplayGeometry {
    width: 500,
    height: 280,
};
const VIDEO_EXTENSIONS: [&str; 3] = [".mp4", ".mov", ".avi"];

pub fn attachment_path_for(source_id: &str, entry_id: i64, file: &str) -> String {
    format!("downloads/{source_id}/{source_id}_{entry_id}_{file}")
}

pub fn format_captured_at(ts: i64, tz: Tz) -> String {
    match tz.timestamp_opt(ts, 0).single() {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => String::new(),
    }
}

/// Square cell size for an album grid of `count` attachments.
pub fn album_cell_geometry(count: usize) -> Option<DisplayGeometry> {
    if count == 0 {
        return None;
    }
    let cols = (count as u32).min(GRID_MAX_PER_ROW);
    let width = (GRID_CONTAINER_WIDTH - GRID_GAP * (cols - 1)) / cols;
    Some(DisplayGeometry {
        width,
        height: width,
    })
}

fn single_attachment_geometry(path: Option<&str>) -> Option<DisplayGeometry> {
    let lower = path?.to_ascii_lowercase();
    VIDEO_EXTENSIONS
        .iter()
        .any(|ext| lower.ends_with(ext))
        .then_some(VIDEO_GEOMETRY)
}

fn to_entry(source_id: &str, record: RawRecord, tz: Tz) -> Entry {
    let attachment_path = record
        .file
        .as_deref()
        .map(|file| attachment_path_for(source_id, record.entry_id, file));
    Entry {
        source_id: source_id.to_string(),
        entry_id: record.entry_id,
        captured_at: format_captured_at(record.date, tz),
        captured_ts: record.date,
        display_geometry: single_attachment_geometry(attachment_path.as_deref()),
        attachment_path,
        attachment_list: Vec::new(),
        author_tag: if record.sender_user_id.is_some() {
            AuthorTag::Own
        } else {
            AuthorTag::Other
        },
        body_text: record.text,
        reply_target_id: record.reply_to,
        reaction_summary: record.reactions,
        link_preview: None,
    }
}

fn collapse_album(members: Vec<Entry>) -> Option<Entry> {
    let head_index = members
        .iter()
        .position(|e| !e.body_text.is_empty())
        .unwrap_or(0);
    let geometry = album_cell_geometry(members.len());

    let mut attachments = Vec::new();
    let mut head = None;
    for (index, mut member) in members.into_iter().enumerate() {
        if let Some(path) = member.attachment_path.take() {
            attachments.push(path);
        }
        if index == head_index {
            head = Some(member);
        }
    }

    let mut head = head?;
    head.attachment_list = attachments;
    head.display_geometry = geometry;
    Some(head)
}

struct OpenGroup {
    group_id: String,
    members: Vec<Entry>,
}

impl OpenGroup {
    fn close(self, out: &mut Vec<Entry>) {
        if self.group_id.is_empty() {
            out.extend(self.members);
        } else if let Some(head) = collapse_album(self.members) {
            out.push(head);
        }
    }
}

/// Normalize one source's records, given in source order, into entries
/// ordered by capture time then id.
pub fn normalize(source_id: &str, records: Vec<RawRecord>, tz: Tz) -> Vec<Entry> {
    let mut out = Vec::with_capacity(records.len());
    let mut open: Option<OpenGroup> = None;

    for record in records {
        let group_id = record.group_id.clone();
        let entry = to_entry(source_id, record, tz);

        if let Some(group) = open.as_mut()
            && !group_id.is_empty()
            && group.group_id == group_id
        {
            group.members.push(entry);
            continue;
        }

        if let Some(group) = open.take() {
            group.close(&mut out);
        }
        open = Some(OpenGroup {
            group_id,
            members: vec![entry],
        });
    }
    if let Some(group) = open.take() {
        group.close(&mut out);
    }

    out.sort_by(|a, b| {
        a.captured_ts
            .cmp(&b.captured_ts)
            .then(a.entry_id.cmp(&b.entry_id))
    });
    out
}

#[cfg(test)]
mod tests {
    use super::{album_cell_geometry, format_captured_at, normalize};
    use crate::vault::model::{AuthorTag, DisplayGeometry, RawRecord};
    use chrono_tz::Tz;

    fn rec(id: i64, group: &str, text: &str, file: Option<&str>) -> RawRecord {
        let mut r = RawRecord::new(id, 1_700_000_000 + id);
        r.group_id = group.to_string();
        r.text = text.to_string();
        r.file = file.map(str::to_string);
        r
    }

    #[test]
    fn album_collapses_onto_first_record_with_text() {
        let entries = normalize(
            "s",
            vec![
                rec(1, "g", "", Some("a.jpg")),
                rec(2, "g", "hello", Some("b.jpg")),
                rec(3, "", "solo", None),
            ],
            Tz::UTC,
        );

        assert_eq!(entries.len(), 2);
        let album = &entries[0];
        assert_eq!(album.entry_id, 2);
        assert_eq!(album.body_text, "hello");
        assert_eq!(
            album.attachment_list,
            vec!["downloads/s/s_1_a.jpg", "downloads/s/s_2_b.jpg"]
        );
        assert_eq!(album.attachment_path, None);
        assert_eq!(
            album.display_geometry,
            Some(DisplayGeometry {
                width: 247,
                height: 247
            })
        );

        let solo = &entries[1];
        assert_eq!(solo.entry_id, 3);
        assert_eq!(solo.body_text, "solo");
        assert!(solo.attachment_list.is_empty());
    }

    #[test]
    fn textless_album_uses_first_record_as_head() {
        let entries = normalize(
            "s",
            vec![rec(5, "g", "", Some("x.png")), rec(6, "g", "", Some("y.png"))],
            Tz::UTC,
        );
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].entry_id, 5);
        assert_eq!(entries[0].attachment_list.len(), 2);
    }

    #[test]
    fn head_attachment_keeps_its_record_position() {
        let entries = normalize(
            "s",
            vec![
                rec(1, "g", "caption", Some("a.jpg")),
                rec(2, "g", "", Some("b.jpg")),
                rec(3, "g", "", None),
            ],
            Tz::UTC,
        );
        assert_eq!(
            entries[0].attachment_list,
            vec!["downloads/s/s_1_a.jpg", "downloads/s/s_2_b.jpg"]
        );
    }

    #[test]
    fn group_boundaries_follow_id_changes() {
        let entries = normalize(
            "s",
            vec![
                rec(1, "g1", "one", None),
                rec(2, "g1", "", Some("a.jpg")),
                rec(3, "g2", "two", None),
                rec(4, "", "", Some("solo.jpg")),
                rec(5, "", "", Some("solo2.jpg")),
                rec(6, "g2", "three", None),
            ],
            Tz::UTC,
        );
        let ids = entries.iter().map(|e| e.entry_id).collect::<Vec<_>>();
        assert_eq!(ids, vec![1, 3, 4, 5, 6]);
        assert_eq!(
            entries[2].attachment_path.as_deref(),
            Some("downloads/s/s_4_solo.jpg")
        );
    }

    #[test]
    fn output_is_ordered_by_time_then_id() {
        let mut late = RawRecord::new(1, 200);
        late.text = "late".to_string();
        let mut tie_high = RawRecord::new(9, 100);
        tie_high.text = "b".to_string();
        let mut tie_low = RawRecord::new(4, 100);
        tie_low.text = "a".to_string();
        let entries = normalize("s", vec![late, tie_high, tie_low], Tz::UTC);
        let ids = entries.iter().map(|e| e.entry_id).collect::<Vec<_>>();
        assert_eq!(ids, vec![4, 9, 1]);
    }

    #[test]
    fn singleton_fields_are_mapped() {
        let mut r = rec(7, "", "clip", Some("movie.MP4"));
        r.sender_user_id = Some(42);
        r.reply_to = Some(3);
        let entries = normalize("s", vec![r], Tz::UTC);
        let e = &entries[0];
        assert_eq!(e.author_tag, AuthorTag::Own);
        assert_eq!(e.reply_target_id, Some(3));
        assert_eq!(
            e.display_geometry,
            Some(DisplayGeometry {
                width: 500,
                height: 280
            })
        );
    }

    #[test]
    fn captured_at_uses_configured_timezone() {
        let tz: Tz = "Asia/Shanghai".parse().expect("tz");
        assert_eq!(format_captured_at(0, tz), "1970-01-01 08:00:00");
        assert_eq!(format_captured_at(0, Tz::UTC), "1970-01-01 00:00:00");
    }

    #[test]
    fn grid_geometry_caps_at_three_columns() {
        assert_eq!(album_cell_geometry(0), None);
        assert_eq!(album_cell_geometry(1).map(|g| g.width), Some(500));
        assert_eq!(album_cell_geometry(3).map(|g| g.width), Some(163));
        assert_eq!(album_cell_geometry(9).map(|g| g.width), Some(163));
    }
}
