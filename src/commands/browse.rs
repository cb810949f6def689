use anyhow::Result;

use crate::commands::CommandReport;
use crate::vault::model::LinkPreview;
use crate::vault::paths::resolve_paths;
use crate::vault::query::{DEFAULT_PAGE_LIMIT, EntryPage};
use crate::vault::store::ArchiveStore;

fn open_archive(source_id: &str, report: &mut CommandReport) -> Result<Option<ArchiveStore>> {
    let paths = resolve_paths()?;
    let store = ArchiveStore::open_existing(&paths, source_id)?;
    if store.is_none() {
        report.issue(format!("no archive for source {source_id}"));
    }
    Ok(store)
}

fn preview_line(text: &str) -> String {
    let line = text.lines().next().unwrap_or("").trim();
    if line.chars().count() > 80 {
        format!("{}...", line.chars().take(80).collect::<String>())
    } else {
        line.to_string()
    }
}

fn page_details(report: &mut CommandReport, page: &EntryPage) {
    report.detail(format!("total={} offset={}", page.total, page.offset));
    for item in &page.entries {
        report.detail(format!(
            "{} [{}] {}",
            item.entry.entry_id,
            item.entry.captured_at,
            preview_line(&item.entry.body_text)
        ));
    }
}

pub fn messages(source_id: &str, offset: i64, limit: Option<usize>) -> Result<CommandReport> {
    let mut report = CommandReport::new("messages");
    let Some(store) = open_archive(source_id, &mut report)? else {
        report.attach(&EntryPage::empty())?;
        return Ok(report);
    };
    let page = store.page(offset, limit.unwrap_or(DEFAULT_PAGE_LIMIT))?;
    page_details(&mut report, &page);
    report.attach(&page)?;
    Ok(report)
}

pub fn message(source_id: &str, entry_id: i64) -> Result<CommandReport> {
    let mut report = CommandReport::new("message");
    let Some(store) = open_archive(source_id, &mut report)? else {
        return Ok(report);
    };
    let Some(item) = store.entry(entry_id)? else {
        report.issue(format!("entry {entry_id} not found in source {source_id}"));
        return Ok(report);
    };
    report.detail(format!("entry_id={}", item.entry.entry_id));
    report.detail(format!("captured_at={}", item.entry.captured_at));
    report.detail(format!("author={}", item.entry.author_tag.as_str()));
    if let Some(path) = item.entry.attachment_path.as_deref() {
        report.detail(format!("attachment={path}"));
    }
    if let Some(reply) = item.reply_to.as_deref() {
        report.detail(format!(
            "reply_to={} {}",
            reply.entry_id,
            preview_line(&reply.body_text)
        ));
    }
    report.detail(format!("text={}", item.entry.body_text));
    report.attach(&item)?;
    Ok(report)
}

pub fn search(source_id: &str, query: &str) -> Result<CommandReport> {
    let mut report = CommandReport::new("search");
    let Some(store) = open_archive(source_id, &mut report)? else {
        return Ok(report);
    };
    let found = store.search(query)?;
    report.detail(format!("total={}", found.total));
    for item in &found.results {
        report.detail(format!(
            "#{} {} [{}] {}",
            item.index.unwrap_or(0),
            item.entry.entry_id,
            item.entry.captured_at,
            preview_line(&item.entry.body_text)
        ));
    }
    report.attach(&found)?;
    Ok(report)
}

pub fn reactions(source_id: &str) -> Result<CommandReport> {
    let mut report = CommandReport::new("reactions");
    let Some(store) = open_archive(source_id, &mut report)? else {
        return Ok(report);
    };
    let totals = store.reaction_totals()?;
    for total in &totals {
        report.detail(format!("{} {}", total.emoticon, total.count));
    }
    report.attach(&totals)?;
    Ok(report)
}

pub fn by_reaction(
    source_id: &str,
    emoticon: &str,
    offset: usize,
    limit: Option<usize>,
) -> Result<CommandReport> {
    let mut report = CommandReport::new("by-reaction");
    let Some(store) = open_archive(source_id, &mut report)? else {
        return Ok(report);
    };
    let page = store.by_reaction(emoticon, offset, limit.unwrap_or(DEFAULT_PAGE_LIMIT))?;
    page_details(&mut report, &page);
    report.attach(&page)?;
    Ok(report)
}

pub fn set_preview(source_id: &str, entry_id: i64, preview: &LinkPreview) -> Result<CommandReport> {
    let mut report = CommandReport::new("preview");
    let Some(store) = open_archive(source_id, &mut report)? else {
        return Ok(report);
    };
    if store.set_link_preview(entry_id, preview)? {
        report.detail(format!("link preview stored for entry {entry_id}"));
    } else {
        report.issue(format!("entry {entry_id} not found in source {source_id}"));
    }
    Ok(report)
}
