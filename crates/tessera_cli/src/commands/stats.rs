//! Stats command implementation.

use super::{format_size, open_existing};
use crate::error::CliResult;
use crate::Format;
use std::path::Path;
use tessera_core::DatabaseStatistics;

/// Runs the stats command.
pub fn run(path: &Path, format: Format) -> CliResult<()> {
    let db = open_existing(path)?;
    let statistics = db.statistics();
    let metrics = db.metrics().snapshot();
    db.dispose()?;
    let statistics = statistics?;

    match format {
        Format::Json => {
            let report = serde_json::json!({
                "statistics": statistics,
                "metrics": metrics,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Format::Text => print_text_output(&statistics),
    }
    Ok(())
}

fn print_text_output(stats: &DatabaseStatistics) {
    let etag = |etag: Option<tessera_core::Etag>| etag.map_or_else(|| "-".to_string(), |e| e.to_string());

    println!("Tessera Database Statistics");
    println!("===========================");
    println!();
    println!("Documents:    {}", stats.count_of_documents);
    println!("Attachments:  {}", stats.count_of_attachments);
    println!("Last doc etag:        {}", etag(stats.last_doc_etag));
    println!("Last attachment etag: {}", etag(stats.last_attachment_etag));
    println!("Pending tasks: {}", stats.approximate_task_count);
    println!("Size on disk:  {}", format_size(stats.total_size_on_disk));
    println!();
    println!("Indexes: {}", stats.count_of_indexes);
    for index in &stats.indexes {
        let stale = stats.stale_indexes.contains(&index.stats.name);
        println!(
            "  {}{}{}  attempts {} errors {} (rate {:.2})",
            index.stats.name,
            if stale { " [stale]" } else { "" },
            if index.is_invalid { " [disabled]" } else { "" },
            index.stats.indexing_attempts,
            index.stats.indexing_errors,
            index.failure_rate,
        );
    }
    if !stats.triggers.is_empty() {
        println!();
        println!("Triggers: {}", stats.triggers.len());
    }
    if !stats.errors.is_empty() {
        println!();
        println!("Recent errors:");
        for error in &stats.errors {
            match &error.document {
                Some(document) => println!("  {} ({document}): {}", error.index, error.error),
                None => println!("  {}: {}", error.index, error.error),
            }
        }
    }
}
