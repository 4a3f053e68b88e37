//! Dump WAL command implementation.

use super::{ensure_database, scan_wal};
use crate::error::CliResult;
use crate::Format;
use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use tessera_core::storage::Mutation;
use tessera_core::wal::WalRecord;

/// WAL record representation for output.
#[derive(Debug, Serialize)]
pub struct WalRecordInfo {
    /// Offset in the WAL file.
    pub offset: u64,
    /// Record type.
    pub record_type: String,
    /// Batch id.
    pub batch: u64,
    /// Payload size in bytes (mutations only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_size: Option<usize>,
    /// Short description of the mutation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Decoded mutation, when requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mutation: Option<Value>,
}

/// Runs the dump-wal command.
pub fn run(path: &Path, limit: Option<usize>, mutations: bool, format: Format) -> CliResult<()> {
    ensure_database(path)?;
    let scan = scan_wal(path)?;
    let records: Vec<WalRecordInfo> = scan
        .records
        .iter()
        .take(limit.unwrap_or(usize::MAX))
        .map(|(offset, record)| describe(*offset, record, mutations))
        .collect();

    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&records)?),
        Format::Text => print_text_output(&records),
    }
    if let Some(e) = scan.error {
        eprintln!("WAL scan stopped: {e}");
    }
    Ok(())
}

/// Renders one record.
pub fn describe(offset: u64, record: &WalRecord, decode: bool) -> WalRecordInfo {
    let mut info = WalRecordInfo {
        offset,
        record_type: format!("{:?}", record.record_type()).to_uppercase(),
        batch: record.batch(),
        payload_size: None,
        summary: None,
        mutation: None,
    };
    if let WalRecord::Mutation { payload, .. } = record {
        info.payload_size = Some(payload.len());
        match Mutation::decode(payload) {
            Ok(mutation) => {
                info.summary = Some(summarize(&mutation));
                if decode {
                    info.mutation = serde_json::to_value(&mutation).ok();
                }
            }
            Err(e) => info.summary = Some(format!("undecodable: {e}")),
        }
    }
    info
}

fn summarize(mutation: &Mutation) -> String {
    match mutation {
        Mutation::PutDocument(doc) => format!("put document {} @ {}", doc.key, doc.etag),
        Mutation::DeleteDocument { key } => format!("delete document {key}"),
        Mutation::PutAttachment(att) => {
            format!("put attachment {} ({} bytes) @ {}", att.key, att.size, att.etag)
        }
        Mutation::DeleteAttachment { key } => format!("delete attachment {key}"),
        Mutation::PutTransaction(tx) => {
            format!("stage transaction {} ({} ops)", tx.id, tx.operations.len())
        }
        Mutation::DeleteTransaction { id } => format!("end transaction {id}"),
        Mutation::AddTask { task, .. } => format!("queue task for {}", task.index()),
        Mutation::RemoveTasks { ids } => format!("remove {} task(s)", ids.len()),
        Mutation::SetIndexStats(stats) => format!("index stats {}", stats.name),
        Mutation::DeleteIndex { name } => format!("delete index {name}"),
        Mutation::PutMappedResults {
            index,
            doc_key,
            results,
        } => format!("{} mapped result(s) of {doc_key} in {index}", results.len()),
        Mutation::DeleteMappedResults { index, doc_key } => {
            format!("drop mapped results of {doc_key} in {index}")
        }
        Mutation::SetIdentity { name, value } => format!("identity {name} = {value}"),
    }
}

fn print_text_output(records: &[WalRecordInfo]) {
    println!("{:>10}  {:<10}  {:>6}  DETAILS", "OFFSET", "TYPE", "BATCH");
    for record in records {
        println!(
            "{:>10}  {:<10}  {:>6}  {}",
            record.offset,
            record.record_type,
            record.batch,
            record.summary.as_deref().unwrap_or("")
        );
        if let Some(mutation) = &record.mutation {
            println!("{:>32}{mutation}", "");
        }
    }
    println!();
    println!("{} record(s)", records.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::storage::Mutation;

    #[test]
    fn mutations_are_summarized() {
        let payload = Mutation::SetIdentity {
            name: "users/".into(),
            value: 7,
        }
        .encode()
        .unwrap();
        let info = describe(
            64,
            &WalRecord::Mutation {
                batch: 3,
                payload: payload.clone(),
            },
            true,
        );
        assert_eq!(info.record_type, "MUTATION");
        assert_eq!(info.batch, 3);
        assert_eq!(info.payload_size, Some(payload.len()));
        assert_eq!(info.summary.as_deref(), Some("identity users/ = 7"));
        assert!(info.mutation.is_some());

        let commit = describe(0, &WalRecord::Commit { batch: 3 }, true);
        assert_eq!(commit.record_type, "COMMIT");
        assert!(commit.summary.is_none());
    }
}
