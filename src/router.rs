//! Splits a batch per destination table.
use tracing::debug;

use crate::batch::Batch;
use crate::error::SinkError;
use crate::schema::{EventKind, Row};
use crate::sink::AnalyticSink;

/// Rows of a batch grouped by destination, in routing order, empty groups dropped.
pub fn group(batch: &Batch) -> Vec<(EventKind, Vec<Row>)> {
    EventKind::ALL
        .into_iter()
        .map(|kind| {
            let rows = batch
                .events
                .iter()
                .filter(|e| e.kind() == kind)
                .map(|e| e.row())
                .collect::<Vec<_>>();
            (kind, rows)
        })
        .filter(|(_, rows)| !rows.is_empty())
        .collect()
}

/// Issues one bulk insert per event kind present in `batch`.
///
/// Stops at the first failing insert, the groups after it are not attempted.
pub async fn route<S: AnalyticSink + ?Sized>(sink: &S, batch: &Batch) -> Result<(), SinkError> {
    for (kind, rows) in group(batch) {
        sink.execute(kind.insert_statement(), &rows).await?;
        debug!(batch_id = %batch.id, table = kind.table(), rows = rows.len(), "rows inserted");
    }
    Ok(())
}
