//! Scan-transform-save over one collection, one bounded page at a time.
//!
//! Each page's changed documents are written back in a single upsert batch.
//! There is no transaction spanning pages: when page N fails, pages before it
//! stay written, so transforms must depend only on the document in hand.

use anyhow::{Context, Result, bail};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::store::{Filter, Store};

pub const DEFAULT_BATCH_SIZE: usize = 500;

/// What a transform decided for one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Save,
    Skip,
}

impl Change {
    pub fn save_if(changed: bool) -> Self {
        if changed { Self::Save } else { Self::Skip }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub pages: usize,
    pub scanned: usize,
    pub written: usize,
}

impl BatchReport {
    pub fn absorb(&mut self, other: BatchReport) {
        self.pages += other.pages;
        self.scanned += other.scanned;
        self.written += other.written;
    }
}

/// Run `transform` over every document in `collection` matching `filter`.
///
/// `transform` receives the document id and a mutable body; returning
/// [`Change::Save`] queues the body for the page's write-back.
pub fn for_each_batch<T, F>(
    store: &Store,
    collection: &str,
    filter: &Filter,
    batch_size: usize,
    mut transform: F,
) -> Result<BatchReport>
where
    T: DeserializeOwned + Serialize,
    F: FnMut(&str, &mut T) -> Result<Change>,
{
    if batch_size == 0 {
        bail!("batch size must be greater than zero");
    }

    let mut report = BatchReport::default();
    let mut cursor = 0i64;
    loop {
        let page = store.scan_page::<T>(collection, filter, cursor, batch_size)?;
        let Some(last) = page.last() else {
            break;
        };
        cursor = last.seq;
        let page_len = page.len();
        report.pages += 1;
        report.scanned += page_len;

        let mut changed: Vec<(String, T)> = Vec::new();
        for mut doc in page {
            match transform(&doc.id, &mut doc.body)
                .with_context(|| format!("transform failed for {collection}/{}", doc.id))?
            {
                Change::Save => changed.push((doc.id, doc.body)),
                Change::Skip => {}
            }
        }

        report.written += store
            .upsert_batch(collection, &changed)
            .with_context(|| format!("failed to write {collection} page {}", report.pages))?;
        debug!(
            collection,
            page = report.pages,
            scanned = page_len,
            written = changed.len(),
            "batch page committed"
        );

        if page_len < batch_size {
            break;
        }
    }
    Ok(report)
}
