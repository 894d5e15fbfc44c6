//! Read-only consistency audit of the cache table against the attribute store.
//!
//! Two streaming passes, neither of which materializes an id set:
//! cache pages with point existence checks on the sidecar directory, then the
//! sidecar directory with point lookups in the cache table.

use std::sync::Arc;

use tessera_core::constants::CACHE_SCAN_PAGE_SIZE;
use tessera_core::{Clock, ConsistencyReport, TesseraResult};

use crate::attr_store::AttributeStore;
use crate::cache_table::CacheTable;

pub struct ConsistencyAuditor {
    attrs: AttributeStore,
    cache: Arc<CacheTable>,
    clock: Arc<dyn Clock>,
}

impl ConsistencyAuditor {
    pub fn new(attrs: AttributeStore, cache: Arc<CacheTable>, clock: Arc<dyn Clock>) -> Self {
        Self {
            attrs,
            cache,
            clock,
        }
    }

    pub async fn check(&self) -> TesseraResult<ConsistencyReport> {
        let now = self.clock.now();

        let mut total_cache = 0u64;
        let mut orphan_cache = 0u64;
        let mut expired = 0u64;
        let mut cursor = None;
        loop {
            let page = self.cache.scan_page(cursor, CACHE_SCAN_PAGE_SIZE)?;
            let Some(last) = page.last() else { break };
            cursor = Some(last.file_id());
            let exhausted = page.len() < CACHE_SCAN_PAGE_SIZE;

            for row in &page {
                total_cache += 1;
                if row.is_expired(now) {
                    expired += 1;
                }
                if !self.attrs.exists(row.file_id()).await? {
                    orphan_cache += 1;
                }
            }

            if exhausted {
                break;
            }
        }

        let mut total_attr = 0u64;
        let mut orphan_attr = 0u64;
        let mut scan = self.attrs.scan().await?;
        while let Some(file_id) = scan.next_id().await? {
            total_attr += 1;
            if !self.cache.contains(file_id)? {
                orphan_attr += 1;
            }
        }

        let report = ConsistencyReport::from_counts(
            total_attr,
            total_cache,
            orphan_cache,
            orphan_attr,
            expired,
            now,
        );
        if report.is_consistent {
            tracing::debug!(ctx_total_attr = total_attr, "Cache consistent");
        } else {
            tracing::warn!(
                ctx_total_attr = total_attr,
                ctx_total_cache = total_cache,
                ctx_orphan_cache = orphan_cache,
                ctx_orphan_attr = orphan_attr,
                ctx_inconsistency_percentage = report.inconsistency_percentage,
                "Cache inconsistency detected"
            );
        }
        Ok(report)
    }
}
