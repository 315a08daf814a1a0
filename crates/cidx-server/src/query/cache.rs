//! Session-scoped cache handles for oversized search results.

use std::collections::HashMap;
use std::sync::Arc;

use cidx_core::error::{CidxError, CidxResult};
use cidx_core::model::CacheHandle;
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

struct CachedContent {
    session_id: Uuid,
    full_content: Arc<String>,
    page_tokens: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CachePage {
    pub content: String,
    pub total_pages: usize,
    pub has_more: bool,
}

/// A fine-grained-locked, session-scoped map guarding cache handles.
#[derive(Default)]
pub struct CacheStore {
    entries: Mutex<HashMap<Uuid, CachedContent>>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, session_id: Uuid, full_content: String, page_tokens: usize) -> CacheHandle {
        let handle = CacheHandle::new();
        self.entries.lock().insert(
            handle.0,
            CachedContent {
                session_id,
                full_content: Arc::new(full_content),
                page_tokens,
            },
        );
        handle
    }

    /// Retrieves one page of cached content. Invariant: readable only
    /// within the issuing session.
    pub fn get_page(&self, handle: CacheHandle, session_id: Uuid, page: usize) -> CidxResult<CachePage> {
        let entries = self.entries.lock();
        let entry = entries
            .get(&handle.0)
            .ok_or_else(|| CidxError::NotFound("cache handle not found or expired".to_string()))?;

        if entry.session_id != session_id {
            return Err(CidxError::PermissionDenied(
                "cache handle belongs to a different session".to_string(),
            ));
        }

        // Approximate paging by character count proportional to the
        // token-budget page size (4 chars/token).
        let page_chars = entry.page_tokens * 4;
        let total_pages = entry.full_content.len().div_ceil(page_chars.max(1)).max(1);
        let start = page.saturating_sub(1) * page_chars;
        if start >= entry.full_content.len() && !entry.full_content.is_empty() {
            return Err(CidxError::InvalidInput(format!("page {page} out of range")));
        }
        let end = (start + page_chars).min(entry.full_content.len());
        let content = entry.full_content[start..end].to_string();

        Ok(CachePage {
            content,
            total_pages,
            has_more: page < total_pages,
        })
    }

    /// Drops every handle owned by a session, called when the session
    /// expires.
    pub fn evict_session(&self, session_id: Uuid) {
        self.entries.lock().retain(|_, v| v.session_id != session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_the_issuing_session_can_read() {
        let cache = CacheStore::new();
        let owner = Uuid::new_v4();
        let other = Uuid::new_v4();
        let handle = cache.store(owner, "a".repeat(100), 10);

        assert!(cache.get_page(handle, owner, 1).is_ok());
        let err = cache.get_page(handle, other, 1).unwrap_err();
        assert!(matches!(err, CidxError::PermissionDenied(_)));
    }

    #[test]
    fn paging_reports_has_more_until_last_page() {
        let cache = CacheStore::new();
        let owner = Uuid::new_v4();
        let handle = cache.store(owner, "x".repeat(100), 10); // page_chars = 40
        let first = cache.get_page(handle, owner, 1).unwrap();
        assert!(first.has_more);
        let last = cache.get_page(handle, owner, first.total_pages).unwrap();
        assert!(!last.has_more);
    }
}
