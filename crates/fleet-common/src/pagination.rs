use serde::{Deserialize, Serialize};

/// Page size used when neither the request nor the configuration sets one.
pub const DEFAULT_PAGE_SIZE: i64 = 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginationResult<T> {
    pub items: Vec<T>,
    pub total_count: usize,
    pub page: i64,
    pub page_size: i64,
}

/// Slice one page out of an already ordered sequence.
///
/// `skip = max(0, page * page_size)`, `limit = page_size`. Callers are
/// responsible for the ordering; the same input always yields the same page.
pub fn paginate<T: Clone>(ordered: &[T], page: i64, page_size: i64) -> PaginationResult<T> {
    let skip = page.saturating_mul(page_size).max(0) as usize;
    let limit = page_size.max(0) as usize;
    PaginationResult {
        items: ordered.iter().skip(skip).take(limit).cloned().collect(),
        total_count: ordered.len(),
        page,
        page_size,
    }
}
