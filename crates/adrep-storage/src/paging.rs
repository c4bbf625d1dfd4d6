//! Cursor pagination with a hard page ceiling.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLimits {
    pub max_pages: usize,
    /// Courtesy pause between consecutive page requests.
    pub pause: Duration,
}

impl Default for PageLimits {
    fn default() -> Self {
        Self {
            max_pages: 100,
            pause: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Page<T, C> {
    pub rows: Vec<T>,
    pub next: Option<C>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Paged<T> {
    pub rows: Vec<T>,
    pub pages: usize,
    /// The ceiling was hit while the remote still offered another page.
    pub truncated: bool,
}

/// Follow `next` cursors from the first page (`None`) until exhausted.
///
/// Hitting `limits.max_pages` logs a warning and returns the rows gathered so far.
pub async fn fetch_all_pages<T, C, E, F, Fut>(
    what: &str,
    limits: PageLimits,
    mut fetch: F,
) -> Result<Paged<T>, E>
where
    F: FnMut(Option<C>) -> Fut,
    Fut: Future<Output = Result<Page<T, C>, E>>,
{
    let mut rows = Vec::new();
    let mut cursor: Option<C> = None;
    let mut pages = 0usize;
    let mut truncated = false;

    loop {
        if pages >= limits.max_pages.max(1) {
            warn!(
                what,
                max_pages = limits.max_pages,
                rows = rows.len(),
                "page ceiling reached; stopping pagination"
            );
            truncated = true;
            break;
        }
        pages += 1;

        let page = fetch(cursor.take()).await?;
        if page.rows.is_empty() {
            warn!(what, page = pages, "page returned no rows");
        } else {
            debug!(
                what,
                page = pages,
                fetched = page.rows.len(),
                total = rows.len() + page.rows.len(),
                "page fetched"
            );
        }
        rows.extend(page.rows);

        match page.next {
            Some(next) => {
                cursor = Some(next);
                if !limits.pause.is_zero() {
                    tokio::time::sleep(limits.pause).await;
                }
            }
            None => break,
        }
    }

    info!(what, pages, rows = rows.len(), "pagination finished");
    Ok(Paged {
        rows,
        pages,
        truncated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(max_pages: usize) -> PageLimits {
        PageLimits {
            max_pages,
            pause: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn follows_cursor_until_exhausted() {
        let fetch = |cursor: Option<String>| async move {
            Ok::<_, String>(match cursor.as_deref() {
                None => Page {
                    rows: vec![1, 2],
                    next: Some("b".to_string()),
                },
                Some("b") => Page {
                    rows: vec![3],
                    next: Some("c".to_string()),
                },
                _ => Page {
                    rows: vec![4],
                    next: None,
                },
            })
        };
        let paged: Paged<u32> = fetch_all_pages("rows", limits(10), fetch).await.expect("paged");

        assert_eq!(paged.rows, vec![1, 2, 3, 4]);
        assert_eq!(paged.pages, 3);
        assert!(!paged.truncated);
    }

    #[tokio::test]
    async fn ceiling_returns_partial_rows_without_error() {
        let fetch = |cursor: Option<u64>| async move {
            let page = cursor.unwrap_or(0);
            Ok::<_, String>(Page {
                rows: vec![page],
                next: Some(page + 1),
            })
        };
        let paged: Paged<u64> = fetch_all_pages("rows", limits(3), fetch)
            .await
            .expect("partial rows");

        assert_eq!(paged.rows, vec![0, 1, 2]);
        assert_eq!(paged.pages, 3);
        assert!(paged.truncated);
    }

    #[tokio::test]
    async fn page_errors_propagate() {
        let result: Result<Paged<u8>, String> =
            fetch_all_pages("rows", limits(5), |cursor: Option<u8>| async move {
                match cursor {
                    None => Ok(Page {
                        rows: vec![1],
                        next: Some(1),
                    }),
                    Some(_) => Err("boom".to_string()),
                }
            })
            .await;
        assert_eq!(result, Err("boom".to_string()));
    }
}
