// src/query/cursor.rs
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;

pub const DEFAULT_PAGE_SIZE: u64 = 15;
pub const MAX_PAGE_SIZE: u64 = 100;

/// Offset-based pagination window, decoded from an opaque cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub page_size: u64,
    pub offset: u64,
}

impl Page {
    /// Resolve the effective page from an optional cursor and an optional
    /// explicit page size. The cursor wins: paginating keeps the page size
    /// the listing started with.
    pub fn resolve(cursor: Option<&str>, page_size: Option<u64>) -> Result<Page, LedgerError> {
        match cursor {
            Some(token) => decode_token(token),
            None => Ok(Page {
                page_size: page_size.unwrap_or(DEFAULT_PAGE_SIZE).min(MAX_PAGE_SIZE),
                offset: 0,
            }),
        }
    }

    fn token(&self) -> String {
        let raw = serde_json::to_vec(self).expect("pages are always serializable");
        URL_SAFE_NO_PAD.encode(raw)
    }
}

fn decode_token(token: &str) -> Result<Page, LedgerError> {
    let raw = URL_SAFE_NO_PAD
        .decode(token)
        .map_err(|_| LedgerError::InvalidQuery("malformed cursor".to_string()))?;
    serde_json::from_slice(&raw)
        .map_err(|_| LedgerError::InvalidQuery("malformed cursor".to_string()))
}

/// One page of results plus opaque pagination tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cursor<T> {
    pub page_size: u64,
    pub has_more: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    pub data: Vec<T>,
}

impl<T> Cursor<T> {
    pub fn build(page: &Page, data: Vec<T>, has_more: bool) -> Self {
        let previous = (page.offset > 0).then(|| {
            Page {
                page_size: page.page_size,
                offset: page.offset.saturating_sub(page.page_size),
            }
            .token()
        });
        let next = has_more.then(|| {
            Page {
                page_size: page.page_size,
                offset: page.offset + page.page_size,
            }
            .token()
        });
        Self {
            page_size: page.page_size,
            has_more,
            previous,
            next,
            data,
        }
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Cursor<U> {
        Cursor {
            page_size: self.page_size,
            has_more: self.has_more,
            previous: self.previous,
            next: self.next,
            data: self.data.into_iter().map(f).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_page() {
        let page = Page::resolve(None, None).unwrap();
        assert_eq!(page.page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(page.offset, 0);
    }

    #[test]
    fn page_size_clamped() {
        let page = Page::resolve(None, Some(1000)).unwrap();
        assert_eq!(page.page_size, MAX_PAGE_SIZE);
    }

    #[test]
    fn cursor_round_trip() {
        let page = Page {
            page_size: 10,
            offset: 0,
        };
        let cursor = Cursor::build(&page, vec![1, 2, 3], true);
        assert!(cursor.previous.is_none());

        let next = Page::resolve(cursor.next.as_deref(), None).unwrap();
        assert_eq!(next.page_size, 10);
        assert_eq!(next.offset, 10);

        let cursor = Cursor::build(&next, vec![4], false);
        assert!(cursor.next.is_none());
        let previous = Page::resolve(cursor.previous.as_deref(), None).unwrap();
        assert_eq!(previous.offset, 0);
    }

    #[test]
    fn garbage_cursor_rejected() {
        assert!(Page::resolve(Some("not a cursor!"), None).is_err());
    }
}
