//! Search filters and paged results for resource queries.

use super::resource::Resource;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_ITEMS_PER_PAGE: u32 = 25;
pub const MAX_ITEMS_PER_PAGE: u32 = 100;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrderBy {
    #[default]
    CreatedAt,
    FileName,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Ascending,
    #[default]
    Descending,
}

/// Filters accepted by search and bulk download.
///
/// `file_name` matches as a substring of the default version's file name.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct SearchFilters {
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
    pub is_public_resource: Option<bool>,
    pub created_date_from: Option<DateTime<Utc>>,
    pub created_date_to: Option<DateTime<Utc>>,
    #[serde(default)]
    pub order_by: OrderBy,
    #[serde(default)]
    pub order: SortOrder,
    pub page_index: Option<u32>,
    pub items_per_page: Option<u32>,
}

impl SearchFilters {
    pub fn page_index(&self) -> u32 {
        self.page_index.unwrap_or(0)
    }

    /// Page size clamped to `1..=MAX_ITEMS_PER_PAGE`.
    pub fn items_per_page(&self) -> u32 {
        self.items_per_page
            .unwrap_or(DEFAULT_ITEMS_PER_PAGE)
            .clamp(1, MAX_ITEMS_PER_PAGE)
    }
}

#[derive(Serialize, Debug)]
pub struct SearchResults {
    pub total_count: i64,
    pub retrieved_count: usize,
    pub page_index: u32,
    pub items_per_page: u32,
    pub order: SortOrder,
    pub order_by: OrderBy,
    pub items: Vec<Resource>,
}
