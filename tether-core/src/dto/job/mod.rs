//! Job DTOs for the master's HTTP API

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::status::Status;

/// Request to create or replace a job definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSource {
    /// The job definition as YAML
    pub yaml: String,
}

/// Request to overwrite a job's parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveParams {
    pub parameter: BTreeMap<String, String>,
}

/// Query parameters for paged listings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageQuery {
    #[serde(default)]
    pub keyword: String,
    #[serde(default)]
    pub page: usize,
    #[serde(default)]
    pub page_size: usize,
}

/// One page of a listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    /// 1-based page number
    pub page: usize,
    pub page_size: usize,

    /// Number of items across all pages
    pub total: usize,

    pub data: Vec<T>,
}

impl<T> Page<T> {
    pub const DEFAULT_SIZE: usize = 10;

    /// Cuts one page out of `items`
    ///
    /// Page 0 means the first page and a size of 0 means `DEFAULT_SIZE`. A page
    /// past the end is empty but still reports the total.
    pub fn slice(items: Vec<T>, page: usize, page_size: usize) -> Self {
        let page = page.max(1);
        let page_size = if page_size == 0 {
            Self::DEFAULT_SIZE
        } else {
            page_size
        };
        let total = items.len();

        let start = (page - 1).saturating_mul(page_size).min(total);
        let data = items.into_iter().skip(start).take(page_size).collect();

        Self {
            page,
            page_size,
            total,
            data,
        }
    }
}

/// Query parameters for stage log tailing
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageLogQuery {
    #[serde(default)]
    pub start: usize,
}

/// Emitted by the master whenever an execution changes status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub job_name: String,
    pub job_id: u64,
    pub status: Status,
}
