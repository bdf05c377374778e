//! Endpoint normalization and category selection.
//!
//! Limiter keys use the normalized path so `/api/tasks/17` and `/api/tasks/42`
//! share one window.

use serde::{Deserialize, Serialize};

const AUTH_ENDPOINTS: [&str; 3] = ["/auth/login", "/auth/register", "/auth/refresh-token"];
const TASK_ITEM_PREFIXES: [&str; 3] = ["/tasks", "/taskitems", "/task-items"];

/// Static limit category of an endpoint, used when the quota oracle has no
/// per-user rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointCategory {
    /// Login, registration, and token refresh.
    Authentication,
    /// Task item CRUD.
    TaskItems,
    /// Everything else.
    General,
}

impl EndpointCategory {
    /// Classify a normalized path. An optional leading `/api` is ignored.
    pub fn classify(normalized: &str) -> Self {
        let path = normalized.strip_prefix("/api").filter(|p| p.starts_with('/')).unwrap_or(normalized);

        if AUTH_ENDPOINTS.contains(&path) {
            return EndpointCategory::Authentication;
        }
        let is_task_item = TASK_ITEM_PREFIXES.iter().any(|prefix| {
            path.strip_prefix(prefix).is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
        });
        if is_task_item {
            EndpointCategory::TaskItems
        } else {
            EndpointCategory::General
        }
    }
}

/// Normalize a request path for use in limiter keys.
///
/// Lower-cases, drops the query string and trailing slash, and replaces
/// numeric or UUID segments with `{id}`.
pub fn normalize_path(path: &str) -> String {
    let path = path.split('?').next().unwrap_or_default();
    let segments: Vec<String> = path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|segment| {
            if segment.chars().all(|c| c.is_ascii_digit()) || is_uuid(segment) {
                "{id}".to_string()
            } else {
                segment.to_ascii_lowercase()
            }
        })
        .collect();

    if segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", segments.join("/"))
    }
}

fn is_uuid(segment: &str) -> bool {
    segment.len() == 36
        && segment.char_indices().all(|(i, c)| match i {
            8 | 13 | 18 | 23 => c == '-',
            _ => c.is_ascii_hexdigit(),
        })
}
