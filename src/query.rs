//! Translates the raw `GET /videos` query string into a storage query.
//!
//! Everything here is pure: the same [`ListQuery`] always produces the same
//! [`VideoQuery`], and nothing touches the database. The store decides how a
//! [`VideoFilter`] and [`SortSpec`] become SQL.

use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

pub const DEFAULT_PAGE: u64 = 1;
pub const DEFAULT_LIMIT: u64 = 10;

/// Query string exactly as the client sent it. Nothing is typed yet.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub page: Option<String>,
    pub limit: Option<String>,
    pub query: Option<String>,
    pub sort_by: Option<String>,
    pub sort_type: Option<String>,
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("invalid userId: {0}")]
    InvalidOwner(String),
    #[error("cannot sort by unknown field: {0}")]
    UnknownSortField(String),
}

/// Predicates combined with AND. An empty filter matches every video.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VideoFilter {
    /// Case-insensitive substring of the title.
    pub title_contains: Option<String>,
    pub owner: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    Title,
    Description,
    CreatedAt,
    UpdatedAt,
    Views,
    Duration,
    IsPublished,
}

impl SortField {
    fn parse(name: &str) -> Option<Self> {
        let field = match name {
            "title" => SortField::Title,
            "description" => SortField::Description,
            "createdAt" => SortField::CreatedAt,
            "updatedAt" => SortField::UpdatedAt,
            "views" => SortField::Views,
            "duration" => SortField::Duration,
            "isPublished" => SortField::IsPublished,
            _ => return None,
        };
        Some(field)
    }

    /// Column in the `videos` table backing this field.
    pub fn column(self) -> &'static str {
        match self {
            SortField::Title => "title",
            SortField::Description => "description",
            SortField::CreatedAt => "created_at",
            SortField::UpdatedAt => "updated_at",
            SortField::Views => "views",
            SortField::Duration => "duration",
            SortField::IsPublished => "is_published",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

impl SortDirection {
    fn parse(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("desc") {
            SortDirection::Descending
        } else {
            SortDirection::Ascending
        }
    }

    /// `1` for ascending, `-1` for descending.
    pub fn value(self) -> i8 {
        match self {
            SortDirection::Ascending => 1,
            SortDirection::Descending => -1,
        }
    }

    pub fn sql(self) -> &'static str {
        match self {
            SortDirection::Ascending => "ASC",
            SortDirection::Descending => "DESC",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortSpec {
    pub field: SortField,
    pub direction: SortDirection,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoQuery {
    pub filter: VideoFilter,
    pub sort: Option<SortSpec>,
    pub page: u64,
    pub limit: u64,
    pub skip: u64,
}

impl ListQuery {
    pub fn build(&self) -> Result<VideoQuery, QueryError> {
        let page = coerce_positive(self.page.as_deref(), DEFAULT_PAGE);
        let limit = coerce_positive(self.limit.as_deref(), DEFAULT_LIMIT);
        let skip = (page - 1).saturating_mul(limit);

        let owner = match present(&self.user_id) {
            Some(raw) => Some(
                Uuid::parse_str(raw).map_err(|_| QueryError::InvalidOwner(raw.to_string()))?,
            ),
            None => None,
        };

        let filter = VideoFilter {
            // Blank means no filter; otherwise the term is matched as typed.
            title_contains: self
                .query
                .as_deref()
                .filter(|term| !term.trim().is_empty())
                .map(str::to_string),
            owner,
        };

        let sort = match (present(&self.sort_by), present(&self.sort_type)) {
            (Some(field), Some(direction)) => Some(SortSpec {
                field: SortField::parse(field)
                    .ok_or_else(|| QueryError::UnknownSortField(field.to_string()))?,
                direction: SortDirection::parse(direction),
            }),
            _ => None,
        };

        Ok(VideoQuery {
            filter,
            sort,
            page,
            limit,
            skip,
        })
    }
}

fn present(value: &Option<String>) -> Option<&str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Integer-prefix parse: `"2.7"` is 2 and `"5abc"` is 5. Anything that does
/// not yield a value >= 1 falls back to `default`.
fn coerce_positive(raw: Option<&str>, default: u64) -> u64 {
    let Some(raw) = raw else {
        return default;
    };
    let trimmed = raw.trim_start();
    let (negative, digits) = match trimmed.as_bytes().first() {
        Some(b'-') => (true, &trimmed[1..]),
        Some(b'+') => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    if negative || end == 0 {
        return default;
    }
    match digits[..end].parse::<u64>() {
        Ok(value) if value >= 1 => value,
        // Overflowing digit runs are still a huge positive number.
        Err(_) => u64::MAX,
        Ok(_) => default,
    }
}
