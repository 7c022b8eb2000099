//! Hard limits applied to every tenant. Requests over a limit fail with
//! `EngineError::LimitExceeded` before anything is written.

pub const MAX_TENANTS: usize = 64;
pub const MAX_TENANT_NAME_LEN: usize = 128;

pub const MAX_SPACES_PER_TENANT: usize = 100_000;
pub const MAX_USERS_PER_TENANT: usize = 1_000_000;
pub const MAX_RESERVATIONS_PER_SPACE: usize = 50_000;

pub const MAX_TITLE_LEN: usize = 200;
pub const MAX_DESCRIPTION_LEN: usize = 4_000;
pub const MAX_ADDRESS_LEN: usize = 500;
pub const MAX_URL_LEN: usize = 2_048;
pub const MAX_NAME_LEN: usize = 200;
pub const MAX_EMAIL_LEN: usize = 254;
pub const MAX_DETAILS_LEN: usize = 2_000;

/// Longest date range a single reservation may cover.
pub const MAX_RESERVATION_DAYS: i64 = 366;

pub const DEFAULT_PAGE_SIZE: usize = 10;
pub const MAX_PAGE_SIZE: usize = 100;

/// How many spaces each ranking in the report lists.
pub const REPORT_RANKING_LEN: usize = 10;
