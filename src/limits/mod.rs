//! Request rate limiting and upstream cost budgeting

pub mod budget;
pub mod rate_limiter;

pub use budget::{Budget, BudgetTracker};
pub use rate_limiter::{
    caller_info, extract_client_ip, is_rejection, rate_limit_middleware, rejected_request_guard,
    CallerInfo, MemoryRateLimitStore, RateLimitDecision, RateLimitStore, RateLimitSubject,
    RateLimiter, WindowCount,
};
