//! Failsafe mechanisms: circuit breaker, admission limiting, retry, health

mod circuit_breaker;
mod health;
mod rate_limiter;
mod retry;

pub use circuit_breaker::{Admission, CircuitBreaker, CircuitGuarded, CircuitState, CircuitStats};
pub use health::{
    Alert, AlertSeverity, HealthInputs, HealthMonitor, HealthSnapshot, HealthStatus,
};
pub use rate_limiter::{AdmissionDecision, AdmissionLimiter, LimiterStats};
pub use retry::with_rate_limit;
