pub mod circuit_breaker;
pub mod dlq;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState,
};
pub use dlq::DeadLetterQueue;
pub use retry::{RetryConfig, RetryHandler, RetryOutcome};
