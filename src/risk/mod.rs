// Risk management module
pub mod circuit_breakers;

pub use circuit_breakers::{
    BreakerError, BreakerState, BreakerStatus, BreakerTrigger, CircuitBreaker,
    CircuitBreakerConfig, CircuitBreakerState, CircuitBreakerTrip,
};
