/* src/lib.rs */

pub mod breaker;
pub mod clock;
pub mod config;
pub mod counter;
pub mod error;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod proxy;
pub mod quota;
pub mod ratelimit;
pub mod routing;
pub mod server;
pub mod state;
pub mod transform;
pub mod upstream;
pub mod websocket;
