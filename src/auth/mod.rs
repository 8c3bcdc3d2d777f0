//! Authentication
//!
//! Tokens are issued by the platform's identity service. This module only
//! verifies them and exposes the caller to handlers.

mod jwt;
mod middleware;

pub use jwt::{create_token, decode_token, Claims};
pub use middleware::auth_middleware;
