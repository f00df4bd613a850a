//! Authentication module for Rise

pub mod jwt;
pub mod middleware;

pub use jwt::{Claims, JwtManager, ADMIN_ROLE};
pub use middleware::{require_admin, require_auth, AuthError, AuthState, AuthUser};
