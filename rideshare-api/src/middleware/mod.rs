pub mod auth;

pub use auth::{auth_middleware, Claims, Identity, ADMIN_ROLE};
