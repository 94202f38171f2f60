pub mod auth;
pub mod ip_filter;

pub use auth::internal_auth;
pub use ip_filter::IpFilterLayer;
