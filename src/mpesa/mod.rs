pub mod callback;
pub mod client;
pub mod token;

pub use callback::{CallbackEnvelope, StkCallback};
pub use client::{StkPushAccepted, StkPushClient, StkPushConfig, StkPushError};
pub use token::{AccessTokenCache, TokenError};
