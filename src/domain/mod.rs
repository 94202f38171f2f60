pub mod metadata;
pub mod transaction;
pub mod webhook_attempt;

pub use metadata::{parse_metadata, Metadata, MetadataItem, MetadataValue};
pub use transaction::{TerminalUpdate, Transaction, TransactionStatus, UnknownStatus};
pub use webhook_attempt::WebhookAttempt;
