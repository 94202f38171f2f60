pub mod postgres_transaction_store;

pub use postgres_transaction_store::PostgresTransactionStore;
