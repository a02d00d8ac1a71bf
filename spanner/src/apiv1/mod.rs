pub mod conn_pool;
pub mod spanner_client;
pub mod types;
