//! # gcloud-spanner-core
//!
//! Session pool, transaction runner and streaming result reassembly for Cloud Spanner.
//!
//! The transport is pluggable: implement [`apiv1::spanner_client::SpannerStub`] on top of a
//! gRPC channel (or a fake) and hand a [`apiv1::conn_pool::Connector`] to [`client::Client::new`].
//!
//! ```ignore
//! use gcloud_spanner_core::client::{Client, ClientConfig, Error};
//! use gcloud_spanner_core::statement::Statement;
//!
//! let client = Client::new("projects/p/instances/i/databases/d", ClientConfig::default().with_env(), &connector).await?;
//!
//! let (commit, updated) = client
//!     .read_write_transaction(|tx| {
//!         Box::pin(async move {
//!             let stmt = Statement::new("UPDATE Guild SET Name = 'x' WHERE GuildId = 1");
//!             let updated = tx.update(stmt).await?;
//!             Ok::<i64, Error>(updated)
//!         })
//!     })
//!     .await?;
//!
//! let tx = client.single().await?;
//! let mut iter = tx.query(Statement::new("SELECT GuildId FROM Guild")).await?;
//! while let Some(row) = iter.next().await? {
//!     let guild_id = row.column_by_name::<String>("GuildId")?;
//! }
//! ```
pub mod apiv1;
pub mod batch;
pub mod client;
pub mod interval;
pub mod key;
pub mod mutation;
pub mod reader;
pub mod request_id;
pub mod retry;
pub mod row;
pub mod session;
pub mod statement;
pub mod transaction;
pub mod transaction_ro;
pub mod transaction_rw;
pub mod value;
