pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod model;
pub mod retry;
pub mod session;
pub mod transaction;
pub mod transport;
pub mod waiter;

pub use client::{InvokeOptions, ProtocolClient};
pub use config::Config;
pub use error::{CpiError, StepFailure};
pub use model::{Document, Link, Task, TaskStatus};
pub use transaction::{Step, Transaction, TransactionOptions, TransactionOutcome};
