pub mod broker;
pub mod cache;
pub mod caller;
pub mod catalog;
pub mod config;
pub mod convert;
pub mod error;
pub mod identity;
pub mod scheduler;
pub mod service;
pub mod shutdown;
pub mod worker;

pub use error::{BrokerError, Result};
