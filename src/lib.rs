pub mod admission;
pub mod cascade;
pub mod config;
pub mod ingress;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod store;
pub mod sweeper;
pub mod trigger;
pub mod wal;
