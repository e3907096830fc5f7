//! Interceptor: a transaction firewall that sits between web pages and the
//! user's signer.
//!
//! Page requests arrive over per-connection sockets. Transactions are
//! appended to a simulated stack on top of the latest block, run through a
//! battery of protectors, and only then shown to the user for a decision.

pub mod abi;
pub mod app;
pub mod board;
pub mod collaborators;
pub mod config;
pub mod decision;
pub mod error;
pub mod page;
pub mod polling;
pub mod protectors;
pub mod router;
pub mod rpc;
pub mod server;
pub mod simulation;
pub mod socket;
pub mod subscriptions;
pub mod types;
