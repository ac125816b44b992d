#![warn(missing_docs)]
//! Remote player host: joins a replication session, mirrors the server's
//! world through the network entity mapper and predicts local movement.

pub mod multiplayer;

pub use multiplayer::ReplicationClient;
