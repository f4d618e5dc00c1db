//! Inbound TLS server
//!
//! Terminates mutual TLS from tunnel clients and relays each connection, in plaintext, to a
//! fixed backend (typically a database on loopback).

mod server;

pub use server::{TlsServer, TlsServerConfig, TlsServerError};
