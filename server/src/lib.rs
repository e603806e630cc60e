//! # Session Server Library
//!
//! This library implements the server side of a two-phase UDP session
//! protocol. A single well-known rendezvous port handles connection
//! handshakes; every accepted client is then handed a private ephemeral
//! port and an isolated session that lives there until the client leaves.
//!
//! ## Core Responsibilities
//!
//! ### Handshake and Capacity
//! The control loop validates the magic and protocol version of each connect
//! request and replies with either an accept frame carrying the session port
//! or a reject frame carrying a reason. Capacity is enforced here, and a
//! client retrying a lost accept reply gets the same port again.
//!
//! ### Session Isolation
//! Each session owns its own socket, sequence counter and instruction queue.
//! Sessions never share mutable state; anything crossing session boundaries
//! goes through the registry.
//!
//! ### Coordinated Teardown
//! A session is torn down by cancelling it, releasing its socket and waiting
//! for its network loop to report exit. Server shutdown does this for every
//! session concurrently before the rendezvous socket is released.
//!
//! ## Architecture Design
//!
//! ### Two Loops per Session
//! The network loop receives and decodes datagrams, drops stale ones and
//! queues instructions. The execution loop drains the queue on a fixed tick.
//! Decoding and command effects therefore never run at the same time for the
//! same client.
//!
//! ### Explicit Collaborators
//! Configuration and the console registries are plain values handed to the
//! server at construction time. There is no global state.
//!
//! ## Module Organization
//!
//! ### Config Module (`config`)
//! Server and session settings with validation.
//!
//! ### Console Module (`console`)
//! Named commands and configuration variables; client string commands are
//! dispatched through it.
//!
//! ### Network Module (`network`)
//! The rendezvous socket, the control loop and server lifecycle.
//!
//! ### Registry Module (`registry`)
//! The synchronized map of live sessions.
//!
//! ### Session Module (`session`)
//! Per-client sequencing, instruction queue and the two session loops.
//!
//! ### Transport Module (`transport`)
//! Send helpers and read-error classification shared by all loops.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::console::Console;
//! use server::network::Server;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let console = Arc::new(Console::with_defaults());
//!     let config = ServerConfig::from_cvars(&console.cvars);
//!     let server = Arc::new(Server::bind(config, console).await?);
//!
//!     let runner = {
//!         let server = Arc::clone(&server);
//!         tokio::spawn(async move { server.run().await })
//!     };
//!
//!     tokio::signal::ctrl_c().await?;
//!     server.shutdown().await;
//!     runner.await??;
//!     Ok(())
//! }
//! ```
//!
//! ## Security Considerations
//!
//! A structurally malformed connect request stops the control loop rather
//! than being skipped. The rendezvous port is meant for trusted networks.

pub mod config;
pub mod console;
pub mod network;
pub mod registry;
pub mod session;
pub mod transport;
