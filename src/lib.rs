//! # Sensing Node Coordination Core
//!
//! Coordination logic for a wireless sensing network of one gateway and a
//! fixed set of leaf nodes: a per-node cooperative state machine, clock
//! synchronization against an external reference and over the radio, and
//! the textual command protocols that schedule synchronized sampling.
//!
//! ## Features
//!
//! - **Unified time**: local uptime corrected by a learned drift ratio and offset
//! - **Radio round-trip sync**: trimmed-mean drift/offset estimation on leaves
//! - **Reliable link**: fixed 32-byte frames, half-duplex turn-taking, bounded retries
//! - **Command protocols**: broker commands parsed into typed variants, radio forwarding
//! - **Hardware seams**: every peripheral and network service behind a trait
//!
//! ## Quick Start
//!
//! ```rust
//! use sensnode::{BrokerCommand, NodeConfig, NodeContext};
//! use sensnode::command::apply_broker_command;
//!
//! let mut ctx = NodeContext::new(NodeConfig::gateway(100, 3));
//! ctx.clock.apply_reference(1_751_371_200_000, 0);
//!
//! let now = ctx.clock.get_unified_time(250);
//! let command: BrokerCommand = "CMD_SFN_90_100Hz_10s".parse().unwrap();
//! let outcome = apply_broker_command(&mut ctx, &command, now).unwrap();
//! assert_eq!(outcome.reply.as_deref(), Some("CMD_SFN: Sensing successfully scheduled."));
//! assert_eq!(ctx.schedule.scheduled_start_ms, 1_751_371_290_000);
//! ```
//!
//! ## Architecture
//!
//! - [`clock`] - Unified time model and calendar conversions
//! - [`link`] - Radio frame codec and reliable point-to-point messaging
//! - [`timesync`] - Reference-time sync and radio round-trip sync
//! - [`command`] - Broker and radio command grammars and their effects
//! - [`machine`] - The per-node state machine
//! - [`sensing`] - Sampling sessions and data-file retrieval
//! - [`hal`] - Collaborator traits (radio, storage, broker, ...)
//! - [`sim`] - In-process collaborators for tests and the simulator

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::must_use_candidate)]

pub mod clock;
pub mod command;
pub mod config;
pub mod hal;
pub mod link;
pub mod machine;
pub mod node;
pub mod sensing;
pub mod sim;
pub mod timesync;

// Re-export main public types for convenience
pub use clock::{CalendarTime, ClockModel};
pub use command::{BrokerCommand, CommandError, RadioCommand};
pub use config::{NetworkProfile, NodeConfig, NodeRole};
pub use link::{ReliableLink, RfMessage};
pub use machine::{NodeStateMachine, TickOutcome};
pub use node::{NodeContext, NodeFlags, NodeSnapshot, NodeState};
