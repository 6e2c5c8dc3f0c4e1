//! # tether-relay — Rendezvous Relay Service
//!
//! Accepts sharer and viewer connections on one TCP port per channel
//! (screen, control, chat), pairs them by username, and forwards bytes
//! between the pairs. A shared UDP port routes frame datagrams between
//! registered endpoints.
//!
//! Configuration comes from a TOML file (see [`config::RelayConfig`]);
//! run `tether-relay --gen-config` for a starting point.

pub mod config;
pub mod service;
