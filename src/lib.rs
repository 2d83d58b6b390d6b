//! Realtime coordination layer for the Huddle chat application.
//!
//! Tracks which users are reachable, groups connections into conversation
//! and personal rooms, drives group-chat mutations through conditional
//! persisted writes, and relays call signaling between presence-resolved
//! connections. Broadcasts always follow the persisted commit that caused
//! them.

pub mod auth;
pub mod chats;
pub mod config;
pub mod database;
pub mod error;
pub mod events;
pub mod presence;
pub mod rooms;
pub mod routing;
pub mod signaling;
pub mod websocket;
