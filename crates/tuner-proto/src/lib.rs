//! Station model, playback session controller and daemon protocol for the
//! tuner radio player.

pub mod config;
pub mod output;
pub mod platform;
pub mod protocol;
pub mod session;
pub mod station;
pub mod store;
