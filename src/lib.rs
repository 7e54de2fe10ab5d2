//! luapatch - Steam Lua patch manager
//!
//! Client, batch index generator and companion file service for a
//! catalog of Lua patch files. The client syncs an availability index,
//! searches the store catalog, and installs patches into the Steam
//! plugin directory.

pub mod app;
pub mod cache;
pub mod config;
pub mod download;
pub mod generator;
pub mod index;
pub mod search;
pub mod server;
pub mod steam;
