//! pve-guardian: scheduled backups of Proxmox VE guests over SSH/SFTP,
//! local and WebDAV retention, and restores back onto the host.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod offsite;
pub mod remote;
pub mod routes;
pub mod services;
pub mod state;
pub mod transfer;
pub mod utils;
