// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Process Identity
//!
//! The subscriber queue is named after a digest of the host name and process
//! id. The name stays the same for the lifetime of the process, so redeclaring
//! the queue after a reconnect targets the same queue.

use sha2::{Digest, Sha256};
use std::{ffi::OsString, io};

/// Host/process unique name, stable for the lifetime of this process.
pub fn identity() -> String {
    identity_for(hostname::get(), std::process::id())
}

/// Digest of a host name lookup result and a process id.
///
/// A failed lookup still yields a usable name: the error text takes the place
/// of the host name. Every field is length-prefixed, so no two distinct inputs
/// hash the same bytes.
pub fn identity_for(hostname: io::Result<OsString>, pid: u32) -> String {
    let host = match &hostname {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(err) => format!("error: {err}"),
    };

    let mut hasher = Sha256::new();
    hasher.update((host.len() as u64).to_be_bytes());
    hasher.update(host.as_bytes());
    hasher.update(pid.to_be_bytes());

    hex::encode(hasher.finalize())
}
