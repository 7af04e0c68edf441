//! Ambient stack shared by every `ub-*` crate: the `Crypto` capability
//! (SHA-256/512/AES/ECDSA as an external collaborator; here we
//! provide the hashing half, since C1/C3/C4 need real digests to operate
//! on), atomic filesystem helpers, process/user helpers, and logging
//! setup for the daemon binary.

pub mod crypto;
pub mod fs;
pub mod log_init;
pub mod paths;
pub mod user;
