//! User/group lookup, grounded on `pbs-config::backup_user`/`backup_group`.

use anyhow::{format_err, Error};
use nix::unistd::{Gid, Group, Uid, User};

pub const BACKUP_USER_NAME: &str = "urbackup";
pub const BACKUP_GROUP_NAME: &str = "urbackup";

/// Returns the `urbackup` service user, falling back to the current user
/// under `cfg(test)` so unit tests don't need root or a provisioned
/// system account.
pub fn backup_user() -> Result<User, Error> {
    if cfg!(test) {
        Ok(User::from_uid(Uid::current())?.expect("current user does not exist"))
    } else {
        User::from_name(BACKUP_USER_NAME)?
            .ok_or_else(|| format_err!("unable to look up '{BACKUP_USER_NAME}' user"))
    }
}

pub fn backup_group() -> Result<Group, Error> {
    if cfg!(test) {
        Ok(Group::from_gid(Gid::current())?.expect("current group does not exist"))
    } else {
        Group::from_name(BACKUP_GROUP_NAME)?
            .ok_or_else(|| format_err!("unable to look up '{BACKUP_GROUP_NAME}' group"))
    }
}
