//! Dropping root before entering the reactor loop.

use std::path::Path;

use nix::unistd::{self, Gid, Group, Uid, User};

use crate::error::{ReactorError, Result};

/// Resolve a `-u`/`-g` argument that may be a name or a bare numeric id.
pub fn resolve_user(spec: &str) -> Result<User> {
    if let Ok(uid) = spec.parse::<u32>() {
        return User::from_uid(Uid::from_raw(uid))
            .map_err(ReactorError::Privilege)?
            .ok_or_else(|| ReactorError::SocketPath(format!("no such uid {uid}")));
    }
    User::from_name(spec)
        .map_err(ReactorError::Privilege)?
        .ok_or_else(|| ReactorError::SocketPath(format!("no such user {spec}")))
}

pub fn resolve_group(spec: &str) -> Result<Group> {
    if let Ok(gid) = spec.parse::<u32>() {
        return Group::from_gid(Gid::from_raw(gid))
            .map_err(ReactorError::Privilege)?
            .ok_or_else(|| ReactorError::SocketPath(format!("no such gid {gid}")));
    }
    Group::from_name(spec)
        .map_err(ReactorError::Privilege)?
        .ok_or_else(|| ReactorError::SocketPath(format!("no such group {spec}")))
}

/// Chown `pidfile` (if given) to the target user, drop supplementary groups down to
/// just the target gid, then switch gid, then uid. Any failure aborts startup: this
/// must run before the reactor loop starts accepting connections.
pub fn drop_privileges(target: &User, pidfile: Option<&Path>) -> Result<()> {
    if !Uid::current().is_root() {
        return Ok(());
    }

    if let Some(path) = pidfile {
        unistd::chown(path, Some(target.uid), Some(target.gid)).map_err(ReactorError::Privilege)?;
    }

    unistd::setgroups(&[target.gid]).map_err(ReactorError::Privilege)?;
    unistd::setgid(target.gid).map_err(ReactorError::Privilege)?;
    unistd::setuid(target.uid).map_err(ReactorError::Privilege)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_user_accepts_numeric_uid() {
        let user = resolve_user("0").unwrap();
        assert_eq!(user.uid.as_raw(), 0);
    }

    #[test]
    fn resolve_user_rejects_unknown_name() {
        assert!(resolve_user("definitely-not-a-real-user-xyz").is_err());
    }
}
