//! Permission model (spec.md §4.B): a fixed four-level lattice and the
//! command → minimum-level table, generalized from the teacher agent's
//! own `security/permission.rs` checker (which already encodes this exact
//! table) to the gateway's server-side `CommandType` and to multi-user
//! effective-level resolution.

use crate::proto::CommandType;

/// Four totally ordered permission levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PermissionLevel {
    ReadOnly = 0,
    BasicWrite = 1,
    ServiceControl = 2,
    SystemAdmin = 3,
}

impl From<u8> for PermissionLevel {
    fn from(level: u8) -> Self {
        match level {
            0 => PermissionLevel::ReadOnly,
            1 => PermissionLevel::BasicWrite,
            2 => PermissionLevel::ServiceControl,
            _ => PermissionLevel::SystemAdmin,
        }
    }
}

impl From<i32> for PermissionLevel {
    fn from(level: i32) -> Self {
        Self::from(level.clamp(0, 3) as u8)
    }
}

impl From<PermissionLevel> for u8 {
    fn from(level: PermissionLevel) -> Self {
        level as u8
    }
}

/// Minimum permission level required to issue a command of this kind
/// (spec.md §4.B). Matches the teacher's `PermissionChecker::required_level`
/// table one-for-one for every command kind that exists in both places.
pub fn required_level(command_type: CommandType) -> u8 {
    match command_type {
        CommandType::ProcessList
        | CommandType::ServiceStatus
        | CommandType::DockerList
        | CommandType::FileTail
        | CommandType::ServiceLogs
        | CommandType::SystemLogs
        | CommandType::AuditLogs => 0,

        CommandType::FileDownload | CommandType::FileTruncate | CommandType::DockerLogs => 1,

        CommandType::ProcessKill
        | CommandType::ServiceStart
        | CommandType::ServiceStop
        | CommandType::ServiceRestart
        | CommandType::DockerStart
        | CommandType::DockerStop
        | CommandType::DockerRestart
        | CommandType::FileUpload => 2,

        CommandType::SystemReboot | CommandType::ShellExecute => 3,

        CommandType::Unspecified => 3,
    }
}

/// Checks whether a caller is allowed to issue a given command.
///
/// A `super_admin` caller always passes. Otherwise the effective level is
/// the caller's own level unless `is_super_admin` is set.
pub fn check_permission(command_type: CommandType, caller_level: u8, is_super_admin: bool) -> bool {
    if is_super_admin {
        return true;
    }
    caller_level >= required_level(command_type)
}

/// Resolve a user's effective permission level for a given agent: the max
/// of any explicit per-agent grant and the union (max) over the groups the
/// user belongs to (spec.md §4.B).
pub fn effective_level(agent_grant: Option<u8>, group_grants: &[u8]) -> u8 {
    let from_groups = group_grants.iter().copied().max().unwrap_or(0);
    agent_grant.unwrap_or(0).max(from_groups)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_spec_table() {
        assert_eq!(required_level(CommandType::ProcessList), 0);
        assert_eq!(required_level(CommandType::ServiceStatus), 0);
        assert_eq!(required_level(CommandType::DockerList), 0);
        assert_eq!(required_level(CommandType::FileTail), 0);
        assert_eq!(required_level(CommandType::ServiceLogs), 0);

        assert_eq!(required_level(CommandType::FileDownload), 1);
        assert_eq!(required_level(CommandType::FileTruncate), 1);
        assert_eq!(required_level(CommandType::DockerLogs), 1);

        assert_eq!(required_level(CommandType::ProcessKill), 2);
        assert_eq!(required_level(CommandType::ServiceStart), 2);
        assert_eq!(required_level(CommandType::DockerStart), 2);
        assert_eq!(required_level(CommandType::FileUpload), 2);

        assert_eq!(required_level(CommandType::SystemReboot), 3);
        assert_eq!(required_level(CommandType::ShellExecute), 3);
    }

    // spec.md §8 invariant 8: permission check is monotone.
    #[test]
    fn monotone_in_level() {
        for cmd in [
            CommandType::ProcessList,
            CommandType::FileDownload,
            CommandType::ServiceRestart,
            CommandType::ShellExecute,
        ] {
            let required = required_level(cmd);
            for level in required..=3 {
                assert!(check_permission(cmd, level, false));
            }
            if required > 0 {
                assert!(!check_permission(cmd, required - 1, false));
            }
        }
    }

    #[test]
    fn super_admin_bypasses_check() {
        assert!(check_permission(CommandType::ShellExecute, 0, true));
    }

    #[test]
    fn effective_level_is_max_of_grant_and_groups() {
        assert_eq!(effective_level(Some(1), &[0, 2]), 2);
        assert_eq!(effective_level(None, &[1]), 1);
        assert_eq!(effective_level(None, &[]), 0);
        assert_eq!(effective_level(Some(3), &[]), 3);
    }
}
