//! The closed set of client commands.

use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Register,
    Login,
    Session,
    ClientUserInfo,
    ClientGroups,
    GroupCreate,
    GetUser,
    GetAllGroups,
    JoinGroup,
    GroupMsg,
    GetGroupMsgs,
    EditAccount,
    CreateGroupCode,
    JoinGroupCode,
    GetGroupCodes,
    DeleteGroupCode,
    DeleteMsg,
    DeleteGroup,
    GetMemberIds,
    Upload,
}

/// Which clients may issue a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    LoggedOut,
    LoggedIn,
}

impl Command {
    pub const ALL: [Command; 20] = [
        Command::Register,
        Command::Login,
        Command::Session,
        Command::ClientUserInfo,
        Command::ClientGroups,
        Command::GroupCreate,
        Command::GetUser,
        Command::GetAllGroups,
        Command::JoinGroup,
        Command::GroupMsg,
        Command::GetGroupMsgs,
        Command::EditAccount,
        Command::CreateGroupCode,
        Command::JoinGroupCode,
        Command::GetGroupCodes,
        Command::DeleteGroupCode,
        Command::DeleteMsg,
        Command::DeleteGroup,
        Command::GetMemberIds,
        Command::Upload,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Command::Register => "register",
            Command::Login => "login",
            Command::Session => "session",
            Command::ClientUserInfo => "client_user_info",
            Command::ClientGroups => "client_groups",
            Command::GroupCreate => "group_create",
            Command::GetUser => "get_user",
            Command::GetAllGroups => "get_all_groups",
            Command::JoinGroup => "join_group",
            Command::GroupMsg => "group_msg",
            Command::GetGroupMsgs => "get_group_msgs",
            Command::EditAccount => "edit_account",
            Command::CreateGroupCode => "create_group_code",
            Command::JoinGroupCode => "join_group_code",
            Command::GetGroupCodes => "get_group_codes",
            Command::DeleteGroupCode => "delete_group_code",
            Command::DeleteMsg => "delete_msg",
            Command::DeleteGroup => "delete_group",
            Command::GetMemberIds => "get_member_ids",
            Command::Upload => "upload",
        }
    }

    pub fn permission(self) -> Permission {
        match self {
            Command::Register | Command::Login | Command::Session => Permission::LoggedOut,
            _ => Permission::LoggedIn,
        }
    }

    /// Whether a client in the given login state may run this command.
    pub fn allowed(self, logged_in: bool) -> bool {
        match self.permission() {
            Permission::LoggedOut => !logged_in,
            Permission::LoggedIn => logged_in,
        }
    }
}

impl FromStr for Command {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        Command::ALL.iter().copied().find(|c| c.name() == s).ok_or(())
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
