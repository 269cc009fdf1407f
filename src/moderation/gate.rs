//! Permission checks for moderation-sensitive actions.
//!
//! `authorize` is a pure decision over the membership index: no I/O, no
//! side effects, and every denial carries a typed reason for client display.
//! Time-based restrictions (active timeouts) are checked by the handlers
//! against the DB, since they expire lazily.

use serde::Serialize;

use crate::rooms::membership::{MembershipIndex, LEVEL_MODERATOR};

/// Actions subject to room-level permission policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action<'a> {
    PostMessage,
    DeleteMessage { target_owner_id: &'a str },
    Report,
    Ban { target_user_id: &'a str },
    Timeout { target_user_id: &'a str },
    HideForSelf,
}

/// Typed denial reasons — never a silent failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    #[error("insufficient_permission")]
    InsufficientPermission,
    #[error("self_action_not_allowed")]
    SelfActionNotAllowed,
    #[error("target_outranks_actor")]
    TargetOutranksActor,
}

impl DenyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InsufficientPermission => "insufficient_permission",
            Self::SelfActionNotAllowed => "self_action_not_allowed",
            Self::TargetOutranksActor => "target_outranks_actor",
        }
    }
}

/// Decide whether `user_id` may perform `action` in `room_id`.
///
/// Policy:
/// - `post_message` / `report` require membership.
/// - `delete_message` requires being the message owner or level >= 2.
/// - `ban` / `timeout` require level >= 2 and a target of strictly lower
///   level — a moderator cannot ban an owner, and nobody bans themselves.
/// - `hide_for_self` is always allowed: it is a per-user visibility flag
///   that never affects fan-out to others.
pub fn authorize(
    index: &MembershipIndex,
    user_id: &str,
    room_id: &str,
    action: Action<'_>,
) -> Result<(), DenyReason> {
    let actor_level = index.level_of(room_id, user_id);

    match action {
        Action::HideForSelf => Ok(()),

        Action::PostMessage | Action::Report => match actor_level {
            Some(_) => Ok(()),
            None => Err(DenyReason::InsufficientPermission),
        },

        Action::DeleteMessage { target_owner_id } => {
            if user_id == target_owner_id {
                return Ok(());
            }
            match actor_level {
                Some(level) if level >= LEVEL_MODERATOR => Ok(()),
                _ => Err(DenyReason::InsufficientPermission),
            }
        }

        Action::Ban { target_user_id } | Action::Timeout { target_user_id } => {
            if user_id == target_user_id {
                return Err(DenyReason::SelfActionNotAllowed);
            }
            let actor = match actor_level {
                Some(level) if level >= LEVEL_MODERATOR => level,
                _ => return Err(DenyReason::InsufficientPermission),
            };
            // Absent target level counts as 0: banning a non-member is
            // allowed and simply records the ban.
            let target = index.level_of(room_id, target_user_id).unwrap_or(0);
            if target >= actor {
                return Err(DenyReason::TargetOutranksActor);
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rooms::membership::{LEVEL_MEMBER, LEVEL_OWNER};

    fn room() -> MembershipIndex {
        let index = MembershipIndex::new();
        index.add_member("general", "owner", LEVEL_OWNER);
        index.add_member("general", "mod", LEVEL_MODERATOR);
        index.add_member("general", "member", LEVEL_MEMBER);
        index
    }

    #[test]
    fn members_post_and_report_outsiders_do_not() {
        let index = room();
        assert!(authorize(&index, "member", "general", Action::PostMessage).is_ok());
        assert!(authorize(&index, "member", "general", Action::Report).is_ok());
        assert_eq!(
            authorize(&index, "stranger", "general", Action::PostMessage),
            Err(DenyReason::InsufficientPermission)
        );
    }

    #[test]
    fn delete_own_message_or_moderate() {
        let index = room();
        let own = Action::DeleteMessage {
            target_owner_id: "member",
        };
        let other = Action::DeleteMessage {
            target_owner_id: "owner",
        };
        assert!(authorize(&index, "member", "general", own).is_ok());
        assert_eq!(
            authorize(&index, "member", "general", other),
            Err(DenyReason::InsufficientPermission)
        );
        assert!(authorize(&index, "mod", "general", other).is_ok());
    }

    #[test]
    fn level_one_ban_is_insufficient_permission() {
        let index = room();
        assert_eq!(
            authorize(
                &index,
                "member",
                "general",
                Action::Ban {
                    target_user_id: "mod"
                }
            ),
            Err(DenyReason::InsufficientPermission)
        );
    }

    #[test]
    fn moderator_cannot_ban_owner() {
        let index = room();
        assert_eq!(
            authorize(
                &index,
                "mod",
                "general",
                Action::Ban {
                    target_user_id: "owner"
                }
            ),
            Err(DenyReason::TargetOutranksActor)
        );
        // Equal rank is also outranked: a moderator cannot ban a moderator.
        index.add_member("general", "mod2", LEVEL_MODERATOR);
        assert_eq!(
            authorize(
                &index,
                "mod",
                "general",
                Action::Ban {
                    target_user_id: "mod2"
                }
            ),
            Err(DenyReason::TargetOutranksActor)
        );
    }

    #[test]
    fn self_moderation_is_rejected() {
        let index = room();
        assert_eq!(
            authorize(
                &index,
                "owner",
                "general",
                Action::Timeout {
                    target_user_id: "owner"
                }
            ),
            Err(DenyReason::SelfActionNotAllowed)
        );
    }

    #[test]
    fn owner_bans_downward_and_hide_is_unconditional() {
        let index = room();
        assert!(authorize(
            &index,
            "owner",
            "general",
            Action::Ban {
                target_user_id: "member"
            }
        )
        .is_ok());
        assert!(authorize(&index, "stranger", "general", Action::HideForSelf).is_ok());
    }
}
