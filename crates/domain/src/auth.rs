//! Auth types.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role carried by a bearer token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserType {
    Student,
    Lecturer,
    Staff,
    Admin,
}

/// JWT claims.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // actor_id
    pub user_type: UserType,
    pub exp: u64, // expiration timestamp
    pub iat: u64, // issued at
}

/// Authenticated caller, resolved from a verified token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub actor_id: Uuid,
    pub user_type: UserType,
}

impl Actor {
    /// Students may only operate on their own records; admins on any.
    pub fn may_act_for(&self, student_id: Uuid) -> bool {
        self.user_type == UserType::Admin || self.actor_id == student_id
    }

    pub fn is_admin(&self) -> bool {
        self.user_type == UserType::Admin
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn student_only_acts_for_self() {
        let me = Uuid::new_v4();
        let other = Uuid::new_v4();
        let actor = Actor {
            actor_id: me,
            user_type: UserType::Student,
        };
        assert!(actor.may_act_for(me));
        assert!(!actor.may_act_for(other));
    }

    #[test]
    fn admin_acts_for_anyone() {
        let actor = Actor {
            actor_id: Uuid::new_v4(),
            user_type: UserType::Admin,
        };
        assert!(actor.may_act_for(Uuid::new_v4()));
        assert!(actor.is_admin());
    }
}
