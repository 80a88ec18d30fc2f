//! Explicit caller context passed into every billing operation.

use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use uuid::Uuid;

use crate::models::{Invoice, UnknownVariant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    Admin,
    Staff,
    Guardian,
    Student,
}

impl ActorRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorRole::Admin => "admin",
            ActorRole::Staff => "staff",
            ActorRole::Guardian => "guardian",
            ActorRole::Student => "student",
        }
    }
}

impl FromStr for ActorRole {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(ActorRole::Admin),
            "staff" => Ok(ActorRole::Staff),
            "guardian" | "parent" => Ok(ActorRole::Guardian),
            "student" | "learner" => Ok(ActorRole::Student),
            _ => Err(UnknownVariant {
                kind: "actor role",
                value: s.to_string(),
            }),
        }
    }
}

/// Who is acting, and on behalf of which students.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorContext {
    pub actor_id: Uuid,
    pub role: ActorRole,
    /// Students a guardian or student may see and pay for.
    pub student_ids: Vec<Uuid>,
    pub ip: Option<IpAddr>,
    pub request_id: Option<String>,
}

impl ActorContext {
    pub fn new(actor_id: Uuid, role: ActorRole) -> Self {
        Self {
            actor_id,
            role,
            student_ids: Vec::new(),
            ip: None,
            request_id: None,
        }
    }

    pub fn staff(actor_id: Uuid) -> Self {
        Self::new(actor_id, ActorRole::Staff)
    }

    pub fn guardian(actor_id: Uuid, student_ids: Vec<Uuid>) -> Self {
        Self {
            student_ids,
            ..Self::new(actor_id, ActorRole::Guardian)
        }
    }

    pub fn is_staff(&self) -> bool {
        matches!(self.role, ActorRole::Admin | ActorRole::Staff)
    }

    pub fn require_staff(&self) -> Result<(), AppError> {
        if self.is_staff() {
            Ok(())
        } else {
            Err(AppError::Forbidden(anyhow::anyhow!(
                "Only staff may perform this action"
            )))
        }
    }

    pub fn can_access(&self, invoice: &Invoice) -> bool {
        self.is_staff() || self.student_ids.contains(&invoice.student_id)
    }

    pub fn ensure_can_access(&self, invoice: &Invoice) -> Result<(), AppError> {
        if self.can_access(invoice) {
            Ok(())
        } else {
            Err(AppError::Forbidden(anyhow::anyhow!(
                "You do not have access to this invoice"
            )))
        }
    }

    /// Students this actor is limited to, or `None` for staff.
    pub fn student_scope(&self) -> Option<Vec<Uuid>> {
        (!self.is_staff()).then(|| self.student_ids.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parsing_accepts_aliases() {
        assert_eq!("Parent".parse::<ActorRole>().unwrap(), ActorRole::Guardian);
        assert_eq!("learner".parse::<ActorRole>().unwrap(), ActorRole::Student);
        assert_eq!(" ADMIN ".parse::<ActorRole>().unwrap(), ActorRole::Admin);
        assert!("janitor".parse::<ActorRole>().is_err());
    }

    #[test]
    fn test_scope() {
        let staff = ActorContext::staff(Uuid::new_v4());
        assert!(staff.require_staff().is_ok());
        assert_eq!(staff.student_scope(), None);

        let child = Uuid::new_v4();
        let guardian = ActorContext::guardian(Uuid::new_v4(), vec![child]);
        assert!(matches!(
            guardian.require_staff(),
            Err(AppError::Forbidden(_))
        ));
        assert_eq!(guardian.student_scope(), Some(vec![child]));
    }
}
