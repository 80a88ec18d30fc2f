//! Program enrollment cross-reference.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The slice of a program enrollment that invoices copy onto their own row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enrollment {
    pub program_enrollment_id: Uuid,
    pub student_id: Uuid,
    pub academic_year_id: Uuid,
    pub curriculum_id: Uuid,
}
