use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "user_role")]
pub enum UserRole {
    Patient,
    Counselor,
    Graphologist,
    Researcher,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Patient => "Patient",
            UserRole::Counselor => "Counselor",
            UserRole::Graphologist => "Graphologist",
            UserRole::Researcher => "Researcher",
        }
    }
}

impl TryFrom<&str> for UserRole {
    type Error = ();

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "Patient" => Ok(UserRole::Patient),
            "Counselor" => Ok(UserRole::Counselor),
            "Graphologist" => Ok(UserRole::Graphologist),
            "Researcher" => Ok(UserRole::Researcher),
            _ => Err(()),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "sample_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SampleStatus {
    Pending,
    Reviewed,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum AiAgreement {
    Agree,
    Disagree,
}

impl AiAgreement {
    pub fn as_str(&self) -> &'static str {
        match self {
            AiAgreement::Agree => "Agree",
            AiAgreement::Disagree => "Disagree",
        }
    }
}

/// User as exposed over the API, PII already decrypted.
#[derive(Debug, Clone, Serialize)]
pub struct UserProfile {
    pub id: Uuid,
    pub email: String,
    pub phone: String,
    pub role: UserRole,
    pub name: Option<String>,
    pub dob: Option<NaiveDate>,
    pub registered_at: DateTime<Utc>,
    pub has_accepted_disclaimer: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PatientSummary {
    pub id: Uuid,
    pub pid: String,
    pub email: String,
    pub phone: String,
    pub name: Option<String>,
    pub dob: Option<NaiveDate>,
    pub registered_at: DateTime<Utc>,
}

/// Display identifier counselors use for a patient.
pub fn patient_pid(id: Uuid) -> String {
    let simple = id.simple().to_string();
    format!("P-{}", simple[simple.len() - 6..].to_uppercase())
}

/// Research-facing identifier that does not expose the patient record id.
pub fn anonymous_id(id: Uuid) -> String {
    let simple = id.simple().to_string();
    format!("ANON-{}", simple[..8].to_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_uses_last_six_hex_chars() {
        let id = Uuid::parse_str("0f8fad5b-d9cb-469f-a165-70867728950e").unwrap();
        assert_eq!(patient_pid(id), "P-28950E");
        assert_eq!(anonymous_id(id), "ANON-0F8FAD5B");
    }

    #[test]
    fn roles_round_trip_through_strings() {
        for role in [
            UserRole::Patient,
            UserRole::Counselor,
            UserRole::Graphologist,
            UserRole::Researcher,
        ] {
            assert_eq!(UserRole::try_from(role.as_str()), Ok(role));
        }
        assert!(UserRole::try_from("Admin").is_err());
    }
}
