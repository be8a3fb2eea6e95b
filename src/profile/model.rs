//! User profile model and the onboarding step machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// User gender, as collected during onboarding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gender {
    Male,
    Female,
    Other,
}

impl Gender {
    /// Parse a user-typed answer. Case-insensitive, exact option match.
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_lowercase().as_str() {
            "male" => Some(Self::Male),
            "female" => Some(Self::Female),
            "other" => Some(Self::Other),
            _ => None,
        }
    }
}

impl std::fmt::Display for Gender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Male => "male",
            Self::Female => "female",
            Self::Other => "other",
        };
        write!(f, "{s}")
    }
}

/// The mandatory onboarding steps, in their fixed order.
///
/// Progresses linearly: Name → Age → Gender → Location → Language →
/// EmergencyContact → Allergies → Medications → MedicalHistory → Complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnboardingStep {
    Name,
    Age,
    Gender,
    Location,
    Language,
    EmergencyContact,
    Allergies,
    Medications,
    MedicalHistory,
    Complete,
}

impl OnboardingStep {
    /// Number of answer-collecting steps (excludes `Complete`).
    pub const TOTAL: usize = 9;

    /// Check if a transition from `self` to `target` is valid.
    pub fn can_transition_to(&self, target: OnboardingStep) -> bool {
        self.next() == Some(target)
    }

    /// Whether onboarding is done.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete)
    }

    /// Get the next step in the linear progression, if any.
    pub fn next(&self) -> Option<OnboardingStep> {
        use OnboardingStep::*;
        match self {
            Name => Some(Age),
            Age => Some(Gender),
            Gender => Some(Location),
            Location => Some(Language),
            Language => Some(EmergencyContact),
            EmergencyContact => Some(Allergies),
            Allergies => Some(Medications),
            Medications => Some(MedicalHistory),
            MedicalHistory => Some(Complete),
            Complete => None,
        }
    }

    /// 1-based position of this step, for "(n/9)" progress prefixes.
    pub fn position(&self) -> usize {
        use OnboardingStep::*;
        match self {
            Name => 1,
            Age => 2,
            Gender => 3,
            Location => 4,
            Language => 5,
            EmergencyContact => 6,
            Allergies => 7,
            Medications => 8,
            MedicalHistory => 9,
            Complete => Self::TOTAL + 1,
        }
    }
}

impl Default for OnboardingStep {
    fn default() -> Self {
        Self::Name
    }
}

impl std::fmt::Display for OnboardingStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Name => "name",
            Self::Age => "age",
            Self::Gender => "gender",
            Self::Location => "location",
            Self::Language => "language",
            Self::EmergencyContact => "emergency_contact",
            Self::Allergies => "allergies",
            Self::Medications => "medications",
            Self::MedicalHistory => "medical_history",
            Self::Complete => "complete",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for OnboardingStep {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "name" => Ok(Self::Name),
            "age" => Ok(Self::Age),
            "gender" => Ok(Self::Gender),
            "location" => Ok(Self::Location),
            "language" => Ok(Self::Language),
            "emergency_contact" => Ok(Self::EmergencyContact),
            "allergies" => Ok(Self::Allergies),
            "medications" => Ok(Self::Medications),
            "medical_history" => Ok(Self::MedicalHistory),
            "complete" => Ok(Self::Complete),
            other => Err(format!("unknown onboarding step: '{other}'")),
        }
    }
}

/// A user profile, keyed by normalized phone number.
///
/// Created empty on first contact; mutated one field per accepted
/// onboarding answer. `onboarding_completed` flips exactly when the step
/// cursor reaches `Complete`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub phone: String,
    pub name: String,
    pub age: Option<u32>,
    pub gender: Option<Gender>,
    pub district: String,
    pub state: String,
    /// Preferred reply language code (e.g. "en", "hi").
    pub language: String,
    pub emergency_contact: String,
    pub allergies: Vec<String>,
    pub medications: Vec<String>,
    pub medical_history: String,
    pub onboarding_step: OnboardingStep,
    pub onboarding_completed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserProfile {
    /// A fresh profile for an unseen phone number, pending its first answer.
    pub fn new(phone: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            phone: phone.into(),
            name: String::new(),
            age: None,
            gender: None,
            district: String::new(),
            state: String::new(),
            language: String::new(),
            emergency_contact: String::new(),
            allergies: Vec::new(),
            medications: Vec::new(),
            medical_history: String::new(),
            onboarding_step: OnboardingStep::Name,
            onboarding_completed: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Human-readable location, "District, State" or whichever half exists.
    pub fn location(&self) -> String {
        match (self.district.is_empty(), self.state.is_empty()) {
            (false, false) => format!("{}, {}", self.district, self.state),
            (false, true) => self.district.clone(),
            (true, false) => self.state.clone(),
            (true, true) => String::new(),
        }
    }

    /// One-line profile summary for capability prompts.
    pub fn summary(&self) -> String {
        let mut parts = vec![format!("Name: {}", self.name)];
        if let Some(age) = self.age {
            parts.push(format!("Age: {age}"));
        }
        if let Some(gender) = self.gender {
            parts.push(format!("Gender: {gender}"));
        }
        let location = self.location();
        if !location.is_empty() {
            parts.push(format!("Location: {location}"));
        }
        parts.push(format!(
            "Allergies: {}",
            join_or_none(&self.allergies)
        ));
        parts.push(format!(
            "Current medications: {}",
            join_or_none(&self.medications)
        ));
        if !self.medical_history.is_empty() {
            parts.push(format!("Medical history: {}", self.medical_history));
        }
        parts.join("; ")
    }
}

fn join_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "none".to_string()
    } else {
        items.join(", ")
    }
}

/// Parse a comma-separated list answer. "none" (any case) yields an empty
/// list; blank items are dropped.
pub fn parse_list_answer(input: &str) -> Vec<String> {
    let trimmed = input.trim();
    if trimmed.eq_ignore_ascii_case("none") {
        return Vec::new();
    }
    trimmed
        .split(',')
        .map(|item| item.trim().to_lowercase())
        .filter(|item| !item.is_empty())
        .collect()
}
