//! Profile Gate — mandatory onboarding before any query capability runs.
//!
//! The gate owns the fixed nine-step question sequence. Each inbound
//! message while a profile is incomplete is interpreted as the answer to
//! the pending step: a valid answer writes exactly one field and advances
//! the cursor; an invalid answer re-prompts the same step without touching
//! stored state.

use crate::profile::model::{parse_list_answer, Gender, OnboardingStep, UserProfile};
use crate::services::language;

/// What the gate reports for a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// All mandatory fields collected; queries may flow.
    Complete,
    /// Onboarding pending at this step.
    IncompleteAt(OnboardingStep),
}

/// Result of feeding one inbound message to the gate.
#[derive(Debug, Clone)]
pub enum GateOutcome {
    /// Answer accepted, field written, next question issued.
    Advanced { step: OnboardingStep, reply: String },
    /// Answer rejected; same step re-prompted. No state was mutated.
    Reprompt { step: OnboardingStep, reply: String },
    /// The final field was accepted; onboarding is now complete.
    Completed { reply: String },
}

impl GateOutcome {
    /// The text to send back to the user.
    pub fn reply(&self) -> &str {
        match self {
            Self::Advanced { reply, .. }
            | Self::Reprompt { reply, .. }
            | Self::Completed { reply } => reply,
        }
    }

    /// Whether this outcome mutated the profile (and needs persisting).
    pub fn mutated(&self) -> bool {
        !matches!(self, Self::Reprompt { .. })
    }
}

/// The onboarding gate.
pub struct ProfileGate {
    max_age: u32,
}

impl ProfileGate {
    pub fn new(max_age: u32) -> Self {
        Self { max_age }
    }

    /// Pure completeness check.
    pub fn check(&self, profile: &UserProfile) -> GateDecision {
        if profile.onboarding_completed {
            GateDecision::Complete
        } else {
            GateDecision::IncompleteAt(profile.onboarding_step)
        }
    }

    /// Welcome message for a first contact: greeting plus the pending
    /// question. Consumes no answer.
    pub fn welcome(&self, profile: &UserProfile) -> String {
        format!(
            "Welcome to Arogya Bot!\n\n\
             I can give you personalized health guidance, but first I need to \
             ask a few questions about you. This takes only a couple of \
             minutes and helps me keep my advice safe for you.\n\n{}",
            self.question(profile.onboarding_step)
        )
    }

    /// Interpret `body` as the answer to the pending step and advance.
    ///
    /// `has_media` marks messages that carried an attachment; every
    /// onboarding step expects text, so media is invalid input and
    /// re-prompts without advancing.
    pub fn advance(&self, profile: &mut UserProfile, body: &str, has_media: bool) -> GateOutcome {
        let step = profile.onboarding_step;
        debug_assert!(!step.is_terminal(), "advance called on a complete profile");

        if has_media {
            return self.reprompt(step, "Please answer with a text message for this question.");
        }
        let answer = body.trim();
        if answer.is_empty() {
            return self.reprompt(step, "This field is required.");
        }

        if let Err(error) = self.apply_answer(profile, step, answer) {
            return self.reprompt(step, &error);
        }

        // Answer written — move the cursor.
        let next = step
            .next()
            .unwrap_or(OnboardingStep::Complete);
        profile.onboarding_step = next;
        profile.updated_at = chrono::Utc::now();

        if next.is_terminal() {
            profile.onboarding_completed = true;
            tracing::info!(phone = %profile.phone, "Onboarding completed");
            return GateOutcome::Completed {
                reply: self.completion_message(profile),
            };
        }

        tracing::debug!(phone = %profile.phone, step = %next, "Onboarding advanced");
        GateOutcome::Advanced {
            step: next,
            reply: format!(
                "Thank you!\n\n({}/{}) {}",
                next.position(),
                OnboardingStep::TOTAL,
                self.question(next)
            ),
        }
    }

    /// Validate and write one field. Errors are user-facing re-prompt text.
    fn apply_answer(
        &self,
        profile: &mut UserProfile,
        step: OnboardingStep,
        answer: &str,
    ) -> Result<(), String> {
        match step {
            OnboardingStep::Name => {
                if answer.len() < 2 {
                    return Err("Please enter a valid name (at least 2 characters).".into());
                }
                if answer.chars().any(|c| c.is_ascii_digit()) {
                    return Err("Name should not contain numbers.".into());
                }
                profile.name = answer.to_string();
            }
            OnboardingStep::Age => {
                let age: u32 = answer
                    .parse()
                    .map_err(|_| "Please enter a valid number for age.".to_string())?;
                if age < 1 || age > self.max_age {
                    return Err(format!(
                        "Please enter an age between 1 and {}.",
                        self.max_age
                    ));
                }
                profile.age = Some(age);
            }
            OnboardingStep::Gender => {
                let gender = Gender::parse(answer)
                    .ok_or_else(|| "Please choose: male, female, or other".to_string())?;
                profile.gender = Some(gender);
            }
            OnboardingStep::Location => {
                if answer.len() < 2 {
                    return Err("Please enter a valid district (e.g. Pune, Maharashtra).".into());
                }
                let (district, state) = split_location(answer);
                profile.district = district;
                profile.state = state;
            }
            OnboardingStep::Language => {
                let code = language::resolve_language(answer).ok_or_else(|| {
                    format!(
                        "I don't support that language yet. Options: {}",
                        language::supported_language_list()
                    )
                })?;
                profile.language = code;
            }
            OnboardingStep::EmergencyContact => {
                let digits: String = answer
                    .chars()
                    .filter(|c| c.is_ascii_digit())
                    .collect();
                if digits.len() < 7 || digits.len() > 15 {
                    return Err(
                        "Please share a valid phone number for your emergency contact.".into(),
                    );
                }
                profile.emergency_contact = answer.to_string();
            }
            OnboardingStep::Allergies => {
                profile.allergies = validated_list(answer)?;
            }
            OnboardingStep::Medications => {
                profile.medications = validated_list(answer)?;
            }
            OnboardingStep::MedicalHistory => {
                profile.medical_history = if answer.eq_ignore_ascii_case("none") {
                    String::new()
                } else {
                    answer.to_string()
                };
            }
            OnboardingStep::Complete => unreachable!("terminal step takes no answer"),
        }
        Ok(())
    }

    fn reprompt(&self, step: OnboardingStep, error: &str) -> GateOutcome {
        GateOutcome::Reprompt {
            step,
            reply: format!(
                "{error}\n\n({}/{}) {}",
                step.position(),
                OnboardingStep::TOTAL,
                self.question(step)
            ),
        }
    }

    /// The question text for a step.
    pub fn question(&self, step: OnboardingStep) -> String {
        match step {
            OnboardingStep::Name => "What is your full name?".to_string(),
            OnboardingStep::Age => format!(
                "What is your age? (Please enter a number between 1 and {})",
                self.max_age
            ),
            OnboardingStep::Gender => {
                "What is your gender?\nPlease type: male, female, or other".to_string()
            }
            OnboardingStep::Location => {
                "Which district and state are you in? (e.g. Pune, Maharashtra)".to_string()
            }
            OnboardingStep::Language => format!(
                "Which language should I reply in?\nOptions: {}",
                language::supported_language_list()
            ),
            OnboardingStep::EmergencyContact => {
                "Who should we contact in an emergency? Please share their phone number."
                    .to_string()
            }
            OnboardingStep::Allergies => {
                "Do you have any allergies? (Please list them separated by commas, or type \
                 'none')\nExample: peanuts, shellfish, penicillin"
                    .to_string()
            }
            OnboardingStep::Medications => {
                "Are you currently taking any medications? (Please list them separated by \
                 commas, or type 'none')\nExample: metformin, lisinopril, inhaler"
                    .to_string()
            }
            OnboardingStep::MedicalHistory => {
                "Briefly describe any past or ongoing medical conditions, or type 'none'.\n\
                 Example: diabetes since 2019, asthma as a child"
                    .to_string()
            }
            OnboardingStep::Complete => String::new(),
        }
    }

    fn completion_message(&self, profile: &UserProfile) -> String {
        format!(
            "Congratulations {}! Your health profile is now complete.\n\n\
             I can now give you guidance based on your age, location ({}) and \
             health conditions.\n\n\
             You can ask me about:\n\
             - Symptoms and health concerns\n\
             - Medication questions\n\
             - Disease outbreaks and health alerts near you\n\
             - Skin conditions (send a photo)\n\
             - Medical reports (send the document)\n\n\
             How can I help you today?",
            profile.name,
            profile.location(),
        )
    }
}

/// Split a location answer into (district, state) on the first comma.
fn split_location(answer: &str) -> (String, String) {
    match answer.split_once(',') {
        Some((district, state)) => (
            district.trim().to_string(),
            state.trim().to_string(),
        ),
        None => (answer.trim().to_string(), String::new()),
    }
}

/// Validate a comma-separated list answer; every item needs ≥ 2 chars.
fn validated_list(answer: &str) -> Result<Vec<String>, String> {
    let items = parse_list_answer(answer);
    if items.iter().any(|item| item.len() < 2) {
        return Err("Please enter valid items separated by commas.".into());
    }
    Ok(items)
}
