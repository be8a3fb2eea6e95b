//! Safety validator for drafted replies.
//!
//! Pure with respect to external state: reads the profile, never mutates
//! it, and is deterministic given the same inputs and tables. The emergency
//! scan runs against the *inbound* text; everything else inspects the
//! drafted reply.

use regex::Regex;

use crate::config::SafetyConfig;
use crate::profile::UserProfile;

/// Fixed disclaimer, always the final line of a non-blocked reply.
pub const DISCLAIMER: &str =
    "This is AI guidance only. Please consult a doctor for confirmation.";

/// English emergency keywords (baseline, always consulted).
const EMERGENCY_KEYWORDS_EN: &[&str] = &[
    "chest pain",
    "heart attack",
    "stroke",
    "difficulty breathing",
    "cannot breathe",
    "can't breathe",
    "severe bleeding",
    "unconscious",
    "seizure",
    "anaphylaxis",
    "severe allergic reaction",
    "overdose",
    "poisoning",
    "severe burn",
    "head injury",
    "choking",
    "cardiac arrest",
    "coma",
    "blood in vomit",
    "blood in stool",
    "sudden vision loss",
    "paralysis",
    "severe abdominal pain",
    "appendicitis",
    "meningitis",
    "emergency",
];

/// Hindi emergency keywords.
const EMERGENCY_KEYWORDS_HI: &[&str] = &[
    "सीने में दर्द",
    "दिल का दौरा",
    "सांस नहीं",
    "सांस लेने में तकलीफ",
    "बेहोश",
    "दौरा",
    "बहुत खून",
    "जहर",
];

/// Known dangerous medication pairs: (a, b, warning).
const MEDICATION_INTERACTIONS: &[(&str, &str, &str)] = &[
    ("warfarin", "aspirin", "Increased bleeding risk"),
    ("metformin", "alcohol", "Risk of lactic acidosis"),
    ("lithium", "ibuprofen", "Lithium toxicity risk"),
    ("digoxin", "furosemide", "Electrolyte imbalance risk"),
];

/// Substances that cross-react with a named allergy.
const ALLERGY_CROSS_REACTANTS: &[(&str, &[&str])] = &[
    ("penicillin", &["amoxicillin", "ampicillin"]),
    ("aspirin", &["ibuprofen", "naproxen"]),
    ("sulfa", &["sulfamethoxazole", "trimethoprim"]),
    ("latex", &["rubber"]),
];

/// Items contraindicated for a condition named in the medical history.
const CONDITION_CONTRAINDICATIONS: &[(&str, &[&str])] = &[
    ("pregnancy", &["aspirin", "ibuprofen", "isotretinoin"]),
    ("hypertension", &["pseudoephedrine", "decongestant", "ibuprofen"]),
    ("diabetes", &["prednisone", "steroid"]),
    ("kidney disease", &["ibuprofen", "naproxen"]),
    ("liver disease", &["paracetamol", "acetaminophen"]),
];

/// The validator's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafetyVerdict {
    pub emergency_detected: bool,
    /// Non-blocking warnings, in a fixed deterministic order.
    pub warnings: Vec<String>,
    /// When true the draft must be replaced by the emergency template.
    pub blocked: bool,
}

/// Deterministic safety checks over a drafted reply.
pub struct SafetyValidator {
    config: SafetyConfig,
    dosage_patterns: Vec<Regex>,
}

impl SafetyValidator {
    pub fn new(config: SafetyConfig) -> Self {
        let dosage_patterns = [
            r"\d+\s*mg\b",
            r"\d+\s*ml\b",
            r"\d+\s*tablets?\b",
            r"\d+\s*times?\s*(?:daily|a day|per day)",
        ]
        .iter()
        .map(|p| Regex::new(p).unwrap_or_else(|e| panic!("invalid dosage pattern {p}: {e}")))
        .collect();
        Self {
            config,
            dosage_patterns,
        }
    }

    /// Validate a draft against the inbound text and the caller's profile.
    ///
    /// `language` is the detected language of the inbound text; its keyword
    /// table is consulted alongside the English baseline.
    pub fn validate(
        &self,
        inbound_text: &str,
        draft: &str,
        profile: &UserProfile,
        language: &str,
    ) -> SafetyVerdict {
        // 1. Emergency scan on the inbound text. Blocking: skip all other
        //    checks and let the caller substitute the emergency template.
        if scan_emergency(inbound_text, language) {
            return SafetyVerdict {
                emergency_detected: true,
                warnings: Vec::new(),
                blocked: true,
            };
        }

        let draft_lower = draft.to_lowercase();
        let mut warnings = Vec::new();

        // 2. Interactions between current medications and draft mentions.
        for (a, b, warning) in MEDICATION_INTERACTIONS {
            let takes_a = profile.medications.iter().any(|m| m.contains(a));
            let takes_b = profile.medications.iter().any(|m| m.contains(b));
            if (takes_a && draft_lower.contains(b)) || (takes_b && draft_lower.contains(a)) {
                warnings.push(format!("Interaction warning: {warning}"));
            }
        }

        // 3. Allergies: direct mentions, then known cross-reactants.
        for allergy in &profile.allergies {
            let allergy_lower = allergy.to_lowercase();
            if draft_lower.contains(&allergy_lower) {
                warnings.push(format!("Allergy alert: you are allergic to {allergy}"));
            }
            if let Some((base, related)) = ALLERGY_CROSS_REACTANTS
                .iter()
                .find(|(base, _)| *base == allergy_lower)
            {
                for item in *related {
                    if draft_lower.contains(item) {
                        warnings.push(format!(
                            "Caution: {item} may cross-react with your {base} allergy"
                        ));
                    }
                }
            }
        }

        // 4. Conditions named in the medical history.
        let history_lower = profile.medical_history.to_lowercase();
        for (condition, items) in CONDITION_CONTRAINDICATIONS {
            if history_lower.contains(condition) {
                for item in *items {
                    if draft_lower.contains(item) {
                        warnings.push(format!(
                            "Caution: {item} may not be suitable with {condition}"
                        ));
                    }
                }
            }
        }

        // 5. Age-based dosage filtering (advisory, never blocking).
        if let Some(age) = profile.age {
            let has_dosage = self
                .dosage_patterns
                .iter()
                .any(|pattern| pattern.is_match(&draft_lower));
            if has_dosage {
                if age < self.config.pediatric_age {
                    warnings.push(
                        "This may be an adult dosage. For a child, please confirm with a \
                         pediatrician before use."
                            .to_string(),
                    );
                } else if age > self.config.geriatric_age {
                    warnings.push(
                        "Dosages may need adjustment for older adults. Please confirm with \
                         your doctor."
                            .to_string(),
                    );
                }
            }
        }

        SafetyVerdict {
            emergency_detected: false,
            warnings,
            blocked: false,
        }
    }

    /// The fixed emergency-response template.
    pub fn emergency_reply(&self) -> String {
        format!(
            "EMERGENCY DETECTED\n\n\
             Your message mentions symptoms that may need immediate medical attention.\n\
             {}\n\
             Do not wait for an online reply. If you can, have someone stay with you \
             until help arrives.",
            self.config.emergency_guidance
        )
    }

    /// Assemble the final non-blocked reply: draft, warnings, disclaimer.
    pub fn finalize(&self, draft: &str, verdict: &SafetyVerdict) -> String {
        debug_assert!(!verdict.blocked, "finalize called on a blocked verdict");
        let mut reply = draft.trim_end().to_string();

        if !verdict.warnings.is_empty() {
            reply.push_str("\n");
            for warning in &verdict.warnings {
                reply.push_str(&format!("\n⚠ {warning}"));
            }
        }

        // Never duplicate the disclaimer if a handler already included it.
        if !reply.contains("AI guidance only") {
            reply.push_str(&format!("\n\n{DISCLAIMER}"));
        }
        reply
    }
}

/// Case-insensitive substring scan against the language's emergency table
/// plus the English baseline.
fn scan_emergency(text: &str, language: &str) -> bool {
    let lowered = text.to_lowercase();
    let in_table = |table: &[&str]| table.iter().any(|kw| lowered.contains(&kw.to_lowercase()));

    if in_table(EMERGENCY_KEYWORDS_EN) {
        return true;
    }
    match language {
        "hi" => in_table(EMERGENCY_KEYWORDS_HI),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> SafetyValidator {
        SafetyValidator::new(SafetyConfig::default())
    }

    fn profile() -> UserProfile {
        let mut profile = UserProfile::new("+919876543210");
        profile.name = "Asha".into();
        profile.age = Some(34);
        profile.onboarding_completed = true;
        profile
    }

    // ── Emergency scan ──────────────────────────────────────────────

    #[test]
    fn emergency_in_inbound_blocks_regardless_of_draft() {
        let verdict = validator().validate(
            "emergency, can't breathe",
            "Take 500 mg paracetamol",
            &profile(),
            "en",
        );
        assert!(verdict.emergency_detected);
        assert!(verdict.blocked);
        assert!(verdict.warnings.is_empty());
    }

    #[test]
    fn emergency_scan_is_case_insensitive() {
        let verdict = validator().validate("CHEST PAIN since morning", "draft", &profile(), "en");
        assert!(verdict.blocked);
    }

    #[test]
    fn emergency_in_draft_alone_does_not_block() {
        // The scan targets the inbound text, not the draft.
        let verdict = validator().validate(
            "mild cold since yesterday",
            "If you ever have chest pain, call a doctor.",
            &profile(),
            "en",
        );
        assert!(!verdict.blocked);
        assert!(!verdict.emergency_detected);
    }

    #[test]
    fn hindi_keywords_detected_for_hindi_language() {
        let verdict = validator().validate("मुझे सीने में दर्द है", "draft", &profile(), "hi");
        assert!(verdict.blocked);
    }

    #[test]
    fn english_baseline_applies_to_all_languages() {
        let verdict = validator().validate("chest pain please help", "draft", &profile(), "ta");
        assert!(verdict.blocked);
    }

    #[test]
    fn emergency_reply_contains_configured_guidance() {
        let reply = validator().emergency_reply();
        assert!(reply.starts_with("EMERGENCY DETECTED"));
        assert!(reply.contains("112"));
    }

    // ── Interactions, allergies, conditions ─────────────────────────

    #[test]
    fn interaction_between_current_med_and_draft_mention() {
        let mut profile = profile();
        profile.medications = vec!["warfarin".into()];
        let verdict = validator().validate(
            "what can I take for a headache",
            "You could take aspirin with food.",
            &profile,
            "en",
        );
        assert!(!verdict.blocked);
        assert_eq!(verdict.warnings.len(), 1);
        assert!(verdict.warnings[0].contains("bleeding risk"));
    }

    #[test]
    fn interaction_checks_both_directions() {
        let mut profile = profile();
        profile.medications = vec!["aspirin".into()];
        let verdict =
            validator().validate("question", "Warfarin is sometimes prescribed.", &profile, "en");
        assert!(verdict.warnings.iter().any(|w| w.contains("bleeding risk")));
    }

    #[test]
    fn direct_allergy_mention_warns() {
        let mut profile = profile();
        profile.allergies = vec!["penicillin".into()];
        let verdict =
            validator().validate("question", "A course of penicillin helps.", &profile, "en");
        assert!(verdict.warnings.iter().any(|w| w.contains("allergic to penicillin")));
    }

    #[test]
    fn allergy_cross_reactant_warns() {
        let mut profile = profile();
        profile.allergies = vec!["penicillin".into()];
        let verdict =
            validator().validate("question", "Amoxicillin 250 mg twice daily.", &profile, "en");
        assert!(verdict
            .warnings
            .iter()
            .any(|w| w.contains("amoxicillin") && w.contains("penicillin")));
    }

    #[test]
    fn condition_in_history_flags_contraindicated_item() {
        let mut profile = profile();
        profile.medical_history = "Hypertension diagnosed in 2021".into();
        let verdict = validator().validate(
            "blocked nose",
            "A decongestant spray can help.",
            &profile,
            "en",
        );
        assert!(verdict
            .warnings
            .iter()
            .any(|w| w.contains("decongestant") && w.contains("hypertension")));
    }

    // ── Age-based dosage checks ─────────────────────────────────────

    #[test]
    fn pediatric_dosage_warns_without_blocking() {
        let mut profile = profile();
        profile.age = Some(8);
        profile.allergies = vec![];
        let verdict = validator().validate(
            "I have fever",
            "Take 500 mg paracetamol every 6 hours.",
            &profile,
            "en",
        );
        assert!(!verdict.blocked);
        assert!(!verdict.emergency_detected);
        assert!(verdict.warnings.iter().any(|w| w.contains("pediatrician")));
    }

    #[test]
    fn geriatric_dosage_warns() {
        let mut profile = profile();
        profile.age = Some(72);
        let verdict =
            validator().validate("question", "Take 2 tablets daily.", &profile, "en");
        assert!(verdict.warnings.iter().any(|w| w.contains("older adults")));
    }

    #[test]
    fn adult_dosage_passes_clean() {
        let verdict = validator().validate(
            "I have fever",
            "Take 500 mg paracetamol every 6 hours.",
            &profile(),
            "en",
        );
        assert!(verdict.warnings.is_empty());
    }

    #[test]
    fn no_dosage_pattern_no_age_warning() {
        let mut profile = profile();
        profile.age = Some(8);
        let verdict = validator().validate("question", "Rest and drink water.", &profile, "en");
        assert!(verdict.warnings.is_empty());
    }

    // ── Finalize ────────────────────────────────────────────────────

    #[test]
    fn finalize_appends_warnings_then_disclaimer() {
        let verdict = SafetyVerdict {
            emergency_detected: false,
            warnings: vec!["Interaction warning: X".into()],
            blocked: false,
        };
        let reply = validator().finalize("Take rest.", &verdict);
        assert!(reply.starts_with("Take rest."));
        assert!(reply.contains("⚠ Interaction warning: X"));
        assert!(reply.ends_with(DISCLAIMER));
        let warning_pos = reply.find("⚠").unwrap();
        let disclaimer_pos = reply.find(DISCLAIMER).unwrap();
        assert!(warning_pos < disclaimer_pos);
    }

    #[test]
    fn finalize_never_duplicates_disclaimer() {
        let verdict = SafetyVerdict {
            emergency_detected: false,
            warnings: vec![],
            blocked: false,
        };
        let draft = format!("Take rest.\n\n{DISCLAIMER}");
        let reply = validator().finalize(&draft, &verdict);
        assert_eq!(reply.matches("AI guidance only").count(), 1);
    }

    // ── Determinism ─────────────────────────────────────────────────

    #[test]
    fn validator_is_deterministic() {
        let mut profile = profile();
        profile.medications = vec!["warfarin".into()];
        profile.allergies = vec!["penicillin".into()];
        profile.medical_history = "pregnancy".into();
        let v = validator();
        let first = v.validate("question", "aspirin and amoxicillin", &profile, "en");
        let second = v.validate("question", "aspirin and amoxicillin", &profile, "en");
        assert_eq!(first, second);
        assert!(first.warnings.len() >= 3);
    }
}
