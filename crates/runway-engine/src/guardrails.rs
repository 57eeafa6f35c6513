//! Pattern-based guardrail layers
//!
//! Declarative rules evaluated against raw text: instruction overrides and
//! policy probes block at the input layer, retrieved context is scrubbed of
//! instruction-like content, and outputs are checked before streaming.

use std::sync::OnceLock;

use regex::Regex;
use runway_core::Settings;

use crate::collab::{Guardrail, GuardrailViolation, SanitizedChunk};

struct Rule {
    name: &'static str,
    threat_type: &'static str,
    pattern: &'static str,
}

static INPUT_RULES: [Rule; 5] = [
    Rule {
        name: "system_instruction_override",
        threat_type: "prompt_injection",
        pattern: r"(?i)ignore\s+(?:all\s+|any\s+)?previous\s+instructions",
    },
    Rule {
        name: "system_instruction_override",
        threat_type: "prompt_injection",
        pattern: r"(?i)disregard\s+(?:all\s+|your\s+)?(?:previous|prior)\s+(?:instructions|rules)",
    },
    Rule {
        name: "internal_policy_probe",
        threat_type: "prompt_injection",
        pattern: r"(?i)reveal\s+(?:your\s+)?(?:hidden\s+)?system\s+prompt",
    },
    Rule {
        name: "internal_policy_probe",
        threat_type: "prompt_injection",
        pattern: r"(?i)reveal\s+hidden\s+polic(?:y|ies)",
    },
    Rule {
        name: "disallowed_action_request",
        threat_type: "policy_violation",
        pattern: r"(?i)\b(?:drop\s+table|rm\s+-rf|delete\s+all\s+(?:files|data))\b",
    },
];

static CONTEXT_RULES: [Rule; 2] = [
    Rule {
        name: "embedded_instruction",
        threat_type: "indirect_prompt_injection",
        pattern: r"(?i)ignore\s+(?:all\s+|any\s+)?previous\s+instructions[^.\n]*",
    },
    Rule {
        name: "embedded_instruction",
        threat_type: "indirect_prompt_injection",
        pattern: r"(?i)you\s+must\s+now\s+[^.\n]*",
    },
];

static OUTPUT_RULES: [Rule; 1] = [Rule {
    name: "system_prompt_leak",
    threat_type: "policy_violation",
    pattern: r"(?i)begin\s+system\s+prompt",
}];

fn compiled(rules: &'static [Rule], cell: &'static OnceLock<Vec<Regex>>) -> &'static [Regex] {
    cell.get_or_init(|| {
        rules
            .iter()
            .map(|rule| Regex::new(rule.pattern).expect("static pattern compiles"))
            .collect()
    })
}

fn input_patterns() -> &'static [Regex] {
    static CELL: OnceLock<Vec<Regex>> = OnceLock::new();
    compiled(&INPUT_RULES, &CELL)
}

fn context_patterns() -> &'static [Regex] {
    static CELL: OnceLock<Vec<Regex>> = OnceLock::new();
    compiled(&CONTEXT_RULES, &CELL)
}

fn output_patterns() -> &'static [Regex] {
    static CELL: OnceLock<Vec<Regex>> = OnceLock::new();
    compiled(&OUTPUT_RULES, &CELL)
}

/// Feature switches for the individual layers.
#[derive(Debug, Clone)]
pub struct GuardrailConfig {
    pub input_gate_enabled: bool,
    pub context_sanitizer_enabled: bool,
    pub output_validator_enabled: bool,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            input_gate_enabled: true,
            context_sanitizer_enabled: true,
            output_validator_enabled: true,
        }
    }
}

impl GuardrailConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            input_gate_enabled: settings.guardrail_input_enabled,
            context_sanitizer_enabled: settings.guardrail_context_sanitizer_enabled,
            output_validator_enabled: settings.guardrail_output_validator_enabled,
        }
    }
}

/// The default layered guardrail.
pub struct PatternGuardrail {
    config: GuardrailConfig,
}

impl PatternGuardrail {
    pub fn new(config: GuardrailConfig) -> Self {
        Self { config }
    }
}

impl Default for PatternGuardrail {
    fn default() -> Self {
        Self::new(GuardrailConfig::default())
    }
}

impl Guardrail for PatternGuardrail {
    fn check_input(&self, message: &str) -> Result<(), GuardrailViolation> {
        if !self.config.input_gate_enabled {
            return Ok(());
        }
        let text = message.trim();
        if text.is_empty() {
            return Ok(());
        }
        for (rule, pattern) in INPUT_RULES.iter().zip(input_patterns()) {
            if pattern.is_match(text) {
                return Err(GuardrailViolation {
                    layer: "input".to_string(),
                    threat_type: rule.threat_type.to_string(),
                    reason: rule.name.to_string(),
                });
            }
        }
        Ok(())
    }

    fn sanitize_chunk(&self, _chunk_id: &str, text: &str) -> SanitizedChunk {
        if !self.config.context_sanitizer_enabled {
            return SanitizedChunk {
                text: text.to_string(),
                sanitization_applied: false,
                injection_pattern: None,
            };
        }
        let mut sanitized = text.to_string();
        let mut injection_pattern = None;
        for (rule, pattern) in CONTEXT_RULES.iter().zip(context_patterns()) {
            if pattern.is_match(&sanitized) {
                injection_pattern.get_or_insert_with(|| rule.name.to_string());
                sanitized = pattern.replace_all(&sanitized, "[sanitized]").into_owned();
            }
        }
        SanitizedChunk {
            sanitization_applied: injection_pattern.is_some(),
            text: sanitized,
            injection_pattern,
        }
    }

    fn check_output(&self, text: &str) -> Result<(), GuardrailViolation> {
        if !self.config.output_validator_enabled {
            return Ok(());
        }
        for (rule, pattern) in OUTPUT_RULES.iter().zip(output_patterns()) {
            if pattern.is_match(text) {
                return Err(GuardrailViolation {
                    layer: "output".to_string(),
                    threat_type: rule.threat_type.to_string(),
                    reason: rule.name.to_string(),
                });
            }
        }
        Ok(())
    }
}
