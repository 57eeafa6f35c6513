//! Permission gating for tool scopes

use runway_core::Settings;

/// Attributes used to evaluate whether a tool scope is allowed.
#[derive(Debug, Clone)]
pub struct Environment {
    pub app_env: String,
    pub github_token_present: bool,
}

impl Environment {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            app_env: settings.app_env.clone(),
            github_token_present: settings.github_token.is_some(),
        }
    }
}

/// Centralized rule evaluation for tool permission scopes.
pub struct PermissionGate {
    environment: Environment,
}

impl PermissionGate {
    pub fn new(environment: Environment) -> Self {
        Self { environment }
    }

    /// Evaluate a scope. Returns the denial reason when not allowed.
    pub fn check(&self, scope: &str) -> Result<(), String> {
        if scope.starts_with("calculator.") {
            return Ok(());
        }
        if scope == "github.read" {
            if self.environment.github_token_present {
                return Ok(());
            }
            return Err("scope_not_allowed_environment".to_string());
        }
        Err("scope_not_allowed".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(github_token_present: bool) -> PermissionGate {
        PermissionGate::new(Environment {
            app_env: "development".to_string(),
            github_token_present,
        })
    }

    #[test]
    fn test_calculator_scope_always_allowed() {
        assert!(gate(false).check("calculator.execute").is_ok());
    }

    #[test]
    fn test_github_scope_requires_token() {
        assert_eq!(
            gate(false).check("github.read"),
            Err("scope_not_allowed_environment".to_string())
        );
        assert!(gate(true).check("github.read").is_ok());
    }

    #[test]
    fn test_unknown_scope_denied() {
        assert_eq!(
            gate(true).check("filesystem.write"),
            Err("scope_not_allowed".to_string())
        );
    }
}
