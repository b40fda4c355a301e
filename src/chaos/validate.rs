//! Construction-time validation of chaos configurations.

use super::ChaosConfig;

/// The findings of a validation pass: hard errors and advisory warnings.
#[derive(Clone, Debug, Default)]
pub struct ValidationReport {
    /// Configurations that cannot behave as written.
    pub errors: Vec<String>,

    /// Configurations that are legal but probably not what was intended.
    pub warnings: Vec<String>,
}

impl ValidationReport {
    /// True when no errors were found.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Validates a chaos configuration without constructing a decorator.
pub fn validate(config: &ChaosConfig) -> ValidationReport {
    let mut report = ValidationReport::default();

    if !config.enabled {
        report
            .warnings
            .push("chaos is globally disabled; no faults will be injected".to_string());
    }

    let mut any_policy = false;
    if let Some(policy) = &config.default_policy {
        any_policy = true;
        policy.check("default policy", &mut report);
    }
    for (operation, settings) in &config.per_operation {
        if let Some(policy) = &settings.policy {
            any_policy = true;
            policy.check(&format!("{operation} policy"), &mut report);
        }
    }
    if !any_policy {
        report
            .warnings
            .push("no decision policies are configured".to_string());
    }

    if let Some(rate) = config.max_fault_rate {
        if config.rate_limit_window.is_zero() {
            report
                .errors
                .push("rate limit window must be positive".to_string());
        }
        if rate > 1_000 {
            report.warnings.push(format!(
                "fault-rate cap of {rate} per window is unlikely to limit anything"
            ));
        }
    }

    report
}
