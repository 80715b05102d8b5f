// 🏷️ Special Rules - per-institution amount adjustments, rules as data
//
// Rules come from settings as {institution, action, value}. The action set is
// closed; an unknown action name is a configuration error, not a no-op.

use std::collections::HashMap;
use std::fmt;

use tracing::debug;

use crate::config::SpecialRuleConfig;
use crate::error::ConfigError;
use crate::records::{CanonicalRecord, RawRecord};

/// Rule values are taken to 4 decimal places.
const RATIO_SCALE: i128 = 10_000;

// ============================================================================
// RATIO
// ============================================================================

/// Exact positive rational used as divisor or multiplier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ratio {
    num: i128,
    den: i128,
}

impl Ratio {
    pub fn from_f64(value: f64) -> Option<Self> {
        if !value.is_finite() || value <= 0.0 {
            return None;
        }
        let scaled = (value * RATIO_SCALE as f64).round();
        if scaled < 1.0 || scaled > i64::MAX as f64 {
            return None;
        }

        let num = scaled as i128;
        let divisor = gcd(num, RATIO_SCALE);
        Some(Ratio {
            num: num / divisor,
            den: RATIO_SCALE / divisor,
        })
    }

    pub fn whole(n: u32) -> Option<Self> {
        (n > 0).then_some(Ratio { num: n as i128, den: 1 })
    }
}

impl fmt::Display for Ratio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.den == 1 {
            write!(f, "{}", self.num)
        } else {
            write!(f, "{}/{}", self.num, self.den)
        }
    }
}

fn gcd(mut a: i128, mut b: i128) -> i128 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a.abs().max(1)
}

/// numerator / denominator for non-negative inputs, halves rounded up.
fn div_round_half_up(numerator: i128, denominator: i128) -> i128 {
    (2 * numerator + denominator) / (2 * denominator)
}

// ============================================================================
// RULE DEFINITION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    DivideAmount(Ratio),
    MultiplyAmount(Ratio),
}

impl RuleAction {
    /// Name used in settings and in `adjustment_applied`
    pub fn id(&self) -> &'static str {
        match self {
            RuleAction::DivideAmount(_) => "divide_amount",
            RuleAction::MultiplyAmount(_) => "multiply_amount",
        }
    }

    /// Scale the magnitude, keep the sign. Halves round away from zero.
    pub fn apply(&self, amount: i64) -> i64 {
        let magnitude = (amount as i128).abs();
        let scaled = match self {
            RuleAction::DivideAmount(r) => div_round_half_up(magnitude * r.den, r.num),
            RuleAction::MultiplyAmount(r) => div_round_half_up(magnitude * r.num, r.den),
        };
        let signed = if amount < 0 { -scaled } else { scaled };
        signed.clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecialRule {
    pub institution: String,
    pub action: RuleAction,
}

impl SpecialRule {
    pub fn from_config(config: &SpecialRuleConfig) -> Result<Self, ConfigError> {
        let ratio = Ratio::from_f64(config.value).ok_or_else(|| {
            ConfigError::Invalid(format!(
                "special rule for {}: value {} must be a positive number",
                config.institution, config.value
            ))
        })?;

        let action = match config.action.as_str() {
            "divide_amount" => RuleAction::DivideAmount(ratio),
            "multiply_amount" => RuleAction::MultiplyAmount(ratio),
            other => {
                return Err(ConfigError::UnknownRuleAction {
                    institution: config.institution.clone(),
                    action: other.to_string(),
                })
            }
        };

        Ok(SpecialRule {
            institution: config.institution.clone(),
            action,
        })
    }
}

// ============================================================================
// RULE ENGINE
// ============================================================================

/// Rules grouped by exact institution name, applied in configuration order.
#[derive(Debug, Default)]
pub struct RuleEngine {
    rules: HashMap<String, Vec<SpecialRule>>,
}

impl RuleEngine {
    pub fn new() -> Self {
        RuleEngine::default()
    }

    pub fn from_config(configs: &[SpecialRuleConfig]) -> Result<Self, ConfigError> {
        let mut engine = RuleEngine::new();
        for config in configs {
            engine.add_rule(SpecialRule::from_config(config)?);
        }
        Ok(engine)
    }

    pub fn add_rule(&mut self, rule: SpecialRule) {
        self.rules.entry(rule.institution.clone()).or_default().push(rule);
    }

    pub fn rule_count(&self) -> usize {
        self.rules.values().map(Vec::len).sum()
    }

    /// Run every matching rule; unmatched institutions pass through untouched.
    pub fn apply(&self, record: RawRecord) -> CanonicalRecord {
        let mut canonical = CanonicalRecord::unadjusted(record);

        let Some(rules) = self.rules.get(&canonical.record.institution) else {
            return canonical;
        };

        for rule in rules {
            let before = canonical.record.amount;
            canonical.record.amount = rule.action.apply(before);
            canonical.adjustment_applied.push(rule.action.id().to_string());
            debug!(
                id = %canonical.record.external_id,
                institution = %rule.institution,
                rule = rule.action.id(),
                before,
                after = canonical.record.amount,
                "special rule applied"
            );
        }

        canonical
    }

    pub fn apply_all(&self, records: Vec<RawRecord>) -> Vec<CanonicalRecord> {
        records.into_iter().map(|r| self.apply(r)).collect()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    const AMEX: &str = "アメリカン・エキスプレスカード";

    fn record(amount: i64, institution: &str) -> RawRecord {
        let date = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        RawRecord {
            date,
            description: "テスト".to_string(),
            amount,
            institution: institution.to_string(),
            major_category: String::new(),
            minor_category: String::new(),
            memo: String::new(),
            is_transfer: false,
            external_id: RawRecord::compute_external_id(date, "テスト", amount, institution),
            included: true,
        }
    }

    fn rule(institution: &str, action: &str, value: f64) -> SpecialRuleConfig {
        SpecialRuleConfig {
            institution: institution.to_string(),
            action: action.to_string(),
            value,
        }
    }

    fn halving() -> RuleEngine {
        RuleEngine::from_config(&[rule(AMEX, "divide_amount", 2.0)]).unwrap()
    }

    #[test]
    fn test_amex_charge_is_halved() {
        let canonical = halving().apply(record(-10_000, AMEX));

        assert_eq!(canonical.amount(), -5_000);
        assert_eq!(canonical.adjustment_applied, vec!["divide_amount".to_string()]);
    }

    #[test]
    fn test_divide_preserves_sign_and_rounds_magnitude() {
        let engine = RuleEngine::from_config(&[rule(AMEX, "divide_amount", 3.0)]).unwrap();

        for original in [-10_001i64, -7, -2, -1, 1, 2, 7, 10_001, 123_457] {
            let adjusted = engine.apply(record(original, AMEX)).amount();
            let expected = ((original.abs() as f64) / 3.0).round() as i64;

            assert_eq!(adjusted.abs(), expected, "magnitude of {}", original);
            if adjusted != 0 {
                assert_eq!(adjusted.signum(), original.signum(), "sign of {}", original);
            }
        }
    }

    #[test]
    fn test_halves_round_away_from_zero() {
        let engine = halving();
        assert_eq!(engine.apply(record(3, AMEX)).amount(), 2);
        assert_eq!(engine.apply(record(-3, AMEX)).amount(), -2);
        assert_eq!(engine.apply(record(-1, AMEX)).amount(), -1);
        assert_eq!(engine.apply(record(0, AMEX)).amount(), 0);
    }

    #[test]
    fn test_unmatched_institution_passes_through() {
        let canonical = halving().apply(record(-10_000, "三井住友銀行"));

        assert_eq!(canonical.amount(), -10_000);
        assert!(!canonical.was_adjusted());
    }

    #[test]
    fn test_fractional_divisor_is_exact() {
        let engine = RuleEngine::from_config(&[rule(AMEX, "divide_amount", 1.25)]).unwrap();
        assert_eq!(engine.apply(record(-1_000, AMEX)).amount(), -800);
    }

    #[test]
    fn test_multiply_amount() {
        let engine = RuleEngine::from_config(&[rule(AMEX, "multiply_amount", 0.5)]).unwrap();
        let canonical = engine.apply(record(-999, AMEX));

        assert_eq!(canonical.amount(), -500);
        assert_eq!(canonical.adjustment_applied, vec!["multiply_amount".to_string()]);
    }

    #[test]
    fn test_rules_stack_in_order() {
        let engine = RuleEngine::from_config(&[
            rule(AMEX, "divide_amount", 2.0),
            rule(AMEX, "divide_amount", 2.0),
        ])
        .unwrap();

        let canonical = engine.apply(record(-10_000, AMEX));
        assert_eq!(canonical.amount(), -2_500);
        assert_eq!(canonical.adjustment_applied.len(), 2);
        assert_eq!(engine.rule_count(), 2);
    }

    #[test]
    fn test_unknown_action_is_config_error() {
        let err = RuleEngine::from_config(&[rule(AMEX, "halve_it", 2.0)]).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownRuleAction { ref action, .. } if action == "halve_it"));
    }

    #[test]
    fn test_ratio_rejects_non_positive() {
        assert!(Ratio::from_f64(0.0).is_none());
        assert!(Ratio::from_f64(-2.0).is_none());
        assert!(Ratio::from_f64(f64::NAN).is_none());
        assert!(Ratio::from_f64(0.00001).is_none());
        assert_eq!(Ratio::from_f64(2.0), Ratio::whole(2));
        assert_eq!(Ratio::from_f64(1.25).unwrap().to_string(), "5/4");
    }
}
