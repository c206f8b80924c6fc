//! Ordered, chainable fault classification rules.
//!
//! A rule set is scanned in declaration order and the first matching rule
//! decides. When nothing matches, the fallback set is consulted, and when the
//! chain runs out the fault is classified as `FailWith(InternalError)`.

use crate::fault::Fault;
use converge_schema::{ErrorStatus, FaultKind, HandlerErrorCode, RuleTable};
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Classification of a fault that no rule in the chain matched.
pub const UNCLASSIFIED: ErrorStatus = ErrorStatus::FailWith(HandlerErrorCode::InternalError);

pub type FaultPredicate = Arc<dyn Fn(&Fault) -> bool + Send + Sync>;

#[derive(Clone)]
pub enum Matcher {
    ByKind(FaultKind),
    /// Matches the fault's normalized service error code exactly.
    ByCode(String),
    ByPredicate(FaultPredicate),
}

impl Matcher {
    pub fn matches(&self, fault: &Fault) -> bool {
        match self {
            Matcher::ByKind(kind) => fault.kind() == *kind,
            Matcher::ByCode(code) => fault.error_code() == Some(code.as_str()),
            Matcher::ByPredicate(predicate) => predicate(fault),
        }
    }
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Matcher::ByKind(kind) => f.debug_tuple("ByKind").field(kind).finish(),
            Matcher::ByCode(code) => f.debug_tuple("ByCode").field(code).finish(),
            Matcher::ByPredicate(_) => f.write_str("ByPredicate(..)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ErrorRule {
    pub matcher: Matcher,
    pub status: ErrorStatus,
}

impl ErrorRule {
    pub fn by_kind(kind: FaultKind, status: ErrorStatus) -> Self {
        Self {
            matcher: Matcher::ByKind(kind),
            status,
        }
    }

    pub fn by_code(code: &str, status: ErrorStatus) -> Self {
        Self {
            matcher: Matcher::ByCode(code.trim().to_owned()),
            status,
        }
    }

    pub fn by_predicate(
        predicate: impl Fn(&Fault) -> bool + Send + Sync + 'static,
        status: ErrorStatus,
    ) -> Self {
        Self {
            matcher: Matcher::ByPredicate(Arc::new(predicate)),
            status,
        }
    }
}

/// Expand a list of codes sharing one outcome into individual rules.
pub fn codes(status: ErrorStatus, codes: &[&str]) -> Vec<ErrorRule> {
    codes.iter().map(|c| ErrorRule::by_code(c, status)).collect()
}

#[derive(Debug, Clone, Default)]
pub struct ErrorRuleSet {
    rules: Vec<ErrorRule>,
    fallback: Option<Arc<ErrorRuleSet>>,
}

impl ErrorRuleSet {
    pub fn new(rules: Vec<ErrorRule>) -> Self {
        Self {
            rules,
            fallback: None,
        }
    }

    /// A derived set whose `rules` take priority over everything in `fallback`.
    pub fn chained(rules: Vec<ErrorRule>, fallback: Arc<ErrorRuleSet>) -> Self {
        Self {
            rules,
            fallback: Some(fallback),
        }
    }

    /// Append `fallback` to the end of this set's chain.
    #[must_use]
    pub fn or_else(self, fallback: Arc<ErrorRuleSet>) -> Self {
        let fallback = match self.fallback {
            None => fallback,
            Some(existing) => Arc::new((*existing).clone().or_else(fallback)),
        };
        Self {
            rules: self.rules,
            fallback: Some(fallback),
        }
    }

    /// Build a set from a configured rule table. Each entry expands to one rule
    /// per code followed by one rule per kind, keeping table order.
    pub fn from_table(table: &RuleTable) -> Self {
        let mut rules = Vec::new();
        for entry in &table.rules {
            let Some(status) = entry.status() else {
                continue;
            };
            rules.extend(entry.codes.iter().map(|c| ErrorRule::by_code(c, status)));
            rules.extend(entry.kinds.iter().map(|k| ErrorRule::by_kind(*k, status)));
        }
        Self::new(rules)
    }

    pub fn rules(&self) -> &[ErrorRule] {
        &self.rules
    }

    pub fn fallback(&self) -> Option<&ErrorRuleSet> {
        self.fallback.as_deref()
    }

    /// Number of sets in the chain, this one included.
    pub fn depth(&self) -> usize {
        1 + self.fallback.as_ref().map_or(0, |f| f.depth())
    }

    /// First matching outcome along the chain, if any.
    pub fn find(&self, fault: &Fault) -> Option<ErrorStatus> {
        let mut current = Some(self);
        while let Some(set) = current {
            if let Some(rule) = set.rules.iter().find(|r| r.matcher.matches(fault)) {
                return Some(rule.status);
            }
            current = set.fallback.as_deref();
        }
        None
    }

    pub fn classify(&self, fault: &Fault) -> ErrorStatus {
        self.find(fault).unwrap_or(UNCLASSIFIED)
    }
}

pub fn classify(fault: &Fault, rule_set: &ErrorRuleSet) -> ErrorStatus {
    rule_set.classify(fault)
}

/// Load an override table from `path`. The set has no fallback; callers chain
/// it in front of the table it overrides.
pub fn load_overrides(path: &std::path::Path) -> Result<ErrorRuleSet, crate::CoreError> {
    let table = converge_schema::parse_rule_table_file(path)?;
    Ok(ErrorRuleSet::from_table(&table))
}

/// The shared base table every resource-specific table falls back to.
pub fn common_rule_set() -> Arc<ErrorRuleSet> {
    static COMMON: OnceLock<Arc<ErrorRuleSet>> = OnceLock::new();
    Arc::clone(COMMON.get_or_init(|| Arc::new(build_common_rule_set())))
}

fn build_common_rule_set() -> ErrorRuleSet {
    use HandlerErrorCode as C;

    let mut rules = Vec::new();
    rules.extend(codes(
        ErrorStatus::FailWith(C::ServiceInternalError),
        &["ClientUnavailable", "InternalFailure", "ServiceUnavailable"],
    ));
    rules.extend(codes(
        ErrorStatus::FailWith(C::AccessDenied),
        &["AccessDeniedException", "AccessDenied", "NotAuthorized"],
    ));
    rules.extend(codes(
        ErrorStatus::FailWith(C::Throttling),
        &["ThrottlingException", "Throttling", "RequestLimitExceeded"],
    ));
    rules.extend(codes(
        ErrorStatus::FailWith(C::InvalidRequest),
        &[
            "InvalidParameterCombination",
            "InvalidParameterValue",
            "MissingParameter",
        ],
    ));
    rules.push(ErrorRule::by_kind(
        FaultKind::Client,
        ErrorStatus::FailWith(C::ServiceInternalError),
    ));
    rules.push(ErrorRule::by_kind(
        FaultKind::AccessDenied,
        ErrorStatus::FailWith(C::AccessDenied),
    ));
    rules.push(ErrorRule::by_kind(
        FaultKind::Validation,
        ErrorStatus::FailWith(C::InvalidRequest),
    ));
    ErrorRuleSet::new(rules)
}
