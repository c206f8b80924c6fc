//! Built-in classification tables for the database handlers.
//!
//! Each resource table is chained over the common base table, and narrower
//! tables (modify, roles, soft-fail tagging) are chained over their resource
//! table, so only the codes that differ need to be listed.

use converge_core::rules::codes;
use converge_core::{common_rule_set, ErrorRule, ErrorRuleSet};
use converge_schema::{ErrorStatus, FaultKind, HandlerErrorCode as C};
use std::sync::{Arc, OnceLock};

fn fail(code: C) -> ErrorStatus {
    ErrorStatus::FailWith(code)
}

pub fn default_db_instance() -> Arc<ErrorRuleSet> {
    static SET: OnceLock<Arc<ErrorRuleSet>> = OnceLock::new();
    Arc::clone(SET.get_or_init(|| {
        let mut rules = Vec::new();
        rules.extend(codes(
            fail(C::NotFound),
            &[
                "DBInstanceNotFound",
                "DBParameterGroupNotFound",
                "DBSecurityGroupNotFound",
                "DBSubnetGroupNotFoundFault",
                "OptionGroupNotFoundFault",
                "DomainNotFoundFault",
            ],
        ));
        rules.extend(codes(fail(C::AlreadyExists), &["DBInstanceAlreadyExists"]));
        rules.extend(codes(
            fail(C::ResourceConflict),
            &[
                "InvalidDBInstanceState",
                "InvalidDBSecurityGroupState",
                "InvalidDBClusterStateFault",
                "DBUpgradeDependencyFailure",
            ],
        ));
        rules.extend(codes(
            fail(C::ServiceLimitExceeded),
            &[
                "InstanceQuotaExceeded",
                "StorageQuotaExceeded",
                "InsufficientDBInstanceCapacity",
            ],
        ));
        rules.extend(codes(
            fail(C::InvalidRequest),
            &[
                "InvalidVPCNetworkStateFault",
                "StorageTypeNotSupported",
                "KMSKeyNotAccessibleFault",
                "InvalidSubnet",
                "ProvisionedIopsNotAvailableInAZFault",
            ],
        ));
        Arc::new(ErrorRuleSet::chained(rules, common_rule_set()))
    }))
}

pub fn modify_db_instance() -> Arc<ErrorRuleSet> {
    static SET: OnceLock<Arc<ErrorRuleSet>> = OnceLock::new();
    Arc::clone(SET.get_or_init(|| {
        let rules = vec![
            // An update that changes nothing the API cares about.
            ErrorRule::by_predicate(
                |f| {
                    f.error_code() == Some("InvalidParameterCombination")
                        && f.message().contains("No modifications were requested")
                },
                ErrorStatus::Ignore,
            ),
            ErrorRule::by_code("CertificateNotFound", fail(C::NotFound)),
            ErrorRule::by_code("DBUpgradeDependencyFailure", fail(C::ResourceConflict)),
        ];
        Arc::new(ErrorRuleSet::chained(rules, default_db_instance()))
    }))
}

pub fn update_associated_roles() -> Arc<ErrorRuleSet> {
    static SET: OnceLock<Arc<ErrorRuleSet>> = OnceLock::new();
    Arc::clone(SET.get_or_init(|| {
        let mut rules = codes(
            ErrorStatus::Ignore,
            &["DBInstanceRoleAlreadyExists", "DBInstanceRoleNotFound"],
        );
        rules.push(ErrorRule::by_code(
            "DBInstanceRoleQuotaExceeded",
            fail(C::ServiceLimitExceeded),
        ));
        Arc::new(ErrorRuleSet::chained(rules, default_db_instance()))
    }))
}

pub fn default_db_parameter_group() -> Arc<ErrorRuleSet> {
    static SET: OnceLock<Arc<ErrorRuleSet>> = OnceLock::new();
    Arc::clone(SET.get_or_init(|| {
        let mut rules = Vec::new();
        rules.extend(codes(
            fail(C::ResourceConflict),
            &["InvalidDBParameterGroupState"],
        ));
        rules.extend(codes(
            fail(C::AlreadyExists),
            &["DBParameterGroupAlreadyExists"],
        ));
        rules.extend(codes(fail(C::NotFound), &["DBParameterGroupNotFound"]));
        rules.extend(codes(
            fail(C::ServiceLimitExceeded),
            &["DBParameterGroupQuotaExceeded"],
        ));
        Arc::new(ErrorRuleSet::chained(rules, common_rule_set()))
    }))
}

/// Tagging a parameter group is best effort when permissions are missing.
pub fn soft_fail_tag_db_parameter_group() -> Arc<ErrorRuleSet> {
    static SET: OnceLock<Arc<ErrorRuleSet>> = OnceLock::new();
    Arc::clone(SET.get_or_init(|| {
        let mut rules = vec![ErrorRule::by_kind(
            FaultKind::AccessDenied,
            ErrorStatus::Ignore,
        )];
        rules.extend(codes(
            ErrorStatus::Ignore,
            &["AccessDenied", "AccessDeniedException"],
        ));
        Arc::new(ErrorRuleSet::chained(rules, default_db_parameter_group()))
    }))
}

/// Put configured override rules in front of a built-in table.
///
/// Only the rules of `overrides` are used; its own fallback chain is ignored
/// so the built-in table keeps its position in front of the common base.
pub fn with_overrides(overrides: Option<&ErrorRuleSet>, base: Arc<ErrorRuleSet>) -> Arc<ErrorRuleSet> {
    match overrides {
        Some(o) if !o.rules().is_empty() => {
            Arc::new(ErrorRuleSet::chained(o.rules().to_vec(), base))
        }
        _ => base,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use converge_core::Fault;

    #[test]
    fn instance_table_overrides_and_falls_back() {
        let set = default_db_instance();
        assert_eq!(
            set.classify(&Fault::service("DBInstanceNotFound", "")),
            fail(C::NotFound)
        );
        assert_eq!(
            set.classify(&Fault::service("ThrottlingException", "")),
            fail(C::Throttling)
        );
        assert_eq!(set.depth(), 2);
    }

    #[test]
    fn no_op_modification_is_ignored() {
        let set = modify_db_instance();
        assert_eq!(
            set.classify(&Fault::service(
                "InvalidParameterCombination",
                "No modifications were requested"
            )),
            ErrorStatus::Ignore
        );
        assert_eq!(
            set.classify(&Fault::service("InvalidParameterCombination", "bad combo")),
            fail(C::InvalidRequest)
        );
        assert_eq!(
            set.classify(&Fault::service("InvalidDBInstanceState", "")),
            fail(C::ResourceConflict)
        );
    }

    #[test]
    fn parameter_group_tables() {
        let set = default_db_parameter_group();
        let cases = [
            ("InvalidDBParameterGroupState", C::ResourceConflict),
            ("DBParameterGroupAlreadyExists", C::AlreadyExists),
            ("DBParameterGroupNotFound", C::NotFound),
            ("DBParameterGroupQuotaExceeded", C::ServiceLimitExceeded),
        ];
        for (code, expected) in cases {
            assert_eq!(set.classify(&Fault::service(code, "")), fail(expected));
        }
    }

    #[test]
    fn soft_fail_tag_ignores_access_denied_only() {
        let set = soft_fail_tag_db_parameter_group();
        assert_eq!(
            set.classify(&Fault::access_denied("403")),
            ErrorStatus::Ignore
        );
        assert_eq!(
            set.classify(&Fault::service("AccessDeniedException", "")),
            ErrorStatus::Ignore
        );
        assert_eq!(
            set.classify(&Fault::service("DBParameterGroupNotFound", "")),
            fail(C::NotFound)
        );
    }

    #[test]
    fn overrides_take_priority() {
        let overrides = ErrorRuleSet::new(vec![ErrorRule::by_code(
            "DBInstanceNotFound",
            ErrorStatus::Ignore,
        )]);
        let set = with_overrides(Some(&overrides), default_db_instance());
        assert_eq!(
            set.classify(&Fault::service("DBInstanceNotFound", "")),
            ErrorStatus::Ignore
        );
        assert_eq!(
            set.classify(&Fault::service("InvalidDBInstanceState", "")),
            fail(C::ResourceConflict)
        );
        assert!(Arc::ptr_eq(
            &with_overrides(None, default_db_instance()),
            &default_db_instance()
        ));
    }
}
