//! Host name policy applied before anything is signed.

use std::net::IpAddr;

use crate::error::ValidationError;

/// Whether `domain` falls under the permitted DNS `constraint`, with the
/// semantics X.509 path validation gives a `dNSName` name constraint.
///
/// A constraint without a leading dot matches the domain itself and its
/// subdomains. A constraint with a leading dot matches exactly one label
/// boundary: `.example.com` matches `example.com` and `foo.example.com` but
/// not `evilexample.com`. An empty constraint matches everything.
///
/// ```
/// use certmgr::authority::naming::match_name_constraint;
///
/// assert!(match_name_constraint("foo.example.com", "example.com"));
/// assert!(!match_name_constraint("evilexample.com", "example.com"));
/// ```
pub fn match_name_constraint(domain: &str, constraint: &str) -> bool {
    if constraint.is_empty() {
        return true;
    }
    if domain.len() < constraint.len() {
        return false;
    }

    let prefix_len = domain.len() - constraint.len();
    let suffix = &domain.as_bytes()[prefix_len..];
    if !suffix.eq_ignore_ascii_case(constraint.as_bytes()) {
        return false;
    }
    if prefix_len == 0 {
        return true;
    }

    let is_subdomain = domain.as_bytes()[prefix_len - 1] == b'.';
    let constraint_has_leading_dot = constraint.starts_with('.');
    is_subdomain != constraint_has_leading_dot
}

/// Inputs the naming policy is evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct NamePolicy<'a> {
    /// Permitted DNS domains of the signing certificate. Empty means unrestricted.
    pub permitted_dns_domains: &'a [String],
    pub max_duration: time::Duration,
}

/// Validates the requested hosts (common name first) and validity span.
///
/// Returns the hosts lower-cased, in request order. IP literals are allowed
/// anywhere but first and are not checked against the DNS constraints.
pub fn validate(
    requested_hosts: &[String],
    duration: time::Duration,
    policy: &NamePolicy<'_>,
) -> Result<Vec<String>, ValidationError> {
    let mut hosts = Vec::with_capacity(requested_hosts.len());

    for (index, requested) in requested_hosts.iter().enumerate() {
        let host = requested.to_ascii_lowercase();
        check_host_format(&host)?;

        if host.parse::<IpAddr>().is_ok() {
            if index == 0 {
                return Err(ValidationError::SubjectMustNotBeIp { host });
            }
            hosts.push(host);
            continue;
        }

        let permitted = policy.permitted_dns_domains.is_empty()
            || policy
                .permitted_dns_domains
                .iter()
                .any(|constraint| match_name_constraint(&host, constraint));
        if !permitted {
            return Err(ValidationError::DomainNotPermitted { host });
        }
        hosts.push(host);
    }

    let max_days = policy.max_duration.whole_days();
    if duration <= time::Duration::ZERO || duration > policy.max_duration {
        return Err(ValidationError::DurationOutOfRange {
            requested_days: duration.whole_days(),
            max_days,
        });
    }

    Ok(hosts)
}

fn check_host_format(host: &str) -> Result<(), ValidationError> {
    let reject = |reason| {
        Err(ValidationError::UnsupportedHostFormat {
            host: host.to_string(),
            reason,
        })
    };

    if host.is_empty() {
        return reject("empty host name");
    }
    if !host.is_ascii() {
        return reject("host names must be ASCII");
    }
    if host.chars().any(|c| c.is_ascii_whitespace() || c.is_ascii_control()) {
        return reject("host names must not contain whitespace");
    }
    if host.starts_with("www.") {
        return reject("www. host names are not supported");
    }
    if host.starts_with('.') {
        return reject(". host names are not supported");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("foo.example.com", "example.com", true)]
    #[case("example.com", "example.com", true)]
    #[case("EXAMPLE.com", "example.COM", true)]
    #[case("evilexample.com", "example.com", false)]
    #[case("example.com", ".example.com", true)]
    #[case("foo.example.com", ".example.com", true)]
    #[case("example.com", "", true)]
    #[case("com", "example.com", false)]
    #[case("foo.example.org", "example.com", false)]
    fn name_constraint_matching(#[case] domain: &str, #[case] constraint: &str, #[case] expected: bool) {
        assert_eq!(match_name_constraint(domain, constraint), expected);
    }

    fn hosts(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn example_policy(permitted: &[String]) -> NamePolicy<'_> {
        NamePolicy {
            permitted_dns_domains: permitted,
            max_duration: time::Duration::days(365),
        }
    }

    #[test]
    fn lower_cases_and_keeps_order() {
        let permitted = hosts(&["example.com"]);
        let validated = validate(
            &hosts(&["A.Example.com", "192.0.2.7", "b.example.COM"]),
            time::Duration::days(90),
            &example_policy(&permitted),
        )
        .unwrap();
        assert_eq!(validated, hosts(&["a.example.com", "192.0.2.7", "b.example.com"]));
    }

    #[rstest]
    #[case(&["192.0.2.1"], ValidationError::SubjectMustNotBeIp { host: "192.0.2.1".into() })]
    #[case(&["::1"], ValidationError::SubjectMustNotBeIp { host: "::1".into() })]
    #[case(&["evil.org"], ValidationError::DomainNotPermitted { host: "evil.org".into() })]
    #[case(&["a.example.com", "b.evil.org"], ValidationError::DomainNotPermitted { host: "b.evil.org".into() })]
    fn rejects_hosts(#[case] requested: &[&str], #[case] expected: ValidationError) {
        let permitted = hosts(&["example.com"]);
        let err = validate(&hosts(requested), time::Duration::days(1), &example_policy(&permitted))
            .unwrap_err();
        assert_eq!(err, expected);
    }

    #[rstest]
    #[case("www.example.com")]
    #[case(".example.com")]
    #[case("")]
    #[case("bad host.example.com")]
    #[case("bücher.example.com")]
    fn rejects_unsupported_formats(#[case] alternate: &str) {
        let permitted = hosts(&["example.com"]);
        let err = validate(
            &hosts(&["a.example.com", alternate]),
            time::Duration::days(1),
            &example_policy(&permitted),
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::UnsupportedHostFormat { .. }), "{err:?}");
    }

    #[test]
    fn unconstrained_policy_permits_any_domain() {
        let validated = validate(
            &hosts(&["anything.test"]),
            time::Duration::days(1),
            &example_policy(&[]),
        )
        .unwrap();
        assert_eq!(validated, hosts(&["anything.test"]));
    }

    #[rstest]
    #[case(0)]
    #[case(-5)]
    #[case(366)]
    fn rejects_durations_outside_policy(#[case] days: i64) {
        let err = validate(
            &hosts(&["a.example.com"]),
            time::Duration::days(days),
            &example_policy(&[]),
        )
        .unwrap_err();
        assert_eq!(
            err,
            ValidationError::DurationOutOfRange {
                requested_days: days,
                max_days: 365
            }
        );
    }
}
