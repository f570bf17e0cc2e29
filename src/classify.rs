//! URL/service classifier (`spec.md` §4.2).
//!
//! Derives `(advertisement, project_path, service)` from a request's
//! method, URL, and content type by matching one of two URL shapes. Never
//! raises — any failure to match degrades to a `(false, ..)` result, per
//! the spec's "the classifier must not raise" requirement.

use std::sync::OnceLock;

use axum::http::{Method, Uri};
use regex::Regex;

use crate::service::Service;

fn advertisement_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^/(?:(?P<path>.+)/)?info/refs$").expect("valid advertisement shape regex")
    })
}

fn direct_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^/(?:(?P<path>.+)/)?git-(?P<name>[a-z-]{1,20})$")
            .expect("valid direct shape regex")
    })
}

fn service_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z-]{1,20}$").expect("valid service name regex"))
}

/// The outcome of classification: whether the request is an advertisement,
/// which repository path (if any) it names, and which service (if any) it
/// names.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Classification {
    pub advertisement: bool,
    pub path: Option<String>,
    pub service: Option<Service>,
}

/// Extracts the `service=git-<name>` query parameter's `<name>`, if
/// present, without pulling in a full query-string parsing dependency —
/// the grammar is narrow enough for a direct scan.
fn query_service_name(query: &str) -> Option<&str> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        if key != "service" {
            return None;
        }
        value.strip_prefix("git-")
    })
}

#[must_use]
pub fn classify(uri: &Uri, method: &Method, content_type: Option<&str>) -> Classification {
    let path = uri.path();

    if let Some(caps) = advertisement_re().captures(path) {
        let project_path = caps.name("path").map(|m| m.as_str().to_owned());
        let service = uri
            .query()
            .and_then(query_service_name)
            .filter(|name| service_name_re().is_match(name))
            .and_then(Service::from_wire_name);

        let valid_method = matches!(*method, Method::GET | Method::HEAD);

        return match service {
            Some(service) if valid_method => Classification {
                advertisement: true,
                path: project_path,
                service: Some(service),
            },
            _ => Classification {
                advertisement: false,
                path: project_path,
                service: None,
            },
        };
    }

    if let Some(caps) = direct_re().captures(path) {
        let project_path = caps.name("path").map(|m| m.as_str().to_owned());
        let name = &caps["name"];
        let service = Service::from_wire_name(name);

        let expected_content_type = service.map(|s| format!("application/x-git-{s}-request"));
        let valid =
            *method == Method::POST && content_type.is_some() && expected_content_type.is_some();
        let valid = valid && content_type == expected_content_type.as_deref();

        return match service {
            Some(service) if valid => Classification {
                advertisement: false,
                path: project_path,
                service: Some(service),
            },
            _ => Classification {
                advertisement: false,
                path: project_path,
                service: None,
            },
        };
    }

    Classification::default()
}

/// Path-validity predicate applied by the backend (`spec.md` §4.2):
/// rejects any string containing `//`, `/./`, `/../`, or their backslash
/// equivalents.
#[must_use]
pub fn is_valid_repo_path(path: &str) -> bool {
    const FORBIDDEN: &[&str] = &["//", "/./", "/../", r"\\", r"\.\", r"\..\"];
    !FORBIDDEN.iter().any(|needle| path.contains(needle))
}
