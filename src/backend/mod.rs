//! Backend dispatcher (`spec.md` §4.5): decides, per request, whether to
//! serve from a local filesystem repository via the `git` executable or
//! forward to an upstream HTTP origin, and presents both as one contract.

pub mod local;
pub mod remote;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use axum::http::StatusCode;
use path_clean::PathClean;

use crate::classify::is_valid_repo_path;
use crate::context::{Context, ResponseBody};
use crate::error::GatewayError;
use crate::service::Service;

/// Where repository content ultimately lives.
#[derive(Debug, Clone)]
pub enum Origin {
    Local(PathBuf),
    Remote(String),
}

/// Per-service enablement fallback used when `git config` has no opinion
/// (`spec.md` §4.5 `checkIfEnabled`, local path, key absent).
#[derive(Debug, Clone, Copy)]
pub struct EnabledDefaults {
    pub upload_pack: bool,
    pub receive_pack: bool,
}

impl Default for EnabledDefaults {
    /// Matches `git-daemon`'s own defaults: uploads are allowed unless
    /// explicitly disabled, pushes are denied unless explicitly enabled.
    fn default() -> Self {
        Self {
            upload_pack: true,
            receive_pack: false,
        }
    }
}

impl EnabledDefaults {
    #[must_use]
    pub fn for_service(self, service: Service) -> bool {
        match service {
            Service::UploadPack => self.upload_pack,
            Service::ReceivePack => self.receive_pack,
        }
    }
}

/// Producer of the URL suffix appended to a remote origin
/// (`spec.md` §4.5 `remoteTail`). Boxed so embedders can override the
/// default shape.
pub type RemoteTail = Arc<dyn Fn(Service, bool) -> String + Send + Sync>;

#[must_use]
pub fn default_remote_tail() -> RemoteTail {
    Arc::new(|service, advertise| {
        if advertise {
            format!("/info/refs?service=git-{service}")
        } else {
            format!("/git-{service}")
        }
    })
}

#[derive(Clone)]
pub struct BackendOptions {
    pub origin: Option<Origin>,
    pub https_only: bool,
    pub enabled_defaults: EnabledDefaults,
    pub remote_tail: RemoteTail,
    pub allow_empty_path: bool,
}

impl fmt::Debug for BackendOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendOptions")
            .field("origin", &self.origin)
            .field("https_only", &self.https_only)
            .field("enabled_defaults", &self.enabled_defaults)
            .field("allow_empty_path", &self.allow_empty_path)
            .finish_non_exhaustive()
    }
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            origin: None,
            https_only: true,
            enabled_defaults: EnabledDefaults::default(),
            remote_tail: default_remote_tail(),
            allow_empty_path: false,
        }
    }
}

/// The outcome of `spec.md` §4.5's "Path preparation" step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedPath {
    Local(PathBuf),
    Remote(String),
    Invalid,
}

fn has_http_prefix(p: &str, https_only: bool) -> bool {
    p.starts_with("https://") || (!https_only && p.starts_with("http://"))
}

fn normalise(p: &str) -> String {
    PathBuf::from("/").join(p).clean().to_string_lossy().trim_start_matches('/').to_owned()
}

/// `spec.md` §4.5 "Path preparation", applied to the `path` a [`Context`]
/// carries (already validated against [`is_valid_repo_path`] here, since
/// that predicate is the backend's responsibility, not the classifier's).
#[must_use]
pub fn resolve_path(path: Option<&str>, opts: &BackendOptions) -> ResolvedPath {
    let path = path.unwrap_or("");

    if path.is_empty() && !opts.allow_empty_path {
        return ResolvedPath::Invalid;
    }

    if !path.is_empty() && !is_valid_repo_path(path) {
        return ResolvedPath::Invalid;
    }

    if has_http_prefix(path, opts.https_only) {
        return ResolvedPath::Remote(path.to_owned());
    }

    match &opts.origin {
        Some(Origin::Remote(base)) => {
            ResolvedPath::Remote(format!("{}/{}", base.trim_end_matches('/'), normalise(path)))
        }
        Some(Origin::Local(base)) => ResolvedPath::Local(base.join(normalise(path))),
        None if path.starts_with('/') => ResolvedPath::Local(PathBuf::from(path)),
        None => ResolvedPath::Invalid,
    }
}

/// The combined filesystem + HTTP backend (`spec.md` §4.5).
pub struct Backend {
    options: BackendOptions,
}

impl Backend {
    #[must_use]
    pub fn new(options: BackendOptions) -> Self {
        Self { options }
    }

    fn resolved(&self, ctx: &Context) -> ResolvedPath {
        resolve_path(ctx.path(), &self.options)
    }

    /// `spec.md` §4.5 `checkIfExists`.
    pub async fn check_if_exists(&self, ctx: &Context) -> bool {
        match self.resolved(ctx) {
            ResolvedPath::Local(path) => local::check_if_exists(&path).await,
            ResolvedPath::Remote(base) => {
                let url = format!("{base}{}", (self.options.remote_tail)(Service::UploadPack, true));
                remote::check_status_ok(&url).await
            }
            ResolvedPath::Invalid => false,
        }
    }

    /// `spec.md` §4.5 `checkIfEnabled`.
    pub async fn check_if_enabled(&self, ctx: &Context, service: Service) -> bool {
        match self.resolved(ctx) {
            ResolvedPath::Local(path) => {
                local::check_if_enabled(&path, service, self.options.enabled_defaults).await
            }
            ResolvedPath::Remote(base) => {
                let url = format!("{base}{}", (self.options.remote_tail)(service, true));
                remote::check_status_ok(&url).await
            }
            ResolvedPath::Invalid => false,
        }
    }

    /// `spec.md` §4.5 `serve`.
    pub async fn serve(&self, ctx: &Context) -> Result<(), GatewayError> {
        let Some(service) = ctx.service() else {
            ctx.set_response_status(StatusCode::BAD_REQUEST);
            ctx.set_response_body(ResponseBody::Bytes("Bad Request".into()));
            return Ok(());
        };

        match self.resolved(ctx) {
            ResolvedPath::Invalid => {
                ctx.set_response_status(StatusCode::BAD_REQUEST);
                ctx.set_response_body(ResponseBody::Bytes("Bad Request".into()));
                Ok(())
            }
            ResolvedPath::Remote(base) => {
                let tail = (self.options.remote_tail)(service, ctx.advertisement());
                remote::serve(&format!("{base}{tail}"), ctx).await
            }
            ResolvedPath::Local(path) => {
                if !local::check_if_exists(&path).await {
                    ctx.set_response_status(StatusCode::NOT_FOUND);
                    ctx.set_response_body(ResponseBody::Bytes("Not Found".into()));
                    return Ok(());
                }
                local::serve(&path, service, ctx.advertisement(), ctx).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(origin: Option<Origin>) -> BackendOptions {
        BackendOptions {
            origin,
            ..BackendOptions::default()
        }
    }

    #[test]
    fn absolute_local_path_with_no_origin_resolves_local() {
        let resolved = resolve_path(Some("/srv/git/foo.git"), &opts(None));
        assert_eq!(resolved, ResolvedPath::Local(PathBuf::from("/srv/git/foo.git")));
    }

    #[test]
    fn relative_path_with_no_origin_is_invalid() {
        let resolved = resolve_path(Some("foo.git"), &opts(None));
        assert_eq!(resolved, ResolvedPath::Invalid);
    }

    #[test]
    fn relative_path_joins_local_origin() {
        let resolved = resolve_path(
            Some("foo.git"),
            &opts(Some(Origin::Local(PathBuf::from("/srv/git")))),
        );
        assert_eq!(resolved, ResolvedPath::Local(PathBuf::from("/srv/git/foo.git")));
    }

    #[test]
    fn relative_path_joins_remote_origin() {
        let resolved = resolve_path(
            Some("foo.git"),
            &opts(Some(Origin::Remote("https://example.com/git".to_owned()))),
        );
        assert_eq!(resolved, ResolvedPath::Remote("https://example.com/git/foo.git".to_owned()));
    }

    #[test]
    fn path_carrying_its_own_https_prefix_is_remote_regardless_of_origin() {
        let resolved = resolve_path(
            Some("https://upstream.example/foo.git"),
            &opts(Some(Origin::Local(PathBuf::from("/srv/git")))),
        );
        assert_eq!(
            resolved,
            ResolvedPath::Remote("https://upstream.example/foo.git".to_owned())
        );
    }

    #[test]
    fn traversal_path_is_invalid() {
        let resolved = resolve_path(
            Some("../escape"),
            &opts(Some(Origin::Local(PathBuf::from("/srv/git")))),
        );
        assert_eq!(resolved, ResolvedPath::Invalid);
    }

    #[test]
    fn empty_path_with_origin_and_allow_empty_resolves_to_origin() {
        let mut options = opts(Some(Origin::Local(PathBuf::from("/srv/git/only.git"))));
        options.allow_empty_path = true;
        let resolved = resolve_path(Some(""), &options);
        assert_eq!(resolved, ResolvedPath::Local(PathBuf::from("/srv/git/only.git")));
    }

    #[test]
    fn empty_path_without_allow_empty_is_invalid() {
        let options = opts(Some(Origin::Local(PathBuf::from("/srv/git/only.git"))));
        let resolved = resolve_path(Some(""), &options);
        assert_eq!(resolved, ResolvedPath::Invalid);
    }
}
