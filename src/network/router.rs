//! Request Router
//!
//! Maps method, path and content type to a store action and turns the
//! outcome into a status code. Errors never reach the client as bodies;
//! the status code plus a log line is all that is produced.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    ACCESS_CONTROL_MAX_AGE, CONTENT_TYPE,
};
use http::{Method, StatusCode};
use tracing::{debug, error, info, warn};

use crate::network::http::{Request, Response, JSON_CONTENT_TYPE};
use crate::splits::{
    decode, encode, read_best, read_document, write_run, ReconcileOutcome, Reconciler, StoreError,
};

/// Routes decoded requests against a serving root.
#[derive(Debug)]
pub struct Router {
    /// Directory that request paths are resolved under.
    root: PathBuf,
    /// `root` with symlinks resolved; every served path must lie below it.
    canonical_root: PathBuf,
    /// Best-document reconciler shared by all connections.
    reconciler: Arc<Reconciler>,
}

impl Router {
    /// Create a router serving `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let canonical_root = std::fs::canonicalize(&root).unwrap_or_else(|_| root.clone());
        Self {
            root,
            canonical_root,
            reconciler: Arc::new(Reconciler::new()),
        }
    }

    /// Serving root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Clean a request target and place it under the serving root.
    ///
    /// Query and fragment are dropped, `.` segments and repeated slashes are
    /// removed and `..` pops a segment. Returns `None` when the target would
    /// climb above the root.
    pub fn resolve(&self, target: &str) -> Option<PathBuf> {
        let path = target.split(['?', '#']).next().unwrap_or("");

        let mut segments: Vec<&str> = Vec::new();
        for segment in path.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    segments.pop()?;
                }
                s => segments.push(s),
            }
        }

        let mut resolved = self.root.clone();
        resolved.extend(segments);
        Some(resolved)
    }

    /// Resolve a request target to the file or directory it names.
    ///
    /// Symlinks are followed, so a category reached through an alias maps to
    /// the same path (and the same best-document lock) as the real one.
    /// Returns `None` when the target does not exist or ends up outside the
    /// serving root.
    pub async fn locate(&self, target: &str) -> Option<PathBuf> {
        let path = self.resolve(target)?;
        let canonical = tokio::fs::canonicalize(&path).await.ok()?;
        canonical.starts_with(&self.canonical_root).then_some(canonical)
    }

    /// Handle one request.
    pub async fn handle(&self, request: &Request) -> Response {
        let Some(path) = self.locate(&request.target).await else {
            warn!(
                "Requested data '{}' does not exist under the serving root",
                request.target
            );
            return Response::new(StatusCode::NOT_FOUND);
        };

        let metadata = match tokio::fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) => {
                warn!("Requested data '{}' does not exist on the server: {}", request.target, e);
                return Response::new(StatusCode::NOT_FOUND);
            }
        };

        let is_json = request.is_json();
        match request.method {
            Method::POST if is_json => {
                if !metadata.is_dir() {
                    warn!("Cannot POST to '{}': not a category", request.target);
                    return Response::new(StatusCode::NOT_FOUND);
                }
                self.submit_run(&path, &request.body).await
            }
            Method::POST => {
                warn!("Cannot POST non-JSON data to '{}'", request.target);
                Response::new(StatusCode::METHOD_NOT_ALLOWED)
            }
            Method::GET if is_json => {
                if !metadata.is_dir() {
                    warn!("Cannot GET best of '{}': not a category", request.target);
                    return Response::new(StatusCode::NOT_FOUND);
                }
                fetch_best(&path).await
            }
            Method::GET => {
                if !metadata.is_file() {
                    warn!("Cannot GET '{}': not a document", request.target);
                    return Response::new(StatusCode::NOT_FOUND);
                }
                fetch_raw(&path).await
            }
            Method::OPTIONS => with_cors(Response::new(StatusCode::OK)),
            ref other => {
                warn!("Invalid request method '{}'", other);
                Response::new(StatusCode::METHOD_NOT_ALLOWED)
            }
        }
    }

    /// Persist a run, then reconcile it against the category's best.
    async fn submit_run(&self, category: &Path, body: &[u8]) -> Response {
        let split = match decode(body) {
            Ok(s) => s,
            Err(e) => {
                error!("Failed to load submitted split for '{}': {}", category.display(), e);
                return Response::new(StatusCode::INTERNAL_SERVER_ERROR);
            }
        };

        let run_id = match write_run(category, &split).await {
            Ok(id) => id,
            Err(e) => {
                error!("Failed to store run: {}", e);
                return Response::new(StatusCode::INTERNAL_SERVER_ERROR);
            }
        };
        debug!("Stored run {} in {}", run_id, category.display());

        let status = match self.reconciler.reconcile(category, &split).await {
            Ok(ReconcileOutcome::Promoted) => {
                info!("Run {} is the new best for {}", run_id, category.display());
                StatusCode::ACCEPTED
            }
            Ok(ReconcileOutcome::Retained) => StatusCode::ACCEPTED,
            Ok(ReconcileOutcome::ShapeMismatch { expected, actual }) => {
                warn!(
                    "Run {} has {} splits but best for {} has {}; best not updated",
                    run_id,
                    actual,
                    category.display(),
                    expected
                );
                StatusCode::MULTI_STATUS
            }
            Err(e) => {
                error!("Run {} saved but best not updated: {}", run_id, e);
                StatusCode::MULTI_STATUS
            }
        };

        with_cors(Response::new(status))
    }
}

/// Return a category's best document as JSON.
async fn fetch_best(category: &Path) -> Response {
    let best = match read_best(category).await {
        Ok(best) => best,
        Err(StoreError::NotFound(path)) => {
            warn!("Failed to locate data '{}'", path.display());
            return Response::new(StatusCode::NOT_FOUND);
        }
        Err(e) => {
            error!("Failed to load best: {}", e);
            return Response::new(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    match encode(&best) {
        Ok(body) => with_cors(
            Response::new(StatusCode::OK)
                .with_header(CONTENT_TYPE, JSON_CONTENT_TYPE)
                .with_body(body),
        ),
        Err(e) => {
            error!("Failed to encode best for {}: {}", category.display(), e);
            Response::new(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Return a stored document verbatim.
async fn fetch_raw(path: &Path) -> Response {
    match read_document(path).await {
        Ok(bytes) => with_cors(Response::new(StatusCode::OK).with_body(bytes)),
        Err(e) => {
            warn!("Failed to read '{}': {}", path.display(), e);
            Response::new(StatusCode::NOT_FOUND)
        }
    }
}

/// Attach the cross-origin headers carried by every successful response.
pub fn with_cors(response: Response) -> Response {
    response
        .with_header(ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .with_header(ACCESS_CONTROL_ALLOW_METHODS, "POST, GET")
        .with_header(
            ACCESS_CONTROL_ALLOW_HEADERS,
            "Content-Type, Access-Control-Allow-Origin",
        )
        .with_header(ACCESS_CONTROL_MAX_AGE, "86400")
}
