//! Pipelined dispatch
//!
//! A batch decodes into a data-flow graph: every call becomes a shared
//! future, and a dependent call awaits its dependencies' futures before its
//! own dispatch. Independent calls never serialize on each other; ordering
//! exists only along declared edges. Dependencies are declared explicitly
//! (`depends_on`) or implicitly via `{{call:<id>}}` placeholders, which are
//! spliced with the dependency's output as a data URI before dispatch.

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::sync::watch;
use tracing::warn;

use crate::engine::{OUTPUT_MIME, RenderOptions, RenderOutput};
use crate::error::RenderError;
use crate::router::{Router, engine_error};

use super::types::{BatchResponse, CallFailure, CallResult, ErrorBody};
use super::validation::PreparedCall;

/// Resolved-output future of one call, shared with its dependents
pub type SharedCallFuture = Shared<BoxFuture<'static, Result<Arc<RenderOutput>, RenderError>>>;

/// One dispatched call, keyed for result delivery
pub struct CallHandle {
    pub call_id: String,
    pub index: usize,
    pub future: SharedCallFuture,
}

/// Extract `{{call:<id>}}` references from a document
pub(crate) fn placeholder_refs(document: &str) -> Vec<String> {
    let mut refs = Vec::new();
    let mut rest = document;
    while let Some(start) = rest.find("{{call:") {
        let after = &rest[start + "{{call:".len()..];
        match after.find("}}") {
            Some(end) => {
                let name = after[..end].trim();
                if !name.is_empty() {
                    refs.push(name.to_string());
                }
                rest = &after[end + 2..];
            }
            None => break,
        }
    }
    refs
}

/// Replace placeholder references with their dependency's output
fn splice_outputs(document: &str, resolved: &[(String, Arc<RenderOutput>)]) -> String {
    let mut spliced = document.to_string();
    for (id, output) in resolved {
        let token = format!("{{{{call:{id}}}}}");
        if spliced.contains(&token) {
            let uri = format!("data:{OUTPUT_MIME};base64,{}", BASE64.encode(&output.data));
            spliced = spliced.replace(&token, &uri);
        }
    }
    spliced
}

/// Resolves once the connection is cancelled; pends forever otherwise
async fn wait_cancelled(mut cancel: watch::Receiver<bool>) {
    while !*cancel.borrow() {
        if cancel.changed().await.is_err() {
            // Sender went away without cancelling: this call can no longer
            // be cancelled, only completed.
            std::future::pending::<()>().await;
        }
    }
}

/// Acquire, render, release — with at-most-one retry after a crash
///
/// Cancellation applies only until acquisition: a call that already holds
/// an instance always finishes its render and releases normally.
async fn run_call(
    router: Arc<Router>,
    identity: String,
    call_id: String,
    document: String,
    options: RenderOptions,
    cancel: watch::Receiver<bool>,
) -> Result<Arc<RenderOutput>, RenderError> {
    let mut attempt = 0u8;
    loop {
        attempt += 1;
        let mut lease = tokio::select! {
            biased;
            _ = wait_cancelled(cancel.clone()) => return Err(RenderError::ConnectionLost),
            acquired = router.acquire(&identity, &call_id) => acquired?,
        };
        let rendered = lease.render(&document, &options).await;
        lease.finish().await;
        match rendered {
            Ok(output) => return Ok(Arc::new(output)),
            Err(e) if e.is_crash() && attempt == 1 => {
                // One retry against a fresh instance; a second failure is
                // reported rather than masking a systematically bad input.
                warn!(call = %call_id, error = %e, "render crashed, retrying once");
                continue;
            }
            Err(e) => return Err(engine_error(e)),
        }
    }
}

/// Build the dispatch graph for a prepared batch
///
/// Calls with a validation issue resolve immediately to their error, so
/// dependents observe a dependency failure without any dispatch happening.
pub fn build_dispatch(
    router: &Arc<Router>,
    identity: &str,
    prepared: Vec<PreparedCall>,
    cancel: &watch::Receiver<bool>,
) -> Vec<CallHandle> {
    let mut by_id: HashMap<String, SharedCallFuture> = HashMap::new();
    let mut handles = Vec::with_capacity(prepared.len());

    for call in prepared {
        let future: SharedCallFuture = match call.issue {
            Some(error) => async move { Err(error) }.boxed().shared(),
            None => {
                // Validation guarantees dependencies reference earlier calls,
                // so their futures already exist here.
                let deps: Vec<(String, SharedCallFuture)> = call
                    .deps
                    .iter()
                    .filter_map(|dep| by_id.get(dep).map(|f| (dep.clone(), f.clone())))
                    .collect();
                let router = Arc::clone(router);
                let identity = identity.to_string();
                let call_id = call.id.clone();
                let document = call.document;
                let options = call.options;
                let cancel = cancel.clone();
                async move {
                    let mut resolved = Vec::with_capacity(deps.len());
                    for (dep_id, dep_future) in deps {
                        match dep_future.await {
                            Ok(output) => resolved.push((dep_id, output)),
                            Err(_) => {
                                return Err(RenderError::DependencyFailed {
                                    dependency: dep_id,
                                });
                            }
                        }
                    }
                    let document = splice_outputs(&document, &resolved);
                    run_call(router, identity, call_id, document, options, cancel).await
                }
                .boxed()
                .shared()
            }
        };
        by_id.insert(call.id.clone(), future.clone());
        handles.push(CallHandle {
            call_id: call.id,
            index: call.index,
            future,
        });
    }
    handles
}

/// Await every call and partition the batch into successes and failures
pub async fn collect_batch(handles: Vec<CallHandle>) -> BatchResponse {
    let outcomes =
        futures::future::join_all(handles.iter().map(|handle| handle.future.clone())).await;
    let mut response = BatchResponse::default();
    for (handle, outcome) in handles.into_iter().zip(outcomes) {
        match outcome {
            Ok(output) => response.results.push(CallResult {
                call_id: handle.call_id,
                index: handle.index,
                data: BASE64.encode(&output.data),
                timing_ms: output.timing_ms,
            }),
            Err(error) => response.errors.push(CallFailure {
                call_id: handle.call_id,
                index: handle.index,
                error: ErrorBody::from(&error),
            }),
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_refs_finds_all_references() {
        let document = r#"<embed src="{{call:cover}}"><embed src="{{call:toc}}">"#;
        assert_eq!(
            placeholder_refs(document),
            vec!["cover".to_string(), "toc".to_string()]
        );
    }

    #[test]
    fn placeholder_refs_ignores_unterminated_tokens() {
        assert!(placeholder_refs("<p>{{call:open").is_empty());
        assert!(placeholder_refs("<p>plain</p>").is_empty());
    }

    #[test]
    fn splice_substitutes_data_uri() {
        let output = Arc::new(RenderOutput {
            data: b"pdf-bytes".to_vec(),
            timing_ms: 7,
        });
        let spliced = splice_outputs(
            r#"<embed src="{{call:cover}}">"#,
            &[("cover".to_string(), output)],
        );
        assert!(spliced.starts_with(r#"<embed src="data:application/pdf;base64,"#));
        assert!(!spliced.contains("{{call:"));
    }

    #[test]
    fn splice_without_deps_is_identity() {
        let document = "<p>standalone</p>";
        assert_eq!(splice_outputs(document, &[]), document);
    }
}
