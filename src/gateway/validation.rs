//! Pre-dispatch validation
//!
//! Everything here rejects input before it ever touches the pool. Batch-level
//! violations fail the whole submission; per-call problems mark only that
//! call as failed so sibling calls still dispatch.

use std::collections::HashMap;

use crate::engine::RenderOptions;
use crate::error::{RenderError, RenderResult};

use super::pipeline::placeholder_refs;
use super::types::RenderCall;

/// Valid print scale range, mirroring the engine's accepted bounds
const SCALE_RANGE: std::ops::RangeInclusive<f64> = 0.1..=2.0;

/// Size and count limits applied before dispatch
#[derive(Debug, Clone, Copy)]
pub struct BatchLimits {
    pub max_document_bytes: usize,
    pub max_batch_calls: usize,
}

/// A call that passed batch-level validation
///
/// `issue` holds the per-call validation failure, if any; such calls are
/// never dispatched but still produce a keyed error in the batch response.
#[derive(Debug)]
pub struct PreparedCall {
    pub id: String,
    pub index: usize,
    pub document: String,
    pub options: RenderOptions,
    /// Explicit `depends_on` entries plus placeholder references, deduplicated
    pub deps: Vec<String>,
    pub issue: Option<RenderError>,
}

/// Validate a batch and resolve its dependency edges
///
/// # Errors
///
/// Returns a whole-batch [`RenderError::Validation`] for an empty batch, an
/// oversized batch, or duplicate call ids — conditions under which per-call
/// attribution would be ambiguous.
pub fn prepare_batch(
    calls: Vec<RenderCall>,
    limits: &BatchLimits,
) -> RenderResult<Vec<PreparedCall>> {
    if calls.is_empty() {
        return Err(RenderError::Validation("batch contains no calls".to_string()));
    }
    if calls.len() > limits.max_batch_calls {
        return Err(RenderError::Validation(format!(
            "batch has {} calls, limit is {}",
            calls.len(),
            limits.max_batch_calls
        )));
    }

    // Resolve ids first: explicit ids must be unique, absent ids are generated.
    let mut ids = Vec::with_capacity(calls.len());
    let mut position: HashMap<String, usize> = HashMap::new();
    for (index, call) in calls.iter().enumerate() {
        let id = call
            .id
            .clone()
            .unwrap_or_else(|| format!("call-{index}"));
        if position.insert(id.clone(), index).is_some() {
            return Err(RenderError::Validation(format!(
                "duplicate call id '{id}' in batch"
            )));
        }
        ids.push(id);
    }

    let prepared = calls
        .into_iter()
        .enumerate()
        .map(|(index, call)| {
            let id = ids[index].clone();
            let mut deps = call.depends_on.clone();
            deps.extend(placeholder_refs(&call.document));
            deps.sort();
            deps.dedup();

            let issue = validate_call(&call, index, &deps, &position, limits);
            PreparedCall {
                id,
                index,
                document: call.document,
                options: call.options,
                deps,
                issue,
            }
        })
        .collect();
    Ok(prepared)
}

/// Per-call checks; a `Some` result means the call fails without dispatch
fn validate_call(
    call: &RenderCall,
    index: usize,
    deps: &[String],
    position: &HashMap<String, usize>,
    limits: &BatchLimits,
) -> Option<RenderError> {
    if call.document.trim().is_empty() {
        return Some(RenderError::Validation("document is empty".to_string()));
    }
    if call.document.len() > limits.max_document_bytes {
        return Some(RenderError::Validation(format!(
            "document is {} bytes, limit is {}",
            call.document.len(),
            limits.max_document_bytes
        )));
    }
    if !SCALE_RANGE.contains(&call.options.scale) {
        return Some(RenderError::Validation(format!(
            "scale {} outside valid range {:?}",
            call.options.scale, SCALE_RANGE
        )));
    }
    if call.options.margin_in < 0.0 {
        return Some(RenderError::Validation("margin must be non-negative".to_string()));
    }
    if let Some(base) = &call.options.base_url
        && url::Url::parse(base).is_err()
    {
        return Some(RenderError::Validation(format!("invalid base_url '{base}'")));
    }
    for dep in deps {
        match position.get(dep) {
            // Dependencies must point at an earlier call in the batch, so
            // dispatch order is exactly submission order.
            Some(&dep_index) if dep_index < index => {}
            Some(_) => {
                return Some(RenderError::Validation(format!(
                    "call depends on '{dep}', which is not an earlier call"
                )));
            }
            None => {
                return Some(RenderError::Validation(format!(
                    "call depends on unknown call '{dep}'"
                )));
            }
        }
    }
    None
}
