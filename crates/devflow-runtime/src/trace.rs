//! Request trace context carried onto external resources as annotations.
//!
//! Purely observational: nothing in the reconcilers reads these values back.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

const TRACE_ID_HEX_LEN: usize = 32;
const SPAN_ID_HEX_LEN: usize = 16;

/// W3C-style trace/span identifiers of the request that triggered an
/// orchestration call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
}

impl TraceContext {
    /// Starts a fresh trace with random ids.
    pub fn generate() -> Self {
        let trace = Uuid::new_v4();
        Self {
            trace_id: hex::encode(trace.as_bytes()),
            span_id: random_span_id(),
        }
    }

    /// Parses a `traceparent` header (`00-<trace-id>-<span-id>-<flags>`).
    ///
    /// Returns `None` for malformed headers and for the all-zero ids the W3C
    /// format reserves as invalid.
    pub fn from_traceparent(header: &str) -> Option<Self> {
        let mut parts = header.trim().split('-');
        let _version = parts.next()?;
        let trace_id = parts.next()?;
        let span_id = parts.next()?;
        let _flags = parts.next()?;
        if parts.next().is_some() {
            return None;
        }
        if !is_lower_hex(trace_id, TRACE_ID_HEX_LEN) || !is_lower_hex(span_id, SPAN_ID_HEX_LEN) {
            return None;
        }
        if trace_id.bytes().all(|b| b == b'0') || span_id.bytes().all(|b| b == b'0') {
            return None;
        }
        Some(Self {
            trace_id: trace_id.to_string(),
            span_id: span_id.to_string(),
        })
    }

    /// New span within the same trace.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: random_span_id(),
        }
    }

    pub fn to_traceparent(&self) -> String {
        format!("00-{}-{}-01", self.trace_id, self.span_id)
    }
}

fn random_span_id() -> String {
    let bytes = Uuid::new_v4();
    hex::encode(&bytes.as_bytes()[..SPAN_ID_HEX_LEN / 2])
}

fn is_lower_hex(value: &str, len: usize) -> bool {
    value.len() == len
        && value
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_traceparent() {
        let ctx =
            TraceContext::from_traceparent("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01")
                .expect("valid header");
        assert_eq!(ctx.trace_id, "4bf92f3577b34da6a3ce929d0e0e4736");
        assert_eq!(ctx.span_id, "00f067aa0ba902b7");
        assert_eq!(
            ctx.to_traceparent(),
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01"
        );
    }

    #[test]
    fn rejects_malformed_traceparent() {
        assert!(TraceContext::from_traceparent("garbage").is_none());
        assert!(TraceContext::from_traceparent(
            "00-00000000000000000000000000000000-00f067aa0ba902b7-01"
        )
        .is_none());
        assert!(TraceContext::from_traceparent("00-4bf92f35-00f067aa0ba902b7-01").is_none());
        assert!(TraceContext::from_traceparent(
            "00-4BF92F3577B34DA6A3CE929D0E0E4736-00f067aa0ba902b7-01"
        )
        .is_none());
    }

    #[test]
    fn generated_ids_have_w3c_lengths() {
        let ctx = TraceContext::generate();
        assert_eq!(ctx.trace_id.len(), 32);
        assert_eq!(ctx.span_id.len(), 16);
        let child = ctx.child();
        assert_eq!(child.trace_id, ctx.trace_id);
        assert_eq!(child.span_id.len(), 16);
    }
}
