//! Decides which declared message an inbound payload is.
//!
//! Each candidate is checked in declaration order: payload schema, headers
//! schema, and correlation id, each only when declared. Exactly one candidate
//! must pass; zero is [`MatchError::NoMatch`], more than one is
//! [`MatchError::AmbiguousMatch`]. The matcher holds no mutable state, so
//! repeated calls with the same input give the same outcome.

use std::sync::Arc;

use bindwire_core::{
    ExpressionCache, ExpressionSource, Headers, MessageDefinition, SchemaError, SchemaRef,
    SchemaRegistry, ValidationResult, Value,
};
use tracing::{debug, trace, warn};

use crate::binding::HandlerServices;
use crate::context::OperationContext;
use crate::error::{ClientError, MatchError};

/// Which checks apply for one matching run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchOptions {
    /// Require declared correlation ids to be present. Off for outbound
    /// selection, where the id is injected after the message is chosen.
    pub check_correlation: bool,
    /// The transport delivered headers. When `false`, headers schemas and
    /// header-sourced correlation ids are treated as undeclared.
    pub headers_available: bool,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            check_correlation: true,
            headers_available: true,
        }
    }
}

/// The single candidate that matched.
#[derive(Debug, Clone)]
pub struct MatchOutcome {
    pub message: Arc<MessageDefinition>,
    /// Correlation id computed while checking the candidate.
    pub correlation_id: Option<String>,
}

/// Stateless matcher over shared schema and expression services.
#[derive(Debug, Clone)]
pub struct MessageMatcher {
    schemas: Arc<SchemaRegistry>,
    expressions: Arc<ExpressionCache>,
}

impl MessageMatcher {
    #[must_use]
    pub fn new(schemas: Arc<SchemaRegistry>, expressions: Arc<ExpressionCache>) -> Self {
        Self {
            schemas,
            expressions,
        }
    }

    #[must_use]
    pub fn from_services(services: &HandlerServices) -> Self {
        Self::new(
            Arc::clone(&services.schemas),
            Arc::clone(&services.expressions),
        )
    }

    /// Finds the one candidate `payload` and `headers` satisfy.
    ///
    /// # Errors
    ///
    /// Returns [`MatchError::NoMatch`] or [`MatchError::AmbiguousMatch`].
    pub fn match_message(
        &self,
        payload: &Value,
        headers: &Headers,
        candidates: &[Arc<MessageDefinition>],
        options: MatchOptions,
    ) -> Result<MatchOutcome, MatchError> {
        let mut matched: Vec<MatchOutcome> = candidates
            .iter()
            .filter_map(|candidate| {
                self.check(candidate, payload, headers, options)
                    .map(|correlation_id| MatchOutcome {
                        message: Arc::clone(candidate),
                        correlation_id,
                    })
            })
            .collect();

        match matched.len() {
            0 => Err(MatchError::NoMatch),
            1 => Ok(matched.remove(0)),
            _ => Err(MatchError::AmbiguousMatch {
                candidates: matched
                    .iter()
                    .map(|outcome| outcome.message.name.clone())
                    .collect(),
            }),
        }
    }

    /// `Some(correlation id)` when every declared check passes.
    fn check(
        &self,
        candidate: &MessageDefinition,
        payload: &Value,
        headers: &Headers,
        options: MatchOptions,
    ) -> Option<Option<String>> {
        if let Some(schema) = candidate.payload_schema() {
            if !self.validates(&candidate.name, payload, schema) {
                return None;
            }
        }

        if options.headers_available {
            if let Some(schema) = candidate.headers_schema() {
                let headers_value = Value::Object(headers.clone());
                if !self.validates(&candidate.name, &headers_value, schema) {
                    return None;
                }
            }
        }

        let Some(descriptor) = &candidate.correlation_id else {
            return Some(None);
        };
        let expression = match self.expressions.get_or_parse(&descriptor.location) {
            Ok(expression) => expression,
            Err(err) => {
                warn!(message_name = %candidate.name, error = %err, "skipping candidate with malformed correlation id");
                return None;
            }
        };
        if expression.source() == ExpressionSource::Header && !options.headers_available {
            return Some(None);
        }

        let value = expression
            .evaluate(payload, headers)
            .filter(|value| !value.is_empty());
        if options.check_correlation && value.is_none() {
            trace!(message_name = %candidate.name, location = %descriptor.location, "correlation id absent");
            return None;
        }
        Some(value)
    }

    /// A schema in a format nothing can validate counts as undeclared.
    fn validates(&self, message: &str, value: &Value, schema: SchemaRef<'_>) -> bool {
        match self.schemas.validate_ref(value, schema) {
            Ok(ValidationResult::Valid) => true,
            Ok(ValidationResult::Invalid { errors }) => {
                trace!(message_name = message, ?errors, "candidate rejected");
                false
            }
            Err(SchemaError::UnsupportedFormat { format }) => {
                debug!(message_name = message, %format, "skipping check in unsupported schema format");
                true
            }
        }
    }
}

/// Picks the declared message an outbound payload is sent as.
///
/// An explicitly named message wins; a single candidate is used as-is;
/// several candidates go through the matcher with correlation checks off.
/// An operation without declared messages publishes an unconstrained
/// message named after the operation.
///
/// # Errors
///
/// Returns [`ClientError::Document`] for an unknown explicit name and
/// [`ClientError::Match`] when the payload does not single out a candidate.
pub fn select_outbound(
    ctx: &OperationContext,
    payload: &Value,
    matcher: &MessageMatcher,
) -> Result<Arc<MessageDefinition>, ClientError> {
    let candidates = ctx.messages();

    if let Some(name) = ctx.message_name() {
        return candidates
            .iter()
            .find(|m| m.name == name)
            .cloned()
            .ok_or_else(|| {
                ClientError::Document(bindwire_core::DocumentError::MessageNotFound {
                    operation_id: ctx.operation_id().to_string(),
                    message: name.to_string(),
                })
            });
    }

    match candidates {
        [] => Ok(Arc::new(MessageDefinition {
            name: ctx.operation_id().to_string(),
            ..MessageDefinition::default()
        })),
        [only] => Ok(Arc::clone(only)),
        _ => {
            let options = MatchOptions {
                check_correlation: false,
                headers_available: true,
            };
            let outcome = matcher.match_message(payload, ctx.headers(), candidates, options)?;
            Ok(outcome.message)
        }
    }
}

#[cfg(test)]
mod tests {
    use bindwire_core::{headers_from, CorrelationIdDefinition};
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    fn matcher() -> MessageMatcher {
        MessageMatcher::from_services(&HandlerServices::default())
    }

    fn kind_message(name: &str, kind: &str) -> Arc<MessageDefinition> {
        Arc::new(MessageDefinition {
            name: name.into(),
            payload: Some(json!({
                "type": "object",
                "properties": {"kind": {"const": kind}},
                "required": ["kind"]
            })),
            ..MessageDefinition::default()
        })
    }

    fn with_correlation(mut message: MessageDefinition, location: &str) -> Arc<MessageDefinition> {
        message.correlation_id = Some(CorrelationIdDefinition {
            description: None,
            location: location.into(),
        });
        Arc::new(message)
    }

    #[test]
    fn selects_the_single_satisfied_schema() {
        let candidates = vec![kind_message("Created", "created"), kind_message("Deleted", "deleted")];
        let outcome = matcher()
            .match_message(&json!({"kind": "deleted"}), &Headers::new(), &candidates, MatchOptions::default())
            .unwrap();
        assert_eq!(outcome.message.name, "Deleted");
        assert!(outcome.correlation_id.is_none());
    }

    #[test]
    fn no_candidate_is_no_match() {
        let candidates = vec![kind_message("Created", "created")];
        let err = matcher()
            .match_message(&json!({"kind": "other"}), &Headers::new(), &candidates, MatchOptions::default())
            .unwrap_err();
        assert_eq!(err, MatchError::NoMatch);
    }

    #[test]
    fn two_permissive_schemas_are_ambiguous() {
        let open = |name: &str| {
            Arc::new(MessageDefinition {
                name: name.into(),
                payload: Some(json!({"type": "object"})),
                ..MessageDefinition::default()
            })
        };
        let candidates = vec![open("A"), open("B")];
        let err = matcher()
            .match_message(&json!({"x": 1}), &Headers::new(), &candidates, MatchOptions::default())
            .unwrap_err();
        assert_eq!(
            err,
            MatchError::AmbiguousMatch {
                candidates: vec!["A".into(), "B".into()]
            }
        );
    }

    #[test]
    fn correlation_id_disambiguates() {
        let plain = MessageDefinition {
            name: "Reply".into(),
            payload: Some(json!({"type": "object"})),
            ..MessageDefinition::default()
        };
        let candidates = vec![
            with_correlation(plain.clone(), "$message.header#/correlationId"),
            with_correlation(
                MessageDefinition {
                    name: "Event".into(),
                    ..plain
                },
                "$message.payload#/eventId",
            ),
        ];
        let headers = headers_from([("correlationId", "c-1")]);
        let outcome = matcher()
            .match_message(&json!({"x": 1}), &headers, &candidates, MatchOptions::default())
            .unwrap();
        assert_eq!(outcome.message.name, "Reply");
        assert_eq!(outcome.correlation_id.as_deref(), Some("c-1"));
    }

    #[test]
    fn empty_correlation_value_does_not_match() {
        let candidates = vec![with_correlation(MessageDefinition::default(), "$message.header#/cid")];
        let headers = headers_from([("cid", "")]);
        assert!(matcher()
            .match_message(&json!({}), &headers, &candidates, MatchOptions::default())
            .is_err());
    }

    #[test]
    fn headers_schema_is_checked_when_headers_exist() {
        let candidates = vec![Arc::new(MessageDefinition {
            name: "Typed".into(),
            headers: Some(json!({"type": "object", "required": ["type"]})),
            ..MessageDefinition::default()
        })];
        let m = matcher();
        assert!(m
            .match_message(&json!({}), &Headers::new(), &candidates, MatchOptions::default())
            .is_err());

        let headerless = MatchOptions {
            headers_available: false,
            ..MatchOptions::default()
        };
        assert!(m.match_message(&json!({}), &Headers::new(), &candidates, headerless).is_ok());
    }

    #[test]
    fn unsupported_schema_format_counts_as_undeclared() {
        let avro = Arc::new(MessageDefinition {
            name: "Ticked".into(),
            schema_format: Some("application/vnd.apache.avro;version=1.9.0".into()),
            payload: Some(json!({"type": "record", "name": "Tick", "fields": []})),
            ..MessageDefinition::default()
        });
        let outcome = matcher()
            .match_message(&json!({"price": 3}), &Headers::new(), &[Arc::clone(&avro)], MatchOptions::default())
            .unwrap();
        assert_eq!(outcome.message.name, "Ticked");

        // Still competes with the other candidates.
        let candidates = vec![avro, kind_message("Created", "created")];
        let err = matcher()
            .match_message(&json!({"kind": "created"}), &Headers::new(), &candidates, MatchOptions::default())
            .unwrap_err();
        assert_eq!(
            err,
            MatchError::AmbiguousMatch {
                candidates: vec!["Ticked".into(), "Created".into()]
            }
        );
    }

    #[test]
    fn header_correlation_is_undeclared_without_headers() {
        let candidates = vec![with_correlation(
            MessageDefinition {
                name: "Cached".into(),
                ..MessageDefinition::default()
            },
            "$message.header#/correlationId",
        )];
        let headerless = MatchOptions {
            headers_available: false,
            ..MatchOptions::default()
        };
        let outcome = matcher()
            .match_message(&json!({}), &Headers::new(), &candidates, headerless)
            .unwrap();
        assert!(outcome.correlation_id.is_none());
    }

    #[test]
    fn payload_correlation_still_required_without_headers() {
        let candidates = vec![with_correlation(MessageDefinition::default(), "$message.payload#/id")];
        let headerless = MatchOptions {
            headers_available: false,
            ..MatchOptions::default()
        };
        let m = matcher();
        assert!(m.match_message(&json!({}), &Headers::new(), &candidates, headerless).is_err());
        let outcome = m
            .match_message(&json!({"id": 5}), &Headers::new(), &candidates, headerless)
            .unwrap();
        assert_eq!(outcome.correlation_id.as_deref(), Some("5"));
    }

    proptest! {
        #[test]
        fn matching_is_idempotent(kind in prop_oneof![Just("created"), Just("deleted"), Just("other")], x in any::<i64>()) {
            let candidates = vec![kind_message("Created", "created"), kind_message("Deleted", "deleted")];
            let payload = json!({"kind": kind, "x": x});
            let m = matcher();
            let first = m.match_message(&payload, &Headers::new(), &candidates, MatchOptions::default())
                .map(|o| o.message.name.clone());
            for _ in 0..3 {
                let again = m.match_message(&payload, &Headers::new(), &candidates, MatchOptions::default())
                    .map(|o| o.message.name.clone());
                prop_assert_eq!(&again, &first);
            }
        }

        #[test]
        fn identical_permissive_candidates_never_pick(count in 2usize..5, x in any::<i64>()) {
            let candidates: Vec<_> = (0..count)
                .map(|i| Arc::new(MessageDefinition {
                    name: format!("M{i}"),
                    payload: Some(json!({"type": "object"})),
                    ..MessageDefinition::default()
                }))
                .collect();
            let result = matcher().match_message(&json!({"x": x}), &Headers::new(), &candidates, MatchOptions::default());
            let is_ambiguous = matches!(result, Err(MatchError::AmbiguousMatch { ref candidates }) if candidates.len() == count);
            prop_assert!(is_ambiguous);
        }
    }
}
