//! Span sampling policies.

use crate::context::{SpanContext, TraceId};
use serde::{Deserialize, Serialize};

/// Outcome of a sampling decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingDecision {
    /// The span is recorded and exported.
    RecordAndSample,
    /// The span is neither recorded nor exported.
    Drop,
}

/// Decides at span start whether the span is recorded and exported.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Sampler {
    /// Sample every span.
    #[default]
    AlwaysOn,
    /// Sample no span.
    AlwaysOff,
    /// Sample a deterministic fraction of traces, keyed on the trace id.
    TraceIdRatio {
        /// Fraction of traces to sample, clamped to `[0, 1]`.
        ratio: f64,
    },
    /// Follow the parent's decision; use `root` for spans without a parent.
    ParentBased {
        /// Sampler applied to root spans.
        root: Box<Sampler>,
    },
}

impl Sampler {
    /// Evaluates the policy for a span about to start.
    pub fn should_sample(
        &self,
        parent: Option<&SpanContext>,
        trace_id: TraceId,
    ) -> SamplingDecision {
        match self {
            Sampler::AlwaysOn => SamplingDecision::RecordAndSample,
            Sampler::AlwaysOff => SamplingDecision::Drop,
            Sampler::TraceIdRatio { ratio } => sample_ratio(*ratio, trace_id),
            Sampler::ParentBased { root } => match parent {
                Some(parent) if parent.is_sampled() => SamplingDecision::RecordAndSample,
                Some(_) => SamplingDecision::Drop,
                None => root.should_sample(None, trace_id),
            },
        }
    }
}

fn sample_ratio(ratio: f64, trace_id: TraceId) -> SamplingDecision {
    if ratio >= 1.0 {
        return SamplingDecision::RecordAndSample;
    }
    if ratio <= 0.0 || ratio.is_nan() {
        return SamplingDecision::Drop;
    }

    let upper_bound = (ratio * (1u64 << 63) as f64) as u64;
    let bytes = trace_id.to_bytes();
    let mut low = [0u8; 8];
    low.copy_from_slice(&bytes[8..16]);
    let value = u64::from_be_bytes(low) >> 1;

    if value < upper_bound {
        SamplingDecision::RecordAndSample
    } else {
        SamplingDecision::Drop
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{TraceFlags, TraceState};
    use opentelemetry_sdk::trace::{IdGenerator, RandomIdGenerator};

    fn random_trace_id() -> TraceId {
        RandomIdGenerator::default().new_trace_id()
    }

    fn parent(sampled: bool) -> SpanContext {
        let ids = RandomIdGenerator::default();
        SpanContext::new(
            ids.new_trace_id(),
            ids.new_span_id(),
            TraceFlags::default().with_sampled(sampled),
            false,
            TraceState::NONE,
        )
    }

    #[test]
    fn test_always_on_and_off() {
        let trace_id = random_trace_id();
        assert_eq!(
            Sampler::AlwaysOn.should_sample(None, trace_id),
            SamplingDecision::RecordAndSample
        );
        assert_eq!(
            Sampler::AlwaysOff.should_sample(None, trace_id),
            SamplingDecision::Drop
        );
    }

    #[test]
    fn test_ratio_bounds() {
        let trace_id = random_trace_id();
        assert_eq!(
            Sampler::TraceIdRatio { ratio: 1.5 }.should_sample(None, trace_id),
            SamplingDecision::RecordAndSample
        );
        assert_eq!(
            Sampler::TraceIdRatio { ratio: 0.0 }.should_sample(None, trace_id),
            SamplingDecision::Drop
        );
    }

    #[test]
    fn test_ratio_uses_low_trace_id_bytes() {
        let low = TraceId::from_bytes([0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0, 0, 0, 0, 0, 0, 0, 1]);
        let high = TraceId::from_bytes([0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff]);
        let sampler = Sampler::TraceIdRatio { ratio: 0.5 };

        assert_eq!(sampler.should_sample(None, low), SamplingDecision::RecordAndSample);
        assert_eq!(sampler.should_sample(None, high), SamplingDecision::Drop);
    }

    #[test]
    fn test_ratio_is_roughly_proportional() {
        let sampler = Sampler::TraceIdRatio { ratio: 0.25 };
        let sampled = (0..4000)
            .filter(|_| {
                sampler.should_sample(None, random_trace_id()) == SamplingDecision::RecordAndSample
            })
            .count();

        assert!((700..1300).contains(&sampled), "sampled {sampled} of 4000");
    }

    #[test]
    fn test_parent_based() {
        let sampler = Sampler::ParentBased {
            root: Box::new(Sampler::AlwaysOff),
        };
        let trace_id = random_trace_id();

        assert_eq!(
            sampler.should_sample(Some(&parent(true)), trace_id),
            SamplingDecision::RecordAndSample
        );
        assert_eq!(
            sampler.should_sample(Some(&parent(false)), trace_id),
            SamplingDecision::Drop
        );
        assert_eq!(sampler.should_sample(None, trace_id), SamplingDecision::Drop);
    }

    #[test]
    fn test_sampler_deserialization() {
        let sampler: Sampler =
            serde_json::from_str(r#"{"type":"parent_based","root":{"type":"trace_id_ratio","ratio":0.1}}"#)
                .unwrap();
        assert_eq!(
            sampler,
            Sampler::ParentBased {
                root: Box::new(Sampler::TraceIdRatio { ratio: 0.1 })
            }
        );
        assert_eq!(
            serde_json::to_string(&Sampler::AlwaysOn).unwrap(),
            r#"{"type":"always_on"}"#
        );
    }
}
