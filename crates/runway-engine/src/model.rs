//! Default model streamer
//!
//! A deterministic, template-based generator standing in for the external
//! model adapter. It grounds its answer in the supplied evidence (citing
//! chunk ids) and meters a fixed per-call cost so budget enforcement is
//! exercised end to end. Provider-backed streamers implement the same
//! [`ModelStreamer`] trait.

use async_trait::async_trait;

use crate::collab::{ModelError, ModelOutput, ModelRequest, ModelStreamer};

const DEFAULT_COST_PER_CALL: f64 = 0.0005;

/// Evidence-citing template generator.
pub struct TemplateModel {
    cost_per_call: f64,
}

impl TemplateModel {
    pub fn new() -> Self {
        Self {
            cost_per_call: DEFAULT_COST_PER_CALL,
        }
    }

    pub fn with_cost_per_call(mut self, cost: f64) -> Self {
        self.cost_per_call = cost;
        self
    }
}

impl Default for TemplateModel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelStreamer for TemplateModel {
    async fn generate(&self, request: ModelRequest<'_>) -> Result<ModelOutput, ModelError> {
        let topic = request.message.trim().trim_end_matches('?');
        let text = if request.evidence.is_empty() {
            format!(
                "There is no supporting material available for \"{topic}\", \
                 so this is a best-effort answer without citations: {topic} \
                 is outside the indexed knowledge."
            )
        } else {
            let mut parts = Vec::with_capacity(request.evidence.len() + 1);
            parts.push(format!("Here is what the available notes say about \"{topic}\"."));
            for chunk in request.evidence {
                parts.push(format!("{} [{}]", chunk.text.trim(), chunk.chunk_id));
            }
            parts.join(" ")
        };
        Ok(ModelOutput {
            text,
            cost_usd: self.cost_per_call,
        })
    }
}
