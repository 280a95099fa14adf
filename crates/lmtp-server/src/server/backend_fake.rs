//! A deterministic [`ModelBackend`] used by tests and the demonstrator
//! binary. Never a production backend: weights, tokenizers, and a real
//! forward pass are explicitly out of scope for this crate.

use lmtp_core::backend::{BackendError, GenerateInput, GenerateOutput, ModelBackend, TokenSink};
use lmtp_core::kwargs::Kwargs;

/// Emits a fixed token per row per step (`(row_index + step) % vocab_size`,
/// skipping zero so it never collides with `eos_token_id` by accident)
/// until either `max_new_tokens` is reached or the emitted token equals
/// `eos_token_id`, which happens for every row after `stop_after` steps.
pub struct DemoBackend {
    model_identifier: String,
    vocab_size: u32,
    eos_token_id: u32,
    stop_after: u32,
    max_batch_size: usize,
}

impl DemoBackend {
    pub const DEFAULT_VOCAB_SIZE: u32 = 256;
    pub const DEFAULT_EOS_TOKEN_ID: u32 = 0;
    pub const DEFAULT_STOP_AFTER: u32 = 4;
    pub const DEFAULT_MAX_BATCH_SIZE: usize = 32;

    fn next_token(&self, row: usize, step: u32) -> u32 {
        if step >= self.stop_after {
            return self.eos_token_id;
        }
        let candidate = (row as u32 + step + 1) % self.vocab_size;
        if candidate == self.eos_token_id {
            candidate + 1
        } else {
            candidate
        }
    }

    fn score_row(&self, token: u32) -> Vec<f32> {
        let mut row = vec![-10.0_f32; self.vocab_size as usize];
        row[(token % self.vocab_size) as usize] = 0.0;
        row
    }
}

impl ModelBackend for DemoBackend {
    async fn load(model_identifier: &str, model_args: &Kwargs) -> Result<Self, BackendError> {
        let vocab_size = match model_args.get("vocab_size") {
            Some(lmtp_core::KwValue::Int(v)) => *v as u32,
            _ => Self::DEFAULT_VOCAB_SIZE,
        };
        let stop_after = match model_args.get("stop_after") {
            Some(lmtp_core::KwValue::Int(v)) => *v as u32,
            _ => Self::DEFAULT_STOP_AFTER,
        };

        Ok(Self {
            model_identifier: model_identifier.to_string(),
            vocab_size,
            eos_token_id: Self::DEFAULT_EOS_TOKEN_ID,
            stop_after,
            max_batch_size: Self::DEFAULT_MAX_BATCH_SIZE,
        })
    }

    fn info(&self) -> String {
        format!(
            "demo-backend(model={}, vocab_size={}, eos={})",
            self.model_identifier, self.vocab_size, self.eos_token_id
        )
    }

    fn eos_token_id(&self) -> u32 {
        self.eos_token_id
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    fn supports_cancellation(&self) -> bool {
        true
    }

    async fn generate(
        &self,
        input: GenerateInput<'_>,
        streamer: &mut dyn TokenSink,
    ) -> Result<GenerateOutput, BackendError> {
        let num_rows = input.input_ids.len();
        let mut sequences: Vec<Vec<u32>> = input.input_ids.to_vec();
        let mut finished = vec![false; num_rows];
        let mut all_scores = Vec::new();

        for step in 0..input.max_new_tokens {
            let mut step_scores = Vec::with_capacity(num_rows);
            for (row, seq) in sequences.iter_mut().enumerate() {
                let token = if finished[row] {
                    self.eos_token_id
                } else {
                    self.next_token(row, step)
                };
                if token == self.eos_token_id {
                    finished[row] = true;
                }
                seq.push(token);
                step_scores.push(self.score_row(token));
            }

            let stop = streamer.log_token(&sequences, std::slice::from_ref(&step_scores));
            all_scores.push(step_scores);

            if stop || finished.iter().all(|f| *f) {
                break;
            }
        }

        Ok(GenerateOutput {
            sequences,
            scores: all_scores,
        })
    }

    async fn score(
        &self,
        input_ids: &[Vec<u32>],
        _attention_mask: &[Vec<u8>],
    ) -> Result<Vec<Vec<f32>>, BackendError> {
        Ok(input_ids
            .iter()
            .map(|row| row.iter().map(|&token| -(token as f32) / 10.0).collect())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingSink {
        steps: usize,
    }

    impl TokenSink for RecordingSink {
        fn log_token(&mut self, _input_ids_so_far: &[Vec<u32>], _scores_so_far: &[Vec<Vec<f32>>]) -> bool {
            self.steps += 1;
            false
        }
    }

    #[tokio::test]
    async fn generate_stops_at_eos_for_every_row() {
        let backend = DemoBackend::load("demo", &Kwargs::new()).await.unwrap();
        let mut sink = RecordingSink { steps: 0 };
        let input = GenerateInput {
            input_ids: &[vec![1, 2, 3]],
            attention_mask: &[vec![1, 1, 1]],
            temperature: 0.0,
            max_new_tokens: 100,
            logit_biases: &[std::collections::HashMap::new()],
            extra: &Kwargs::new(),
        };
        let output = backend.generate(input, &mut sink).await.unwrap();
        assert!(output.sequences[0].len() < 100 + 3);
        assert_eq!(*output.sequences[0].last().unwrap(), backend.eos_token_id());
        assert_eq!(sink.steps, output.sequences[0].len() - 3);
    }

    #[tokio::test]
    async fn score_is_deterministic() {
        let backend = DemoBackend::load("demo", &Kwargs::new()).await.unwrap();
        let scores_a = backend.score(&[vec![1, 2, 3]], &[vec![1, 1, 1]]).await.unwrap();
        let scores_b = backend.score(&[vec![1, 2, 3]], &[vec![1, 1, 1]]).await.unwrap();
        assert_eq!(scores_a, scores_b);
    }
}
