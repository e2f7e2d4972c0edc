//! Model-based speculative token proposer.
//!
//! The draft network carries a feature vector alongside the token stream.
//! At each position the current token's embedding and the carried feature
//! are fused into one hidden state, refined by a stack of residual blocks,
//! and projected to the vocabulary; the refined state becomes the next
//! carried feature. The feature is first warmed up over the last few
//! tokens of the request, then drafts are decoded greedily.
//!
//! Eagle, Eagle3, Medusa, MTP and standalone draft models all run through
//! this network shape here; they differ only in the weights loaded.
//!
//! Before [`EagleProposer::load_model`] succeeds the proposer degrades
//! deterministically: it repeats the last token and tags the proposal
//! [`DraftMethod::EagleFallback`].

use std::path::Path;

use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{embedding, linear, linear_no_bias, rms_norm, Embedding, Linear, RmsNorm, VarBuilder};
use tracing::{info, warn};

use crate::error::DraftModelError;

use super::DraftMethod;

/// Context tokens folded into the feature before the first draft.
const WARMUP_TOKENS: usize = 4;

/// Draft network shape.
#[derive(Debug, Clone)]
pub struct EagleConfig {
    pub hidden_size: usize,
    /// Residual blocks after the fuse projection.
    pub num_layers: usize,
    pub vocab_size: usize,
    pub num_speculative_tokens: usize,
}

/// `x + silu(proj(norm(x)))`
struct FeatureBlock {
    norm: RmsNorm,
    proj: Linear,
}

impl FeatureBlock {
    fn load(hidden_size: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            norm: rms_norm(hidden_size, 1e-6, vb.pp("norm"))?,
            proj: linear(hidden_size, hidden_size, vb.pp("proj"))?,
        })
    }
}

impl Module for FeatureBlock {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let update = candle_nn::ops::silu(&self.proj.forward(&self.norm.forward(xs)?)?)?;
        xs + update
    }
}

struct DraftNetwork {
    embed_tokens: Embedding,
    /// `[embedding; feature]` (2H) down to H.
    fuse: Linear,
    blocks: Vec<FeatureBlock>,
    lm_head: Linear,
    hidden_size: usize,
    device: Device,
}

impl DraftNetwork {
    fn load(config: &EagleConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let h = config.hidden_size;
        let blocks = (0..config.num_layers)
            .map(|i| FeatureBlock::load(h, vb.pp(format!("layers.{i}"))))
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self {
            embed_tokens: embedding(config.vocab_size, h, vb.pp("embed_tokens"))?,
            fuse: linear(2 * h, h, vb.pp("fc"))?,
            blocks,
            lm_head: linear_no_bias(h, config.vocab_size, vb.pp("lm_head"))?,
            hidden_size: h,
            device: vb.device().clone(),
        })
    }

    /// One position: fuse, refine, return the new feature.
    fn advance(&self, token_id: u32, feature: &Tensor) -> candle_core::Result<Tensor> {
        let ids = Tensor::new(&[token_id], &self.device)?;
        let embedded = self.embed_tokens.forward(&ids)?;
        let fused = self.fuse.forward(&Tensor::cat(&[&embedded, feature], D::Minus1)?)?;
        self.blocks.iter().try_fold(fused, |xs, block| block.forward(&xs))
    }

    fn next_token(&self, feature: &Tensor) -> candle_core::Result<u32> {
        self.lm_head
            .forward(feature)?
            .argmax(D::Minus1)?
            .squeeze(0)?
            .to_scalar::<u32>()
    }

    /// Warm up on `context`, then draft `k` tokens.
    fn propose(&self, context: &[u32], k: usize) -> candle_core::Result<Vec<u32>> {
        let mut feature = Tensor::zeros((1, self.hidden_size), DType::F32, &self.device)?;
        for &token_id in context {
            feature = self.advance(token_id, &feature)?;
        }
        let mut drafts = Vec::with_capacity(k);
        for _ in 0..k {
            let token_id = self.next_token(&feature)?;
            drafts.push(token_id);
            feature = self.advance(token_id, &feature)?;
        }
        Ok(drafts)
    }
}

pub struct EagleProposer {
    config: EagleConfig,
    network: Option<DraftNetwork>,
}

impl EagleProposer {
    /// Create a proposer without weights; it runs degraded until
    /// [`load_model`](Self::load_model) succeeds.
    pub fn new(config: EagleConfig) -> Self {
        Self {
            config,
            network: None,
        }
    }

    pub fn config(&self) -> &EagleConfig {
        &self.config
    }

    pub fn has_model(&self) -> bool {
        self.network.is_some()
    }

    pub fn load_model(&mut self, vb: VarBuilder) -> Result<(), DraftModelError> {
        if self.config.hidden_size == 0 || self.config.vocab_size == 0 {
            return Err(DraftModelError::Config(format!(
                "hidden_size {} and vocab_size {} must be positive",
                self.config.hidden_size, self.config.vocab_size
            )));
        }
        self.network = Some(DraftNetwork::load(&self.config, vb)?);
        info!(
            hidden_size = self.config.hidden_size,
            num_layers = self.config.num_layers,
            vocab_size = self.config.vocab_size,
            "draft network loaded"
        );
        Ok(())
    }

    /// Load draft weights from a safetensors file.
    pub fn load_safetensors(&mut self, path: &Path, device: &Device) -> Result<(), DraftModelError> {
        // SAFETY: the file is mapped read-only and not modified while mapped.
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[path], DType::F32, device)? };
        self.load_model(vb)
    }

    /// Propose up to `max_tokens` tokens continuing `token_ids`.
    ///
    /// Returns the method that actually produced the tokens so callers can
    /// detect the degraded path.
    pub fn propose(&self, token_ids: &[u32], max_tokens: usize) -> (Vec<u32>, DraftMethod) {
        let k = max_tokens.min(self.config.num_speculative_tokens);
        let Some(&last) = token_ids.last() else {
            return (Vec::new(), self.method());
        };
        if k == 0 {
            return (Vec::new(), self.method());
        }

        let Some(network) = &self.network else {
            return (vec![last; k], DraftMethod::EagleFallback);
        };
        let context = &token_ids[token_ids.len().saturating_sub(WARMUP_TOKENS)..];
        if let Some(&bad) = context.iter().find(|&&t| t as usize >= self.config.vocab_size) {
            warn!(token = bad, vocab_size = self.config.vocab_size, "token outside draft vocabulary");
            return (Vec::new(), DraftMethod::Eagle);
        }
        match network.propose(context, k) {
            Ok(tokens) => (tokens, DraftMethod::Eagle),
            Err(e) => {
                warn!(error = %e, "draft network forward failed, proposing nothing");
                (Vec::new(), DraftMethod::Eagle)
            }
        }
    }

    pub fn method(&self) -> DraftMethod {
        if self.has_model() {
            DraftMethod::Eagle
        } else {
            DraftMethod::EagleFallback
        }
    }
}

impl std::fmt::Debug for EagleProposer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EagleProposer")
            .field("config", &self.config)
            .field("has_model", &self.has_model())
            .finish()
    }
}
