//! Multi-head attention over flattened spatial sequences
//!
//! The denoising network tokenizes each voxel of a feature volume and runs
//! attention over the resulting sequence. The same module serves both
//! self-attention (context is the sequence itself) and cross-attention
//! against an external context of patient covariates.

use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;

/// Multi-head attention (self-attention when `context_dim` is `None`)
#[derive(Module, Debug)]
pub struct Attention<B: Backend> {
    /// Query projection
    pub to_q: Linear<B>,
    /// Key projection
    pub to_k: Linear<B>,
    /// Value projection
    pub to_v: Linear<B>,
    /// Output projection
    pub to_out: Linear<B>,
    /// Number of attention heads
    pub num_heads: usize,
    /// Dimension per head
    pub head_dim: usize,
}

impl<B: Backend> Attention<B> {
    /// Creates a new attention module
    ///
    /// `query_dim` must be divisible by `num_heads`. `context_dim` is the
    /// key/value width for cross-attention; `None` uses `query_dim`.
    pub fn new(
        query_dim: usize,
        num_heads: usize,
        context_dim: Option<usize>,
        device: &B::Device,
    ) -> Self {
        let head_dim = query_dim / num_heads;
        let context_dim = context_dim.unwrap_or(query_dim);

        Self {
            to_q: LinearConfig::new(query_dim, query_dim).init(device),
            to_k: LinearConfig::new(context_dim, query_dim).init(device),
            to_v: LinearConfig::new(context_dim, query_dim).init(device),
            to_out: LinearConfig::new(query_dim, query_dim).init(device),
            num_heads,
            head_dim,
        }
    }

    /// Computes scaled dot-product attention
    ///
    /// * `x` - Query input of shape `[batch, seq_len, query_dim]`
    /// * `context` - Key/value context (`None` uses `x` for self-attention)
    pub fn forward(&self, x: Tensor<B, 3>, context: Option<Tensor<B, 3>>) -> Tensor<B, 3> {
        let context = context.unwrap_or_else(|| x.clone());

        let [b, seq_len, _] = x.dims();
        let [_, ctx_len, _] = context.dims();

        let q = self.to_q.forward(x);
        let k = self.to_k.forward(context.clone());
        let v = self.to_v.forward(context);

        // [b, seq, heads*dim] -> [b, heads, seq, dim]
        let q = q
            .reshape([b, seq_len, self.num_heads, self.head_dim])
            .swap_dims(1, 2);
        let k = k
            .reshape([b, ctx_len, self.num_heads, self.head_dim])
            .swap_dims(1, 2);
        let v = v
            .reshape([b, ctx_len, self.num_heads, self.head_dim])
            .swap_dims(1, 2);

        let scale = (self.head_dim as f64).powf(-0.5);
        let attn = q.matmul(k.transpose()) * scale;
        let attn = burn::tensor::activation::softmax(attn, 3);
        let out = attn.matmul(v);

        // [b, heads, seq, dim] -> [b, seq, heads*dim]
        let out = out
            .swap_dims(1, 2)
            .reshape([b, seq_len, self.num_heads * self.head_dim]);

        self.to_out.forward(out)
    }
}
