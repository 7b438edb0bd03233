//! EMA vector quantizer
//!
//! Maps each spatial position of a feature volume to its nearest codeword.
//! The codebook is updated from exponential moving averages of selection
//! counts and selected vectors, so it carries no gradients of its own; the
//! straight-through estimator passes encoder gradients around the lookup.

use burn::prelude::*;
use burn::tensor::backend::Backend;
use rand::rngs::StdRng;
use rand::Rng;
use thiserror::Error;

/// Quantization failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QuantizeError {
    /// The quantized volume contained NaN or infinite values
    #[error("quantized output contains non-finite values")]
    NonFiniteQuantized,
}

/// EMA quantizer configuration
#[derive(Debug, Clone)]
pub struct EmaQuantizerConfig {
    /// Number of codewords
    pub num_embeddings: usize,
    /// Width of each codeword
    pub embedding_dim: usize,
    /// EMA decay for cluster sizes and running sums
    pub decay: f64,
    /// Floor applied to cluster sizes and the Laplace smoothing constant
    pub epsilon: f64,
    /// Symmetric clamp on updated codewords (`None` disables clamping)
    pub clip_value: Option<f64>,
    /// Update steps between dead-code sweeps
    pub reset_after: usize,
    /// Cluster sizes below this count as dead at a sweep
    pub reset_threshold: f64,
}

impl EmaQuantizerConfig {
    /// Creates a configuration with the defaults used in training
    pub fn new(num_embeddings: usize, embedding_dim: usize) -> Self {
        Self {
            num_embeddings,
            embedding_dim,
            decay: 0.95,
            epsilon: 1e-5,
            clip_value: Some(2.0),
            reset_after: 20_000,
            reset_threshold: 5.0,
        }
    }

    /// Sets the EMA decay
    pub fn with_decay(mut self, decay: f64) -> Self {
        self.decay = decay;
        self
    }

    /// Sets the codeword clamp (`None` disables clamping)
    pub fn with_clip_value(mut self, clip_value: Option<f64>) -> Self {
        self.clip_value = clip_value;
        self
    }

    /// Sets the number of update steps between dead-code sweeps
    pub fn with_reset_after(mut self, reset_after: usize) -> Self {
        self.reset_after = reset_after;
        self
    }

    /// Sets the cluster-size threshold below which a code counts as dead
    pub fn with_reset_threshold(mut self, reset_threshold: f64) -> Self {
        self.reset_threshold = reset_threshold;
        self
    }

    /// Initializes a quantizer with a random codebook
    ///
    /// `rng` drives dead-code reseeding; injecting it keeps runs
    /// reproducible.
    pub fn init<B: Backend>(&self, rng: StdRng, device: &B::Device) -> EmaQuantizer<B> {
        let embedding = Tensor::random(
            [self.num_embeddings, self.embedding_dim],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            device,
        );
        let ema_embedding = Tensor::random(
            [self.num_embeddings, self.embedding_dim],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            device,
        );
        let cluster_size = Tensor::zeros([self.num_embeddings], device);

        EmaQuantizer {
            config: self.clone(),
            embedding,
            ema_embedding,
            cluster_size,
            step: 0,
            learning: false,
            rng,
        }
    }
}

/// Result of one quantization call
#[derive(Debug)]
pub struct QuantizeOutput<B: Backend> {
    /// Quantized volume with straight-through gradients, shaped like the input
    pub quantized: Tensor<B, 5>,
    /// Pulls codewords toward the (detached) encoder output
    pub codebook_loss: Tensor<B, 1>,
    /// Pulls the encoder output toward the (detached) codewords
    pub commitment_loss: Tensor<B, 1>,
    /// Selected code index per spatial position, `[batch, depth, height, width]`
    pub indices: Tensor<B, 4, Int>,
}

/// Vector quantizer with EMA codebook updates
///
/// The codebook and its EMA buffers are mutated only by [`forward`] while
/// learning is enabled; callers never write them directly. One forward call
/// is one atomic update step, so the quantizer must not be shared across
/// threads without external synchronization.
///
/// [`forward`]: EmaQuantizer::forward
#[derive(Debug)]
pub struct EmaQuantizer<B: Backend> {
    config: EmaQuantizerConfig,
    /// Codebook, `[num_embeddings, embedding_dim]`
    embedding: Tensor<B, 2>,
    /// Running sums of selected input vectors
    ema_embedding: Tensor<B, 2>,
    /// Running selection counts
    cluster_size: Tensor<B, 1>,
    /// Update steps since the last dead-code sweep
    step: usize,
    learning: bool,
    rng: StdRng,
}

impl<B: Backend> EmaQuantizer<B> {
    /// Quantizes `[batch, embedding_dim, depth, height, width]` features
    ///
    /// Replaces each position's channel vector with its nearest codeword
    /// (squared Euclidean distance, ties to the lowest index). While learning
    /// is enabled the call also advances the EMA codebook statistics.
    pub fn forward(&mut self, z_e: Tensor<B, 5>) -> Result<QuantizeOutput<B>, QuantizeError> {
        let [b, c, d, h, w] = z_e.dims();
        let positions = b * d * h * w;
        let k = self.config.num_embeddings;

        // (B, C, D, H, W) -> (B*D*H*W, C)
        let flat = z_e
            .clone()
            .permute([0, 2, 3, 4, 1])
            .reshape([positions, c]);

        // |z - e|^2 = |z|^2 - 2 z.e + |e|^2
        let distances = flat.clone().powf_scalar(2.0).sum_dim(1)
            - flat.clone().matmul(self.embedding.clone().transpose()) * 2.0
            + self
                .embedding
                .clone()
                .powf_scalar(2.0)
                .sum_dim(1)
                .reshape([1, k]);

        let indices = distances.argmin(1).reshape([positions]);
        let quantized_flat = self.embedding.clone().select(0, indices.clone());
        let quantized = quantized_flat
            .reshape([b, d, h, w, c])
            .permute([0, 4, 1, 2, 3]);

        if self.learning {
            self.step += 1;
            self.ema_update(&flat, &indices);
        }

        let commitment_loss = (quantized.clone().detach() - z_e.clone())
            .powf_scalar(2.0)
            .mean();
        let codebook_loss = (quantized.clone() - z_e.clone().detach())
            .powf_scalar(2.0)
            .mean();

        // Straight-through estimator
        let quantized = z_e.clone() + (quantized - z_e).detach();

        if !quantized
            .clone()
            .into_data()
            .iter::<f32>()
            .all(|v| v.is_finite())
        {
            return Err(QuantizeError::NonFiniteQuantized);
        }

        Ok(QuantizeOutput {
            quantized,
            codebook_loss,
            commitment_loss,
            indices: indices.reshape([b, d, h, w]),
        })
    }

    fn ema_update(&mut self, flat: &Tensor<B, 2>, indices: &Tensor<B, 1, Int>) {
        let device = flat.device();
        let [positions, c] = flat.dims();
        let k = self.config.num_embeddings;
        let decay = self.config.decay;
        let epsilon = self.config.epsilon;

        // per-code selection counts for this batch
        let counts = Tensor::<B, 1>::zeros([k], &device).scatter(
            0,
            indices.clone(),
            Tensor::ones([positions], &device),
        );

        self.cluster_size = (self.cluster_size.clone() * decay + counts * (1.0 - decay))
            .clamp_min(epsilon);

        // Laplace smoothing over the total cluster mass
        let total = self.cluster_size.clone().sum();
        let smoothed = (self.cluster_size.clone() + epsilon)
            / (total.clone() + k as f64 * epsilon)
            * total;

        // per-code sums of the selected input vectors
        let scatter_indices = indices.clone().reshape([positions, 1]).expand([positions, c]);
        let dw = Tensor::<B, 2>::zeros([k, c], &device).scatter(0, scatter_indices, flat.clone());

        self.ema_embedding = self.ema_embedding.clone() * decay + dw * (1.0 - decay);

        let mut new_embed = self.ema_embedding.clone() / smoothed.reshape([k, 1]);
        if let Some(clip) = self.config.clip_value {
            new_embed = new_embed.clamp(-clip, clip);
        }
        self.embedding = new_embed;

        if self.step >= self.config.reset_after {
            self.reseed_dead_codes(flat);
            self.step = 0;
        }
    }

    /// Replaces codes whose cluster size stayed below the threshold with a
    /// randomly sampled input vector, resetting their cluster size to 1
    fn reseed_dead_codes(&mut self, flat: &Tensor<B, 2>) {
        let [positions, c] = flat.dims();
        let device = flat.device();
        let sizes: Vec<f32> = self.cluster_size.clone().into_data().iter::<f32>().collect();

        for (code, &size) in sizes.iter().enumerate() {
            if f64::from(size) >= self.config.reset_threshold {
                continue;
            }
            let source = self.rng.gen_range(0..positions);
            let row = flat.clone().slice([source..source + 1, 0..c]);

            self.embedding = self
                .embedding
                .clone()
                .slice_assign([code..code + 1, 0..c], row.clone());
            self.ema_embedding = self
                .ema_embedding
                .clone()
                .slice_assign([code..code + 1, 0..c], row);
            self.cluster_size = self
                .cluster_size
                .clone()
                .slice_assign([code..code + 1], Tensor::ones([1], &device));
        }
    }

    /// Current codewords, `[num_embeddings, embedding_dim]`
    pub fn codebook(&self) -> Tensor<B, 2> {
        self.embedding.clone()
    }

    /// Fraction of codes with a nonzero cluster size
    pub fn usage(&self) -> f64 {
        let used = self
            .cluster_size
            .clone()
            .into_data()
            .iter::<f32>()
            .filter(|&v| v > 0.0)
            .count();
        used as f64 / self.config.num_embeddings as f64
    }

    /// Update steps since the last dead-code sweep
    pub fn steps_since_reset(&self) -> usize {
        self.step
    }

    /// Enables or disables the EMA codebook update
    pub fn set_learning(&mut self, learning: bool) {
        self.learning = learning;
    }

    /// Whether forward calls advance the codebook statistics
    pub fn learning(&self) -> bool {
        self.learning
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use rand::SeedableRng;

    type TestBackend = NdArray<f32>;

    fn quantizer(config: EmaQuantizerConfig) -> EmaQuantizer<TestBackend> {
        config.init(StdRng::seed_from_u64(42), &Default::default())
    }

    fn volume(shape: [usize; 5]) -> Tensor<TestBackend, 5> {
        Tensor::random(
            shape,
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &Default::default(),
        )
    }

    #[test]
    fn test_output_shapes() {
        let mut vq = quantizer(EmaQuantizerConfig::new(8, 4));
        let out = vq.forward(volume([2, 4, 3, 3, 3])).unwrap();

        assert_eq!(out.quantized.dims(), [2, 4, 3, 3, 3]);
        assert_eq!(out.indices.dims(), [2, 3, 3, 3]);
        assert_eq!(out.codebook_loss.dims(), [1]);
        assert_eq!(out.commitment_loss.dims(), [1]);
    }

    #[test]
    fn test_quantization_is_idempotent() {
        let mut vq = quantizer(EmaQuantizerConfig::new(8, 4));

        let once = vq.forward(volume([1, 4, 2, 2, 2])).unwrap().quantized;
        let twice = vq.forward(once.clone()).unwrap().quantized;

        let a = once.into_data().to_vec::<f32>().unwrap();
        let b = twice.into_data().to_vec::<f32>().unwrap();
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-6);
        }
    }

    #[test]
    fn test_update_floors_cluster_sizes() {
        let mut vq = quantizer(EmaQuantizerConfig::new(8, 4));
        vq.set_learning(true);
        vq.forward(volume([1, 4, 3, 3, 3])).unwrap();

        let sizes: Vec<f32> = vq.cluster_size.clone().into_data().iter::<f32>().collect();
        assert!(sizes.iter().all(|&s| s >= 1e-5));
        assert_eq!(vq.usage(), 1.0);
    }

    #[test]
    fn test_update_keeps_decayed_cluster_mass() {
        let mut vq = quantizer(EmaQuantizerConfig::new(8, 4));
        vq.set_learning(true);
        // seed some prior mass so the decay term is nonzero
        vq.forward(volume([1, 4, 3, 3, 3])).unwrap();

        let prior: f32 = vq.cluster_size.clone().sum().into_scalar();

        // one update over a batch of 27 positions
        vq.forward(volume([1, 4, 3, 3, 3])).unwrap();
        let after: f32 = vq.cluster_size.clone().sum().into_scalar();

        // sum(cluster_size) = decay * prior + (1 - decay) * positions, up to
        // the epsilon floor on codes the batch never selected
        let expected = 0.95 * prior + 0.05 * 27.0;
        assert!(
            (after - expected).abs() < 1e-3,
            "cluster mass {after} differs from {expected}"
        );
    }

    #[test]
    fn test_codewords_respect_clip_bound() {
        let mut vq = quantizer(EmaQuantizerConfig::new(8, 4).with_clip_value(Some(2.0)));
        vq.set_learning(true);
        for _ in 0..10 {
            // large inputs would push codewords past the bound without clamping
            vq.forward(volume([1, 4, 3, 3, 3]) * 50.0).unwrap();
        }

        let codebook: Vec<f32> = vq.codebook().into_data().iter::<f32>().collect();
        assert!(codebook.iter().all(|&v| v.abs() <= 2.0 + 1e-6));
    }

    #[test]
    fn test_dead_codes_are_reseeded() {
        let mut vq = quantizer(
            EmaQuantizerConfig::new(8, 4)
                .with_reset_after(3)
                .with_clip_value(None),
        );
        vq.set_learning(true);

        // small batches keep every cluster size far below the threshold
        let batch = volume([1, 4, 2, 2, 1]);
        vq.forward(batch.clone()).unwrap();
        vq.forward(batch.clone()).unwrap();
        assert_eq!(vq.steps_since_reset(), 2);

        vq.forward(batch.clone()).unwrap();
        assert_eq!(vq.steps_since_reset(), 0);

        let sizes: Vec<f32> = vq.cluster_size.clone().into_data().iter::<f32>().collect();
        assert!(sizes.iter().all(|&s| (s - 1.0).abs() < 1e-6));

        // every reseeded codeword is one of the batch vectors
        let rows: Vec<f32> = batch
            .permute([0, 2, 3, 4, 1])
            .reshape([4, 4])
            .into_data()
            .to_vec()
            .unwrap();
        let codebook: Vec<f32> = vq.codebook().into_data().to_vec().unwrap();
        for code in codebook.chunks(4) {
            let matches = rows.chunks(4).any(|row| {
                code.iter().zip(row).all(|(a, b)| (a - b).abs() < 1e-6)
            });
            assert!(matches, "codeword {code:?} is not a batch vector");
        }
    }

    #[test]
    fn test_sweep_spares_codes_above_threshold() {
        let device = Default::default();
        let mut vq = EmaQuantizerConfig::new(4, 2)
            .with_reset_after(1)
            .with_reset_threshold(0.5)
            .with_clip_value(None)
            .init::<TestBackend>(StdRng::seed_from_u64(42), &device);

        // pin the codebook so every position selects code 0
        let codebook = Tensor::from_data(
            TensorData::new(
                vec![0.5f32, 0.5, 10.0, 10.0, -10.0, -10.0, 30.0, 30.0],
                [4, 2],
            ),
            &device,
        );
        vq.embedding = codebook.clone();
        vq.ema_embedding = codebook;
        vq.set_learning(true);

        // 16 zero positions all map to code 0, pushing its cluster size to
        // 0.05 * 16 = 0.8, past the threshold; codes 1..4 stay dead
        vq.forward(Tensor::zeros([1, 2, 4, 2, 2], &device)).unwrap();
        assert_eq!(vq.steps_since_reset(), 0);

        let sizes: Vec<f32> = vq.cluster_size.clone().into_data().iter::<f32>().collect();
        assert!((sizes[0] - 0.8).abs() < 1e-6, "live code was reset: {sizes:?}");
        for &size in &sizes[1..] {
            assert!((size - 1.0).abs() < 1e-6, "dead code kept size {size}");
        }

        let codebook: Vec<f32> = vq.codebook().into_data().to_vec().unwrap();
        // dead codes are reseeded to batch vectors (all zero here)
        for code in codebook[2..].chunks(2) {
            assert!(code.iter().all(|v| v.abs() < 1e-6), "dead code {code:?}");
        }
        // the surviving code keeps its EMA-updated codeword
        assert!(codebook[0].abs() > 0.1 && codebook[1].abs() > 0.1);
    }

    #[test]
    fn test_usage_grows_and_stays_bounded() {
        let mut vq = quantizer(EmaQuantizerConfig::new(8, 4));
        vq.set_learning(true);

        let mut previous = vq.usage();
        for _ in 0..50 {
            vq.forward(volume([1, 4, 5, 5, 4])).unwrap();
            let usage = vq.usage();
            assert!(usage >= previous);
            assert!(usage <= 1.0);
            previous = usage;
        }
    }

    #[test]
    fn test_learning_disabled_keeps_codebook_fixed() {
        let mut vq = quantizer(EmaQuantizerConfig::new(8, 4));
        let before: Vec<f32> = vq.codebook().into_data().to_vec().unwrap();

        vq.forward(volume([1, 4, 3, 3, 3])).unwrap();

        let after: Vec<f32> = vq.codebook().into_data().to_vec().unwrap();
        assert_eq!(before, after);
        assert_eq!(vq.steps_since_reset(), 0);
    }
}
