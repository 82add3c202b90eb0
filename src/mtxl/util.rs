use burn::{
    config::Config,
    module::Module,
    nn::{Dropout, DropoutConfig, Linear, LinearConfig},
    prelude::Backend,
    tensor::{activation::gelu, DType, Element, Tensor},
};

/// Realigns relative-position scores so column `c` of row `r` holds the score
/// for the key offset implied by queries being the last `i` of `j` positions.
///
/// Pads the key axis with `i` zeros, flattens the last two axes, pads to a
/// multiple of `i + j - 1`, views as rows of that width and keeps the first
/// `i` rows with the first `i - 1` columns dropped.
///
/// # Parameters
/// - `x`: scores of shape `[batch_size, num_heads, i, j]`.
///
/// Returns a tensor of the same shape.
pub fn relative_shift<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    let [batch_size, num_heads, i, j] = x.dims();
    let device = x.device();

    let x = Tensor::cat(
        vec![x, Tensor::zeros([batch_size, num_heads, i, i], &device)],
        3,
    );

    let width = i + j - 1;
    let flat_len = i * (i + j);
    let pad = (width - flat_len % width) % width;

    let mut flat = x.reshape([batch_size, num_heads, flat_len]);
    if pad > 0 {
        flat = Tensor::cat(
            vec![flat, Tensor::zeros([batch_size, num_heads, pad], &device)],
            2,
        );
    }

    flat.reshape([batch_size, num_heads, (flat_len + pad) / width, width])
        .slice([0..batch_size, 0..num_heads, 0..i, (i - 1)..width])
}

/// Most negative finite value of the backend's float element.
///
/// Masked scores use this instead of `-inf` so softmax stays finite.
#[must_use]
pub fn max_neg_value<B: Backend>() -> f64 {
    match <B::FloatElem as Element>::dtype() {
        DType::F64 => f64::MIN,
        DType::F16 => half::f16::MIN.to_f64(),
        DType::BF16 => half::bf16::MIN.to_f64(),
        _ => f64::from(f32::MIN),
    }
}

/// Layer normalization over the last axis with no learned scale or shift.
pub fn layer_norm<B: Backend, const D: usize>(x: Tensor<B, D>, epsilon: f64) -> Tensor<B, D> {
    let (var, mean) = x.clone().var_mean_bias(D - 1);
    let std = (var + epsilon).sqrt();

    (x - mean) / std
}

/// Right-multiplies the feature axis of `x` by `weight`.
///
/// # Parameters
/// - `x`: `[a, b, n, d_in]`
/// - `weight`: `[d_in, d_out]`
///
/// Returns `[a, b, n, d_out]`.
pub fn project<B: Backend>(x: Tensor<B, 4>, weight: Tensor<B, 2>) -> Tensor<B, 4> {
    let [a, b, n, d_in] = x.dims();
    let [_, d_out] = weight.dims();

    x.reshape([a * b * n, d_in])
        .matmul(weight)
        .reshape([a, b, n, d_out])
}

/// Concatenates along `dim`, skipping parts of length zero.
///
/// Returns `None` when every part is empty.
pub fn cat_nonempty<B: Backend, const D: usize>(
    parts: Vec<Tensor<B, D>>,
    dim: usize,
) -> Option<Tensor<B, D>> {
    let mut parts: Vec<_> = parts.into_iter().filter(|t| t.dims()[dim] > 0).collect();

    match parts.len() {
        0 => None,
        1 => parts.pop(),
        _ => Some(Tensor::cat(parts, dim)),
    }
}

/// Keeps the last `len` entries along `dim`.
pub fn keep_last<B: Backend, const D: usize>(
    x: Tensor<B, D>,
    dim: usize,
    len: usize,
) -> Tensor<B, D> {
    let total = x.dims()[dim];
    let keep = len.min(total);

    x.narrow(dim, total - keep, keep)
}

#[derive(Module, Debug)]
pub struct FeedForward<B: Backend> {
    w1: Linear<B>,
    w2: Linear<B>,
    dropout: Dropout,
    inner_size: usize,
    glu: bool,
}

#[derive(Config, Debug)]
pub struct FeedForwardConfig {
    dim: usize,
    #[config(default = 4)]
    mult: usize,
    #[config(default = 0.0)]
    dropout: f64,
    /// Gate the activation with a second projection.
    #[config(default = false)]
    glu: bool,
}

impl FeedForwardConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> FeedForward<B> {
        let inner_size = self.dim * self.mult;
        let w1_out = if self.glu { inner_size * 2 } else { inner_size };

        FeedForward {
            w1: LinearConfig::new(self.dim, w1_out).init(device),
            w2: LinearConfig::new(inner_size, self.dim).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            inner_size,
            glu: self.glu,
        }
    }
}

impl<B: Backend> FeedForward<B> {
    /// # Parameters
    /// - `x`: `[batch_size, seq_len, dim]`
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let x = self.w1.forward(x);

        let x = if self.glu {
            let gate = x.clone().narrow(2, self.inner_size, self.inner_size);
            gelu(x.narrow(2, 0, self.inner_size)) * gate
        } else {
            gelu(x)
        };

        self.w2.forward(self.dropout.forward(x))
    }
}
