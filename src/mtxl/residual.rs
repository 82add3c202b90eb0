use burn::{
    config::Config,
    module::Module,
    nn::{Linear, LinearConfig},
    prelude::Backend,
    tensor::{activation::sigmoid, Tensor},
};

/// Selects how a sublayer's output is merged back into its input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResidualKind {
    /// `output + input`
    Add,
    /// GRU cell with the output as input and the sublayer input as hidden state.
    Gru { mogrify: bool },
}

impl ResidualKind {
    #[must_use]
    pub fn from_flags(gru_gated: bool, mogrify: bool) -> Self {
        if gru_gated {
            Self::Gru { mogrify }
        } else {
            Self::Add
        }
    }

    pub fn init<B: Backend>(&self, dim: usize, device: &B::Device) -> Residual<B> {
        let gru = match self {
            Self::Add => None,
            Self::Gru { mogrify } => Some(GruGating::new(dim, *mogrify, device)),
        };
        Residual { gru }
    }
}

#[derive(Module, Debug)]
pub struct Residual<B: Backend> {
    gru: Option<GruGating<B>>,
}

impl<B: Backend> Residual<B> {
    /// Combines a sublayer's output with the input it was computed from.
    ///
    /// Both tensors are `[batch_size, seq_len, dim]`.
    pub fn merge(&self, output: Tensor<B, 3>, input: Tensor<B, 3>) -> Tensor<B, 3> {
        match &self.gru {
            Some(gru) => gru.forward(output, input),
            None => output + input,
        }
    }
}

/// Single-step GRU cell applied independently to every token.
#[derive(Module, Debug)]
pub struct GruGating<B: Backend> {
    /// Reset, update and candidate gates from the sublayer output.
    input_gates: Linear<B>,
    /// Reset, update and candidate gates from the hidden state.
    hidden_gates: Linear<B>,
    mogrifier: Option<Mogrifier<B>>,
    dim: usize,
}

impl<B: Backend> GruGating<B> {
    pub fn new(dim: usize, mogrify: bool, device: &B::Device) -> Self {
        Self {
            input_gates: LinearConfig::new(dim, 3 * dim).init(device),
            hidden_gates: LinearConfig::new(dim, 3 * dim).init(device),
            mogrifier: mogrify.then(|| MogrifierConfig::new(dim).init(device)),
            dim,
        }
    }

    pub fn forward(&self, output: Tensor<B, 3>, input: Tensor<B, 3>) -> Tensor<B, 3> {
        let (x, h) = match &self.mogrifier {
            Some(mogrifier) => mogrifier.forward(output, input),
            None => (output, input),
        };

        let d = self.dim;
        let gi = self.input_gates.forward(x);
        let gh = self.hidden_gates.forward(h.clone());

        let reset = sigmoid(gi.clone().narrow(2, 0, d) + gh.clone().narrow(2, 0, d));
        let update = sigmoid(gi.clone().narrow(2, d, d) + gh.clone().narrow(2, d, d));
        let candidate = (gi.narrow(2, 2 * d, d) + reset * gh.narrow(2, 2 * d, d)).tanh();

        // (1 - z) * n + z * h
        candidate.clone() + update * (h - candidate)
    }
}

#[derive(Config, Debug)]
pub struct MogrifierConfig {
    dim: usize,
    #[config(default = 5)]
    iters: usize,
    /// Rank of the factorized modulation matrices. Defaults to `dim / 4`.
    #[config(default = "None")]
    factorize_k: Option<usize>,
}

/// Lets the input and hidden state modulate each other before the recurrent cell.
#[derive(Module, Debug)]
pub struct Mogrifier<B: Backend> {
    /// Modulates the input from the hidden state.
    q: (Linear<B>, Linear<B>),
    /// Modulates the hidden state from the input.
    r: Option<(Linear<B>, Linear<B>)>,
    iters: usize,
}

impl MogrifierConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Mogrifier<B> {
        let k = self.factorize_k.unwrap_or(self.dim / 4).max(1);
        let factorized = || {
            (
                LinearConfig::new(self.dim, k).with_bias(false).init(device),
                LinearConfig::new(k, self.dim).init(device),
            )
        };

        Mogrifier {
            q: factorized(),
            r: (self.iters > 1).then(factorized),
            iters: self.iters,
        }
    }
}

impl<B: Backend> Mogrifier<B> {
    pub fn forward(&self, x: Tensor<B, 3>, h: Tensor<B, 3>) -> (Tensor<B, 3>, Tensor<B, 3>) {
        let (mut x, mut h) = (x, h);

        for round in 0..self.iters {
            if round % 2 == 0 {
                let (down, up) = &self.q;
                x = sigmoid(up.forward(down.forward(h.clone()))) * 2.0 * x;
            } else if let Some((down, up)) = &self.r {
                h = sigmoid(up.forward(down.forward(x.clone()))) * 2.0 * h;
            }
        }

        (x, h)
    }
}
