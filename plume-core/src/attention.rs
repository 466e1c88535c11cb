use candle_core::{Module, Result, Tensor};
use candle_nn::{linear, linear_no_bias, Linear, VarBuilder};

/// Multi-head attention used both for text self-attention and for latent-to-text
/// cross-attention.
#[derive(Debug)]
pub(crate) struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl Attention {
    /// `context_dim` is the width of the keys/values source; equal to `query_dim` for
    /// self-attention.
    pub fn new(
        vb: VarBuilder,
        query_dim: usize,
        context_dim: usize,
        num_heads: usize,
        bias: bool,
    ) -> Result<Self> {
        let proj = |in_dim: usize, name: &str| {
            if bias {
                linear(in_dim, query_dim, vb.pp(name))
            } else {
                linear_no_bias(in_dim, query_dim, vb.pp(name))
            }
        };
        let q_proj = proj(query_dim, "q_proj")?;
        let k_proj = proj(context_dim, "k_proj")?;
        let v_proj = proj(context_dim, "v_proj")?;
        let out_proj = linear(query_dim, query_dim, vb.pp("out_proj"))?;
        let head_dim = query_dim / num_heads;
        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            out_proj,
            num_heads,
            head_dim,
            scale: 1.0 / (head_dim as f64).sqrt(),
        })
    }

    fn split_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (batch, seq, _) = xs.dims3()?;
        xs.reshape((batch, seq, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    /// `xs`: (batch, seq, query_dim). `context`: (batch, ctx_seq, context_dim), or `None`
    /// for self-attention. `mask` is added to the attention logits.
    pub fn forward(
        &self,
        xs: &Tensor,
        context: Option<&Tensor>,
        mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let (batch, seq, dim) = xs.dims3()?;
        let context = context.unwrap_or(xs);
        let q = (self.split_heads(&self.q_proj.forward(xs)?)? * self.scale)?;
        let k = self.split_heads(&self.k_proj.forward(context)?)?;
        let v = self.split_heads(&self.v_proj.forward(context)?)?;

        let logits = q.matmul(&k.t()?)?;
        let logits = match mask {
            Some(mask) => logits.broadcast_add(mask)?,
            None => logits,
        };
        let weights = candle_nn::ops::softmax_last_dim(&logits)?;
        let out = weights
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((batch, seq, dim))?;
        self.out_proj.forward(&out)
    }
}
