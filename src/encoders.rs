//! Encoders mapping `[batch, width]` inputs to `[batch, hidden]` latents.
//!
//! Sequence encoders view the input vector as a sequence of patches of
//! `patch_width` features (zero padded on the right).

use candle_core::{Module, Result, Tensor, D};
use candle_nn::{
    conv1d, linear, lstm, Conv1d, Conv1dConfig, Init, LSTMConfig, Linear, VarBuilder, LSTM, RNN,
};

use crate::config::ArchitectureConfig;
use crate::norm::{layer_norm, softmax_last_dim, LayerNorm};

/// Encoder architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderKind {
    /// Patch transformer.
    Transformer,
    /// Bidirectional LSTM over patches.
    BiLstm,
    /// Two dense layers.
    Mlp,
    /// 1-D residual convolutions.
    ResNet,
}

/// Apply dropout in training passes only.
fn dropout(x: &Tensor, p: f32, train: bool) -> Result<Tensor> {
    if train && p > 0.0 {
        candle_nn::ops::dropout(x, p)
    } else {
        Ok(x.clone())
    }
}

/// `[batch, width]` to `[batch, seq, patch]`.
fn to_patches(x: &Tensor, patch: usize) -> Result<Tensor> {
    let (batch, width) = x.dims2()?;
    let seq = width.div_ceil(patch);
    let pad = seq * patch - width;
    let x = if pad > 0 { x.pad_with_zeros(1, 0, pad)? } else { x.clone() };
    x.reshape((batch, seq, patch))
}

/// Any encoder.
pub enum Encoder {
    /// Patch transformer.
    Transformer(TransformerEncoder),
    /// Bidirectional LSTM.
    BiLstm(BiLstmEncoder),
    /// Feed-forward.
    Mlp(MlpEncoder),
    /// Residual CNN.
    ResNet(ResNetEncoder),
}

impl Encoder {
    /// Build an encoder of `kind` for inputs of `input_dim` features.
    pub fn new(
        kind: EncoderKind,
        input_dim: usize,
        arch: &ArchitectureConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(match kind {
            EncoderKind::Transformer => {
                Encoder::Transformer(TransformerEncoder::new(input_dim, arch, vb)?)
            }
            EncoderKind::BiLstm => Encoder::BiLstm(BiLstmEncoder::new(arch, vb)?),
            EncoderKind::Mlp => Encoder::Mlp(MlpEncoder::new(input_dim, arch, vb)?),
            EncoderKind::ResNet => Encoder::ResNet(ResNetEncoder::new(arch, vb)?),
        })
    }

    /// Latent `[batch, hidden]` for input `[batch, width]`.
    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        match self {
            Encoder::Transformer(e) => e.forward(x, train),
            Encoder::BiLstm(e) => e.forward(x, train),
            Encoder::Mlp(e) => e.forward(x, train),
            Encoder::ResNet(e) => e.forward(x, train),
        }
    }
}

/// Multi-head self-attention.
struct SelfAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl SelfAttention {
    fn new(d_model: usize, num_heads: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            q_proj: linear(d_model, d_model, vb.pp("q_proj"))?,
            k_proj: linear(d_model, d_model, vb.pp("k_proj"))?,
            v_proj: linear(d_model, d_model, vb.pp("v_proj"))?,
            o_proj: linear(d_model, d_model, vb.pp("o_proj"))?,
            num_heads,
            head_dim: d_model / num_heads,
        })
    }

    /// (batch, seq, d_model) -> (batch, seq, d_model)
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (batch, seq_len, _) = x.dims3()?;
        let shape = (batch, seq_len, self.num_heads, self.head_dim);

        let q = self.q_proj.forward(x)?.reshape(shape)?.transpose(1, 2)?.contiguous()?;
        let k = self.k_proj.forward(x)?.reshape(shape)?.transpose(1, 2)?.contiguous()?;
        let v = self.v_proj.forward(x)?.reshape(shape)?.transpose(1, 2)?.contiguous()?;

        let scale = (self.head_dim as f64).sqrt();
        let attn = (q.matmul(&k.t()?.contiguous()?)? / scale)?;
        let attn = softmax_last_dim(&attn)?;

        let out = attn.matmul(&v)?.transpose(1, 2)?;
        let out = out.reshape((batch, seq_len, self.num_heads * self.head_dim))?;
        self.o_proj.forward(&out)
    }
}

/// Post-norm attention + feed-forward block.
struct EncoderLayer {
    attention: SelfAttention,
    attention_norm: LayerNorm,
    ff_in: Linear,
    ff_out: Linear,
    ff_norm: LayerNorm,
    dropout: f32,
}

impl EncoderLayer {
    fn new(arch: &ArchitectureConfig, vb: VarBuilder) -> Result<Self> {
        let d = arch.d_model;
        Ok(Self {
            attention: SelfAttention::new(d, arch.num_heads, vb.pp("attention"))?,
            attention_norm: layer_norm(d, 1e-5, vb.pp("attention_norm"))?,
            ff_in: linear(d, arch.d_inner, vb.pp("ff_in"))?,
            ff_out: linear(arch.d_inner, d, vb.pp("ff_out"))?,
            ff_norm: layer_norm(d, 1e-5, vb.pp("ff_norm"))?,
            dropout: arch.dropout,
        })
    }

    fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let attn = dropout(&self.attention.forward(x)?, self.dropout, train)?;
        let x = self.attention_norm.forward(&(x + attn)?)?;

        let ff = self.ff_out.forward(&self.ff_in.forward(&x)?.relu()?)?;
        let ff = dropout(&ff, self.dropout, train)?;
        self.ff_norm.forward(&(x + ff)?)
    }
}

/// Patch embedding, learned positions, attention layers, mean pooling.
pub struct TransformerEncoder {
    patch_width: usize,
    embed: Linear,
    positions: Tensor,
    layers: Vec<EncoderLayer>,
    out: Linear,
    dropout: f32,
}

impl TransformerEncoder {
    /// Encoder for inputs of `input_dim` features.
    pub fn new(input_dim: usize, arch: &ArchitectureConfig, vb: VarBuilder) -> Result<Self> {
        let seq_len = input_dim.div_ceil(arch.patch_width);
        let positions = vb.get_with_hints(
            (1, seq_len, arch.d_model),
            "positions",
            Init::Randn {
                mean: 0.0,
                stdev: 0.02,
            },
        )?;
        let layers = (0..arch.num_layers)
            .map(|i| EncoderLayer::new(arch, vb.pp(format!("layers.{i}"))))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            patch_width: arch.patch_width,
            embed: linear(arch.patch_width, arch.d_model, vb.pp("embed"))?,
            positions,
            layers,
            out: linear(arch.d_model, arch.hidden_dim, vb.pp("out"))?,
            dropout: arch.dropout,
        })
    }

    fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let patches = to_patches(x, self.patch_width)?;
        let mut h = self.embed.forward(&patches)?.broadcast_add(&self.positions)?;
        h = dropout(&h, self.dropout, train)?;
        for layer in &self.layers {
            h = layer.forward(&h, train)?;
        }
        self.out.forward(&h.mean(1)?)
    }
}

/// Forward and backward LSTMs over patches, final states concatenated.
pub struct BiLstmEncoder {
    patch_width: usize,
    forward_lstm: LSTM,
    backward_lstm: LSTM,
    out: Linear,
    dropout: f32,
}

impl BiLstmEncoder {
    /// Encoder over patch sequences of any length.
    pub fn new(arch: &ArchitectureConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = arch.d_model;
        Ok(Self {
            patch_width: arch.patch_width,
            forward_lstm: lstm(arch.patch_width, hidden, LSTMConfig::default(), vb.pp("fwd"))?,
            backward_lstm: lstm(arch.patch_width, hidden, LSTMConfig::default(), vb.pp("bwd"))?,
            out: linear(2 * hidden, arch.hidden_dim, vb.pp("out"))?,
            dropout: arch.dropout,
        })
    }

    fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let patches = to_patches(x, self.patch_width)?;
        let seq_len = patches.dim(1)?;
        let reversed: Vec<u32> = (0..seq_len as u32).rev().collect();
        let reversed = Tensor::from_vec(reversed, seq_len, patches.device())?;
        let backward_input = patches.index_select(&reversed, 1)?;

        let last = |states: Vec<candle_nn::rnn::LSTMState>| -> Result<Tensor> {
            states
                .last()
                .map(|s| s.h().clone())
                .ok_or_else(|| candle_core::Error::Msg("empty sequence".into()))
        };
        let h_fwd = last(self.forward_lstm.seq(&patches)?)?;
        let h_bwd = last(self.backward_lstm.seq(&backward_input)?)?;

        let h = Tensor::cat(&[h_fwd, h_bwd], D::Minus1)?;
        self.out.forward(&dropout(&h, self.dropout, train)?)
    }
}

/// Two dense layers with ReLU and dropout.
pub struct MlpEncoder {
    fc1: Linear,
    fc2: Linear,
    dropout: f32,
}

impl MlpEncoder {
    /// Encoder for inputs of `input_dim` features.
    pub fn new(input_dim: usize, arch: &ArchitectureConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            fc1: linear(input_dim, arch.d_inner, vb.pp("fc1"))?,
            fc2: linear(arch.d_inner, arch.hidden_dim, vb.pp("fc2"))?,
            dropout: arch.dropout,
        })
    }

    fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let h = dropout(&self.fc1.forward(x)?.relu()?, self.dropout, train)?;
        dropout(&self.fc2.forward(&h)?.relu()?, self.dropout, train)
    }
}

/// Two same-width convolutions with an identity shortcut.
struct ResidualBlock {
    conv1: Conv1d,
    conv2: Conv1d,
}

impl ResidualBlock {
    fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        let cfg = Conv1dConfig {
            padding: 1,
            ..Default::default()
        };
        Ok(Self {
            conv1: conv1d(channels, channels, 3, cfg, vb.pp("conv1"))?,
            conv2: conv1d(channels, channels, 3, cfg, vb.pp("conv2"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.conv2.forward(&self.conv1.forward(x)?.relu()?)?;
        (x + h)?.relu()
    }
}

/// Convolutional stem, residual blocks, global average pooling.
pub struct ResNetEncoder {
    stem: Conv1d,
    blocks: Vec<ResidualBlock>,
    out: Linear,
    dropout: f32,
}

impl ResNetEncoder {
    /// Encoder over the raw feature axis; input width is free.
    pub fn new(arch: &ArchitectureConfig, vb: VarBuilder) -> Result<Self> {
        let channels = arch.hidden_dim;
        let cfg = Conv1dConfig {
            padding: 1,
            ..Default::default()
        };
        let blocks = (0..arch.num_layers)
            .map(|i| ResidualBlock::new(channels, vb.pp(format!("blocks.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            stem: conv1d(1, channels, 3, cfg, vb.pp("stem"))?,
            blocks,
            out: linear(channels, arch.hidden_dim, vb.pp("out"))?,
            dropout: arch.dropout,
        })
    }

    fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let mut h = self.stem.forward(&x.unsqueeze(1)?)?.relu()?;
        for block in &self.blocks {
            h = block.forward(&h)?;
        }
        let pooled = dropout(&h.mean(D::Minus1)?, self.dropout, train)?;
        self.out.forward(&pooled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn arch() -> ArchitectureConfig {
        ArchitectureConfig {
            d_model: 8,
            d_inner: 16,
            hidden_dim: 6,
            num_layers: 1,
            num_heads: 2,
            dropout: 0.1,
            patch_width: 4,
            num_classes: None,
        }
    }

    fn check_shape(kind: EncoderKind) {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let encoder = Encoder::new(kind, 10, &arch(), vb).unwrap();

        let x = Tensor::randn(0f32, 1.0, (3, 10), &device).unwrap();
        let latent = encoder.forward(&x, true).unwrap();
        assert_eq!(latent.dims(), &[3, 6], "{kind:?}");
    }

    #[test]
    fn test_transformer_shape() {
        check_shape(EncoderKind::Transformer);
    }

    #[test]
    fn test_bilstm_shape() {
        check_shape(EncoderKind::BiLstm);
    }

    #[test]
    fn test_mlp_shape() {
        check_shape(EncoderKind::Mlp);
    }

    #[test]
    fn test_resnet_shape() {
        check_shape(EncoderKind::ResNet);
    }

    #[test]
    fn test_patches_pad_with_zeros() {
        let x = Tensor::new(&[[1f32, 2.0, 3.0, 4.0, 5.0]], &Device::Cpu).unwrap();
        let patches = to_patches(&x, 2).unwrap();
        assert_eq!(patches.dims(), &[1, 3, 2]);
        assert_eq!(
            patches.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            vec![1.0, 2.0, 3.0, 4.0, 5.0, 0.0]
        );
    }

    #[test]
    fn test_eval_forward_is_deterministic() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let encoder = Encoder::new(EncoderKind::Transformer, 12, &arch(), vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 12), &device).unwrap();

        let a = encoder.forward(&x, false).unwrap().to_vec2::<f32>().unwrap();
        let b = encoder.forward(&x, false).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_encoders_register_parameters() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let _ = Encoder::new(EncoderKind::BiLstm, 8, &arch(), vb).unwrap();
        assert!(!varmap.all_vars().is_empty());
    }

    fn check_every_parameter_trains(kind: EncoderKind) {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let arch = ArchitectureConfig {
            dropout: 0.0,
            ..arch()
        };
        let encoder = Encoder::new(kind, 10, &arch, vb.pp("encoder")).unwrap();
        let head = linear(arch.hidden_dim, 3, vb.pp("head")).unwrap();

        let x = Tensor::randn(0f32, 1.0, (4, 10), &device).unwrap();
        let targets = Tensor::new(&[0u32, 1, 2, 1], &device).unwrap();
        let logits = head.forward(&encoder.forward(&x, true).unwrap()).unwrap();
        let loss = candle_nn::loss::cross_entropy(&logits, &targets).unwrap();
        let grads = loss.backward().unwrap();

        let data = varmap.data().lock().unwrap();
        assert!(!data.is_empty());
        for (name, var) in data.iter() {
            assert!(
                grads.get(var.as_tensor()).is_some(),
                "{kind:?}: no gradient for {name}"
            );
        }
    }

    #[test]
    fn test_transformer_parameters_all_receive_gradients() {
        check_every_parameter_trains(EncoderKind::Transformer);
    }

    #[test]
    fn test_bilstm_parameters_all_receive_gradients() {
        check_every_parameter_trains(EncoderKind::BiLstm);
    }

    #[test]
    fn test_mlp_parameters_all_receive_gradients() {
        check_every_parameter_trains(EncoderKind::Mlp);
    }

    #[test]
    fn test_resnet_parameters_all_receive_gradients() {
        check_every_parameter_trains(EncoderKind::ResNet);
    }
}
