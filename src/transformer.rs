use crate::attention::{xavier_uniform, MultiHeadAttention, MultiHeadAttentionConfig};
use crate::config::Activation;
use crate::error::TranslatorError;
use burn::nn::{
    Dropout, DropoutConfig, Embedding, EmbeddingConfig, LayerNorm, LayerNormConfig, Linear,
    LinearConfig,
};
use burn::prelude::*;
use burn::tensor::activation::{gelu, relu, softmax};

// ===== 位置エンコーディング =====

/// 正弦波位置テーブルを行優先で計算（[max_seq_len, embed_dim]）
///
/// 偶数列 2i: sin(pos / 10000^(2i/D))、奇数列 2i+1: cos(pos / 10000^(2(i+1)/D))
pub fn positional_table(max_seq_len: usize, embed_dim: usize) -> Vec<f32> {
    let mut table = Vec::with_capacity(max_seq_len * embed_dim);

    for pos in 0..max_seq_len {
        for col in 0..embed_dim {
            let value = if col % 2 == 0 {
                let angle = pos as f64 / 10000_f64.powf(col as f64 / embed_dim as f64);
                angle.sin()
            } else {
                let angle = pos as f64 / 10000_f64.powf((col + 1) as f64 / embed_dim as f64);
                angle.cos()
            };
            table.push(value as f32);
        }
    }

    table
}

#[derive(Module, Debug)]
pub struct PositionalEncoder<B: Backend> {
    /// [1, max_seq_len, embed_dim]（学習しない）
    table: Tensor<B, 3>,
    embed_dim: usize,
    max_seq_len: usize,
}

impl<B: Backend> PositionalEncoder<B> {
    pub fn new(max_seq_len: usize, embed_dim: usize, device: &B::Device) -> Self {
        let values = positional_table(max_seq_len, embed_dim);
        let table = Tensor::<B, 1>::from_floats(values.as_slice(), device)
            .reshape([1, max_seq_len, embed_dim]);

        Self {
            table,
            embed_dim,
            max_seq_len,
        }
    }

    /// 埋め込みをsqrt(D)倍してから先頭seq_len行の位置テーブルを加える
    ///
    /// seq_len は max_seq_len 以下であること（`check_len` で確認できる）
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let seq_len = x.dims()[1];
        let scale = (self.embed_dim as f32).sqrt();

        let positions = self
            .table
            .clone()
            .slice([0..1, 0..seq_len, 0..self.embed_dim]);

        x * scale + positions
    }

    pub fn table(&self) -> Tensor<B, 3> {
        self.table.clone()
    }

    /// 位置テーブルに収まる長さか確認する
    pub fn check_len(&self, seq_len: usize) -> crate::error::Result<()> {
        if seq_len > self.max_seq_len {
            return Err(TranslatorError::Sequence(format!(
                "シーケンス長 {seq_len} が最大シーケンス長 {} を超えています",
                self.max_seq_len
            )));
        }
        Ok(())
    }
}

// ===== FeedForward =====

#[derive(Module, Debug)]
pub struct FeedForward<B: Backend> {
    w_1: Linear<B>,
    w_2: Linear<B>,
    use_gelu: bool,
}

impl<B: Backend> FeedForward<B> {
    pub fn new(
        embed_dim: usize,
        expansion_factor: usize,
        activation: Activation,
        device: &B::Device,
    ) -> Self {
        let hidden_dim = expansion_factor * embed_dim;
        let w_1 = LinearConfig::new(embed_dim, hidden_dim)
            .with_initializer(xavier_uniform())
            .init(device);
        let w_2 = LinearConfig::new(hidden_dim, embed_dim)
            .with_initializer(xavier_uniform())
            .init(device);

        Self {
            w_1,
            w_2,
            use_gelu: activation == Activation::Gelu,
        }
    }

    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        // 第1層: D → expansion_factor * D
        let hidden = self.w_1.forward(x);

        let activated = if self.use_gelu {
            gelu(hidden)
        } else {
            relu(hidden)
        };

        // 第2層: expansion_factor * D → D
        self.w_2.forward(activated)
    }
}

// ===== Transformer Block =====

/// ブロック出力とそのAttention重み
pub struct BlockOutput<B: Backend> {
    pub hidden: Tensor<B, 3>,
    pub weights: Tensor<B, 4>,
}

#[derive(Module, Debug)]
pub struct TransformerBlock<B: Backend> {
    attention: MultiHeadAttention<B>,
    feed_forward: FeedForward<B>,
    norm1: LayerNorm<B>,
    norm2: LayerNorm<B>,
    dropout1: Dropout,
    dropout2: Dropout,
    norm_first: bool,
}

impl<B: Backend> TransformerBlock<B> {
    pub fn new(config: &TransformerConfig, device: &B::Device) -> crate::error::Result<Self> {
        Ok(Self {
            attention: config.attention_config().init(device)?,
            feed_forward: FeedForward::new(
                config.embed_dim,
                config.expansion_factor,
                config.activation,
                device,
            ),
            norm1: LayerNormConfig::new(config.embed_dim).init(device),
            norm2: LayerNormConfig::new(config.embed_dim).init(device),
            dropout1: DropoutConfig::new(config.dropout).init(),
            dropout2: DropoutConfig::new(config.dropout).init(),
            norm_first: config.norm_first,
        })
    }

    /// 自己注意（key = query = value = x）
    pub fn forward_self(&self, x: Tensor<B, 3>, mask: Option<Tensor<B, 4>>) -> BlockOutput<B> {
        self.apply(None, x, mask)
    }

    /// 外部メモリ（Encoder出力）へのAttention。queryが残差の流れになる
    pub fn forward(
        &self,
        key: Tensor<B, 3>,
        query: Tensor<B, 3>,
        value: Tensor<B, 3>,
        mask: Option<Tensor<B, 4>>,
    ) -> Tensor<B, 3> {
        self.apply(Some((key, value)), query, mask).hidden
    }

    fn apply(
        &self,
        memory: Option<(Tensor<B, 3>, Tensor<B, 3>)>,
        query: Tensor<B, 3>,
        mask: Option<Tensor<B, 4>>,
    ) -> BlockOutput<B> {
        if self.norm_first {
            // Pre-LN方式: Layer Norm → Attention → 残差接続
            let normalized = self.norm1.forward(query.clone());
            let (key, value) = memory.unwrap_or_else(|| (normalized.clone(), normalized.clone()));
            let attention = self.attention.forward(key, normalized, value, mask);
            let residual1 = query + self.dropout1.forward(attention.context);

            let ff_output = self.feed_forward.forward(self.norm2.forward(residual1.clone()));
            let residual2 = residual1 + self.dropout2.forward(ff_output);

            BlockOutput {
                hidden: residual2,
                weights: attention.weights,
            }
        } else {
            // Post-LN方式: Attention → 残差接続 → Layer Norm → Dropout
            let (key, value) = memory.unwrap_or_else(|| (query.clone(), query.clone()));
            let attention = self.attention.forward(key, query.clone(), value, mask);
            let normalized1 = self
                .dropout1
                .forward(self.norm1.forward(attention.context + query));

            let ff_output = self.feed_forward.forward(normalized1.clone());
            let normalized2 = self
                .dropout2
                .forward(self.norm2.forward(ff_output + normalized1));

            BlockOutput {
                hidden: normalized2,
                weights: attention.weights,
            }
        }
    }
}

// ===== Decoder Block =====

#[derive(Module, Debug)]
pub struct DecoderBlock<B: Backend> {
    self_attention: MultiHeadAttention<B>,
    norm: LayerNorm<B>,
    dropout: Dropout,
    transformer_block: TransformerBlock<B>,
    norm_first: bool,
}

impl<B: Backend> DecoderBlock<B> {
    pub fn new(config: &TransformerConfig, device: &B::Device) -> crate::error::Result<Self> {
        Ok(Self {
            self_attention: config.attention_config().init(device)?,
            norm: LayerNormConfig::new(config.embed_dim).init(device),
            dropout: DropoutConfig::new(config.dropout).init(),
            transformer_block: TransformerBlock::new(config, device)?,
            norm_first: config.norm_first,
        })
    }

    /// x: Decoderの状態 [batch, tgt_len, D]、encoder_output: [batch, src_len, D]
    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        encoder_output: Tensor<B, 3>,
        mask: Tensor<B, 4>,
    ) -> Tensor<B, 3> {
        // 1. Self-Attention（因果マスク付き）
        let value = if self.norm_first {
            let normalized = self.norm.forward(x.clone());
            let attention = self.self_attention.forward(
                normalized.clone(),
                normalized.clone(),
                normalized,
                Some(mask),
            );
            x + self.dropout.forward(attention.context)
        } else {
            let attention = self
                .self_attention
                .forward(x.clone(), x.clone(), x.clone(), Some(mask));
            self.dropout.forward(self.norm.forward(attention.context + x))
        };

        // 2. Encoderの出力を参照するTransformer Block
        self.transformer_block
            .forward(encoder_output.clone(), value, encoder_output, None)
    }
}

// ===== Encoder =====

#[derive(Module, Debug)]
pub struct Encoder<B: Backend> {
    embedding: Embedding<B>,
    positional_encoder: PositionalEncoder<B>,
    layers: Vec<TransformerBlock<B>>,
    final_norm: Option<LayerNorm<B>>,
}

impl<B: Backend> Encoder<B> {
    pub fn new(config: &TransformerConfig, device: &B::Device) -> crate::error::Result<Self> {
        let layers = (0..config.num_layers)
            .map(|_| TransformerBlock::new(config, device))
            .collect::<crate::error::Result<Vec<_>>>()?;

        Ok(Self {
            embedding: EmbeddingConfig::new(config.src_vocab_size, config.embed_dim).init(device),
            positional_encoder: PositionalEncoder::new(
                config.seq_length,
                config.embed_dim,
                device,
            ),
            layers,
            final_norm: config
                .norm_first
                .then(|| LayerNormConfig::new(config.embed_dim).init(device)),
        })
    }

    pub fn forward(&self, src_tokens: Tensor<B, 2, Int>) -> Tensor<B, 3> {
        self.run(src_tokens).0
    }

    pub fn check_len(&self, src_len: usize) -> crate::error::Result<()> {
        self.positional_encoder.check_len(src_len)
    }

    /// 各層の自己注意重み [batch, n_heads, src_len, src_len]
    pub fn attention_maps(&self, src_tokens: Tensor<B, 2, Int>) -> Vec<Tensor<B, 4>> {
        self.run(src_tokens).1
    }

    fn run(&self, src_tokens: Tensor<B, 2, Int>) -> (Tensor<B, 3>, Vec<Tensor<B, 4>>) {
        let embedded = self.embedding.forward(src_tokens);
        let mut x = self.positional_encoder.forward(embedded);
        let mut maps = Vec::with_capacity(self.layers.len());

        for layer in &self.layers {
            let output = layer.forward_self(x, None);
            x = output.hidden;
            maps.push(output.weights);
        }

        if let Some(norm) = &self.final_norm {
            x = norm.forward(x);
        }

        (x, maps)
    }
}

// ===== Decoder =====

#[derive(Module, Debug)]
pub struct Decoder<B: Backend> {
    embedding: Embedding<B>,
    positional_encoder: PositionalEncoder<B>,
    dropout: Dropout,
    layers: Vec<DecoderBlock<B>>,
    final_norm: Option<LayerNorm<B>>,
    fc_out: Linear<B>,
}

impl<B: Backend> Decoder<B> {
    pub fn new(config: &TransformerConfig, device: &B::Device) -> crate::error::Result<Self> {
        let layers = (0..config.num_layers)
            .map(|_| DecoderBlock::new(config, device))
            .collect::<crate::error::Result<Vec<_>>>()?;

        Ok(Self {
            embedding: EmbeddingConfig::new(config.target_vocab_size, config.embed_dim)
                .init(device),
            positional_encoder: PositionalEncoder::new(
                config.seq_length,
                config.embed_dim,
                device,
            ),
            dropout: DropoutConfig::new(config.dropout).init(),
            layers,
            final_norm: config
                .norm_first
                .then(|| LayerNormConfig::new(config.embed_dim).init(device)),
            fc_out: LinearConfig::new(config.embed_dim, config.target_vocab_size)
                .with_initializer(xavier_uniform())
                .init(device),
        })
    }

    pub fn check_len(&self, tgt_len: usize) -> crate::error::Result<()> {
        self.positional_encoder.check_len(tgt_len)
    }

    /// 戻り値は語彙上の確率分布 [batch, tgt_len, target_vocab_size]（softmax適用済み）
    pub fn forward(
        &self,
        tgt_tokens: Tensor<B, 2, Int>,
        encoder_output: Tensor<B, 3>,
        mask: Tensor<B, 4>,
    ) -> Tensor<B, 3> {
        let embedded = self.embedding.forward(tgt_tokens);
        let mut x = self.dropout.forward(self.positional_encoder.forward(embedded));

        for layer in &self.layers {
            x = layer.forward(x, encoder_output.clone(), mask.clone());
        }

        if let Some(norm) = &self.final_norm {
            x = norm.forward(x);
        }

        softmax(self.fc_out.forward(x), 2)
    }
}

// ===== Transformer =====

#[derive(Config, Debug)]
pub struct TransformerConfig {
    pub embed_dim: usize,
    pub src_vocab_size: usize,
    pub target_vocab_size: usize,
    /// 位置テーブルの長さ（入力シーケンスの最大長）
    pub seq_length: usize,
    #[config(default = 2)]
    pub num_layers: usize,
    #[config(default = 4)]
    pub expansion_factor: usize,
    #[config(default = 8)]
    pub n_heads: usize,
    #[config(default = 0.2)]
    pub dropout: f64,
    #[config(default = "Activation::Relu")]
    pub activation: Activation,
    #[config(default = false)]
    pub norm_first: bool,
    #[config(default = false)]
    pub relative_attention: bool,
}

impl TransformerConfig {
    /// 構成を検証してモデルを構築する
    pub fn init<B: Backend>(&self, device: &B::Device) -> crate::error::Result<Transformer<B>> {
        self.validate()?;

        Ok(Transformer {
            encoder: Encoder::new(self, device)?,
            decoder: Decoder::new(self, device)?,
            target_vocab_size: self.target_vocab_size,
            max_seq_len: self.seq_length,
        })
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        if self.n_heads == 0 || self.embed_dim % self.n_heads != 0 {
            return Err(TranslatorError::InvalidDimensions {
                embed_dim: self.embed_dim,
                n_heads: self.n_heads,
            });
        }
        if self.embed_dim % 2 != 0 {
            return Err(TranslatorError::Config(format!(
                "embed_dim={} は偶数である必要があります",
                self.embed_dim
            )));
        }
        if self.src_vocab_size == 0 || self.target_vocab_size == 0 || self.seq_length == 0 {
            return Err(TranslatorError::Config(
                "語彙サイズとシーケンス長は1以上が必要です".to_string(),
            ));
        }
        Ok(())
    }

    fn attention_config(&self) -> MultiHeadAttentionConfig {
        MultiHeadAttentionConfig::new(self.embed_dim, self.n_heads).with_relative_positions(
            self.relative_attention.then_some(self.seq_length),
        )
    }

    /// 学習パラメータをレイヤーパス順に列挙（チェックポイント検証用）
    pub fn parameter_shapes(&self) -> Vec<(String, Vec<usize>)> {
        let d = self.embed_dim;
        let head_dim = d / self.n_heads.max(1);
        let hidden = self.expansion_factor * d;
        let mut shapes = Vec::new();

        let attention = |shapes: &mut Vec<(String, Vec<usize>)>, prefix: &str| {
            for name in ["w_q", "w_k", "w_v"] {
                for head in 0..self.n_heads {
                    shapes.push((
                        format!("{prefix}.{name}.{head}.weight"),
                        vec![head_dim, head_dim],
                    ));
                }
            }
            shapes.push((format!("{prefix}.w_o.weight"), vec![d, d]));
            shapes.push((format!("{prefix}.w_o.bias"), vec![d]));
            if self.relative_attention {
                shapes.push((
                    format!("{prefix}.relative_bias.weight"),
                    vec![2 * self.seq_length - 1, self.n_heads],
                ));
            }
        };
        let layer_norm = |shapes: &mut Vec<(String, Vec<usize>)>, prefix: &str| {
            shapes.push((format!("{prefix}.gamma"), vec![d]));
            shapes.push((format!("{prefix}.beta"), vec![d]));
        };
        let block = |shapes: &mut Vec<(String, Vec<usize>)>, prefix: &str| {
            attention(shapes, &format!("{prefix}.attention"));
            shapes.push((format!("{prefix}.feed_forward.w_1.weight"), vec![d, hidden]));
            shapes.push((format!("{prefix}.feed_forward.w_1.bias"), vec![hidden]));
            shapes.push((format!("{prefix}.feed_forward.w_2.weight"), vec![hidden, d]));
            shapes.push((format!("{prefix}.feed_forward.w_2.bias"), vec![d]));
            layer_norm(shapes, &format!("{prefix}.norm1"));
            layer_norm(shapes, &format!("{prefix}.norm2"));
        };

        shapes.push((
            "encoder.embedding.weight".to_string(),
            vec![self.src_vocab_size, d],
        ));
        for layer in 0..self.num_layers {
            block(&mut shapes, &format!("encoder.layers.{layer}"));
        }
        if self.norm_first {
            layer_norm(&mut shapes, "encoder.final_norm");
        }

        shapes.push((
            "decoder.embedding.weight".to_string(),
            vec![self.target_vocab_size, d],
        ));
        for layer in 0..self.num_layers {
            let prefix = format!("decoder.layers.{layer}");
            attention(&mut shapes, &format!("{prefix}.self_attention"));
            layer_norm(&mut shapes, &format!("{prefix}.norm"));
            block(&mut shapes, &format!("{prefix}.transformer_block"));
        }
        if self.norm_first {
            layer_norm(&mut shapes, "decoder.final_norm");
        }
        shapes.push((
            "decoder.fc_out.weight".to_string(),
            vec![d, self.target_vocab_size],
        ));
        shapes.push((
            "decoder.fc_out.bias".to_string(),
            vec![self.target_vocab_size],
        ));

        shapes
    }
}

#[derive(Module, Debug)]
pub struct Transformer<B: Backend> {
    encoder: Encoder<B>,
    decoder: Decoder<B>,
    target_vocab_size: usize,
    max_seq_len: usize,
}

impl<B: Backend> Transformer<B> {
    /// 因果マスク [batch, 1, tgt_len, tgt_len]（下三角が1）
    pub fn make_mask(&self, target: &Tensor<B, 2, Int>) -> Tensor<B, 4> {
        let [batch_size, target_len] = target.dims();

        let mut values = Vec::with_capacity(target_len * target_len);
        for row in 0..target_len {
            for col in 0..target_len {
                values.push(if col <= row { 1.0_f32 } else { 0.0 });
            }
        }

        Tensor::<B, 1>::from_floats(values.as_slice(), &target.device())
            .reshape([1, 1, target_len, target_len])
            .expand([batch_size, 1, target_len, target_len])
    }

    /// 訓練・検証時のフォワードパス（Teacher Forcing）
    ///
    /// src / target が位置テーブルより長い場合は Sequence エラー
    pub fn forward(
        &self,
        src: Tensor<B, 2, Int>,
        target: Tensor<B, 2, Int>,
    ) -> crate::error::Result<Tensor<B, 3>> {
        self.encoder.check_len(src.dims()[1])?;
        self.decoder.check_len(target.dims()[1])?;

        let mask = self.make_mask(&target);
        let encoder_output = self.encoder.forward(src);

        Ok(self.decoder.forward(target, encoder_output, mask))
    }

    /// 貪欲法による自己回帰生成
    ///
    /// ソース長と同じ数だけトークンを生成し、[batch, src_len] で返す。
    /// EOSでの打ち切りは行わない（呼び出し側で処理する）。
    pub fn decode(
        &self,
        src: Tensor<B, 2, Int>,
        target_prefix: Tensor<B, 2, Int>,
    ) -> crate::error::Result<Tensor<B, 2, Int>> {
        let [batch_size, seq_len] = src.dims();
        let [prefix_batch, prefix_len] = target_prefix.dims();

        if seq_len == 0 || prefix_len == 0 || prefix_batch != batch_size {
            return Err(TranslatorError::Sequence(format!(
                "不正な入力形状: src=[{batch_size}, {seq_len}], prefix=[{prefix_batch}, {prefix_len}]"
            )));
        }
        let longest = prefix_len + seq_len - 1;
        if seq_len > self.max_seq_len || longest > self.max_seq_len {
            return Err(TranslatorError::Sequence(format!(
                "生成長 {longest} が最大シーケンス長 {} を超えています",
                self.max_seq_len
            )));
        }

        let encoder_output = self.encoder.forward(src);
        let mut sequence = target_prefix;
        let mut generated = Vec::with_capacity(seq_len);

        for _ in 0..seq_len {
            let current_len = sequence.dims()[1];
            let mask = self.make_mask(&sequence);

            let probabilities =
                self.decoder
                    .forward(sequence.clone(), encoder_output.clone(), mask);

            // 最終位置の分布から最も確率の高いトークンを取得 [batch, 1]
            let next_token = probabilities
                .slice([
                    0..batch_size,
                    current_len - 1..current_len,
                    0..self.target_vocab_size,
                ])
                .reshape([batch_size, self.target_vocab_size])
                .argmax(1);

            sequence = Tensor::cat(vec![sequence, next_token.clone()], 1);
            generated.push(next_token);
        }

        Ok(Tensor::cat(generated, 1))
    }

    /// Encoder各層の自己注意重み
    pub fn encoder_attention(
        &self,
        src: Tensor<B, 2, Int>,
    ) -> crate::error::Result<Vec<Tensor<B, 4>>> {
        self.encoder.check_len(src.dims()[1])?;
        Ok(self.encoder.attention_maps(src))
    }

    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }
}
