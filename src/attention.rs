use crate::error::TranslatorError;
use burn::nn::{Embedding, EmbeddingConfig, Initializer, Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::softmax;

/// マスク位置に入れるスコア（softmax後にほぼ0になる）
pub const MASK_FILL_VALUE: f32 = -1e20;

/// 線形層の重み行列で共通のXavier一様初期化
pub(crate) fn xavier_uniform() -> Initializer {
    Initializer::XavierUniform { gain: 1.0 }
}

// ===== Multi-Head Attention =====

#[derive(Config, Debug)]
pub struct MultiHeadAttentionConfig {
    /// 埋め込み次元（n_headsで割り切れる必要がある）
    pub embed_dim: usize,
    /// ヘッド数
    pub n_heads: usize,
    /// 相対位置バイアスを使う場合の最大シーケンス長
    #[config(default = "None")]
    pub relative_positions: Option<usize>,
}

impl MultiHeadAttentionConfig {
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> crate::error::Result<MultiHeadAttention<B>> {
        if self.n_heads == 0 || self.embed_dim % self.n_heads != 0 {
            return Err(TranslatorError::InvalidDimensions {
                embed_dim: self.embed_dim,
                n_heads: self.n_heads,
            });
        }
        let head_dim = self.embed_dim / self.n_heads;

        // 各ヘッド用の重み行列（部分空間 → 部分空間、バイアスなし）
        let head_projection = || {
            LinearConfig::new(head_dim, head_dim)
                .with_bias(false)
                .with_initializer(xavier_uniform())
                .init::<B>(device)
        };
        let w_q = (0..self.n_heads).map(|_| head_projection()).collect();
        let w_k = (0..self.n_heads).map(|_| head_projection()).collect();
        let w_v = (0..self.n_heads).map(|_| head_projection()).collect();

        // 出力射影層 [embed_dim, embed_dim]
        let w_o = LinearConfig::new(self.embed_dim, self.embed_dim)
            .with_initializer(xavier_uniform())
            .init(device);

        // 相対距離 -(L-1)..=(L-1) ごとのヘッド別バイアス（0から学習）
        let relative_bias = self.relative_positions.map(|max_len| {
            EmbeddingConfig::new(2 * max_len.max(1) - 1, self.n_heads)
                .with_initializer(Initializer::Zeros)
                .init::<B>(device)
        });

        Ok(MultiHeadAttention {
            w_q,
            w_k,
            w_v,
            w_o,
            relative_bias,
            n_heads: self.n_heads,
            head_dim,
            max_relative_distance: self.relative_positions.unwrap_or(1).max(1) - 1,
        })
    }
}

/// Attentionの出力
pub struct AttentionOutput<B: Backend> {
    /// [batch_size, seq_len_q, embed_dim]
    pub context: Tensor<B, 3>,
    /// [batch_size, n_heads, seq_len_q, seq_len_k]
    pub weights: Tensor<B, 4>,
}

#[derive(Module, Debug)]
pub struct MultiHeadAttention<B: Backend> {
    w_q: Vec<Linear<B>>,
    w_k: Vec<Linear<B>>,
    w_v: Vec<Linear<B>>,
    w_o: Linear<B>,
    relative_bias: Option<Embedding<B>>,
    n_heads: usize,
    head_dim: usize,
    max_relative_distance: usize,
}

impl<B: Backend> MultiHeadAttention<B> {
    /// key/query/value: [batch_size, seq_len, embed_dim]
    ///
    /// mask は [batch_size or 1, 1, seq_len_q, seq_len_k] の0/1テンソルで、
    /// 0の位置はsoftmax前に `MASK_FILL_VALUE` で埋められる。
    /// key と value のシーケンス長は一致している必要がある。
    pub fn forward(
        &self,
        key: Tensor<B, 3>,
        query: Tensor<B, 3>,
        value: Tensor<B, 3>,
        mask: Option<Tensor<B, 4>>,
    ) -> AttentionOutput<B> {
        let [batch_size, seq_len_k, _] = key.dims();
        let seq_len_q = query.dims()[1];
        let device = query.device();

        // ヘッドをシーケンスの前へ: [batch_size, n_heads, seq_len, head_dim]
        let q = self.project_heads(query, &self.w_q);
        let k = self.project_heads(key, &self.w_k);
        let v = self.project_heads(value, &self.w_v);

        let scale = (self.head_dim as f32).sqrt();
        let mut scores = q.matmul(k.swap_dims(2, 3)) / scale;

        if let Some(table) = &self.relative_bias {
            scores = scores + self.relative_position_bias(table, seq_len_q, seq_len_k, &device);
        }

        if let Some(mask) = mask {
            let blocked = mask
                .equal_elem(0.0)
                .expand([batch_size, self.n_heads, seq_len_q, seq_len_k]);
            scores = scores.mask_fill(blocked, MASK_FILL_VALUE);
        }

        let weights = softmax(scores, 3);

        // ヘッドを結合 [batch_size, seq_len_q, embed_dim]
        let context = weights
            .clone()
            .matmul(v)
            .swap_dims(1, 2)
            .reshape([batch_size, seq_len_q, self.n_heads * self.head_dim]);

        AttentionOutput {
            context: self.w_o.forward(context),
            weights,
        }
    }

    fn project_heads(&self, x: Tensor<B, 3>, projections: &[Linear<B>]) -> Tensor<B, 4> {
        let [batch_size, seq_len, _] = x.dims();
        let x = x.reshape([batch_size, seq_len, self.n_heads, self.head_dim]);

        let heads: Vec<Tensor<B, 3>> = projections
            .iter()
            .enumerate()
            .map(|(head_idx, projection)| {
                let head = x
                    .clone()
                    .slice([
                        0..batch_size,
                        0..seq_len,
                        head_idx..head_idx + 1,
                        0..self.head_dim,
                    ])
                    .reshape([batch_size, seq_len, self.head_dim]);
                projection.forward(head)
            })
            .collect();

        Tensor::stack::<4>(heads, 1)
    }

    /// [1, n_heads, seq_len_q, seq_len_k] の相対位置バイアス
    fn relative_position_bias(
        &self,
        table: &Embedding<B>,
        seq_len_q: usize,
        seq_len_k: usize,
        device: &B::Device,
    ) -> Tensor<B, 4> {
        let max_distance = self.max_relative_distance as i64;
        let indices: Vec<i64> = (0..seq_len_q)
            .flat_map(|i| {
                (0..seq_len_k).map(move |j| {
                    (j as i64 - i as i64).clamp(-max_distance, max_distance) + max_distance
                })
            })
            .collect();

        let indices = Tensor::<B, 1, Int>::from_data(indices.as_slice(), device)
            .reshape([1, seq_len_q * seq_len_k]);

        table
            .forward(indices)
            .reshape([seq_len_q, seq_len_k, self.n_heads])
            .swap_dims(0, 2)
            .swap_dims(1, 2)
            .unsqueeze::<4>()
    }
}
