//! オプティマイザの構築
//!
//! Adam / AdamW はBurn組み込み、RAdam は `SimpleOptimizer` として実装する。

use crate::config::{OptimizerKind, TrainSettings};
use burn::grad_clipping::GradientClippingConfig;
use burn::module::AutodiffModule;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::{AdamConfig, AdamWConfig, Optimizer, SimpleOptimizer};
use burn::prelude::*;
use burn::LearningRate;
use burn::record::Record;
use burn::tensor::backend::AutodiffBackend;

/// 勾配クリッピングの最大ノルム
pub const MAX_GRAD_NORM: f32 = 1.0;

fn grad_clipping(settings: &TrainSettings) -> Option<GradientClippingConfig> {
    settings
        .use_gradient_clipping
        .then_some(GradientClippingConfig::Norm(MAX_GRAD_NORM))
}

/// Adam（β=0.9/0.98, ε=1e-9）
pub fn adam<B: AutodiffBackend, M: AutodiffModule<B>>(
    settings: &TrainSettings,
) -> impl Optimizer<M, B> {
    AdamConfig::new()
        .with_beta_1(0.9)
        .with_beta_2(0.98)
        .with_epsilon(1e-9)
        .with_grad_clipping(grad_clipping(settings))
        .init()
}

/// AdamW（weight decay 1e-5）
pub fn adam_w<B: AutodiffBackend, M: AutodiffModule<B>>(
    settings: &TrainSettings,
) -> impl Optimizer<M, B> {
    AdamWConfig::new()
        .with_weight_decay(1e-5)
        .with_grad_clipping(grad_clipping(settings))
        .init()
}

/// RAdam（β=0.9/0.999, ε=1e-8）
pub fn radam<B: AutodiffBackend, M: AutodiffModule<B>>(
    settings: &TrainSettings,
) -> OptimizerAdaptor<RAdam, M, B> {
    RAdamConfig::new()
        .with_grad_clipping(grad_clipping(settings))
        .init()
}

/// 選択中のオプティマイザ名（ログ・メタデータ用）
pub fn optimizer_name(kind: OptimizerKind) -> &'static str {
    match kind {
        OptimizerKind::Adam => "Adam",
        OptimizerKind::AdamW => "AdamW",
        OptimizerKind::RAdam => "RAdam",
    }
}

// ===== RAdam =====

#[derive(Config)]
pub struct RAdamConfig {
    #[config(default = 0.9)]
    pub beta_1: f32,
    #[config(default = 0.999)]
    pub beta_2: f32,
    #[config(default = 1e-8)]
    pub epsilon: f32,
    pub grad_clipping: Option<GradientClippingConfig>,
}

impl RAdamConfig {
    pub fn init<B: AutodiffBackend, M: AutodiffModule<B>>(&self) -> OptimizerAdaptor<RAdam, M, B> {
        let optim = RAdam {
            beta_1: self.beta_1,
            beta_2: self.beta_2,
            epsilon: self.epsilon,
        };

        let mut optim = OptimizerAdaptor::from(optim);
        if let Some(config) = &self.grad_clipping {
            optim = optim.with_grad_clipping(config.init());
        }
        optim
    }
}

/// Rectified Adam
///
/// 分散の推定が不安定な序盤（ρ_t ≤ 5）はモーメンタムSGDとして更新し、
/// 以降は補正係数 r_t を掛けた適応的な更新に切り替える。
#[derive(Clone, Debug)]
pub struct RAdam {
    beta_1: f32,
    beta_2: f32,
    epsilon: f32,
}

/// パラメータごとのモーメント
#[derive(Record, Clone)]
pub struct RAdamState<B: Backend, const D: usize> {
    pub moment_1: Tensor<B, D>,
    pub moment_2: Tensor<B, D>,
    pub time: usize,
}

impl RAdam {
    /// 近似SMAの最大長 ρ_∞
    fn rho_inf(&self) -> f32 {
        2.0 / (1.0 - self.beta_2) - 1.0
    }

    /// ステップtでのSMA長 ρ_t
    fn rho(&self, time: usize) -> f32 {
        let beta_2_t = self.beta_2.powi(time as i32);
        self.rho_inf() - 2.0 * time as f32 * beta_2_t / (1.0 - beta_2_t)
    }
}

impl<B: Backend> SimpleOptimizer<B> for RAdam {
    type State<const D: usize> = RAdamState<B, D>;

    fn step<const D: usize>(
        &self,
        lr: LearningRate,
        tensor: Tensor<B, D>,
        grad: Tensor<B, D>,
        state: Option<Self::State<D>>,
    ) -> (Tensor<B, D>, Option<Self::State<D>>) {
        let (moment_1, moment_2, time) = match state {
            Some(state) => (
                state
                    .moment_1
                    .mul_scalar(self.beta_1)
                    .add(grad.clone().mul_scalar(1.0 - self.beta_1)),
                state
                    .moment_2
                    .mul_scalar(self.beta_2)
                    .add(grad.powf_scalar(2.0).mul_scalar(1.0 - self.beta_2)),
                state.time + 1,
            ),
            None => (
                grad.clone().mul_scalar(1.0 - self.beta_1),
                grad.powf_scalar(2.0).mul_scalar(1.0 - self.beta_2),
                1,
            ),
        };

        let bias_correction_1 = 1.0 - self.beta_1.powi(time as i32);
        let moment_1_corrected = moment_1.clone().div_scalar(bias_correction_1);

        let rho_inf = self.rho_inf();
        let rho_t = self.rho(time);

        let update = if rho_t > 5.0 {
            let bias_correction_2 = 1.0 - self.beta_2.powi(time as i32);
            let rectification = ((rho_t - 4.0) * (rho_t - 2.0) * rho_inf
                / ((rho_inf - 4.0) * (rho_inf - 2.0) * rho_t))
                .sqrt();

            let adaptive_lr = moment_2
                .clone()
                .sqrt()
                .add_scalar(self.epsilon)
                .recip()
                .mul_scalar(bias_correction_2.sqrt());

            moment_1_corrected
                .mul(adaptive_lr)
                .mul_scalar(rectification)
        } else {
            moment_1_corrected
        };

        let state = RAdamState {
            moment_1,
            moment_2,
            time,
        };

        (tensor.sub(update.mul_scalar(lr)), Some(state))
    }

    fn to_device<const D: usize>(mut state: Self::State<D>, device: &B::Device) -> Self::State<D> {
        state.moment_1 = state.moment_1.to_device(device);
        state.moment_2 = state.moment_2.to_device(device);
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    fn values(tensor: Tensor<NdArray, 1>) -> Vec<f32> {
        tensor.into_data().iter::<f32>().collect()
    }

    #[test]
    fn first_steps_fall_back_to_momentum() {
        let device = Default::default();
        let optim = RAdamConfig::new();
        let radam = RAdam {
            beta_1: optim.beta_1,
            beta_2: optim.beta_2,
            epsilon: optim.epsilon,
        };

        let param = Tensor::<NdArray, 1>::from_floats([1.0, 2.0], &device);
        let grad = Tensor::<NdArray, 1>::from_floats([0.5, -0.5], &device);

        let (param, state) = SimpleOptimizer::<NdArray>::step(&radam, 0.1, param, grad, None);
        let updated = values(param);
        assert!((updated[0] - 0.95).abs() < 1e-6);
        assert!((updated[1] - 2.05).abs() < 1e-6);
        assert_eq!(state.map(|s| s.time), Some(1));
    }

    #[test]
    fn rectification_starts_after_warmup() {
        let radam = RAdam {
            beta_1: 0.9,
            beta_2: 0.999,
            epsilon: 1e-8,
        };
        assert!(radam.rho(1) <= 5.0);
        assert!(radam.rho(10) > 5.0);
        assert!(radam.rho(10_000) < radam.rho_inf());
    }

    #[test]
    fn adaptive_steps_keep_moving_toward_minimum() {
        let device = Default::default();
        let radam = RAdam {
            beta_1: 0.9,
            beta_2: 0.999,
            epsilon: 1e-8,
        };

        // f(x) = x^2 の最小化
        let mut param = Tensor::<NdArray, 1>::from_floats([3.0], &device);
        let mut state = None;
        for _ in 0..20 {
            let grad = param.clone().mul_scalar(2.0);
            let (next, next_state) =
                SimpleOptimizer::<NdArray>::step(&radam, 0.1, param, grad, state);
            param = next;
            state = next_state;
        }

        let x = values(param)[0];
        assert!(x < 3.0 && x > -3.0, "x = {x}");
        assert_eq!(state.map(|s| s.time), Some(20));
    }
}
